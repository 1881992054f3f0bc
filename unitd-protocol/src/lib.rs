pub mod client;
pub mod errors;
pub mod protocol;
pub mod server;
pub mod tls;

pub use client::PushClient;
pub use protocol::{DiffAssembler, DiffFragment, ErrorCategory, KeyDiff, PushFrame, PushResponse};
pub use server::Server;
