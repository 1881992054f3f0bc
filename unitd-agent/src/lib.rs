pub mod config;
pub mod errors;
pub mod extract;
pub mod handler;
pub mod reconciler;
pub mod store;
pub mod systemd;
pub mod unit;
