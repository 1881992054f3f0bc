//! Tail end of the protocol adapter: apply an assembled diff through the
//! shared reconciler and map the outcome to a protocol response.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, warn};

use unitd_protocol::protocol::{KeyDiff, PushResponse};

use crate::reconciler::Reconciler;

/// Reconciler shared by all connection tasks. The mutex is the explicit
/// single-writer region: one push fully assembles, applies and persists
/// before the next may begin.
pub type SharedReconciler = Arc<Mutex<Reconciler>>;

/// Apply one assembled diff. Contract violations map to "invalid argument"
/// (the controller pushed bad data), everything else to "internal".
pub async fn apply_push(reconciler: SharedReconciler, diff: KeyDiff) -> PushResponse {
    let mut reconciler = reconciler.lock().await;
    match reconciler.apply(diff).await {
        Ok(()) => PushResponse::Ok,
        Err(e) if e.is_contract_error() => {
            warn!("Rejected push: {}", e);
            PushResponse::invalid_argument(e.to_string())
        }
        Err(e) => {
            error!("Failed to apply push: {}", e);
            PushResponse::internal(e.to_string())
        }
    }
}
