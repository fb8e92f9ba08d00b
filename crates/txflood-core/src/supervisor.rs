//! Error boundary for long-lived loops

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::{error, warn};

use crate::PoolResult;

/// Run one loop iteration, logging errors and panics instead of propagating them.
///
/// Returns `None` if the iteration failed either way.
pub async fn guarded<F, T>(task: &str, fut: F) -> Option<T>
where
    F: Future<Output = PoolResult<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(task, error = %e, "iteration failed");
            None
        }
        Err(panic) => {
            error!(task, panic = %panic_message(panic.as_ref()), "iteration panicked");
            None
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
