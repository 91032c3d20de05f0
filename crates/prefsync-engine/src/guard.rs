//! Failure isolation for individual attempts
//!
//! Every tier read and every backend round-trip runs through [`isolated`]:
//! a deadline plus a panic boundary, so one misbehaving source surfaces as an
//! ordinary error instead of tearing down the caller.

use futures::FutureExt;
use prefsync_core::SyncError;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

/// Run `attempt` with a deadline, converting panics and timeouts into errors
///
/// # Errors
/// - [`SyncError::Timeout`] when `deadline` elapses first
/// - [`SyncError::Protocol`] when the attempt panics
/// - whatever the attempt itself returns
pub async fn isolated<T, F>(deadline: Duration, attempt: F) -> Result<T, SyncError>
where
    F: Future<Output = Result<T, SyncError>>,
{
    let guarded = AssertUnwindSafe(attempt).catch_unwind();
    match tokio::time::timeout(deadline, guarded).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => Err(SyncError::Protocol(format!(
            "attempt panicked: {}",
            panic_message(panic.as_ref())
        ))),
        Err(_) => Err(SyncError::Timeout(deadline)),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
