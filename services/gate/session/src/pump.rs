//! Pipeline task spawning with a fault boundary.

use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::error;

/// Spawn a pump with a fault boundary: an unexpected panic inside the pump
/// body is converted into a logged diagnostic (message plus captured
/// backtrace) and the pump terminates; the process does not.
pub(crate) fn spawn_guarded<F>(pump: &'static str, sid: u64, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(payload) = AssertUnwindSafe(fut).catch_unwind().await {
            let backtrace = Backtrace::force_capture();
            error!(
                sid,
                pump,
                "pump panicked: {}; backtrace:\n{}",
                panic_message(&payload),
                backtrace
            );
        }
    });
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}
