//! Polling helpers for conditions reached asynchronously by actors.
//!
//! Elapsed time is measured on the Tokio clock, so the helpers also work
//! under `start_paused`.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Default time allowed for a condition to become true.
pub const EVENTUAL_TIMEOUT: Duration = Duration::from_secs(5);

const INITIAL_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_millis(100);

/// Poll `condition` with exponential backoff until it holds or
/// [`EVENTUAL_TIMEOUT`] elapses.
pub async fn assert_eventually<F, Fut>(mut condition: F) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    let mut delay = INITIAL_DELAY;

    loop {
        if condition().await {
            return Ok(());
        }

        if start.elapsed() >= EVENTUAL_TIMEOUT {
            return Err(format!("Condition not met within {EVENTUAL_TIMEOUT:?}"));
        }

        sleep(delay).await;
        delay = (delay * 2).min(MAX_DELAY);
    }
}

/// Synchronous-condition variant of [`assert_eventually`]; panics on timeout.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    if let Err(e) = assert_eventually(|| std::future::ready(condition())).await {
        panic!("{what}: {e}");
    }
}
