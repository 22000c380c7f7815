use std::future::Future;
use std::time::Duration;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use indicatif::ProgressBar;
use tokio::time::Instant;
use tracing::debug;

/// Poll `test_fn` every `poll_interval` until it reports ready or `timeout`
/// runs out, keeping `progress` updated with the attempt count.
///
/// Errors from `test_fn` count as "not ready yet". Returns the time waited
/// together with the progress bar so the caller decides how to finish it.
pub async fn wait_for_readiness<F, Fut>(
    progress: ProgressBar,
    message: &str,
    mut test_fn: F,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<(Duration, ProgressBar)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();
    let deadline = start + timeout;
    debug!("{message}: polling every {poll_interval:?} for up to {timeout:?}");

    let mut attempt = 0u32;
    while Instant::now() < deadline {
        attempt += 1;
        progress.set_message(format!(
            "{message} (attempt {attempt}, {}s)",
            start.elapsed().as_secs()
        ));

        match test_fn().await {
            Ok(true) => {
                debug!("{message}: ready after {attempt} attempts");
                return Ok((start.elapsed(), progress));
            }
            Ok(false) => {}
            Err(e) => debug!("{message}: attempt {attempt} failed: {e}"),
        }

        tokio::time::sleep_until((Instant::now() + poll_interval).min(deadline)).await;
    }

    Err(eyre!(
        "Timeout waiting for readiness after {}s ({attempt} attempts)",
        timeout.as_secs()
    ))
}
