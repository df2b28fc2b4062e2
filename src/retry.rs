//! Bounded polling and bounded-attempt retry loops.
//!
//! Both primitives are plain futures: dropping them (for example from the
//! losing arm of a `tokio::select!`) cancels the loop mid-sleep.

use std::future::Future;
use std::time::Duration;

use crate::errors::{Error, Result};

/// Calls `check` at the given interval until it returns `Ok(true)`, an error
/// (fatal, propagated unchanged), or the timeout expires.
///
/// The first call happens immediately, before any delay, so a condition that
/// is already satisfied never sleeps. The timeout only fires between calls.
pub async fn poll<F, Fut>(interval: Duration, timeout: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        if check().await? {
            return Ok(());
        }
        tokio::select! {
            _ = &mut deadline => return Err(Error::Timeout(timeout)),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Calls `f` up to `attempts` times, sleeping `delay` only between attempts.
/// Returns `Ok` on the first success, or the last error once attempts are
/// exhausted. Zero attempts is a no-op success.
pub async fn do_with<F, Fut>(attempts: u32, delay: Duration, mut f: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut last = None;
    for i in 0..attempts {
        if i > 0 {
            tokio::time::sleep(delay).await;
        }
        match f().await {
            Ok(()) => return Ok(()),
            Err(e) => last = Some(e),
        }
    }
    match last {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
