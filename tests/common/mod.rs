//! Shared helpers for the integration tests.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::time::Duration;

use tally_bridge::backoff::Backoff;
use tokio::sync::broadcast;

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// Fast reconnect schedule: 10ms, 20ms, 40ms, then give up.
pub fn fast_backoff() -> Backoff {
    Backoff::new(Duration::from_millis(10), Duration::from_millis(40), 3)
}

/// Wait for the first event matching `pred`, skipping others.
pub async fn wait_for<T: Clone>(rx: &mut broadcast::Receiver<T>, pred: impl Fn(&T) -> bool) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("expected event did not arrive in time")
}

/// Collect every event up to and including the first one matching `pred`.
pub async fn collect_until<T: Clone>(
    rx: &mut broadcast::Receiver<T>,
    pred: impl Fn(&T) -> bool,
) -> Vec<T> {
    tokio::time::timeout(WAIT, async {
        let mut seen = Vec::new();
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let done = pred(&event);
                    seen.push(event);
                    if done {
                        return seen;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("expected event did not arrive in time")
}

/// Poll `check` until it holds.
pub async fn eventually(check: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
