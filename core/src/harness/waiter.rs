/// Message delivery waiter
use crate::error::{BenchError, Result};
use crate::messaging::filter::ReceivedMessage;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::debug;

/// Something that buffers messages per filter until they are polled
#[async_trait]
pub trait FilterSource: Send + Sync {
    /// Messages buffered since the previous poll of `filter_id`
    async fn poll_filter(&self, filter_id: &str) -> Result<Vec<ReceivedMessage>>;

    /// Arrival counter for `filter_id`, if the source can push
    async fn arrivals(&self, _filter_id: &str) -> Option<watch::Receiver<u64>> {
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WaitOptions {
    /// Longest pause between two polls
    pub interval: Duration,
    /// Overall bound; `None` waits until the target is met or a poll fails
    pub timeout: Option<Duration>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: None,
        }
    }
}

/// Outcome of a successful wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WaitReport {
    pub polls: u64,
    pub received: i64,
}

/// Sleep for `interval`, or less if the source reports an arrival
async fn next_tick(arrivals: &mut Option<watch::Receiver<u64>>, interval: Duration) {
    if let Some(rx) = arrivals {
        match timeout(interval, rx.changed()).await {
            Ok(Ok(())) | Err(_) => return,
            // Filter went away; fall back to plain polling
            Ok(Err(_)) => {}
        }
        *arrivals = None;
    }
    sleep(interval).await;
}

/// Poll `filter_id` until at least `target` messages were seen in total.
///
/// Each round waits one interval (cut short by a pushed arrival), polls, and
/// adds the batch size to the running total. A failed poll is returned as is.
pub async fn wait_for_messages<S>(
    target: i64,
    source: &S,
    filter_id: &str,
    options: WaitOptions,
) -> Result<WaitReport>
where
    S: FilterSource + ?Sized,
{
    let deadline = options.timeout.map(|t| Instant::now() + t);
    let mut arrivals = source.arrivals(filter_id).await;
    let mut report = WaitReport::default();

    loop {
        match deadline {
            Some(at) => {
                if timeout_at(at, next_tick(&mut arrivals, options.interval))
                    .await
                    .is_err()
                {
                    return Err(BenchError::Timeout(format!(
                        "received {} of {} messages on filter {} after {} polls",
                        report.received, target, filter_id, report.polls
                    )));
                }
            }
            None => next_tick(&mut arrivals, options.interval).await,
        }

        let batch = source.poll_filter(filter_id).await?;
        report.polls += 1;
        report.received += batch.len() as i64;
        debug!(
            "Filter {}: {} new, {}/{} total",
            filter_id,
            batch.len(),
            report.received,
            target
        );

        if report.received >= target {
            return Ok(report);
        }
    }
}
