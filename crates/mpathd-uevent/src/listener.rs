use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::event::Uevent;
use crate::pipeline::UeventPipeline;
use crate::source::{PollStatus, UeventSource};

/// Accumulation window cutoffs for the burst rule.
pub const MAX_ACCUMULATION_COUNT: u64 = 2048;
pub const MAX_ACCUMULATION_TIME: Duration = Duration::from_secs(30);
/// Arrivals per second below which a burst is considered over.
pub const MIN_BURST_SPEED: u64 = 10;

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const BURST_TIMEOUT: Duration = Duration::from_millis(1);

/// Whether the current accumulation window is still bursting. Rapid
/// arrivals keep accumulating so the dispatcher sees one large snapshot;
/// sparse arrivals flush promptly to keep latency low.
fn burst_continues(events: u64, elapsed: Duration) -> bool {
    if events > MAX_ACCUMULATION_COUNT {
        debug!(events, "accumulated too many uevents, ending burst");
        return false;
    }
    let elapsed_ms = elapsed.as_millis() as u64;
    if elapsed_ms == 0 {
        return true;
    }
    if elapsed_ms > MAX_ACCUMULATION_TIME.as_millis() as u64 {
        debug!(elapsed_ms, "accumulated for too long, ending burst");
        return false;
    }
    events * 1000 > MIN_BURST_SPEED * elapsed_ms
}

impl UeventPipeline {
    /// Drain `source` until it fails or the pipeline shuts down.
    ///
    /// Notifications are staged locally and flushed to the handoff queue
    /// as one batch whenever a poll times out, so the kernel-side receive
    /// buffer is drained promptly while bursts still reach the dispatcher
    /// as large, merge-friendly snapshots.
    pub fn listen(&self, source: &mut dyn UeventSource) -> Result<()> {
        let mut staging: Vec<Uevent> = Vec::new();
        let mut events: u64 = 0;
        let mut window_start = Instant::now();
        let mut timeout = IDLE_TIMEOUT;

        loop {
            if self.is_shut_down() {
                debug!("uevent listener shutting down");
                return Ok(());
            }
            match source.poll(timeout).context("poll uevent source")? {
                PollStatus::Ready => {
                    timeout = if burst_continues(events + 1, window_start.elapsed()) {
                        BURST_TIMEOUT
                    } else {
                        Duration::ZERO
                    };
                    match source.recv().context("receive uevent")? {
                        Some(raw) => {
                            if let Some(uev) = Uevent::from_raw(raw) {
                                staging.push(uev);
                                events += 1;
                            }
                        }
                        None => warn!("uevent source yielded no event"),
                    }
                    continue;
                }
                PollStatus::Interrupted => continue,
                PollStatus::TimedOut => {}
            }
            if !staging.is_empty() {
                debug!(count = events, "forwarding uevents");
                self.append_batch(&mut staging);
                events = 0;
            }
            window_start = Instant::now();
            timeout = IDLE_TIMEOUT;
        }
    }
}
