use anyhow::Result;
use tracing::{debug, error};

use crate::config::{ConfigStore, MultipathConfig};
use crate::event::Uevent;
use crate::pipeline::UeventPipeline;

/// Applies a serviced event to the multipath topology.
pub trait UeventTrigger: Send {
    fn handle(&mut self, event: &Uevent) -> Result<()>;
}

impl UeventPipeline {
    /// Service the handoff queue until [`shutdown`](Self::shutdown).
    ///
    /// Each drained snapshot is prepared (devnode filtering, wwid
    /// resolution), coalesced, and serviced in arrival order. Trigger
    /// failures are logged and do not stop the pass; events and their
    /// merged children are released as each one is serviced.
    pub fn dispatch(&self, config: &ConfigStore, trigger: &mut dyn UeventTrigger) -> Result<()> {
        while let Some(snapshot) = self.drain_wait() {
            let config = config.snapshot();
            let survivors = coalesce(snapshot, &config);
            service(survivors, trigger);
        }
        debug!("terminating uevent service queue");
        Ok(())
    }
}

fn service(snapshot: Vec<Uevent>, trigger: &mut dyn UeventTrigger) {
    for uev in snapshot {
        if let Err(err) = trigger.handle(&uev) {
            error!(
                action = uev.action(),
                kernel = uev.kernel(),
                error = ?err,
                "uevent trigger failed"
            );
        }
    }
}

/// Run the prepare, filter, and merge passes over one snapshot, returning
/// the surviving events in arrival order.
fn coalesce(snapshot: Vec<Uevent>, config: &MultipathConfig) -> Vec<Uevent> {
    let mut slots: Vec<Option<Uevent>> = snapshot.into_iter().map(Some).collect();
    prepare(&mut slots, config);
    for later_idx in (0..slots.len()).rev() {
        let Some(mut later) = slots[later_idx].take() else {
            continue;
        };
        filter_earlier(&mut slots[..later_idx], &later);
        if config.merging_enabled() {
            merge_earlier(&mut slots[..later_idx], &mut later);
        }
        slots[later_idx] = Some(later);
    }
    slots.into_iter().flatten().collect()
}

/// Reverse walk dropping devnode-rejected path events and resolving
/// wwids. dm-* events are exempt from both.
fn prepare(slots: &mut [Option<Uevent>], config: &MultipathConfig) {
    for slot in slots.iter_mut().rev() {
        let Some(uev) = slot.as_mut() else {
            continue;
        };
        if uev.is_dm() {
            continue;
        }
        if !config.devnode_filter.accepts(uev.kernel()) {
            debug!(
                action = uev.action(),
                kernel = uev.kernel(),
                "discarding uevent rejected by devnode filter"
            );
            *slot = None;
            continue;
        }
        if config.merging_enabled() {
            uev.resolve_wwid(config);
        }
    }
}

fn can_filter(earlier: &Uevent, later: &Uevent) -> bool {
    // A later removal annihilates prior history for the same device.
    if earlier.kernel() == later.kernel() && later.is_remove() && !later.is_dm() {
        return true;
    }
    // An add supersedes a preceding change for the same device.
    if earlier.kernel() == later.kernel()
        && earlier.is_change()
        && later.is_add()
        && !later.is_dm()
    {
        return true;
    }
    false
}

fn filter_earlier(earlier_slots: &mut [Option<Uevent>], later: &Uevent) {
    for slot in earlier_slots.iter_mut().rev() {
        let Some(earlier) = slot.as_ref() else {
            continue;
        };
        if can_filter(earlier, later) {
            debug!(
                action = earlier.action(),
                kernel = earlier.kernel(),
                by_action = later.action(),
                by_kernel = later.kernel(),
                "uevent filtered by later uevent"
            );
            *slot = None;
        }
    }
}

/// A stop means causality can no longer be judged: dm events never merge,
/// an unidentified event ends the scan, and an opposite-action event from
/// the same LUN marks a remove/re-add transition that must not collapse.
fn merge_must_stop(earlier: &Uevent, later: &Uevent) -> bool {
    if later.is_dm() {
        return true;
    }
    let (Some(earlier_wwid), Some(later_wwid)) = (earlier.wwid(), later.wwid()) else {
        return true;
    };
    earlier_wwid == later_wwid
        && earlier.action() != later.action()
        && !earlier.is_change()
        && !later.is_change()
}

fn can_merge(earlier: &Uevent, later: &Uevent) -> bool {
    match (earlier.wwid(), later.wwid()) {
        (Some(earlier_wwid), Some(later_wwid)) => {
            earlier_wwid == later_wwid
                && earlier.action() == later.action()
                && !earlier.is_change()
                && !earlier.is_dm()
        }
        _ => false,
    }
}

fn merge_earlier(earlier_slots: &mut [Option<Uevent>], later: &mut Uevent) {
    for slot in earlier_slots.iter_mut().rev() {
        let Some(earlier) = slot.as_ref() else {
            continue;
        };
        if merge_must_stop(earlier, later) {
            break;
        }
        if !can_merge(earlier, later) {
            continue;
        }
        if let Some(earlier) = slot.take() {
            debug!(
                action = earlier.action(),
                kernel = earlier.kernel(),
                into_kernel = later.kernel(),
                wwid = later.wwid().unwrap_or(""),
                "merged uevent into later uevent"
            );
            later.absorb(earlier);
        }
    }
}
