//! Component E — Connector Reconciler.
//!
//! Pure functions of the previous bus-with-EDID set and the current sysfs
//! view (spec §4.E, §8.2: `reconcile(prev, next) = (next, next \ prev,
//! prev \ next)` modulo stabilisation). Nothing here touches the registry
//! or performs I/O beyond what a caller-supplied resample closure does —
//! that keeps the stabilisation sleep out of the registry lock (spec §5's
//! forbidden-pattern rule).

use std::thread;
use std::time::Duration;

use crate::core::busset::BusSet;
use crate::core::config::Config;

/// Result of one reconciliation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delta {
    pub settled: BusSet,
    pub added: BusSet,
    pub removed: BusSet,
}

/// Applies the stabilisation rule from spec §4.E: if `next` reports any
/// disconnect relative to `prev`, sleep `extra_stabilisation_millisec`,
/// then resample via `resample` every `stabilisation_poll_millisec` until
/// two consecutive samples agree. `resample` is expected to re-run the
/// sysfs scan (component A); it is never called under any registry lock.
pub fn reconcile(
    config: &Config,
    prev: BusSet,
    next: BusSet,
    resample: impl Fn() -> BusSet,
) -> Delta {
    let removed_any = !prev.difference(&next).is_empty();

    let settled = if removed_any {
        settle(config, next, &resample)
    } else {
        next
    };

    Delta {
        settled,
        added: settled.difference(&prev),
        removed: prev.difference(&settled),
    }
}

fn settle(config: &Config, first: BusSet, resample: &impl Fn() -> BusSet) -> BusSet {
    thread::sleep(Duration::from_millis(config.extra_stabilisation_millisec));
    let mut last = first;
    loop {
        let sample = resample();
        if sample == last {
            return sample;
        }
        last = sample;
        thread::sleep(Duration::from_millis(config.stabilisation_poll_millisec));
    }
}

/// Single-connector entry point (spec §4.E): `read_edid` re-reads one
/// connector's `edid` attribute; `was_present` is whether it was in the
/// previous bearing set. Produces a delta with at most one bit set.
pub fn reconcile_single(
    config: &Config,
    busno: i32,
    was_present: bool,
    read_edid: impl Fn() -> bool,
) -> Delta {
    let first = read_edid();
    let now_present = if !first && was_present {
        settle_single(config, &read_edid)
    } else {
        first
    };

    let mut settled = BusSet::new();
    if now_present {
        settled.insert(busno);
    }
    let mut prev = BusSet::new();
    if was_present {
        prev.insert(busno);
    }

    Delta {
        settled,
        added: settled.difference(&prev),
        removed: prev.difference(&settled),
    }
}

fn settle_single(config: &Config, read_edid: &impl Fn() -> bool) -> bool {
    thread::sleep(Duration::from_millis(config.extra_stabilisation_millisec));
    let mut last = read_edid();
    loop {
        let sample = read_edid();
        if sample == last {
            return sample;
        }
        last = sample;
        thread::sleep(Duration::from_millis(config.stabilisation_poll_millisec));
    }
}

/// DPMS reconciliation (spec §4.E, optional path). `oracle` reports
/// "is asleep?" for a bus currently in the EDID-bearing set; a bus
/// leaving `bearing` is dropped from `asleep` unconditionally — DPMS
/// state does not survive disconnection.
pub fn reconcile_dpms(
    bearing: BusSet,
    asleep: &mut BusSet,
    oracle: impl Fn(i32) -> bool,
) -> (BusSet, BusSet) {
    let stale: Vec<i32> = asleep.difference(&bearing).iter().collect();
    for busno in stale {
        asleep.remove(busno);
    }

    let mut went_asleep = BusSet::new();
    let mut woke = BusSet::new();
    for busno in bearing.iter() {
        let is_asleep = oracle(busno);
        let was_asleep = asleep.contains(busno);
        if is_asleep && !was_asleep {
            asleep.insert(busno);
            went_asleep.insert(busno);
        } else if !is_asleep && was_asleep {
            asleep.remove(busno);
            woke.insert(busno);
        }
    }
    (went_asleep, woke)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        Config {
            extra_stabilisation_millisec: 1,
            stabilisation_poll_millisec: 1,
            ..Config::default()
        }
    }

    #[test]
    fn pure_add_with_no_disconnect_needs_no_settling() {
        let prev: BusSet = [1, 2].into_iter().collect();
        let next: BusSet = [1, 2, 3].into_iter().collect();
        let delta = reconcile(&cfg(), prev, next, || next);
        assert_eq!(delta.added.iter().collect::<Vec<_>>(), vec![3]);
        assert!(delta.removed.is_empty());
    }

    #[test]
    fn spurious_disconnect_settles_back_to_original() {
        let prev: BusSet = [1, 2].into_iter().collect();
        let flicker: BusSet = [1].into_iter().collect();
        // First resample still shows the flicker, second shows it settled back.
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let resample = || {
            let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n == 0 {
                flicker
            } else {
                prev
            }
        };
        let delta = reconcile(&cfg(), prev, flicker, resample);
        assert_eq!(delta.settled, prev);
        assert!(delta.added.is_empty());
        assert!(delta.removed.is_empty());
    }

    #[test]
    fn true_disconnect_settles_to_the_smaller_set() {
        let prev: BusSet = [1, 2].into_iter().collect();
        let next: BusSet = [1].into_iter().collect();
        let delta = reconcile(&cfg(), prev, next, || next);
        assert_eq!(delta.removed.iter().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn dpms_asleep_set_drops_disconnected_bus() {
        let mut asleep: BusSet = [5].into_iter().collect();
        let bearing: BusSet = BusSet::new();
        let (went, woke) = reconcile_dpms(bearing, &mut asleep, |_| false);
        assert!(asleep.is_empty());
        assert!(went.is_empty());
        assert!(woke.is_empty());
    }

    #[test]
    fn dpms_transition_is_reported_once() {
        let mut asleep = BusSet::new();
        let bearing: BusSet = [3].into_iter().collect();
        let (went, _) = reconcile_dpms(bearing, &mut asleep, |_| true);
        assert_eq!(went.iter().collect::<Vec<_>>(), vec![3]);
        let (went_again, _) = reconcile_dpms(bearing, &mut asleep, |_| true);
        assert!(went_again.is_empty());
    }
}
