//! The hot-plug watcher and I²C bus lifecycle core (spec §1–§9).
//!
//! [`Hotplug`] is the library's control-API facade (§6.3): it owns the one
//! [`registry::Registry`], the one [`pipeline::Pipeline`], and the one
//! [`watcher::Watcher`] a process needs, and hands clients a stable handle
//! to all three. Design note §9 calls for "a singleton object with an
//! `init()` call made exactly once from the library entry point and a
//! `terminate()` that frees owned memory for leak-check cleanliness" rather
//! than hidden static initialisers; `Hotplug::init` and `Hotplug::terminate`
//! are that call, kept as ordinary constructor/destructor methods on an
//! owned value instead of a `static`, so nothing here needs `OnceLock` at
//! the crate's public surface (component B's process-wide strategy
//! selector is the one piece of state spec §9 itself calls out as
//! necessarily global, and it stays inside [`gateway`]).

pub mod busset;
pub mod config;
pub mod error;
pub mod gateway;
pub mod lock;
pub mod pipeline;
pub mod reconcile;
pub mod registry;
pub mod sysfs;
pub mod types;
pub mod watcher;

use std::sync::Arc;

pub use config::{Config, ResolvedWatchMode, WatchMode};
pub use error::{HotplugError, Result};
pub use pipeline::{DeliveryMode, Filter, Sink, SinkId};
pub use types::{BusInfo, ConnectorRecord, DisplayRef, Event, EventKind, IoPath};
pub use watcher::EventClass;

use pipeline::Pipeline;
use registry::Registry;
use watcher::Watcher;

/// The control-API facade a client constructs once per process (spec
/// §6.3). Cloning is cheap (every field is an `Arc` or copy-cheap) and
/// clones refer to the same underlying registry, pipeline and watcher —
/// there is exactly one of each per `Hotplug`, matching spec §5's "one
/// process-wide mutex" / "the watcher ... is the sole writer" model.
#[derive(Clone)]
pub struct Hotplug {
    config: Config,
    registry: Arc<Registry>,
    pipeline: Arc<Pipeline>,
    watcher: Arc<Watcher>,
}

impl Hotplug {
    /// `init()` (spec §9 design notes): constructs the registry, pipeline
    /// and watcher exactly once. `mode` selects immediate vs. deferred
    /// event delivery (spec §4.F); deferred delivery is drained by
    /// [`Watcher::stop`] and at whatever cadence the caller chooses to
    /// call [`Hotplug::drain_deferred`].
    pub fn init(config: Config, mode: DeliveryMode) -> Self {
        let registry = Arc::new(Registry::new());
        let pipeline = Arc::new(Pipeline::new(mode));
        let watcher = Arc::new(Watcher::new(config, registry.clone(), pipeline.clone()));
        Hotplug {
            config,
            registry,
            pipeline,
            watcher,
        }
    }

    /// *start(event_classes)* (spec §6.3, §4.G Startup).
    pub fn start(&self, event_classes: std::collections::HashSet<EventClass>) -> Result<()> {
        self.watcher.start(event_classes)
    }

    /// *stop(wait)* (spec §6.3, §4.G Shutdown). Also drains any events
    /// left in a deferred-mode pipeline once the loop has joined.
    pub fn stop(&self, wait: bool) -> Result<()> {
        self.watcher.stop(wait)
    }

    /// *active_classes()* (spec §6.3).
    pub fn active_classes(&self) -> Result<std::collections::HashSet<EventClass>> {
        self.watcher.active_classes()
    }

    /// *subscribe(sink)* on the event pipeline (spec §6.3, §4.F).
    pub fn subscribe(&self, sink: Box<dyn Sink>) -> SinkId {
        self.pipeline.subscribe(sink)
    }

    /// *unsubscribe(id)* (spec §6.3).
    pub fn unsubscribe(&self, id: SinkId) {
        self.pipeline.unsubscribe(id)
    }

    /// Installs a [`Filter`] in front of delivery (spec §4.F's reserved
    /// coalescing extension point).
    pub fn set_filter(&self, filter: Box<dyn Filter>) {
        self.pipeline.set_filter(filter)
    }

    /// Drains any events queued by a deferred-mode pipeline. A no-op for
    /// an immediate-mode `Hotplug` (spec §4.F).
    pub fn drain_deferred(&self) {
        self.pipeline.drain()
    }

    /// *registry snapshot()* (spec §6.3): returns copies of every
    /// `BusInfo` record, in insertion order.
    pub fn snapshot(&self) -> Vec<BusInfo> {
        self.registry.snapshot()
    }

    /// Every `DisplayRef` not yet marked *removed*.
    pub fn live_displays(&self) -> Vec<DisplayRef> {
        self.registry.live_displays()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// `terminate()` (spec §9 design notes): stops the watcher if it is
    /// still running and drops this handle's `Arc`s. Leak-check
    /// cleanliness, not a correctness requirement — dropping the last
    /// `Hotplug` clone is equivalent.
    pub fn terminate(self) {
        let _ = self.watcher.stop(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_starts_stopped_and_rejects_empty_classes() {
        let hp = Hotplug::init(Config::default(), DeliveryMode::Immediate);
        assert!(hp.active_classes().is_err());
        let err = hp.start(std::collections::HashSet::new()).unwrap_err();
        assert!(matches!(err, HotplugError::InvalidArgument(_)));
    }

    #[test]
    fn snapshot_is_empty_before_any_probe() {
        let hp = Hotplug::init(Config::default(), DeliveryMode::Deferred);
        assert!(hp.snapshot().is_empty());
    }
}
