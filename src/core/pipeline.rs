//! Component F — Event Pipeline.
//!
//! Two delivery modes (spec §4.F): *immediate*, where every registered
//! sink is called synchronously as each event is produced, and
//! *deferred*, where events accumulate in a FIFO that the watcher drains
//! at its own synchronisation points. A `Pipeline` in immediate mode owns
//! no queue; in deferred mode it owns the FIFO.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::core::types::Event;

/// A registered event sink. Implementors must not block and must not
/// re-enter any registry mutation operation (spec §4.F); violations are
/// logged, not policed, by the pipeline itself.
pub trait Sink: Send + Sync {
    fn handle(&self, event: &Event);
}

impl<F: Fn(&Event) + Send + Sync> Sink for F {
    fn handle(&self, event: &Event) {
        self(event)
    }
}

pub type SinkId = u64;

struct Subscription {
    id: SinkId,
    sink: Box<dyn Sink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Immediate,
    Deferred,
}

/// A filter that can veto or rewrite an event before delivery. Reserved
/// extension point (spec §4.F) for future coalescing of a disconnect
/// immediately followed by a reconnect on the same bus; the default is
/// the identity filter, which passes every event through unchanged.
pub trait Filter: Send + Sync {
    fn apply(&self, event: Event) -> Option<Event>;
}

struct IdentityFilter;

impl Filter for IdentityFilter {
    fn apply(&self, event: Event) -> Option<Event> {
        Some(event)
    }
}

pub struct Pipeline {
    mode: DeliveryMode,
    sinks: Mutex<Vec<Subscription>>,
    queue: Mutex<VecDeque<Event>>,
    filter: Mutex<Box<dyn Filter>>,
    next_id: AtomicU64,
}

impl Pipeline {
    pub fn new(mode: DeliveryMode) -> Self {
        Pipeline {
            mode,
            sinks: Mutex::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            filter: Mutex::new(Box::new(IdentityFilter)),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, sink: Box<dyn Sink>) -> SinkId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sinks.lock().unwrap().push(Subscription { id, sink });
        id
    }

    pub fn unsubscribe(&self, id: SinkId) {
        self.sinks.lock().unwrap().retain(|s| s.id != id);
    }

    pub fn set_filter(&self, filter: Box<dyn Filter>) {
        *self.filter.lock().unwrap() = filter;
    }

    /// Submits one event produced by the reconciler. In immediate mode
    /// every sink is called synchronously before this returns; in
    /// deferred mode the event is pushed to the FIFO for later draining.
    pub fn emit(&self, event: Event) {
        let Some(event) = self.filter.lock().unwrap().apply(event) else {
            return;
        };
        match self.mode {
            DeliveryMode::Immediate => self.dispatch(&event),
            DeliveryMode::Deferred => self.queue.lock().unwrap().push_back(event),
        }
    }

    fn dispatch(&self, event: &Event) {
        for sub in self.sinks.lock().unwrap().iter() {
            sub.sink.handle(event);
        }
    }

    /// Drains and dispatches every queued event, in FIFO order (spec
    /// §4.G main-loop step 5, §5 ordering guarantees). A no-op in
    /// immediate mode, since nothing accumulates there.
    pub fn drain(&self) {
        loop {
            let event = self.queue.lock().unwrap().pop_front();
            match event {
                Some(event) => self.dispatch(&event),
                None => break,
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Event, EventKind};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::SystemTime;

    fn event(kind: EventKind, busno: i32) -> Event {
        Event::new(kind, busno, None, None, SystemTime::UNIX_EPOCH)
    }

    #[test]
    fn immediate_mode_dispatches_synchronously() {
        let pipeline = Pipeline::new(DeliveryMode::Immediate);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        pipeline.subscribe(Box::new(move |_: &Event| {
            seen2.fetch_add(1, Ordering::SeqCst);
        }));
        pipeline.emit(event(EventKind::Connected, 1));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deferred_mode_accumulates_until_drained() {
        let pipeline = Pipeline::new(DeliveryMode::Deferred);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        pipeline.subscribe(Box::new(move |_: &Event| {
            seen2.fetch_add(1, Ordering::SeqCst);
        }));
        pipeline.emit(event(EventKind::Connected, 1));
        pipeline.emit(event(EventKind::Disconnected, 1));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(pipeline.pending_len(), 2);
        pipeline.drain();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(pipeline.pending_len(), 0);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let pipeline = Pipeline::new(DeliveryMode::Immediate);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let id = pipeline.subscribe(Box::new(move |_: &Event| {
            seen2.fetch_add(1, Ordering::SeqCst);
        }));
        pipeline.unsubscribe(id);
        pipeline.emit(event(EventKind::Connected, 1));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn filter_can_veto_an_event() {
        struct DropDisconnects;
        impl Filter for DropDisconnects {
            fn apply(&self, event: Event) -> Option<Event> {
                if event.kind == EventKind::Disconnected {
                    None
                } else {
                    Some(event)
                }
            }
        }
        let pipeline = Pipeline::new(DeliveryMode::Deferred);
        pipeline.set_filter(Box::new(DropDisconnects));
        pipeline.emit(event(EventKind::Disconnected, 1));
        pipeline.emit(event(EventKind::Connected, 1));
        assert_eq!(pipeline.pending_len(), 1);
    }
}
