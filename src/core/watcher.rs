//! Component G — Watcher.
//!
//! A state machine with states *stopped*, *running*, *stopping* (spec
//! §4.G). Runs on one dedicated thread; it is the sole writer of the
//! registry at steady state (spec §5). Three concrete watch mechanisms
//! (poll, udev, xevent) share one main-loop shape: wait for a wake
//! signal, ask the reconciler for a delta, push it through the pipeline.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crate::core::busset::BusSet;
use crate::core::config::{Config, ResolvedWatchMode, WatchMode};
use crate::core::error::{HotplugError, Result};
use crate::core::pipeline::Pipeline;
use crate::core::reconcile;
use crate::core::registry::Registry;
use crate::core::sysfs;
use crate::core::types::{Event, EventKind};

/// A slice no single sleep exceeds, so a stop request is observed
/// promptly (spec §4.G main-loop step 2, §5 cancellation).
const CANCEL_SLICE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    DisplayConnection,
    Dpms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Stopped,
    Running,
    Stopping,
}

struct RunningLoop {
    handle: JoinHandle<()>,
    terminate: Arc<AtomicBool>,
    /// Set only in xevent mode: a ping that wakes the event thread out of
    /// its blocking X11 read (spec §4.G Shutdown). `std::sync::mpsc` is
    /// always available, so this field needs no `linux-xevent` gating.
    xevent_shutdown: Option<std::sync::mpsc::SyncSender<()>>,
}

/// The watcher (component G). Owns the registry, the event pipeline, and
/// the loop thread's lifecycle; does not own the lock manager, which
/// lives on the registry (spec §5 shared-resources list).
pub struct Watcher {
    config: Config,
    registry: Arc<Registry>,
    pipeline: Arc<Pipeline>,
    state: Mutex<State>,
    running: Mutex<Option<RunningLoop>>,
    active_classes: Mutex<Option<HashSet<EventClass>>>,
}

impl Watcher {
    pub fn new(config: Config, registry: Arc<Registry>, pipeline: Arc<Pipeline>) -> Self {
        Watcher {
            config,
            registry,
            pipeline,
            state: Mutex::new(State::Stopped),
            running: Mutex::new(None),
            active_classes: Mutex::new(None),
        }
    }

    fn has_drm_adapter() -> bool {
        std::path::Path::new("/sys/class/drm").exists()
    }

    fn resolve_mode(&self) -> ResolvedWatchMode {
        match self.config.watch_mode {
            WatchMode::Poll => ResolvedWatchMode::Poll,
            WatchMode::Udev => {
                if udev::MonitorBuilder::new().is_ok() {
                    ResolvedWatchMode::Udev
                } else {
                    ResolvedWatchMode::Poll
                }
            }
            WatchMode::Xevent => resolve_xevent_or_poll(),
            WatchMode::Dynamic => {
                let session_type = std::env::var("XDG_SESSION_TYPE").unwrap_or_default();
                let has_display_hint = session_type == "x11"
                    || session_type == "wayland"
                    || std::env::var("DISPLAY").is_ok();
                if has_display_hint {
                    resolve_xevent_or_poll()
                } else {
                    ResolvedWatchMode::Poll
                }
            }
        }
    }

    /// *start(event_classes)* (spec §4.G Startup, §6.3).
    pub fn start(&self, event_classes: HashSet<EventClass>) -> Result<()> {
        if event_classes.is_empty() {
            return Err(HotplugError::InvalidArgument("event_classes must be non-empty"));
        }
        if !Self::has_drm_adapter() {
            return Err(HotplugError::InvalidOperation("no DRM video adapter present"));
        }

        let mut state = self.state.lock().unwrap();
        if *state != State::Stopped {
            return Err(HotplugError::InvalidOperation("watcher already running"));
        }

        let mode = self.resolve_mode();

        // Initial snapshot into the registry (spec §4.G Startup step 4).
        let connectors = sysfs::scan_connectors();
        let attached = sysfs::list_attached_buses();
        for busno in attached.iter() {
            self.registry.ensure_businfo(busno);
        }
        if attached.len() >= self.config.i2c_businfo_async_threshold {
            let handles: Vec<_> = attached
                .iter()
                .map(|busno| {
                    let registry = self.registry.clone();
                    let config = self.config.clone();
                    let connectors = connectors.clone();
                    thread::spawn(move || {
                        let _ = registry.probe(&config, busno, Some(&connectors));
                    })
                })
                .collect();
            for h in handles {
                let _ = h.join();
            }
        } else {
            for busno in attached.iter() {
                let _ = self.registry.probe(&self.config, busno, Some(&connectors));
            }
        }

        let terminate = Arc::new(AtomicBool::new(false));
        let bearing = sysfs::buses_having_edid(&connectors);

        let config = self.config.clone();
        let registry = self.registry.clone();
        let pipeline = self.pipeline.clone();
        let classes = event_classes.clone();
        let terminate_for_loop = terminate.clone();

        let (handle, xevent_shutdown): (JoinHandle<()>, Option<std::sync::mpsc::SyncSender<()>>) =
            match mode {
                ResolvedWatchMode::Poll => (
                    thread::spawn(move || {
                        run_poll_loop(config, registry, pipeline, classes, terminate_for_loop, bearing)
                    }),
                    None,
                ),
                ResolvedWatchMode::Udev => (
                    thread::spawn(move || {
                        run_udev_loop(config, registry, pipeline, classes, terminate_for_loop, bearing)
                    }),
                    None,
                ),
                ResolvedWatchMode::Xevent => spawn_xevent_loop(
                    config,
                    registry,
                    pipeline,
                    classes,
                    terminate_for_loop,
                    bearing,
                ),
            };

        *self.running.lock().unwrap() = Some(RunningLoop {
            handle,
            terminate,
            xevent_shutdown,
        });
        *self.active_classes.lock().unwrap() = Some(event_classes);
        *state = State::Running;
        Ok(())
    }

    /// *stop(wait)* (spec §4.G Shutdown, §6.3).
    pub fn stop(&self, wait: bool) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != State::Running {
                return Err(HotplugError::InvalidOperation("watcher is not running"));
            }
            *state = State::Stopping;
        }

        let running = self.running.lock().unwrap().take();
        if let Some(running) = running {
            running.terminate.store(true, Ordering::SeqCst);
            if let Some(shutdown) = &running.xevent_shutdown {
                let _ = shutdown.try_send(());
            }
            if wait {
                let _ = running.handle.join();
            }
        }

        self.pipeline.drain();
        *self.state.lock().unwrap() = State::Stopped;
        *self.active_classes.lock().unwrap() = None;
        Ok(())
    }

    /// *active_classes()* (spec §6.3).
    pub fn active_classes(&self) -> Result<HashSet<EventClass>> {
        self.active_classes
            .lock()
            .unwrap()
            .clone()
            .ok_or(HotplugError::InvalidOperation("watcher is not running"))
    }
}

/// Spawns the xevent-mode loop thread when `linux-xevent` is compiled in,
/// returning the join handle plus the shutdown ping sender; falls back to
/// the poll loop (with no shutdown ping needed) otherwise.
fn spawn_xevent_loop(
    config: Config,
    registry: Arc<Registry>,
    pipeline: Arc<Pipeline>,
    classes: HashSet<EventClass>,
    terminate: Arc<AtomicBool>,
    bearing: BusSet,
) -> (JoinHandle<()>, Option<std::sync::mpsc::SyncSender<()>>) {
    #[cfg(feature = "linux-xevent")]
    {
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        let handle = thread::spawn(move || {
            xevent::run_xevent_loop(config, registry, pipeline, classes, terminate, bearing, rx)
        });
        (handle, Some(tx))
    }
    #[cfg(not(feature = "linux-xevent"))]
    {
        let handle = thread::spawn(move || {
            run_poll_loop(config, registry, pipeline, classes, terminate, bearing)
        });
        (handle, None)
    }
}

fn resolve_xevent_or_poll() -> ResolvedWatchMode {
    #[cfg(feature = "linux-xevent")]
    {
        ResolvedWatchMode::Xevent
    }
    #[cfg(not(feature = "linux-xevent"))]
    {
        ResolvedWatchMode::Poll
    }
}

/// Sleeps `total` in slices no longer than [`CANCEL_SLICE`], returning
/// early if `terminate` becomes true (spec §5 cancellation).
fn cancellable_sleep(total: Duration, terminate: &AtomicBool) -> bool {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if terminate.load(Ordering::SeqCst) {
            return true;
        }
        let slice = remaining.min(CANCEL_SLICE);
        thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
    terminate.load(Ordering::SeqCst)
}

fn step(
    config: &Config,
    registry: &Registry,
    pipeline: &Pipeline,
    classes: &HashSet<EventClass>,
    bearing: &mut BusSet,
    asleep: &mut BusSet,
) {
    if classes.contains(&EventClass::DisplayConnection) {
        let connectors = sysfs::scan_connectors();
        let delta = reconcile::reconcile(config, *bearing, sysfs::buses_having_edid(&connectors), || {
            sysfs::buses_having_edid(&sysfs::scan_connectors())
        });
        *bearing = delta.settled;

        for busno in delta.added.iter() {
            registry.ensure_businfo(busno);
            let _ = registry.probe(config, busno, Some(&connectors));
            let connector_name = sysfs::connector_for_busno(&connectors, busno)
                .map(|c| c.connector_name.clone());
            let display = registry.add_display(busno, connector_name.clone());
            pipeline.emit(Event::new(
                EventKind::Connected,
                busno,
                connector_name,
                Some(display),
                SystemTime::now(),
            ));
        }
        for busno in delta.removed.iter() {
            registry.mark_disconnected(busno);
            let connector_name = sysfs::connector_for_busno(&connectors, busno)
                .map(|c| c.connector_name.clone());
            pipeline.emit(Event::new(
                EventKind::Disconnected,
                busno,
                connector_name,
                None,
                SystemTime::now(),
            ));
        }
    }

    if classes.contains(&EventClass::Dpms) {
        let current_bearing = *bearing;
        let (went_asleep, woke) = reconcile::reconcile_dpms(current_bearing, asleep, |busno| {
            registry
                .find_by_busno(busno)
                .map(|info| info.last_checked_dpms_asleep)
                .unwrap_or(false)
        });
        for busno in went_asleep.iter() {
            pipeline.emit(Event::new(EventKind::DpmsAsleep, busno, None, None, SystemTime::now()));
        }
        for busno in woke.iter() {
            pipeline.emit(Event::new(EventKind::DpmsAwake, busno, None, None, SystemTime::now()));
        }
    }
}

fn run_poll_loop(
    config: Config,
    registry: Arc<Registry>,
    pipeline: Arc<Pipeline>,
    classes: HashSet<EventClass>,
    terminate: Arc<AtomicBool>,
    mut bearing: BusSet,
) {
    let mut asleep = BusSet::new();
    loop {
        if terminate.load(Ordering::SeqCst) {
            break;
        }
        step(&config, &registry, &pipeline, &classes, &mut bearing, &mut asleep);
        if cancellable_sleep(Duration::from_millis(config.poll_watch_loop_millisec), &terminate) {
            break;
        }
    }
}

fn run_udev_loop(
    config: Config,
    registry: Arc<Registry>,
    pipeline: Arc<Pipeline>,
    classes: HashSet<EventClass>,
    terminate: Arc<AtomicBool>,
    mut bearing: BusSet,
) {
    use std::os::unix::io::AsRawFd;
    use std::time::Instant;

    let monitor = udev::MonitorBuilder::new()
        .and_then(|b| b.match_subsystem("drm"))
        .and_then(|b| b.listen());
    let Ok(monitor) = monitor else {
        log::warn!("udev monitor unavailable, falling back to poll loop");
        return run_poll_loop(config, registry, pipeline, classes, terminate, bearing);
    };

    let mut asleep = BusSet::new();
    let fd = monitor.as_raw_fd();
    // udev push-notifies us, so this is a backstop cadence rather than the
    // sole trigger: `step()` still runs on this interval even with no
    // socket activity, the way `run_poll_loop` always does (spec §6.4).
    let fallback_interval = Duration::from_millis(config.udev_watch_loop_millisec);
    let mut last_step = Instant::now();

    loop {
        if terminate.load(Ordering::SeqCst) {
            break;
        }

        let mut pollfds = [nix::poll::PollFd::new(
            unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) },
            nix::poll::PollFlags::POLLIN,
        )];
        match nix::poll::poll(&mut pollfds, nix::poll::PollTimeout::from(CANCEL_SLICE.as_millis() as u16)) {
            Ok(0) => {
                if last_step.elapsed() >= fallback_interval {
                    step(&config, &registry, &pipeline, &classes, &mut bearing, &mut asleep);
                    last_step = Instant::now();
                }
                continue;
            }
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                log::warn!("udev poll failed: {e}");
                continue;
            }
        }

        let mut relevant = false;
        for event in monitor.iter() {
            match event.event_type() {
                udev::EventType::Add | udev::EventType::Change => relevant = true,
                _ => {}
            }
        }
        if relevant {
            step(&config, &registry, &pipeline, &classes, &mut bearing, &mut asleep);
            last_step = Instant::now();
        }
    }
}

#[cfg(feature = "linux-xevent")]
mod xevent {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::sync::mpsc;
    use std::time::Instant;
    use x11rb::connection::Connection;
    use x11rb::protocol::randr::{self, ConnectionExt as _};
    use x11rb::protocol::Event as X11Event;

    /// Polls the X11 connection's own fd for RandR screen-change events,
    /// waking at most every [`super::CANCEL_SLICE`] to check for a
    /// shutdown request — unlike blocking on `wait_for_event`, this never
    /// parks the thread, so shutdown is observed promptly without needing
    /// the synthetic client-message ping (spec §4.G Shutdown).
    /// `config.xevent_watch_loop_millisec` paces a fallback [`step`] when
    /// no RandR event arrives (spec §6.4).
    pub fn run_xevent_loop(
        config: Config,
        registry: Arc<Registry>,
        pipeline: Arc<Pipeline>,
        classes: HashSet<EventClass>,
        terminate: Arc<AtomicBool>,
        mut bearing: BusSet,
        shutdown_rx: mpsc::Receiver<()>,
    ) {
        let (conn, screen_num) = match x11rb::connect(None) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("x11 connection failed ({e}), falling back to poll loop");
                return run_poll_loop(config, registry, pipeline, classes, terminate, bearing);
            }
        };
        let root = conn.setup().roots[screen_num].root;
        if randr::select_input(&conn, root, randr::NotifyMask::SCREEN_CHANGE)
            .and_then(|c| c.check())
            .is_err()
        {
            log::warn!("randr select_input failed, falling back to poll loop");
            return run_poll_loop(config, registry, pipeline, classes, terminate, bearing);
        }

        let mut asleep = BusSet::new();
        let fd = conn.as_raw_fd();
        let fallback_interval = Duration::from_millis(config.xevent_watch_loop_millisec);
        let mut last_step = Instant::now();

        loop {
            if terminate.load(Ordering::SeqCst) || shutdown_rx.try_recv().is_ok() {
                break;
            }

            let mut pollfds = [nix::poll::PollFd::new(
                unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) },
                nix::poll::PollFlags::POLLIN,
            )];
            match nix::poll::poll(&mut pollfds, nix::poll::PollTimeout::from(CANCEL_SLICE.as_millis() as u16)) {
                Ok(0) => {
                    if last_step.elapsed() >= fallback_interval {
                        step(&config, &registry, &pipeline, &classes, &mut bearing, &mut asleep);
                        last_step = Instant::now();
                    }
                    continue;
                }
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    log::warn!("x11 poll failed: {e}");
                    break;
                }
            }

            loop {
                match conn.poll_for_event() {
                    Ok(Some(X11Event::RandrScreenChangeNotify(_))) => {
                        step(&config, &registry, &pipeline, &classes, &mut bearing, &mut asleep);
                        last_step = Instant::now();
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("x11 poll_for_event failed: {e}");
                        break;
                    }
                }
            }
        }
        let _ = conn.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellable_sleep_returns_immediately_when_already_terminated() {
        let term = AtomicBool::new(true);
        let start = std::time::Instant::now();
        assert!(cancellable_sleep(Duration::from_secs(5), &term));
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn start_rejects_empty_event_classes() {
        let registry = Arc::new(Registry::new());
        let pipeline = Arc::new(Pipeline::new(crate::core::pipeline::DeliveryMode::Immediate));
        let watcher = Watcher::new(Config::default(), registry, pipeline);
        let err = watcher.start(HashSet::new()).unwrap_err();
        assert!(matches!(err, HotplugError::InvalidArgument(_)));
    }

    #[test]
    fn stop_without_start_is_invalid_operation() {
        let registry = Arc::new(Registry::new());
        let pipeline = Arc::new(Pipeline::new(crate::core::pipeline::DeliveryMode::Immediate));
        let watcher = Watcher::new(Config::default(), registry, pipeline);
        let err = watcher.stop(false).unwrap_err();
        assert!(matches!(err, HotplugError::InvalidOperation(_)));
    }

    #[test]
    fn active_classes_is_invalid_operation_when_stopped() {
        let registry = Arc::new(Registry::new());
        let pipeline = Arc::new(Pipeline::new(crate::core::pipeline::DeliveryMode::Immediate));
        let watcher = Watcher::new(Config::default(), registry, pipeline);
        assert!(watcher.active_classes().is_err());
    }
}
