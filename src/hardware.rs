use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bus::{AudioBus, PowerSensor};
use crate::notify::NotificationHub;
use crate::persist;
use crate::remote::{RemoteControl, RemoteKey};
use crate::schedule::Schedule;
use crate::state::{source_switch_key, DeviceState, Source};
use crate::tda7318;

// --- Device state controller -----------------------------------------------
//
// A single worker task owns the hardware: it reconciles the requested
// ("next") state with the confirmed ("current") one, polls the power sensor
// and runs the power-up choreography. Callers only touch the two snapshots
// (each behind its own lock) and post signals to the worker.
//
// Power is switched with the infrared remote, so every power change is a
// transition: the power key repeats until the sensor confirms the new state.

/// How often the sensor is re-read when no transition is in progress.
const SENSOR_INTERVAL: Duration = Duration::from_secs(2);
const BUS_ATTEMPTS: u32 = 10;
const BUS_RETRY_DELAY: Duration = Duration::from_millis(50);
/// Delay before re-applying registers after a transport key press.
const KEY_SETTLE: Duration = Duration::from_secs(1);
const POWER_UP_KEY_START: Duration = Duration::from_secs(3);
const POWER_UP_KEY_STOP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Timeout,
    StateRequested,
    WakeUp,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deferred {
    ApplyAudioConfig,
    StartRepeating(RemoteKey),
    StopRepeating(RemoteKey),
    Publish,
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    state: DeviceState,
    last_poll: Option<Instant>,
    last_change: Option<Instant>,
}

struct Shared {
    current: Mutex<Snapshot>,
    next: Mutex<Snapshot>,
    transition: AtomicBool,
    hub: NotificationHub,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Hardware endpoints driven by the controller.
pub struct Devices {
    pub bus: Box<dyn AudioBus>,
    pub sensor: Box<dyn PowerSensor>,
    pub remote: Arc<dyn RemoteControl>,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub state_path: PathBuf,
    pub poll_interval: Duration,
}

pub struct DeviceStateController {
    shared: Arc<Shared>,
    tx: mpsc::Sender<Signal>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceStateController {
    /// Restores the persisted state, reads the sensor and starts the worker.
    /// Must be called from within a tokio runtime.
    pub fn start(config: ControllerConfig, devices: Devices) -> Self {
        let mut state = persist::load_or_default(&config.state_path);
        state.power = devices.sensor.is_powered_on();
        state.remote_key = None;

        let shared = Arc::new(Shared {
            current: Mutex::new(Snapshot { state: state.clone(), ..Snapshot::default() }),
            next: Mutex::new(Snapshot { state, ..Snapshot::default() }),
            transition: AtomicBool::new(false),
            hub: NotificationHub::new(),
        });

        let (tx, rx) = mpsc::channel(16);
        let worker = Worker {
            shared: shared.clone(),
            bus: Arc::new(Mutex::new(devices.bus)),
            sensor: Arc::from(devices.sensor),
            remote: devices.remote,
            schedule: Schedule::new(),
            state_path: config.state_path,
            poll_interval: config.poll_interval,
            asleep: false,
        };
        let handle = tokio::spawn(worker.run(rx));

        Self { shared, tx, worker: Mutex::new(Some(handle)) }
    }

    /// Subscribes `session`; the first listener wakes a sleeping controller.
    pub fn add_listener(&self, session: impl Into<String>, callback: impl Fn() + Send + Sync + 'static) -> usize {
        let count = self.shared.hub.subscribe(session, callback);
        if count == 1 {
            self.signal(Signal::WakeUp);
        }
        count
    }

    pub fn remove_listener(&self, session: &str) -> usize {
        self.shared.hub.unsubscribe(session)
    }

    pub fn listener_count(&self) -> usize {
        self.shared.hub.listener_count()
    }

    /// Requests `state`. Refused while a power transition is in flight; an
    /// accepted request is applied asynchronously by the worker.
    pub fn set_state(&self, state: DeviceState) -> bool {
        let mut next = lock(&self.shared.next);
        if self.shared.transition.load(Ordering::SeqCst) {
            return false;
        }
        next.state = state;
        drop(next);
        self.signal(Signal::StateRequested)
    }

    /// Last hardware-confirmed state.
    pub fn state(&self) -> DeviceState {
        lock(&self.shared.current).state.clone()
    }

    pub fn in_transition(&self) -> bool {
        self.shared.transition.load(Ordering::SeqCst)
    }

    /// Stops the worker and waits for it to finish.
    pub async fn shutdown(&self) {
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(handle) = handle else {
            return;
        };
        let _ = self.tx.send(Signal::Shutdown).await;
        if let Err(e) = handle.await {
            warn!("hardware worker ended abnormally: {e}");
        }
    }

    fn signal(&self, signal: Signal) -> bool {
        match self.tx.try_send(signal) {
            Ok(()) => true,
            // A full queue already holds a wake-up for the worker, and the
            // worker always reads the latest snapshot.
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("hardware: {signal:?} coalesced");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

struct Worker {
    shared: Arc<Shared>,
    bus: Arc<Mutex<Box<dyn AudioBus>>>,
    sensor: Arc<dyn PowerSensor>,
    remote: Arc<dyn RemoteControl>,
    schedule: Schedule<Deferred>,
    state_path: PathBuf,
    poll_interval: Duration,
    asleep: bool,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<Signal>) {
        let mut tick = Instant::now() + self.poll_interval;
        loop {
            let signal = if self.asleep {
                rx.recv().await.unwrap_or(Signal::Shutdown)
            } else {
                match tokio::time::timeout_at(tick, rx.recv()).await {
                    Err(_) => Signal::Timeout,
                    Ok(signal) => signal.unwrap_or(Signal::Shutdown),
                }
            };

            match signal {
                Signal::Timeout => {
                    tick = Instant::now() + self.poll_interval;
                    self.on_timer().await;
                }
                Signal::StateRequested => {
                    let was_asleep = self.asleep;
                    self.on_state_requested().await;
                    if was_asleep && !self.asleep {
                        tick = Instant::now() + self.poll_interval;
                    }
                }
                Signal::WakeUp => {
                    if self.asleep {
                        info!("Hardware: waking up");
                        self.asleep = false;
                        tick = Instant::now() + self.poll_interval;
                    }
                }
                Signal::Shutdown => return,
            }
        }
    }

    fn current(&self) -> Snapshot {
        lock(&self.shared.current).clone()
    }

    fn next_state(&self) -> DeviceState {
        lock(&self.shared.next).state.clone()
    }

    fn store_current(&self, snapshot: Snapshot) {
        *lock(&self.shared.current) = snapshot;
    }

    fn changed(&self, now: Instant) {
        lock(&self.shared.current).last_change = Some(now);
        self.shared.hub.publish();
    }

    /// Device I/O blocks, so it runs on the blocking pool.
    async fn write_bus(&self, regs: Vec<u8>) -> anyhow::Result<()> {
        let bus = self.bus.clone();
        tokio::task::spawn_blocking(move || {
            let mut bus = lock(&bus);
            bus.write(&regs)
        })
            .await
            .map_err(|e| anyhow::anyhow!(e))
            .and_then(|x| x)
    }

    async fn read_sensor(&self) -> bool {
        let sensor = self.sensor.clone();
        tokio::task::spawn_blocking(move || sensor.is_powered_on())
            .await
            .unwrap_or_else(|e| {
                error!("power sensor: {e}");
                false
            })
    }

    /// Writes `next` to the chip, retrying up to `attempts` times. An input
    /// change is written with both speakers silenced first.
    async fn apply(&mut self, next: &DeviceState, current: &DeviceState, attempts: u32) -> bool {
        let regs = tda7318::encode(next, next.source != current.source);
        let mut last_err = None;
        for attempt in 0..attempts {
            match self.write_bus(regs.clone()).await {
                Ok(()) => return true,
                Err(e) => last_err = Some(e),
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(BUS_RETRY_DELAY).await;
            }
        }
        if let Some(e) = last_err {
            error!("i2c: {e:#}");
        }
        false
    }

    async fn apply_audio_config(&mut self) -> bool {
        let next = self.next_state();
        let current = self.current().state;
        self.apply(&next, &current, BUS_ATTEMPTS).await
    }

    async fn on_timer(&mut self) {
        let now = Instant::now();
        let mut changed = false;
        let mut current = self.current();
        let poll_due = current.last_poll.map_or(true, |t| now > t + SENSOR_INTERVAL);

        if self.shared.transition.load(Ordering::SeqCst) || poll_due {
            let powered_on = self.read_sensor().await;
            if current.state.power != powered_on {
                if self.shared.transition.swap(false, Ordering::SeqCst) {
                    self.remote.stop_repeating(RemoteKey::Power).await;
                }
                if powered_on {
                    let next = self.next_state();
                    self.apply(&next, &current.state, BUS_ATTEMPTS).await;
                    // Hold a source key once the amplifier has settled.
                    let key = if current.state.source == Source::Cd { RemoteKey::Cd } else { RemoteKey::Aux };
                    self.schedule.at(now + POWER_UP_KEY_START, Deferred::ApplyAudioConfig);
                    self.schedule.at(now + POWER_UP_KEY_START, Deferred::StartRepeating(key));
                    self.schedule.at(now + POWER_UP_KEY_STOP, Deferred::StopRepeating(key));
                    self.schedule.at(now + POWER_UP_KEY_STOP, Deferred::ApplyAudioConfig);
                    self.schedule.at(now + POWER_UP_KEY_STOP, Deferred::Publish);
                }
                current.state.power = powered_on;
                if !powered_on {
                    persist::persist(self.state_path.clone(), current.state.clone()).await;
                    changed = true;
                }
            }
            current.last_poll = Some(now);

            let limit = current.state.auto_power_off;
            let idle_limit = Duration::try_from_secs_f32(limit).ok().filter(|d| !d.is_zero());
            if let (Some(last_change), Some(idle_limit)) = (current.last_change, idle_limit) {
                if now.checked_duration_since(last_change).is_some_and(|idle| idle > idle_limit)
                    && powered_on
                    && !self.shared.transition.load(Ordering::SeqCst)
                {
                    info!("Hardware: auto power off after {limit}s without changes");
                    self.shared.transition.store(true, Ordering::SeqCst);
                    if !self.remote.start_repeating(RemoteKey::Power).await {
                        self.shared.transition.store(false, Ordering::SeqCst);
                    }
                    changed = true;
                }
            }
            self.store_current(current);

            if self.shared.hub.listener_count() == 0
                && !powered_on
                && !self.shared.transition.load(Ordering::SeqCst)
                && self.schedule.is_empty()
            {
                info!("Hardware: going to sleep");
                self.asleep = true;
            }
        }

        if changed {
            self.changed(now);
        }

        for action in self.schedule.take_due(now) {
            self.run_deferred(action).await;
        }
    }

    async fn on_state_requested(&mut self) {
        let now = Instant::now();
        let mut current = self.current();
        // The pending key belongs to this reconciliation step only. A power
        // change becomes a transition before `next` is released, so requests
        // are refused from here on.
        let (mut next, begins_transition) = {
            let mut n = lock(&self.shared.next);
            let state = n.state.clone();
            n.state.remote_key = None;
            let begins = state.power != current.state.power && !self.shared.transition.load(Ordering::SeqCst);
            if begins {
                self.shared.transition.store(true, Ordering::SeqCst);
            }
            (state, begins)
        };
        let mut changed = false;

        if begins_transition {
            // The sensor must be polled to see the transition through.
            self.asleep = false;
            if !self.remote.start_repeating(RemoteKey::Power).await {
                warn!("Hardware: power key not sent, transition abandoned");
                self.shared.transition.store(false, Ordering::SeqCst);
            }
        }

        if let Some(key) = source_switch_key(current.state.source, next.source) {
            next.remote_key = Some(key);
        }

        let key = next.remote_key.take();
        if current.state.power {
            if let Some(key) = key {
                changed = true;
                self.remote.send_once(key).await;
                // The press may change levels on the amplifier side.
                self.schedule.at(now + KEY_SETTLE, Deferred::ApplyAudioConfig);
            }
        }

        if current.state.power && next.power && self.apply(&next, &current.state, BUS_ATTEMPTS).await {
            changed = true;
            current.state = next;
            self.store_current(current);
        }

        if changed {
            self.changed(now);
        }
    }

    async fn run_deferred(&mut self, action: Deferred) {
        match action {
            Deferred::ApplyAudioConfig => {
                self.apply_audio_config().await;
            }
            Deferred::StartRepeating(key) => {
                self.remote.start_repeating(key).await;
            }
            Deferred::StopRepeating(key) => {
                self.remote.stop_repeating(key).await;
            }
            Deferred::Publish => self.shared.hub.publish(),
        }
    }
}
