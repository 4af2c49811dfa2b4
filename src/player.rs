use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::notify::NotificationHub;
use crate::process::{ProcessHandle, ProcessSignal, Spawner};

// --- Playback supervisor ---------------------------------------------------
//
// Owns the single "now playing" slot. Two backends:
//
//   local decoder  mplayer in slave mode; metadata and position are polled
//                  with get_<property> and answered as ANS_<Name>=<value>
//   relay client   audiocast client; controlled with signals, statistics
//                  polled with get_statistics and answered as key=value
//
// All process interaction happens on the worker task.

const RELAY_SCHEMES: [&str; 2] = ["relay://", "audiocast://"];
const RELAY_POLL: Duration = Duration::from_millis(1000);
/// How long a decoder gets to honour `quit` before it is killed.
const QUIT_GRACE: Duration = Duration::from_secs(2);
const DECODER_QUERIES: [&str; 5] = ["file_name", "audio_samples", "audio_bitrate", "audio_codec", "time_pos"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    StartPending,
    Playing,
    Terminating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    None,
    LocalDecoder,
    RelayClient,
}

#[derive(Debug, Clone)]
pub struct PlayerConfig {
    pub decoder: String,
    pub relay: String,
    pub update_interval: Duration,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            decoder: "/usr/bin/mplayer".into(),
            relay: "/usr/local/bin/audiocast_client".into(),
            update_interval: Duration::from_millis(500),
        }
    }
}

struct Status {
    state: PlaybackState,
    backend: Backend,
    properties: BTreeMap<String, String>,
    query_outstanding: bool,
    paused: bool,
    update_interval: Duration,
}

impl Status {
    fn reset(&mut self) {
        self.state = PlaybackState::Idle;
        self.backend = Backend::None;
        self.properties.clear();
        self.query_outstanding = false;
        self.paused = false;
    }
}

struct Shared {
    status: Mutex<Status>,
    hub: NotificationHub,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug)]
enum Command {
    Play(String),
    Pause,
    Stop,
    Shutdown,
}

pub struct PlaybackSupervisor {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackSupervisor {
    /// Starts the worker. Must be called from within a tokio runtime.
    pub fn start(config: PlayerConfig, spawner: Arc<dyn Spawner>) -> Self {
        let shared = Arc::new(Shared {
            status: Mutex::new(Status {
                state: PlaybackState::Idle,
                backend: Backend::None,
                properties: BTreeMap::new(),
                query_outstanding: false,
                paused: false,
                update_interval: config.update_interval,
            }),
            hub: NotificationHub::new(),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker { shared: shared.clone(), spawner, config, process: None };
        let handle = tokio::spawn(worker.run(rx));
        Self { shared, tx, worker: Mutex::new(Some(handle)) }
    }

    /// Stops whatever is playing, then starts `uri`. `relay://` URIs go to
    /// the relay client, anything else non-empty to the decoder.
    pub fn play(&self, uri: impl Into<String>) {
        self.send(Command::Play(uri.into()));
    }

    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.lock().state
    }

    pub fn backend(&self) -> Backend {
        self.shared.lock().backend
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PlaybackState::Playing
    }

    pub fn is_idle(&self) -> bool {
        self.state() == PlaybackState::Idle
    }

    pub fn stream_property(&self, name: &str) -> String {
        self.shared.lock().properties.get(name).cloned().unwrap_or_default()
    }

    pub fn properties(&self) -> BTreeMap<String, String> {
        self.shared.lock().properties.clone()
    }

    pub fn update_interval(&self) -> Duration {
        self.shared.lock().update_interval
    }

    pub fn set_update_interval(&self, interval: Duration) {
        self.shared.lock().update_interval = interval;
    }

    pub fn subscribe(&self, session: impl Into<String>, callback: impl Fn() + Send + Sync + 'static) -> usize {
        self.shared.hub.subscribe(session, callback)
    }

    pub fn unsubscribe(&self, session: &str) -> usize {
        self.shared.hub.unsubscribe(session)
    }

    /// Stops playback and waits for the worker to exit.
    pub async fn shutdown(&self) {
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(handle) = handle else {
            return;
        };
        self.send(Command::Shutdown);
        if let Err(e) = handle.await {
            warn!("player worker ended abnormally: {e}");
        }
    }

    fn send(&self, command: Command) {
        if let Err(e) = self.tx.send(command) {
            warn!("player: {:?} dropped, worker is gone", e.0);
        }
    }
}

/// Parses a decoder answer such as `ANS_TIME_POSITION=12.0` or
/// `ANS_FILE_NAME='x.mp3'` into a lower-cased name and unquoted value.
fn parse_answer(line: &str) -> Option<(String, String)> {
    let (name, value) = line.strip_prefix("ANS_")?.split_once('=')?;
    let value = match (value.starts_with('\''), value.ends_with('\'')) {
        (true, true) if value.len() >= 2 => &value[1..value.len() - 1],
        (false, false) => value,
        _ => return None,
    };
    Some((name.to_ascii_lowercase(), value.to_string()))
}

fn parse_statistic(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once('=')?;
    Some((key.to_ascii_lowercase(), value.to_string()))
}

/// Command line for a relay URI: `relay://<server>[/[?]opt1[&opt2...]]`.
fn relay_args(relay: &str, uri: &str) -> Option<Vec<String>> {
    let rest = RELAY_SCHEMES.iter().find_map(|scheme| uri.strip_prefix(scheme))?;
    let (server, options) = rest.split_once('/').unwrap_or((rest, ""));
    let options = options.strip_prefix('?').unwrap_or(options);

    let mut args = vec![relay.to_string(), "--quiet".into(), "--stdin-control".into(), format!("--server={server}")];
    args.extend(options.split('&').filter(|o| !o.is_empty()).map(|o| format!("--{o}")));
    Some(args)
}

fn decoder_args(decoder: &str) -> Vec<String> {
    [decoder, "-idle", "-slave", "-quiet", "-ao", "alsa"].iter().map(|s| s.to_string()).collect()
}

enum Event {
    Command(Option<Command>),
    Output(Option<String>),
}

struct Worker {
    shared: Arc<Shared>,
    spawner: Arc<dyn Spawner>,
    config: PlayerConfig,
    process: Option<Box<dyn ProcessHandle>>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let event = tokio::select! {
                command = rx.recv() => Event::Command(command),
                line = self.wait_output() => Event::Output(line),
            };

            match event {
                Event::Command(Some(Command::Play(uri))) => self.play(uri).await,
                Event::Command(Some(Command::Pause)) => self.pause().await,
                Event::Command(Some(Command::Stop)) => self.stop().await,
                Event::Command(Some(Command::Shutdown) | None) => {
                    self.stop().await;
                    self.shared.lock().state = PlaybackState::Terminating;
                    return;
                }
                Event::Output(Some(line)) => self.on_output(line),
                Event::Output(None) => self.on_timeout().await,
            }
        }
    }

    fn backend(&self) -> Backend {
        self.shared.lock().backend
    }

    async fn wait_output(&mut self) -> Option<String> {
        let timeout = match self.backend() {
            Backend::RelayClient => RELAY_POLL,
            _ => self.shared.lock().update_interval,
        };
        match self.process.as_mut() {
            Some(p) => p.next_line(timeout).await,
            None => std::future::pending().await,
        }
    }

    async fn play(&mut self, uri: String) {
        self.stop().await;
        if uri.is_empty() {
            return;
        }

        let (backend, args) = match relay_args(&self.config.relay, &uri) {
            Some(args) => (Backend::RelayClient, args),
            None => (Backend::LocalDecoder, decoder_args(&self.config.decoder)),
        };
        let mut process = match self.spawner.spawn(&args) {
            Ok(p) => p,
            Err(e) => {
                error!("{e:#}");
                return;
            }
        };

        let state = match backend {
            Backend::LocalDecoder => {
                process.send_line(&format!("loadfile {uri}")).await;
                for property in DECODER_QUERIES {
                    process.send_line(&format!("get_{property}")).await;
                }
                PlaybackState::StartPending
            }
            _ => PlaybackState::Playing,
        };
        self.process = Some(process);
        {
            let mut s = self.shared.lock();
            s.reset();
            s.state = state;
            s.backend = backend;
        }
        info!("Player: playing {uri}");
        self.shared.hub.publish();
    }

    async fn pause(&mut self) {
        let Some(process) = self.process.as_mut() else {
            return;
        };
        let (backend, paused) = {
            let s = self.shared.lock();
            (s.backend, s.paused)
        };
        match backend {
            Backend::LocalDecoder => {
                process.send_line("pause").await;
            }
            _ => process.raise(if paused { ProcessSignal::Continue } else { ProcessSignal::Stop }),
        }
        self.shared.lock().paused = !paused;
    }

    async fn stop(&mut self) {
        if self.shared.lock().paused {
            self.pause().await;
        }
        let Some(mut process) = self.process.take() else {
            return;
        };

        if self.backend() == Backend::LocalDecoder {
            process.send_line("quit").await;
            let deadline = Instant::now() + QUIT_GRACE;
            while process.running() && Instant::now() < deadline {
                process.next_line(Duration::from_millis(100)).await;
            }
        }
        process.kill().await;

        self.shared.lock().reset();
        info!("Player: stopped");
        self.shared.hub.publish();
    }

    async fn on_timeout(&mut self) {
        let Some(process) = self.process.as_mut() else {
            return;
        };
        if !process.running() {
            self.process = None;
            self.shared.lock().reset();
            info!("Player: playback ended");
            self.shared.hub.publish();
            return;
        }

        let (backend, should_query) = {
            let s = self.shared.lock();
            (s.backend, s.state == PlaybackState::Playing && !s.query_outstanding)
        };
        if should_query {
            let query = if backend == Backend::RelayClient { "get_statistics" } else { "get_time_pos" };
            if process.send_line(query).await {
                self.shared.lock().query_outstanding = true;
            }
        }
    }

    fn on_output(&mut self, line: String) {
        let changed = match self.backend() {
            Backend::LocalDecoder => self.on_decoder_line(&line),
            Backend::RelayClient => self.on_relay_output(&line),
            Backend::None => false,
        };
        if changed {
            self.shared.hub.publish();
        }
    }

    fn on_decoder_line(&mut self, line: &str) -> bool {
        let Some((name, value)) = parse_answer(line) else {
            return false;
        };
        let mut s = self.shared.lock();
        let mut changed = s.properties.get(&name) != Some(&value);
        if name == "time_position" {
            s.query_outstanding = false;
            if s.state == PlaybackState::StartPending {
                s.state = PlaybackState::Playing;
                changed = true;
            }
        }
        s.properties.insert(name, value);
        changed
    }

    fn on_relay_output(&mut self, first: &str) -> bool {
        let mut lines = vec![first.to_string()];
        if let Some(process) = self.process.as_mut() {
            while let Some(line) = process.try_next_line() {
                lines.push(line);
            }
        }

        let mut s = self.shared.lock();
        s.query_outstanding = false;
        if s.state == PlaybackState::StartPending {
            s.state = PlaybackState::Playing;
        }
        for (key, value) in lines.iter().filter_map(|l| parse_statistic(l)) {
            s.properties.insert(key, value);
        }
        true
    }
}
