use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::hardware::DeviceStateController;
use crate::player::{Backend, PlaybackState, PlaybackSupervisor};
use crate::remote::RemoteKey;
use crate::state::{DeviceState, Source, LEVEL_FIELDS};

#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub hardware: Arc<DeviceStateController>,
    pub player: Arc<PlaybackSupervisor>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/state", get(state_text))
        .route("/control", get(control))
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/status", get(status))
        .route("/api/v1/events", get(events))
        .with_state(state)
}

// --- Plain-text control API ------------------------------------------------
//
// Line-oriented `Name=value` interface used by scripts and the front-end:
//
//   GET /state                      current state, one field per line
//   GET /control?VolumeL=-30&...    modify the current state; replies 1 or 0

fn flag(v: &str) -> bool {
    number(v) != 0.0
}

fn number(v: &str) -> f32 {
    v.trim().parse::<f32>().ok().filter(|x| x.is_finite()).unwrap_or(0.0)
}

fn render_state(s: &DeviceState) -> String {
    let mut out = String::new();
    out.push_str(&format!("Power={}\n", s.power as u8));
    out.push_str(&format!("Mute={}\n", s.mute as u8));
    out.push_str(&format!("Source={}\n", s.source.as_str()));
    for field in &LEVEL_FIELDS {
        out.push_str(&format!("{}={}\n", field.name, (field.get)(s)));
    }
    out.push_str(&format!("Stream={}\n", s.stream));
    out.push('\n');
    out
}

struct ControlRequest {
    state: DeviceState,
    accepted: bool,
    stream_changed: bool,
}

/// Applies query parameters onto `state`. The last value of a repeated
/// parameter wins.
///
/// While power is off, only `Power=1` on its own is accepted; switching power
/// cannot be combined with other changes.
fn apply_control(mut state: DeviceState, pairs: &[(String, String)]) -> ControlRequest {
    let params: BTreeMap<&str, &str> = pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    let mut accepted = true;

    match params.get("Power") {
        Some(v) => {
            let on = flag(v);
            if !(on && state.power) && params.len() > 1 {
                accepted = false;
            }
            state.power = on;
        }
        None if !state.power => accepted = false,
        None => {}
    }

    for field in &LEVEL_FIELDS {
        if let Some(v) = params.get(field.name) {
            (field.set)(&mut state, number(v));
        }
    }

    if let Some(v) = params.get("Mute") {
        state.mute = flag(v);
    }
    if let Some(v) = params.get("Source") {
        state.source = Source::from_name(v);
    }
    if let Some(v) = params.get("RemoteKey") {
        match RemoteKey::transport_key(v) {
            Some(key) => state.remote_key = Some(key),
            None => accepted = false,
        }
    }

    let mut stream_changed = false;
    if let Some(v) = params.get("Stream") {
        if *v != state.stream {
            state.stream = v.to_string();
            stream_changed = true;
        }
    }

    ControlRequest { state, accepted, stream_changed }
}

async fn state_text(State(state): State<AppState>) -> String {
    render_state(&state.hardware.state())
}

async fn control(State(state): State<AppState>, Query(pairs): Query<Vec<(String, String)>>) -> String {
    let current = state.hardware.state();
    let was_on = current.power;
    let req = apply_control(current, &pairs);

    let ok = req.accepted && state.hardware.set_state(req.state.clone());
    if ok && req.stream_changed {
        state.player.stop();
        if !req.state.stream.is_empty() {
            state.player.play(req.state.stream.clone());
        }
    }
    if ok && was_on && !req.state.power {
        state.player.stop();
    }
    debug!("control {pairs:?} -> {ok}");

    format!("{}\n\n", ok as u8)
}

// --- JSON status and change feed -------------------------------------------

#[derive(Serialize)]
struct PlayerStatus {
    state: PlaybackState,
    backend: Backend,
    properties: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    device: DeviceState,
    in_transition: bool,
    listeners: usize,
    player: PlayerStatus,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: state.version.clone(),
        device: state.hardware.state(),
        in_transition: state.hardware.in_transition(),
        listeners: state.hardware.listener_count(),
        player: PlayerStatus {
            state: state.player.state(),
            backend: state.player.backend(),
            properties: state.player.properties(),
        },
    })
}

async fn events(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| event_session(socket, state))
}

/// One change-feed client. Holding a subscription keeps the device
/// controller awake.
async fn event_session(socket: WebSocket, state: AppState) {
    let session = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<&'static str>();

    let device_tx = tx.clone();
    state.hardware.add_listener(session.clone(), move || {
        let _ = device_tx.send("device");
    });
    state.player.subscribe(session.clone(), move || {
        let _ = tx.send("player");
    });
    debug!("events: session {session} opened");

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            changed = rx.recv() => {
                let Some(what) = changed else { break };
                let frame = json!({ "changed": what }).to_string();
                if sink.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.hardware.remove_listener(&session);
    state.player.unsubscribe(&session);
    debug!("events: session {session} closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::tests::{FakeBus, FakeSensor};
    use crate::hardware::{ControllerConfig, Devices};
    use crate::player::PlayerConfig;
    use crate::process::tests::FakeSpawner;
    use crate::remote::tests::RecordingRemote;
    use std::time::Duration;

    fn pairs(q: &[(&str, &str)]) -> Vec<(String, String)> {
        q.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn powered() -> DeviceState {
        DeviceState { power: true, ..DeviceState::default() }
    }

    #[test]
    fn test_render_default_state() {
        assert_eq!(
            render_state(&DeviceState::default()),
            "Power=0\nMute=0\nSource=CD\nVolumeL=-36\nVolumeR=-36\nTreble=0\nBass=0\n\
             GainCD=0\nGainAUX=0\nGainNetwork=0\nAutoPowerOff=345600\nStream=\n\n"
        );
    }

    #[test]
    fn test_control_refused_while_off() {
        let off = DeviceState::default();
        assert!(!apply_control(off.clone(), &pairs(&[("VolumeL", "-20")])).accepted);
        assert!(!apply_control(off.clone(), &pairs(&[("Power", "1"), ("VolumeL", "-20")])).accepted);

        let req = apply_control(off, &pairs(&[("Power", "1")]));
        assert!(req.accepted);
        assert!(req.state.power);
    }

    #[test]
    fn test_control_power_switch_alone() {
        assert!(apply_control(powered(), &pairs(&[("Power", "1"), ("Bass", "4")])).accepted);
        assert!(!apply_control(powered(), &pairs(&[("Power", "0"), ("Bass", "4")])).accepted);
        let req = apply_control(powered(), &pairs(&[("Power", "0")]));
        assert!(req.accepted);
        assert!(!req.state.power);
    }

    #[test]
    fn test_control_fields() {
        let req = apply_control(
            powered(),
            &pairs(&[
                ("VolumeL", "-20.5"),
                ("VolumeL", "-21"),
                ("GainAUX", "3"),
                ("AutoPowerOff", "600"),
                ("Mute", "1"),
                ("Source", "Network"),
                ("Treble", "bogus"),
            ]),
        );
        assert!(req.accepted);
        assert_eq!(req.state.volume_l, -21.0);
        assert_eq!(req.state.gain_aux, 3.0);
        assert_eq!(req.state.auto_power_off, 600.0);
        assert!(req.state.mute);
        assert_eq!(req.state.source, Source::Network);
        assert_eq!(req.state.treble, 0.0);
        assert!(!req.stream_changed);

        let req = apply_control(powered(), &pairs(&[("Source", "Phono")]));
        assert_eq!(req.state.source, Source::Tape);
    }

    #[test]
    fn test_control_stream_and_remote_key() {
        let req = apply_control(powered(), &pairs(&[("Stream", "relay://host"), ("RemoteKey", "next")]));
        assert!(req.accepted);
        assert!(req.stream_changed);
        assert_eq!(req.state.remote_key, Some(RemoteKey::CdNext));

        let same = DeviceState { stream: "relay://host".into(), ..powered() };
        assert!(!apply_control(same, &pairs(&[("Stream", "relay://host")])).stream_changed);
        assert!(!apply_control(powered(), &pairs(&[("RemoteKey", "power")])).accepted);
    }

    struct Rig {
        state: AppState,
        spawner: FakeSpawner,
        bus: FakeBus,
        _dir: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let bus = FakeBus::default();
        let sensor = FakeSensor::default();
        sensor.set(true);
        let hardware = DeviceStateController::start(
            ControllerConfig { state_path: dir.path().join("state"), poll_interval: Duration::from_millis(500) },
            Devices { bus: Box::new(bus.clone()), sensor: Box::new(sensor), remote: Arc::new(RecordingRemote::default()) },
        );
        let spawner = FakeSpawner::default();
        let player = PlaybackSupervisor::start(PlayerConfig::default(), Arc::new(spawner.clone()));
        let state = AppState { version: "test".into(), hardware: Arc::new(hardware), player: Arc::new(player) };
        Rig { state, spawner, bus, _dir: dir }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_endpoint_applies_and_plays() {
        let r = rig();
        let reply = control(
            State(r.state.clone()),
            Query(pairs(&[("VolumeR", "-30"), ("Stream", "relay://host:9000")])),
        )
        .await;
        assert_eq!(reply, "1\n\n");
        settle().await;

        assert_eq!(r.state.hardware.state().volume_r, -30.0);
        assert_eq!(r.state.hardware.state().stream, "relay://host:9000");
        assert_eq!(r.bus.writes().len(), 1);
        assert_eq!(r.spawner.count(), 1);
        assert!(r.state.player.is_playing());

        let text = state_text(State(r.state.clone())).await;
        assert!(text.contains("VolumeR=-30\n"));
        assert!(text.ends_with("Stream=relay://host:9000\n\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_off_stops_playback() {
        let r = rig();
        r.state.player.play("relay://host");
        settle().await;
        assert!(r.state.player.is_playing());

        let reply = control(State(r.state.clone()), Query(pairs(&[("Power", "0")]))).await;
        assert_eq!(reply, "1\n\n");
        settle().await;
        assert!(r.state.player.is_idle());
        assert!(r.state.hardware.in_transition());

        // Refused while the amplifier is switching.
        let reply = control(State(r.state.clone()), Query(pairs(&[("Power", "1")]))).await;
        assert_eq!(reply, "0\n\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_json() {
        let r = rig();
        let Json(resp) = status(State(r.state.clone())).await;
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["version"], "test");
        assert_eq!(v["device"]["power"], true);
        assert_eq!(v["device"]["source"], "CD");
        assert_eq!(v["player"]["state"], "idle");
        assert_eq!(v["player"]["backend"], "none");
        assert_eq!(v["listeners"], 0);
        assert!(v["device"].get("remote_key").is_none());
    }
}
