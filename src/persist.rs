use std::path::Path;

use anyhow::Context;

use crate::state::{DeviceState, Source};

// --- Persisted snapshot ----------------------------------------------------
//
// Layout (version 1):
//
//   magic "AMPS" | version u8
//   power u8 | mute u8 | source u8
//   gain_cd gain_aux gain_network volume_l volume_r treble bass auto_power_off  (f32 LE each)
//   stream URI bytes, NUL terminated
//
// The pending remote key is transient and never written.

const MAGIC: &[u8; 4] = b"AMPS";
const VERSION: u8 = 1;
const FIXED_LEN: usize = MAGIC.len() + 1 + 3 + 8 * 4;

pub fn encode(state: &DeviceState) -> Vec<u8> {
    let mut out = Vec::with_capacity(FIXED_LEN + state.stream.len() + 1);
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.push(state.power as u8);
    out.push(state.mute as u8);
    out.push(state.source.code());
    for v in [
        state.gain_cd,
        state.gain_aux,
        state.gain_network,
        state.volume_l,
        state.volume_r,
        state.treble,
        state.bass,
        state.auto_power_off,
    ] {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out.extend_from_slice(state.stream.as_bytes());
    out.push(0);
    out
}

pub fn decode(buf: &[u8]) -> anyhow::Result<DeviceState> {
    if buf.len() < FIXED_LEN {
        anyhow::bail!("snapshot too short ({} bytes)", buf.len());
    }
    if &buf[..4] != MAGIC {
        anyhow::bail!("not a state snapshot");
    }
    if buf[4] != VERSION {
        anyhow::bail!("unsupported snapshot version {}", buf[4]);
    }

    let source = Source::from_code(buf[7])
        .ok_or_else(|| anyhow::anyhow!("invalid source code {}", buf[7]))?;

    let mut levels = [0f32; 8];
    let mut i = 8;
    for v in levels.iter_mut() {
        *v = f32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        i += 4;
    }

    // A missing terminator means the file was cut short; take what is there.
    let tail = &buf[FIXED_LEN..];
    let end = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
    let stream = String::from_utf8(tail[..end].to_vec()).context("stream URI is not UTF-8")?;

    let [gain_cd, gain_aux, gain_network, volume_l, volume_r, treble, bass, auto_power_off] =
        levels;
    Ok(DeviceState {
        power: buf[5] != 0,
        mute: buf[6] != 0,
        source,
        remote_key: None,
        gain_cd,
        gain_aux,
        gain_network,
        volume_l,
        volume_r,
        treble,
        bass,
        stream,
        auto_power_off,
    })
}

pub fn save(path: &Path, state: &DeviceState) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }
    std::fs::write(path, encode(state))
        .with_context(|| format!("failed to write {}", path.display()))
}

pub fn load(path: &Path) -> anyhow::Result<DeviceState> {
    let buf = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    decode(&buf)
}

/// Startup read: any failure falls back to the compiled-in defaults.
pub fn load_or_default(path: &Path) -> DeviceState {
    match load(path) {
        Ok(state) => {
            tracing::info!("restored state from {}", path.display());
            state
        }
        Err(e) => {
            tracing::error!("could not restore state, using defaults: {e:#}");
            DeviceState::default()
        }
    }
}

/// Writes the snapshot off the async runtime; failures are logged only.
pub async fn persist(path: std::path::PathBuf, state: DeviceState) {
    let shown = path.display().to_string();
    let _ = tokio::task::spawn_blocking(move || save(&path, &state))
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .and_then(|x| x)
        .map(|_| tracing::info!("saved state to {shown}"))
        .map_err(|e| tracing::error!("could not save state: {e:#}"));
}
