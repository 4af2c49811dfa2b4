use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Engine configuration, read once at startup from `AMPCONTROL_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub state_path: PathBuf,
    pub power_sensor: PathBuf,
    pub i2c_bus: PathBuf,
    pub i2c_address: u16,
    pub lirc_socket: PathBuf,
    pub remote_name: String,
    pub decoder: String,
    pub relay: String,
    pub poll_interval: Duration,
    pub player_update_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            state_path: "/var/local/ampcontrol/state".into(),
            power_sensor: "/var/local/ampcontrol/powersensor".into(),
            i2c_bus: "/dev/i2c-1".into(),
            i2c_address: crate::tda7318::ADDRESS,
            lirc_socket: "/var/run/lirc/lircd".into(),
            remote_name: "goldstard".into(),
            decoder: "/usr/bin/mplayer".into(),
            relay: "/usr/local/bin/audiocast_client".into(),
            poll_interval: Duration::from_millis(500),
            player_update_interval: Duration::from_millis(500),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Config::default();
        let text = |key: &str, default: String| get(key).unwrap_or(default);
        let path = |key: &str, default: PathBuf| get(key).map(PathBuf::from).unwrap_or(default);
        let millis = |key: &str, default: Duration| {
            Duration::from_millis(parsed(&get, key, default.as_millis() as u64, u64::from_str))
        };

        Config {
            bind: parsed(&get, "AMPCONTROL_BIND", d.bind, SocketAddr::from_str),
            state_path: path("AMPCONTROL_STATE_PATH", d.state_path),
            power_sensor: path("AMPCONTROL_POWER_SENSOR", d.power_sensor),
            i2c_bus: path("AMPCONTROL_I2C_BUS", d.i2c_bus),
            i2c_address: parsed(&get, "AMPCONTROL_I2C_ADDRESS", d.i2c_address, parse_address),
            lirc_socket: path("AMPCONTROL_LIRC_SOCKET", d.lirc_socket),
            remote_name: text("AMPCONTROL_REMOTE_NAME", d.remote_name),
            decoder: text("AMPCONTROL_DECODER", d.decoder),
            relay: text("AMPCONTROL_RELAY", d.relay),
            poll_interval: millis("AMPCONTROL_POLL_MS", d.poll_interval),
            player_update_interval: millis("AMPCONTROL_PLAYER_UPDATE_MS", d.player_update_interval),
        }
    }
}

fn parsed<T, E: std::fmt::Display>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parse: impl Fn(&str) -> Result<T, E>,
) -> T {
    let Some(raw) = get(key) else {
        return default;
    };
    match parse(raw.trim()) {
        Ok(v) => v,
        Err(e) => {
            warn!("ignoring {key}={raw:?}: {e}");
            default
        }
    }
}

/// Accepts `0x44` style hex as well as decimal.
fn parse_address(s: &str) -> Result<u16, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    }
}
