use serde::Serialize;

use crate::remote::RemoteKey;

// --- Device state ----------------------------------------------------------
//
// One value type shared by the controller, the HTTP surface and the persisted
// snapshot. Levels are in dB; `auto_power_off` is in seconds (0 disables it).

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Source {
    #[serde(rename = "CD")]
    Cd,
    #[serde(rename = "AUX")]
    Aux,
    Network,
    Tape,
    Unknown,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Cd => "CD",
            Source::Aux => "AUX",
            Source::Network => "Network",
            Source::Tape | Source::Unknown => "Tape",
        }
    }

    /// Parses the names used by the plain-text API. Anything unrecognized
    /// selects the tape input, which is what the amplifier falls back to.
    pub fn from_name(name: &str) -> Source {
        match name {
            "CD" => Source::Cd,
            "AUX" => Source::Aux,
            "Network" => Source::Network,
            _ => Source::Tape,
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            Source::Unknown => 0,
            Source::Cd => 1,
            Source::Aux => 2,
            Source::Network => 3,
            Source::Tape => 4,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Source> {
        match code {
            0 => Some(Source::Unknown),
            1 => Some(Source::Cd),
            2 => Some(Source::Aux),
            3 => Some(Source::Network),
            4 => Some(Source::Tape),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceState {
    pub power: bool,
    pub mute: bool,
    pub source: Source,
    /// One-shot key for the CD transport, consumed by the next reconciliation.
    #[serde(skip)]
    pub remote_key: Option<RemoteKey>,
    pub gain_cd: f32,
    pub gain_aux: f32,
    pub gain_network: f32,
    pub volume_l: f32,
    pub volume_r: f32,
    pub treble: f32,
    pub bass: f32,
    pub stream: String,
    pub auto_power_off: f32,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            power: false,
            mute: false,
            source: Source::Cd,
            remote_key: None,
            gain_cd: 0.0,
            gain_aux: 0.0,
            gain_network: 0.0,
            volume_l: -36.0,
            volume_r: -36.0,
            treble: 0.0,
            bass: 0.0,
            stream: String::new(),
            auto_power_off: 4.0 * 24.0 * 3600.0,
        }
    }
}

impl DeviceState {
    /// Gain trim configured for the currently selected input.
    pub fn source_gain(&self) -> f32 {
        match self.source {
            Source::Cd => self.gain_cd,
            Source::Aux => self.gain_aux,
            Source::Network => self.gain_network,
            Source::Tape | Source::Unknown => 0.0,
        }
    }
}

/// Key the CD transport needs when the amplifier moves between inputs.
///
/// The transport only cares about entering or leaving CD; moving among the
/// other inputs needs no key press.
pub fn source_switch_key(from: Source, to: Source) -> Option<RemoteKey> {
    if from == to {
        None
    } else if to == Source::Cd {
        Some(RemoteKey::Cd)
    } else if from == Source::Cd {
        Some(RemoteKey::Aux)
    } else {
        None
    }
}

// --- Named level fields ----------------------------------------------------

/// A numeric field of [`DeviceState`] addressable by its external name.
pub struct LevelField {
    pub name: &'static str,
    pub get: fn(&DeviceState) -> f32,
    pub set: fn(&mut DeviceState, f32),
}

/// Numeric fields in the order the plain-text API lists them.
pub static LEVEL_FIELDS: [LevelField; 8] = [
    LevelField { name: "VolumeL", get: |s| s.volume_l, set: |s, v| s.volume_l = v },
    LevelField { name: "VolumeR", get: |s| s.volume_r, set: |s, v| s.volume_r = v },
    LevelField { name: "Treble", get: |s| s.treble, set: |s, v| s.treble = v },
    LevelField { name: "Bass", get: |s| s.bass, set: |s, v| s.bass = v },
    LevelField { name: "GainCD", get: |s| s.gain_cd, set: |s, v| s.gain_cd = v },
    LevelField { name: "GainAUX", get: |s| s.gain_aux, set: |s, v| s.gain_aux = v },
    LevelField { name: "GainNetwork", get: |s| s.gain_network, set: |s, v| s.gain_network = v },
    LevelField { name: "AutoPowerOff", get: |s| s.auto_power_off, set: |s, v| s.auto_power_off = v },
];

pub fn level_field(name: &str) -> Option<&'static LevelField> {
    LEVEL_FIELDS.iter().find(|f| f.name == name)
}
