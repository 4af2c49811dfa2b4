//! Register model of the TDA7318 audio processor.
//!
//! [`encode`] turns a [`DeviceState`] into the byte sequence written to the
//! chip over I2C. The chip realizes the requested level in successive gain
//! stages (input preamp, main volume, per-speaker attenuation), each with its
//! own step size, so the target level is peeled off stage by stage and each
//! stage only gets what it can represent exactly.

use crate::state::{DeviceState, Source};

pub const ADDRESS: u16 = 0x44;

const VOLUME: u8 = 0x00;
const VOLUME_GAIN_BITS: u32 = 6;
const VOLUME_GAIN_RANGE: f32 = 80.0;

const SPK_L_FRONT: u8 = 0x80;
const SPK_R_FRONT: u8 = 0xa0;
const SPK_GAIN_BITS: u32 = 5;
const SPK_GAIN_RANGE: f32 = 40.0;

const INPUT: u8 = 0x40;
const INPUT_GAIN_BITS: u32 = 2;
const INPUT_GAIN_SHIFT: u32 = 3;
const INPUT_GAIN_RANGE: f32 = 25.0;

const BASS: u8 = 0x60;
const TREBLE: u8 = 0x70;
const BASS_TREBLE_MINUS: u8 = 0;
const BASS_TREBLE_PLUS: u8 = 8;
const BASS_TREBLE_GAIN_BITS: u32 = 3;
const BASS_TREBLE_GAIN_RANGE: f32 = 14.0;

/// Full attenuation code of a speaker channel.
pub const SPK_MUTE: u8 = (1 << SPK_GAIN_BITS) - 1;

/// Upper bound of [`encode`]'s output length.
pub const MAX_WRITES: usize = 8;

fn step(range: f32, bits: u32) -> f32 {
    range / (1u32 << bits) as f32
}

fn full_scale(bits: u32) -> u8 {
    ((1u32 << bits) - 1) as u8
}

fn input_index(source: Source) -> u8 {
    match source {
        Source::Aux => 0,
        Source::Network => 1,
        Source::Cd => 2,
        Source::Tape | Source::Unknown => 3,
    }
}

fn tone_code(value: f32) -> u8 {
    let max = full_scale(BASS_TREBLE_GAIN_BITS);
    let steps = (value / step(BASS_TREBLE_GAIN_RANGE, BASS_TREBLE_GAIN_BITS) + 0.5)
        .floor()
        .abs()
        .min(max as f32) as u8;
    let sign = if value > 0.0 { BASS_TREBLE_PLUS } else { BASS_TREBLE_MINUS };
    (max - steps) | sign
}

/// Encodes `s` as a sequence of register writes.
///
/// With `muted_transition` set (the input is about to change) both speaker
/// channels are first driven to full attenuation so the switch is silent.
pub fn encode(s: &DeviceState, muted_transition: bool) -> Vec<u8> {
    let source = input_index(s.source);
    let gain = s.source_gain();
    let mut vol_l = (gain + s.volume_l).min(INPUT_GAIN_RANGE);
    let mut vol_r = (gain + s.volume_r).min(INPUT_GAIN_RANGE);

    // Preamp: positive gain only, rounded up so later stages only attenuate.
    let preamp_step = step(INPUT_GAIN_RANGE, INPUT_GAIN_BITS);
    let preamp_max = full_scale(INPUT_GAIN_BITS);
    let steps = (vol_l.max(vol_r).max(0.0) / preamp_step)
        .ceil()
        .min(preamp_max as f32);
    let preamp = preamp_max - steps as u8;
    let realized = steps * preamp_step;
    vol_l -= realized;
    vol_r -= realized;

    // Main volume: attenuation of the louder channel, rounded to nearest.
    let volume_step = step(VOLUME_GAIN_RANGE, VOLUME_GAIN_BITS);
    let steps = (vol_l.max(vol_r).min(0.0).max(-VOLUME_GAIN_RANGE + volume_step) / volume_step
        + 0.5)
        .floor();
    let volume = (-steps) as u8;
    let realized = steps * volume_step;
    vol_l -= realized;
    vol_r -= realized;

    // Balance: whatever difference is left attenuates the quieter speaker.
    let spk_step = step(SPK_GAIN_RANGE, SPK_GAIN_BITS);
    let spk = ((vol_l - vol_r).abs() / spk_step + 0.5)
        .floor()
        .min(SPK_MUTE as f32) as u8;
    let (mut spk_l, mut spk_r) = if vol_l > vol_r { (0, spk) } else { (spk, 0) };

    if s.mute {
        spk_l = SPK_MUTE;
        spk_r = SPK_MUTE;
    }

    let mut out = Vec::with_capacity(MAX_WRITES);
    if muted_transition {
        out.push(SPK_L_FRONT | SPK_MUTE);
        out.push(SPK_R_FRONT | SPK_MUTE);
    }
    out.push(VOLUME | volume);
    out.push(INPUT | (preamp << INPUT_GAIN_SHIFT) | source);
    out.push(TREBLE | tone_code(s.treble));
    out.push(BASS | tone_code(s.bass));
    out.push(SPK_L_FRONT | spk_l);
    out.push(SPK_R_FRONT | spk_r);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> DeviceState {
        DeviceState { power: true, ..DeviceState::default() }
    }

    #[test]
    fn test_default_state() {
        // -36 dB: no preamp (code 3), volume -36.25 dB (code 29), +0.25 dB left
        // over is below half a speaker step.
        assert_eq!(encode(&state(), false), vec![0x1d, 0x5a, 0x77, 0x67, 0x80, 0xa0]);
    }

    #[test]
    fn test_deterministic() {
        let mut s = state();
        s.volume_l = -17.3;
        s.volume_r = -21.9;
        s.bass = 5.2;
        s.treble = -8.8;
        s.source = Source::Aux;
        s.gain_aux = 4.0;
        assert_eq!(encode(&s, true), encode(&s.clone(), true));
    }

    #[test]
    fn test_muted_transition_prefix() {
        let out = encode(&state(), true);
        assert_eq!(out.len(), MAX_WRITES);
        assert_eq!(&out[..2], &[0x80 | SPK_MUTE, 0xa0 | SPK_MUTE]);
        assert_eq!(&out[2..], encode(&state(), false).as_slice());
    }

    #[test]
    fn test_balance_attenuates_quieter_channel() {
        let mut s = state();
        s.volume_l = -30.0;
        s.volume_r = -36.0;
        let out = encode(&s, false);
        assert_eq!(out[0], 24); // -30 dB main volume
        assert_eq!(out[4], 0x80);
        assert_eq!(out[5], 0xa0 | 5); // 6 dB rounds to 5 steps of 1.25 dB

        std::mem::swap(&mut s.volume_l, &mut s.volume_r);
        let out = encode(&s, false);
        assert_eq!(out[4], 0x80 | 5);
        assert_eq!(out[5], 0xa0);
    }

    #[test]
    fn test_input_gain_ceiling() {
        let mut s = state();
        s.gain_cd = 20.0;
        s.volume_l = 10.0;
        s.volume_r = 10.0;
        let out = encode(&s, false);
        // Maximum preamp gain, nothing left for the volume stage.
        assert_eq!(out[1], INPUT | 2);
        assert_eq!(out[0], 0);
    }

    #[test]
    fn test_preamp_rounds_up() {
        let mut s = state();
        s.source = Source::Network;
        s.gain_network = 1.0;
        s.volume_l = 0.0;
        s.volume_r = 0.0;
        let out = encode(&s, false);
        // 1 dB needs one preamp step (6.25 dB), the volume stage takes back 5 dB.
        assert_eq!(out[1], INPUT | (2 << INPUT_GAIN_SHIFT) | 1);
        assert_eq!(out[0], 4);
    }

    #[test]
    fn test_balance_clamps() {
        let mut s = state();
        s.volume_l = 0.0;
        s.volume_r = -79.0;
        let out = encode(&s, false);
        assert_eq!(out[4], 0x80);
        assert_eq!(out[5], 0xa0 | SPK_MUTE);
    }

    #[test]
    fn test_volume_floor() {
        let mut s = state();
        s.volume_l = -200.0;
        s.volume_r = -200.0;
        let out = encode(&s, false);
        assert_eq!(out[0], 63);
    }

    #[test]
    fn test_mute_overrides_balance() {
        for (l, r) in [(-36.0, -36.0), (0.0, -50.0), (-50.0, 0.0), (10.0, 10.0)] {
            let mut s = state();
            s.mute = true;
            s.volume_l = l;
            s.volume_r = r;
            let out = encode(&s, false);
            assert_eq!(out[4], 0x80 | SPK_MUTE);
            assert_eq!(out[5], 0xa0 | SPK_MUTE);
        }
    }

    #[test]
    fn test_tone_codes() {
        let mut s = state();
        s.bass = 14.0;
        s.treble = -3.5;
        let out = encode(&s, false);
        assert_eq!(out[3], BASS | BASS_TREBLE_PLUS);
        assert_eq!(out[2], TREBLE | 5);

        s.bass = 40.0;
        s.treble = -40.0;
        let out = encode(&s, false);
        assert_eq!(out[3], BASS | BASS_TREBLE_PLUS);
        assert_eq!(out[2], TREBLE);
    }

    #[test]
    fn test_tape_has_no_gain_trim() {
        let mut s = state();
        s.source = Source::Tape;
        s.gain_cd = 12.0;
        let out = encode(&s, false);
        assert_eq!(out[1], INPUT | (3 << INPUT_GAIN_SHIFT) | 3);
    }
}
