//! Built-in demo song
//!
//! Four channels: a pitched kick, a noise hihat, a looped square bass and
//! an FM lead on the OPL. Two 32-row patterns, played A B A.

use std::f32::consts::PI;

use nether_tracker::{Effect, TrackerModule, TrackerNote, TrackerPattern, TrackerSample, VolumeEffect};

/// Rate the PCM drums are generated at
const SAMPLE_RATE: f32 = 22050.0;

const ROWS: u16 = 32;

const KICK: u8 = 1;
const HIHAT: u8 = 2;
const BASS: u8 = 3;
const LEAD: u8 = 4;

const CH_KICK: usize = 0;
const CH_HIHAT: usize = 1;
const CH_BASS: usize = 2;
const CH_LEAD: usize = 3;

/// Plain sine carrier with a soft modulator, moderate attack
const LEAD_PATCH: [u8; 12] = [0x21, 0x21, 0x1A, 0x00, 0xF3, 0xF2, 0x45, 0x56, 0x00, 0x00, 0x06, 0x00];

/// C-5 is the note the samples are tuned to
const fn note(semitones_from_c5: i8) -> u8 {
    (TrackerNote::NOTE_MIDDLE_C as i16 + semitones_from_c5 as i16) as u8
}

/// Generate kick drum: sine wave with pitch sweep (150Hz to 50Hz) and exponential decay
fn generate_kick() -> Vec<i16> {
    let samples = (SAMPLE_RATE * 0.3) as usize;
    let mut phase = 0.0f32;
    (0..samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE;
            let decay = (-t * 15.0).exp();
            let freq = 150.0 * (-t * 20.0).exp() + 50.0;
            phase += 2.0 * PI * freq / SAMPLE_RATE;
            (phase.sin() * decay * 30000.0) as i16
        })
        .collect()
}

/// Generate hihat: xorshift noise with a fast decay
fn generate_hihat() -> Vec<i8> {
    let samples = (SAMPLE_RATE * 0.05) as usize;
    let mut state: u32 = 0x1234_5678;
    (0..samples)
        .map(|i| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let t = i as f32 / SAMPLE_RATE;
            let noise = (state >> 24) as i8 as f32;
            (noise * (-t * 80.0).exp()) as i8
        })
        .collect()
}

/// One cycle of a square wave; at 8363 Hz C-5 plays about 261 Hz
fn bass_cycle() -> Vec<i8> {
    (0..32).map(|i| if i < 16 { 48 } else { -48 }).collect()
}

fn put(pattern: &mut TrackerPattern, row: u16, channel: usize, cell: TrackerNote) {
    if let Some(n) = pattern.note_mut(row, channel) {
        *n = cell;
    }
}

fn drums(pattern: &mut TrackerPattern) {
    for row in (0..ROWS).step_by(8) {
        put(pattern, row, CH_KICK, TrackerNote::new(note(0), KICK));
    }
    for row in (4..ROWS).step_by(4) {
        let accent = if row % 8 == 4 { 48 } else { 24 };
        put(
            pattern,
            row,
            CH_HIHAT,
            TrackerNote::new(note(0), HIHAT).with_volume(VolumeEffect::Volume, accent),
        );
    }
}

fn pattern_a() -> TrackerPattern {
    let mut p = TrackerPattern::empty(ROWS);
    drums(&mut p);
    put(&mut p, 0, CH_KICK, TrackerNote::new(note(0), KICK).with_effect(Effect::Speed, 6));
    for (row, semis) in [(0, -24), (8, -24), (16, -19), (24, -17)] {
        put(
            &mut p,
            row,
            CH_BASS,
            TrackerNote::new(note(semis), BASS).with_effect(Effect::Arpeggio, 0x0C),
        );
    }
    for (row, semis) in [(0, 0), (6, 3), (12, 7), (20, 5), (26, 3)] {
        put(&mut p, row, CH_LEAD, TrackerNote::new(note(semis), LEAD));
    }
    put(
        &mut p,
        30,
        CH_LEAD,
        TrackerNote::default().with_effect(Effect::VolumeSlide, 0x04),
    );
    p
}

fn pattern_b() -> TrackerPattern {
    let mut p = TrackerPattern::empty(ROWS);
    drums(&mut p);
    for (row, semis) in [(0, -21), (8, -21), (16, -24), (24, -22)] {
        put(&mut p, row, CH_BASS, TrackerNote::new(note(semis), BASS));
    }
    put(&mut p, 0, CH_LEAD, TrackerNote::new(note(8), LEAD).with_effect(Effect::Vibrato, 0x44));
    put(&mut p, 12, CH_LEAD, TrackerNote::new(note(7), LEAD));
    put(&mut p, 16, CH_LEAD, TrackerNote::new(note(3), 0).with_effect(Effect::TonePortamento, 0x20));
    put(&mut p, 31, CH_BASS, TrackerNote::new(TrackerNote::NOTE_OFF, 0));
    p
}

/// Build the demo module
pub fn module() -> TrackerModule {
    let mut module = TrackerModule {
        name: "nether demo".into(),
        orders: vec![0, 1, 0],
        initial_speed: 6,
        initial_tempo: 125,
        ..TrackerModule::default()
    };

    let mut kick = TrackerSample::from_pcm16(generate_kick());
    kick.c5_speed = SAMPLE_RATE as u32;
    let mut hihat = TrackerSample::from_pcm8(generate_hihat());
    hihat.c5_speed = SAMPLE_RATE as u32;
    let bass = TrackerSample::from_pcm8(bass_cycle()).with_loop(0, 32, false);
    let lead = TrackerSample::adlib(LEAD_PATCH);
    module.samples = vec![kick, hihat, bass, lead];

    module.channels[CH_HIHAT].panning = 176;
    module.channels[CH_BASS].panning = 96;
    module.channels[CH_LEAD].volume = 48;

    module.set_pattern(0, pattern_a());
    module.set_pattern(1, pattern_b());
    module
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_module_shape() {
        let m = module();
        assert_eq!(m.orders, vec![0, 1, 0]);
        assert_eq!(m.samples.len(), 4);
        assert!(m.samples.iter().all(|s| s.has_data()), "every sample plays");
        assert_eq!(m.pattern_rows(0), ROWS);
        assert_eq!(m.pattern_rows(1), ROWS);
    }

    #[test]
    fn test_generated_drums_decay() {
        let kick = generate_kick();
        let head = kick[..200].iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
        let tail = kick[kick.len() - 200..].iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
        assert!(head > 10 * tail, "kick fades out: head {head}, tail {tail}");
        assert_eq!(generate_hihat(), generate_hihat(), "noise is deterministic");
    }

    #[test]
    fn test_note_offsets() {
        assert_eq!(note(0), TrackerNote::NOTE_MIDDLE_C);
        assert_eq!(note(-24), TrackerNote::NOTE_MIDDLE_C - 24);
    }
}
