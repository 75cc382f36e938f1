//! Tests for nether-tracker types

use crate::effects::{Effect, VolumeEffect};
use crate::instrument::{EnvelopeFlags, TrackerEnvelope, TrackerInstrument};
use crate::pattern::{TrackerNote, TrackerPattern};
use crate::sample::{SampleData, SampleFlags, TrackerSample};
use crate::{MAX_CHANNELS, ModuleError, ORDER_LAST, ORDER_SKIP, SongFlags, TrackerModule};

fn module_with_pattern() -> TrackerModule {
    let mut module = TrackerModule {
        orders: vec![0, ORDER_SKIP, 1, ORDER_LAST],
        ..Default::default()
    };
    module.set_pattern(0, TrackerPattern::empty(4));
    module
}

#[test]
fn test_tracker_note_methods() {
    let note = TrackerNote::new(49, 1).with_effect(Effect::VolumeSlide, 0x0F);
    assert!(note.has_note());
    assert!(note.has_instrument());
    assert!(note.has_effect());
    assert!(!note.is_empty());

    let note_off = TrackerNote {
        note: TrackerNote::NOTE_OFF,
        ..Default::default()
    };
    assert!(TrackerNote::is_control(note_off.note));
    assert!(!note_off.has_note());
    assert!(TrackerNote::default().is_empty());
}

#[test]
fn test_envelope_interpolation() {
    let env = TrackerEnvelope {
        points: vec![(0, 64), (10, 32), (20, 0)],
        flags: EnvelopeFlags::ENABLED,
        ..Default::default()
    };

    let vol = |pos| env.interpolate(pos, 0, |v| (v as i32) << 2);
    assert_eq!(vol(0), 256, "first node");
    assert_eq!(vol(5), 192, "midpoint between 64 and 32");
    assert_eq!(vol(10), 128);
    assert_eq!(vol(15), 64, "midpoint between 32 and 0");
    assert_eq!(vol(20), 0);
    assert_eq!(vol(30), 0, "holds past the end");
}

#[test]
fn test_envelope_starts_from_origin() {
    let env = TrackerEnvelope {
        points: vec![(4, 64), (8, 64)],
        ..Default::default()
    };
    assert_eq!(env.interpolate(0, 0, |v| v as i32), 0);
    assert_eq!(env.interpolate(2, 0, |v| v as i32), 32, "ramps from origin");
    assert_eq!(env.interpolate(6, 0, |v| v as i32), 64);
}

#[test]
fn test_envelope_markers_clamp() {
    let env = TrackerEnvelope::flat(40);
    assert_eq!(env.tick_at(7), 100, "marker past the end reads the last node");
    assert_eq!(env.value_at_node(0), 40);
    assert_eq!(env.last_tick(), 100);
}

#[test]
fn test_pattern_empty() {
    let pattern = TrackerPattern::empty(64);
    assert_eq!(pattern.num_rows, 64);
    assert_eq!(pattern.notes.len(), 64 * MAX_CHANNELS);
    assert!(pattern.get_note(64, 0).is_none(), "row out of range");
    assert!(pattern.get_note(0, MAX_CHANNELS).is_none(), "channel out of range");
    assert_eq!(pattern.row(3).map(<[TrackerNote]>::len), Some(MAX_CHANNELS));
    assert!(pattern.is_blank());
}

#[test]
fn test_pattern_note_mut() {
    let mut pattern = TrackerPattern::empty(2);
    if let Some(n) = pattern.note_mut(1, 3) {
        *n = TrackerNote::new(61, 1).with_volume(VolumeEffect::Volume, 32);
    }
    let n = pattern.get_note(1, 3).copied().unwrap_or_default();
    assert_eq!(n.note, 61);
    assert_eq!(n.vol_effect, VolumeEffect::Volume);
    assert!(!pattern.is_blank());
}

#[test]
fn test_module_orders_and_lookup() {
    let module = module_with_pattern();
    assert!(module.pattern_at_order(0).is_some());
    assert!(module.pattern_at_order(1).is_none(), "skip marker");
    assert!(module.pattern_at_order(2).is_none(), "unallocated pattern");
    assert_eq!(module.pattern_rows(1), 64, "unallocated patterns are 64 rows");
    assert_eq!(module.order(99), ORDER_LAST, "past the end reads as end marker");
    assert_eq!(module.last_order(), 2);
}

#[test]
fn test_module_one_based_lookup() {
    let module = TrackerModule {
        samples: vec![TrackerSample::from_pcm8(vec![0; 16])],
        instruments: vec![TrackerInstrument::for_sample(1)],
        ..Default::default()
    };
    assert!(module.sample(0).is_none(), "sample 0 means none");
    assert!(module.sample(1).is_some());
    assert!(module.instrument(2).is_none());
    assert_eq!(module.instrument(1).and_then(|i| i.sample_for_note(61)), Some(1));
}

#[test]
fn test_highest_used_channel() {
    let mut module = module_with_pattern();
    let mut pattern = TrackerPattern::empty(2);
    if let Some(n) = pattern.note_mut(1, 9) {
        *n = TrackerNote::new(40, 1);
    }
    module.set_pattern(1, pattern);
    assert_eq!(module.highest_used_channel(), 9);
}

#[test]
fn test_module_defaults() {
    let module = TrackerModule::default();
    assert_eq!(module.initial_speed, 6);
    assert_eq!(module.initial_tempo, 125);
    assert_eq!(module.initial_global_volume, 128);
    assert_eq!(module.mixing_volume, 0x30);
    assert!(module.channels.iter().all(|c| c.panning == 128 && c.volume == 64));
    assert!(!module.uses_instruments());
}

#[test]
fn test_song_flags() {
    let flags = SongFlags::LINEAR_SLIDES | SongFlags::INSTRUMENT_MODE;
    let module = TrackerModule {
        flags,
        ..Default::default()
    };
    assert!(module.uses_linear_slides());
    assert!(module.uses_instruments());
    assert!(!module.uses_old_effects());
    assert!(!module.uses_compat_gxx());
}

#[test]
fn test_validate_accepts_good_module() {
    let mut module = module_with_pattern();
    module.samples.push(TrackerSample::from_pcm16(vec![0; 100]).with_loop(10, 90, false));
    module.instruments.push(TrackerInstrument::for_sample(1));
    assert_eq!(module.validate(), Ok(()));
}

#[test]
fn test_validate_rejects_bad_envelope() {
    let mut instrument = TrackerInstrument::for_sample(1);
    instrument.volume_envelope.points = vec![(0, 64), (10, 32), (10, 0)];
    let module = TrackerModule {
        instruments: vec![instrument],
        ..Default::default()
    };
    assert!(
        matches!(module.validate(), Err(ModuleError::Envelope { instrument: 1, .. })),
        "repeated tick should be rejected"
    );
}

#[test]
fn test_validate_rejects_bad_loop_and_rows() {
    let module = TrackerModule {
        samples: vec![TrackerSample::from_pcm8(vec![0; 10]).with_loop(4, 20, false)],
        ..Default::default()
    };
    assert!(matches!(module.validate(), Err(ModuleError::Sample { sample: 1, .. })));

    let mut module = TrackerModule::default();
    module.set_pattern(0, TrackerPattern::empty(0));
    assert!(matches!(module.validate(), Err(ModuleError::PatternRows { .. })));

    let module = TrackerModule {
        samples: vec![TrackerSample {
            length: 50,
            data: SampleData::Pcm8(vec![0i8; 10].into()),
            ..Default::default()
        }],
        ..Default::default()
    };
    assert!(matches!(module.validate(), Err(ModuleError::Sample { .. })));
}

#[test]
fn test_sample_adjust_loop() {
    let mut sample = TrackerSample::from_pcm8(vec![0; 32]).with_loop(4, 100, false);
    sample.adjust_loop();
    assert_eq!(sample.loop_end, 32, "loop end clamps to length");
    assert!(sample.flags.contains(SampleFlags::LOOP));

    let mut sample = TrackerSample::from_pcm8(vec![0; 32]).with_loop(10, 12, false);
    sample.adjust_loop();
    assert!(!sample.flags.contains(SampleFlags::LOOP), "tiny loop is dropped");
    assert_eq!((sample.loop_start, sample.loop_end), (0, 0));
}

#[test]
fn test_sample_data_access() {
    let data = SampleData::Pcm8(vec![1i8, -2, 3].into());
    assert_eq!(data.get(1), -512, "8-bit scales to 16-bit");
    assert_eq!(data.get(10), 768, "past the end repeats the last value");
    assert!(!data.is_16bit());
    assert!(data.same_buffer(&data.clone()));
    assert!(!data.same_buffer(&SampleData::Pcm8(vec![1i8, -2, 3].into())));
    assert_eq!(SampleData::Empty.get(0), 0);
}

#[test]
fn test_tracker_sample_defaults() {
    let sample = TrackerSample::default();
    assert_eq!(sample.volume, 256);
    assert_eq!(sample.global_volume, 64);
    assert_eq!(sample.c5_speed, 8363);
    assert!(!sample.has_data());
    assert!(TrackerSample::adlib([0; 12]).has_data(), "FM samples have no PCM");
}

#[test]
fn test_instrument_note_map() {
    let mut instrument = TrackerInstrument::for_sample(2);
    instrument.note_map[60] = 73;
    assert_eq!(instrument.map_note(61), 73);
    assert_eq!(instrument.map_note(1), 1);
    assert_eq!(instrument.sample_for_note(0), None, "note 0 has no mapping");
    assert!(!instrument.is_midi());
}
