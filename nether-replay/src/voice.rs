//! Voice state
//!
//! One [`Voice`] per tracker channel (the foreground voices, indices below
//! [`MAX_CHANNELS`](nether_tracker::MAX_CHANNELS)) plus a pool of background
//! voices that carry notes released by New Note Actions. The sequencer and
//! effects write these fields once per tick; the mixer reads them once per
//! mix period.

use nether_tracker::{Effect, SampleData, SampleFlags, VolumeEffect};

/// Runtime flags of a voice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VoiceFlags(u32);

impl VoiceFlags {
    pub const SIXTEEN_BIT: Self = Self(0x01);
    pub const LOOP: Self = Self(0x02);
    pub const PINGPONG_LOOP: Self = Self(0x04);
    pub const SUSTAIN_LOOP: Self = Self(0x08);
    pub const PINGPONG_SUSTAIN: Self = Self(0x10);
    pub const PANNING: Self = Self(0x20);
    pub const STEREO: Self = Self(0x40);
    /// Playing backwards through a ping-pong loop
    pub const PINGPONG_FLAG: Self = Self(0x80);
    pub const MUTE: Self = Self(0x100);
    /// Note-off seen, sustain loops are released
    pub const KEYOFF: Self = Self(0x200);
    pub const NOTEFADE: Self = Self(0x400);
    pub const SURROUND: Self = Self(0x800);
    /// Step is close enough to 1.0 (or too large) to skip interpolation
    pub const NO_IDO: Self = Self(0x1000);
    pub const FILTER: Self = Self(0x4000);
    pub const VOLUME_RAMP: Self = Self(0x8000);
    pub const VIBRATO: Self = Self(0x1_0000);
    pub const TREMOLO: Self = Self(0x2_0000);
    pub const PORTAMENTO: Self = Self(0x8_0000);
    pub const GLISSANDO: Self = Self(0x10_0000);
    pub const VOLUME_ENV: Self = Self(0x20_0000);
    pub const PANNING_ENV: Self = Self(0x40_0000);
    pub const PITCH_ENV: Self = Self(0x80_0000);
    pub const FAST_VOLUME_RAMP: Self = Self(0x100_0000);
    /// A note was triggered this row; resets the filter history
    pub const NEW_NOTE: Self = Self(0x200_0000);
    /// Unmute when picked as an NNA voice
    pub const NNA_MUTE: Self = Self(0x1000_0000);
    /// Plays through the OPL chip instead of the sample mixer
    pub const ADLIB: Self = Self(0x2000_0000);

    /// Flags that come from the bound sample
    pub const SAMPLE_FLAGS: Self = Self(
        Self::SIXTEEN_BIT.0
            | Self::LOOP.0
            | Self::PINGPONG_LOOP.0
            | Self::SUSTAIN_LOOP.0
            | Self::PINGPONG_SUSTAIN.0
            | Self::PANNING.0
            | Self::STEREO.0
            | Self::ADLIB.0,
    );

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn intersects(&self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: Self, on: bool) {
        if on {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }

    /// Voice flags mirroring a sample's flags
    pub const fn from_sample(flags: SampleFlags) -> Self {
        Self(flags.bits() & Self::SAMPLE_FLAGS.0)
    }
}

impl std::ops::BitOr for VoiceFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Extra per-tick behaviour requested by the effect column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TickCommand {
    #[default]
    None,
    Arpeggio,
    Tremor,
}

/// Playback state of one mixing voice.
///
/// `position` is 32.32 fixed point (whole samples in the high word) and
/// `increment` 16.16 fixed point. `length == 0` means the voice is silent;
/// while it sounds, `position < length` except transiently inside a
/// ping-pong reflection.
#[derive(Debug, Clone)]
pub struct Voice {
    // Mixer
    pub current_sample_data: Option<SampleData>,
    pub position: i64,
    pub increment: i32,
    pub left_volume: i32,
    pub right_volume: i32,
    pub left_ramp: i32,
    pub right_ramp: i32,
    /// Playable length: sample end, or loop end while looping
    pub length: u32,
    pub flags: VoiceFlags,
    /// Loop or sustain loop, whichever is active
    pub loop_start: u32,
    pub loop_end: u32,
    pub left_ramp_volume: i32,
    pub right_ramp_volume: i32,
    /// Display countdown for a fresh note
    pub strike: i32,
    /// Resonant filter history per output side, newest first
    pub filter_y: [[i32; 2]; 2],
    pub filter_a0: i32,
    pub filter_b0: i32,
    pub filter_b1: i32,
    /// Click-removal offsets carried after a voice stops
    pub left_ofs: i32,
    pub right_ofs: i32,
    pub ramp_length: i32,

    // Tick state
    pub left_volume_new: i32,
    pub right_volume_new: i32,
    /// 14-bit product of every volume stage
    pub final_volume: i32,
    pub final_panning: i32,
    /// Note volume (0..=256)
    pub volume: i32,
    /// Note panning (0..=256)
    pub panning: i32,
    pub fadeout_volume: i32,
    /// Current pitch in Hz
    pub frequency: i32,
    pub c5speed: u32,
    /// Last computed output frequency
    pub sample_freq: u32,
    pub portamento_target: i32,
    /// Bound instrument (1-based)
    pub ptr_instrument: Option<usize>,
    /// Bound sample (1-based)
    pub ptr_sample: Option<usize>,
    pub vol_env_position: i32,
    pub pan_env_position: i32,
    pub pitch_env_position: i32,
    /// Foreground channel + 1 for background voices, 0 otherwise
    pub master_channel: usize,
    pub vu_meter: u32,
    /// Channel volume (0..=64)
    pub global_volume: i32,
    /// Sample global volume times instrument global volume (0..=64)
    pub instrument_volume: i32,
    pub autovib_depth: i32,
    pub autovib_position: u32,
    pub vibrato_position: u32,
    pub tremolo_position: u32,
    pub panbrello_position: u32,
    pub vol_swing: i32,
    pub pan_swing: i32,
    /// Channel panning saved while an instrument overrides it: pan + 1,
    /// `0x8000` set for surround, 0 when nothing is saved
    pub channel_panning: u16,

    pub note: u8,
    pub nna: u8,
    pub new_note: u8,
    pub new_instrument: u8,
    pub n_command: TickCommand,

    // Effect memory
    pub mem_vc_volslide: u8,
    pub mem_arpeggio: u8,
    pub mem_volslide: u8,
    /// Exx/Fxx, shared with Gxx unless compatible Gxx is set
    pub mem_pitchslide: u8,
    pub mem_portanote: i32,
    pub mem_tremor: u8,
    pub mem_channel_volslide: u8,
    /// Combined yxx00h from Oxx and SAy
    pub mem_offset: u32,
    pub mem_panslide: u8,
    pub mem_retrig: u8,
    pub mem_special: u8,
    pub mem_tempo: u8,
    pub mem_global_volslide: u8,
    pub note_slide_counter: u32,
    pub note_slide_speed: u32,
    pub note_slide_step: u32,
    pub vib_type: u8,
    pub vibrato_speed: u32,
    pub vibrato_depth: u32,
    pub tremolo_type: u8,
    pub tremolo_speed: u32,
    pub tremolo_depth: u32,
    pub panbrello_type: u8,
    pub panbrello_speed: u32,
    pub panbrello_depth: u32,
    pub tremolo_delta: i32,
    pub panbrello_delta: i32,

    pub cutoff: u32,
    pub resonance: u32,
    pub cd_note_delay: i32,
    pub cd_note_cut: i32,
    pub cd_retrig: i32,
    /// Tremor countdown; bit 7 marks it running, bit 6 the off phase
    pub cd_tremor: u32,
    pub patloop_row: u32,
    pub cd_patloop: u32,

    // Current row
    pub row_note: u8,
    pub row_instr: u8,
    pub row_vol_effect: VolumeEffect,
    pub row_vol_param: u8,
    pub row_effect: Effect,
    pub row_param: u8,
    pub active_macro: u8,
    pub last_instrument: u8,
}

impl Default for Voice {
    fn default() -> Self {
        Self {
            current_sample_data: None,
            position: 0,
            increment: 0,
            left_volume: 0,
            right_volume: 0,
            left_ramp: 0,
            right_ramp: 0,
            length: 0,
            flags: VoiceFlags::empty(),
            loop_start: 0,
            loop_end: 0,
            left_ramp_volume: 0,
            right_ramp_volume: 0,
            strike: 0,
            filter_y: [[0; 2]; 2],
            filter_a0: 0,
            filter_b0: 0,
            filter_b1: 0,
            left_ofs: 0,
            right_ofs: 0,
            ramp_length: 0,
            left_volume_new: 0,
            right_volume_new: 0,
            final_volume: 0,
            final_panning: 0,
            volume: 256,
            panning: 128,
            fadeout_volume: 0,
            frequency: 0,
            c5speed: 0,
            sample_freq: 0,
            portamento_target: 0,
            ptr_instrument: None,
            ptr_sample: None,
            vol_env_position: 0,
            pan_env_position: 0,
            pitch_env_position: 0,
            master_channel: 0,
            vu_meter: 0,
            global_volume: 64,
            instrument_volume: 0,
            autovib_depth: 0,
            autovib_position: 0,
            vibrato_position: 0,
            tremolo_position: 0,
            panbrello_position: 0,
            vol_swing: 0,
            pan_swing: 0,
            channel_panning: 0,
            note: 0,
            nna: 0,
            new_note: 0,
            new_instrument: 0,
            n_command: TickCommand::None,
            mem_vc_volslide: 0,
            mem_arpeggio: 0,
            mem_volslide: 0,
            mem_pitchslide: 0,
            mem_portanote: 0,
            mem_tremor: 0,
            mem_channel_volslide: 0,
            mem_offset: 0,
            mem_panslide: 0,
            mem_retrig: 0,
            mem_special: 0,
            mem_tempo: 0,
            mem_global_volslide: 0,
            note_slide_counter: 0,
            note_slide_speed: 0,
            note_slide_step: 0,
            vib_type: 0,
            vibrato_speed: 0,
            vibrato_depth: 0,
            tremolo_type: 0,
            tremolo_speed: 0,
            tremolo_depth: 0,
            panbrello_type: 0,
            panbrello_speed: 0,
            panbrello_depth: 0,
            tremolo_delta: 0,
            panbrello_delta: 0,
            cutoff: 0x7F,
            resonance: 0,
            cd_note_delay: 0,
            cd_note_cut: 0,
            cd_retrig: 0,
            cd_tremor: 0,
            patloop_row: 0,
            cd_patloop: 0,
            row_note: 0,
            row_instr: 0,
            row_vol_effect: VolumeEffect::None,
            row_vol_param: 0,
            row_effect: Effect::None,
            row_param: 0,
            active_macro: 0,
            last_instrument: 0,
        }
    }
}

impl Voice {
    /// Whole sample index of the playback cursor
    #[inline]
    pub fn position_whole(&self) -> i64 {
        self.position >> 32
    }

    pub fn set_position(&mut self, whole: u32) {
        self.position = (whole as i64) << 32;
    }

    /// True while the voice produces sample output
    pub fn is_sounding(&self) -> bool {
        self.length > 0 && self.current_sample_data.is_some()
    }

    /// Stop output immediately without touching note memory
    pub(crate) fn silence(&mut self) {
        self.length = 0;
        self.position = 0;
        self.left_ofs = 0;
        self.right_ofs = 0;
        self.left_volume = 0;
        self.right_volume = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_helpers() {
        let mut flags = VoiceFlags::LOOP | VoiceFlags::KEYOFF;
        assert!(flags.contains(VoiceFlags::LOOP));
        assert!(flags.intersects(VoiceFlags::KEYOFF | VoiceFlags::MUTE));
        flags.remove(VoiceFlags::LOOP);
        assert!(!flags.contains(VoiceFlags::LOOP));
        flags.set(VoiceFlags::MUTE, true);
        assert!(flags.contains(VoiceFlags::MUTE | VoiceFlags::KEYOFF));
    }

    #[test]
    fn test_sample_flags_carry_over() {
        let sample = SampleFlags::SIXTEEN_BIT | SampleFlags::PINGPONG_LOOP | SampleFlags::ADLIB;
        let flags = VoiceFlags::from_sample(sample);
        assert!(flags.contains(VoiceFlags::SIXTEEN_BIT | VoiceFlags::PINGPONG_LOOP | VoiceFlags::ADLIB));
        assert!(!flags.contains(VoiceFlags::LOOP));
    }

    #[test]
    fn test_default_voice_is_silent() {
        let voice = Voice::default();
        assert!(!voice.is_sounding());
        assert_eq!(voice.cutoff, 0x7F, "filter starts fully open");
        assert_eq!(voice.volume, 256);
    }

    #[test]
    fn test_position_helpers() {
        let mut voice = Voice::default();
        voice.set_position(100);
        assert_eq!(voice.position_whole(), 100);
        voice.position += 0x8000_0000;
        assert_eq!(voice.position_whole(), 100, "fraction does not change the whole part");
    }
}
