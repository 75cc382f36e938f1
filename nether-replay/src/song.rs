//! Song playback state
//!
//! [`Song`] owns everything a playback session mutates: the voice array,
//! the sequencer counters, the OPL and General MIDI drivers, the output DSP
//! state and the host callbacks. The [`TrackerModule`] it plays is shared
//! read-only through an `Arc`, so a length calculation or a UI can look at
//! the same data without touching the session.
//!
//! The engine is split into `impl Song` blocks by concern:
//!
//! | Module       | Concern                                                |
//! |--------------|--------------------------------------------------------|
//! | `tick`       | tick/row countdown, order list progression             |
//! | `effects`    | volume column and effect column interpretation         |
//! | `notes`      | note and instrument changes, key-off, note cut         |
//! | `nna`        | duplicate note checks and background voice allocation  |
//! | `midi`       | MIDI macro expansion and MIDI note output              |
//! | `modulation` | per-tick vibrato, envelopes, arpeggio, auto-vibrato    |
//! | `render`     | per-period voice setup, mixing and PCM conversion      |
//! | `control`    | seeking, live notes, muting and other host mutators    |
//! | `length`     | song duration without mixing                           |
//!
//! Every entry point is total: out-of-range input is clamped or ignored.

mod control;
mod effects;
mod length;
mod midi;
mod modulation;
mod nna;
mod notes;
mod render;
mod tick;

use std::sync::Arc;

use nether_opl::OplDriver;
use nether_tracker::{MAX_CHANNELS, TrackerInstrument, TrackerModule, TrackerNote, TrackerSample};
use rand::SeedableRng;
use rand_pcg::Pcg32;
use tracing::debug;

use crate::config::{Interpolation, MAX_EQ_BANDS, MAX_SAMPLE_RATE, MIN_SAMPLE_RATE, MixerConfig};
use crate::gm::GmDriver;
use crate::mixer::convert::PeakTracker;
use crate::mixer::dsp::NoiseReduction;
use crate::mixer::eq::Equalizer;
use crate::voice::Voice;
use crate::{MAX_VOICES, MIX_BUFFER_SIZE};

pub use length::{position_at_ms, song_length_ms};
pub use midi::MidiOutState;

/// Raw MIDI output: message bytes and the frame offset into the current
/// output buffer at which they belong.
pub type MidiSink = Box<dyn FnMut(&[u8], u32) + Send>;

/// Called once per channel per tick: with the row's note on the first tick
/// of a row, `None` on the others.
pub type NoteCallback = Box<dyn FnMut(usize, Option<&TrackerNote>) + Send>;

/// Seed for the waveform and swing generator
pub const DEFAULT_SEED: u64 = 0x6E65_7468_6572;

/// `process_row` value that makes the next row advance resolve a new order
pub(crate) const PROCESS_NEXT_ORDER: u32 = 0xFFFE;

/// Sequencer state flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlayFlags(u32);

impl PlayFlags {
    /// The current tick is the first of its row
    pub const FIRST_TICK: Self = Self(0x01);
    /// Looping a single pattern
    pub const PATTERN_LOOP: Self = Self(0x02);
    /// Playback ran off the end of the song
    pub const END_REACHED: Self = Self(0x04);
    /// Transport stopped; ticks only run for live notes
    pub const PAUSED: Self = Self(0x08);
    /// Order changes are ignored
    pub const ORDER_LOCKED: Self = Self(0x10);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for PlayFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Display snapshot of one voice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VoiceInfo {
    /// Producing sample output
    pub sounding: bool,
    /// Bound sample (1-based)
    pub sample: Option<usize>,
    /// Bound instrument (1-based)
    pub instrument: Option<usize>,
    pub note: u8,
    /// Foreground channel that released this voice, for background voices
    pub master_channel: Option<usize>,
    /// 0..=255
    pub vu: u32,
    pub final_volume: i32,
    pub final_panning: i32,
    /// Output frequency in Hz
    pub frequency: u32,
}

/// One playback session over a module
pub struct Song {
    pub(crate) module: Arc<TrackerModule>,
    pub(crate) config: MixerConfig,

    pub(crate) voices: Vec<Voice>,
    /// Voices set up for the current mix period, loudest first when sorted
    pub(crate) voice_mix: Vec<usize>,
    pub(crate) num_voices: usize,
    /// Voices that produced audio in the last mix pass
    pub(crate) mixed_voices: usize,

    pub(crate) flags: PlayFlags,
    /// A pattern loop (SBx) is armed in the current pattern
    pub(crate) patloop: bool,

    pub(crate) current_speed: u32,
    pub(crate) current_tempo: u32,
    pub(crate) current_global_volume: i32,
    pub(crate) tick_count: u32,
    pub(crate) row_count: i32,
    /// Extra ticks added to the current row by S6x
    pub(crate) frame_delay: u32,
    pub(crate) row: u32,
    pub(crate) process_row: u32,
    pub(crate) process_order: u32,
    pub(crate) current_order: u32,
    pub(crate) current_pattern: u32,
    pub(crate) break_row: u32,
    /// -1 plays once, 0 loops forever, n > 0 counts completed loops
    pub(crate) repeat_count: i32,
    pub(crate) stop_at: Option<(u32, u32)>,

    /// Frames left in the current tick
    pub(crate) buffer_count: u32,
    pub(crate) samples_played: u64,
    pub(crate) ramp_up_samples: i32,
    pub(crate) ramp_down_samples: i32,
    pub(crate) mix_buffer: Vec<i32>,
    pub(crate) dry: [i32; 2],
    pub(crate) eq: Equalizer,
    pub(crate) noise: NoiseReduction,
    pub(crate) peaks: PeakTracker,
    pub(crate) vu: [u32; 2],

    pub(crate) opl: OplDriver,
    pub(crate) gm: GmDriver,
    pub(crate) rng: Pcg32,

    pub(crate) midi_sink: Option<MidiSink>,
    pub(crate) note_callback: Option<NoteCallback>,
    pub(crate) midi_out: [MidiOutState; MAX_CHANNELS],
}

impl std::fmt::Debug for Song {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Song")
            .field("module", &self.module.name)
            .field("order", &self.current_order)
            .field("row", &self.row)
            .field("speed", &self.current_speed)
            .field("tempo", &self.current_tempo)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl Song {
    /// Session over `module`, positioned at the first order and paused
    /// until [`start`](Self::start).
    pub fn new(module: impl Into<Arc<TrackerModule>>, config: MixerConfig) -> Self {
        let config = config.validated();
        let mut song = Self {
            module: module.into(),
            voices: vec![Voice::default(); MAX_VOICES],
            voice_mix: Vec::with_capacity(MAX_VOICES),
            num_voices: 0,
            mixed_voices: 0,
            flags: PlayFlags::empty(),
            patloop: false,
            current_speed: 6,
            current_tempo: 125,
            current_global_volume: 128,
            tick_count: 1,
            row_count: 0,
            frame_delay: 0,
            row: 0,
            process_row: PROCESS_NEXT_ORDER,
            process_order: 0,
            current_order: 0,
            current_pattern: 0,
            break_row: 0,
            repeat_count: 0,
            stop_at: None,
            buffer_count: 0,
            samples_played: 0,
            ramp_up_samples: 0,
            ramp_down_samples: 0,
            mix_buffer: vec![0; MIX_BUFFER_SIZE * 2],
            dry: [0; 2],
            eq: Equalizer::default(),
            noise: NoiseReduction::default(),
            peaks: PeakTracker::default(),
            vu: [0; 2],
            opl: OplDriver::new(config.sample_rate),
            gm: GmDriver::new(config.midi_like_tracker),
            rng: Pcg32::seed_from_u64(DEFAULT_SEED),
            midi_sink: None,
            note_callback: None,
            midi_out: [MidiOutState::default(); MAX_CHANNELS],
            config,
        };
        song.eq.set_gains(&song.config.eq_gains, &song.config.eq_freqs, true, song.config.sample_rate);
        song.init_player(true);
        song.reset_playback();
        song.flags.insert(PlayFlags::PAUSED | PlayFlags::END_REACHED);
        song
    }

    /// Replace the module and rewind. Host callbacks are kept.
    pub fn set_module(&mut self, module: impl Into<Arc<TrackerModule>>) {
        self.module = module.into();
        self.midi_out = [MidiOutState::default(); MAX_CHANNELS];
        self.reset_playback();
        self.flags.insert(PlayFlags::PAUSED | PlayFlags::END_REACHED);
    }

    pub fn module(&self) -> &TrackerModule {
        &self.module
    }

    /// Shared handle to the module
    pub fn module_arc(&self) -> Arc<TrackerModule> {
        Arc::clone(&self.module)
    }

    pub fn config(&self) -> &MixerConfig {
        &self.config
    }

    /// Reseed the random waveform and swing generator
    pub fn seed(&mut self, seed: u64) {
        self.rng = Pcg32::seed_from_u64(seed);
    }

    pub fn set_midi_sink(&mut self, sink: Option<MidiSink>) {
        self.midi_sink = sink;
    }

    pub fn set_note_callback(&mut self, callback: Option<NoteCallback>) {
        self.note_callback = callback;
    }

    // =========================================================================
    // Mixer configuration
    // =========================================================================

    /// Apply the current configuration to the DSP state. `reset` also
    /// clears filter histories and meters.
    pub fn init_player(&mut self, reset: bool) {
        let rate = self.config.sample_rate.clamp(MIN_SAMPLE_RATE, MAX_SAMPLE_RATE);
        self.config.sample_rate = rate;
        self.ramp_up_samples = ramp_samples(rate, self.config.ramp_up_us, self.config.ramping);
        self.ramp_down_samples = ramp_samples(rate, self.config.ramp_down_us, self.config.ramping);

        self.dry = [0; 2];
        if reset {
            self.peaks = PeakTracker::default();
            self.vu = [0; 2];
        }
        self.noise.reset();
        self.eq.initialize(reset, rate);
        self.opl.set_mix_rate(rate);
        self.opl.reset();
        self.gm.set_enabled(self.config.midi_like_tracker);
        self.gm.reset(false);
        self.flush_gm();

        debug!(
            rate,
            channels = self.config.channels,
            bits = self.config.bits,
            interpolation = ?self.config.interpolation,
            ramp_up = self.ramp_up_samples,
            ramp_down = self.ramp_down_samples,
            "mixer initialised"
        );
    }

    /// Change the output format. Returns true if anything changed.
    pub fn set_wave_config(&mut self, rate: u32, bits: u32, channels: u32) -> bool {
        let old = (self.config.sample_rate, self.config.bits, self.config.channels);
        self.config.sample_rate = rate;
        self.config.bits = bits;
        self.config.channels = channels;
        self.config = self.config.clone().validated();
        let reset = old != (self.config.sample_rate, self.config.bits, self.config.channels);
        self.init_player(reset);
        reset
    }

    pub fn set_resampling_mode(&mut self, mode: Interpolation) {
        self.config.interpolation = mode;
    }

    /// Set equalizer band gains (0..=127) and centre frequencies
    pub fn set_eq_gains(&mut self, gains: &[u32], freqs: &[u32], reset: bool) {
        let bands = gains.len().min(MAX_EQ_BANDS);
        for i in 0..bands {
            self.config.eq_gains[i] = gains[i].min(127);
            if let Some(&f) = freqs.get(i) {
                self.config.eq_freqs[i] = f;
            }
        }
        self.eq.set_gains(&gains[..bands], freqs, reset, self.config.sample_rate);
    }

    /// Swap in a new configuration and reinitialise the mixer
    pub fn set_config(&mut self, config: MixerConfig) {
        self.config = config.validated();
        self.eq.set_gains(&self.config.eq_gains, &self.config.eq_freqs, true, self.config.sample_rate);
        self.init_player(true);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Output frames rendered since playback started
    pub fn samples_played(&self) -> u64 {
        self.samples_played
    }

    pub fn current_order(&self) -> u32 {
        self.current_order
    }

    pub fn current_row(&self) -> u32 {
        self.row
    }

    pub fn current_pattern(&self) -> u32 {
        self.current_pattern
    }

    /// Ticks elapsed in the current row
    pub fn current_tick(&self) -> u32 {
        self.elapsed_ticks() as u32
    }

    pub fn current_speed(&self) -> u32 {
        self.current_speed
    }

    pub fn current_tempo(&self) -> u32 {
        self.current_tempo
    }

    /// Global volume, 0..=128
    pub fn global_volume(&self) -> i32 {
        self.current_global_volume
    }

    /// Voices set up in the last mix period
    pub fn active_voices(&self) -> usize {
        self.num_voices
    }

    /// Voices that produced audio in the last mix pass, never more than
    /// the configured voice limit
    pub fn mixed_voices(&self) -> usize {
        self.mixed_voices
    }

    /// Transport stopped; only live notes are rendered
    pub fn is_stopped(&self) -> bool {
        self.flags.contains(PlayFlags::PAUSED)
    }

    /// Song rows are advancing
    pub fn is_playing(&self) -> bool {
        !self.flags.contains(PlayFlags::PAUSED) && !self.flags.contains(PlayFlags::END_REACHED)
    }

    pub fn is_end_reached(&self) -> bool {
        self.flags.contains(PlayFlags::END_REACHED)
    }

    pub fn is_pattern_loop(&self) -> bool {
        self.flags.contains(PlayFlags::PATTERN_LOOP)
    }

    pub fn voice_info(&self, index: usize) -> Option<VoiceInfo> {
        let v = self.voices.get(index)?;
        Some(VoiceInfo {
            sounding: v.is_sounding(),
            sample: v.ptr_sample,
            instrument: v.ptr_instrument,
            note: v.note,
            master_channel: v.master_channel.checked_sub(1),
            vu: v.vu_meter,
            final_volume: v.final_volume,
            final_panning: v.final_panning,
            frequency: v.sample_freq,
        })
    }

    /// Output level meters per side, 0..=255
    pub fn vu_meters(&self) -> [u32; 2] {
        self.vu
    }

    /// Lowest and highest accumulator values seen in the last read
    pub fn vu_min_max(&self) -> ([i32; 2], [i32; 2]) {
        (self.peaks.mins, self.peaks.maxs)
    }

    // =========================================================================
    // Shared helpers
    // =========================================================================

    pub(crate) fn instrument_mode(&self) -> bool {
        self.module.uses_instruments()
    }

    pub(crate) fn old_effects(&self) -> bool {
        self.module.uses_old_effects()
    }

    pub(crate) fn first_tick(&self) -> bool {
        self.flags.contains(PlayFlags::FIRST_TICK)
    }

    /// Ticks since the row started, counting S6x delay ticks
    pub(crate) fn elapsed_ticks(&self) -> i64 {
        (self.current_speed + self.frame_delay) as i64 - self.tick_count as i64
    }

    /// Instrument bound to voice `nchan`, when instruments are in use
    pub(crate) fn voice_instrument(&self, nchan: usize) -> Option<&TrackerInstrument> {
        if !self.instrument_mode() {
            return None;
        }
        self.module.instrument(self.voices[nchan].ptr_instrument?)
    }

    pub(crate) fn voice_sample(&self, nchan: usize) -> Option<&TrackerSample> {
        self.module.sample(self.voices[nchan].ptr_sample?)
    }

    /// Uniform value in `-64..64` for random waveforms
    pub(crate) fn random_delta(&mut self) -> i32 {
        use rand::Rng;
        self.rng.random_range(-64..64)
    }

    /// Uniform value in `[-1, 1)` for swing
    pub(crate) fn random_unit(&mut self) -> f64 {
        use rand::Rng;
        self.rng.random_range(-1.0..1.0)
    }

    /// Hand queued General MIDI messages to the sink
    pub(crate) fn flush_gm(&mut self) {
        let offset = self.buffer_count;
        let messages: Vec<_> = self.gm.drain().collect();
        if let Some(sink) = self.midi_sink.as_mut() {
            for msg in &messages {
                sink(msg, offset);
            }
        }
    }
}

/// Ramp length in frames for `us` microseconds at `rate`
fn ramp_samples(rate: u32, us: u32, ramping: bool) -> i32 {
    if !ramping {
        return 2;
    }
    ((rate as u64 * us as u64 / 1_000_000) as i32).max(8)
}
