//! Nether-Tracker: in-memory song model for Nethercore tracker playback
//!
//! This crate holds the data a loader hands to the replayer: the order list,
//! patterns, samples, instruments, per-channel defaults and the MIDI macro
//! table. The replayer only reads it; sample PCM is shared through `Arc`
//! so voices can keep playing a sample without copying it.
//!
//! # Design
//!
//! Values are stored in the ranges the replayer computes with rather than
//! the ranges a file format displays:
//! - Sample volume and all panning are 0-256
//! - Instrument global volume is 0-128, sample global volume 0-64
//! - Samples and instruments are numbered from 1, 0 meaning "none"
//! - Every pattern row is [`MAX_CHANNELS`] wide
//!
//! # Architecture
//!
//! ```text
//!     ┌────────────────────────────────────────┐
//!     │            TrackerModule               │
//!     │  - orders: Vec<u8>                     │
//!     │  - patterns: Vec<Option<Pattern>>      │
//!     │  - samples: Vec<TrackerSample>         │
//!     │  - instruments: Vec<TrackerInstrument> │
//!     │  - channels: [ChannelSettings; 64]     │
//!     │  - midi_config: MidiConfig             │
//!     └────────────────────────────────────────┘
//!                      │
//!                      ▼
//!            nether-replay Song
//!        (plays any TrackerModule)
//! ```

mod effects;
mod error;
mod instrument;
mod midi;
mod pattern;
mod sample;

#[cfg(test)]
mod tests;

pub use effects::{Effect, VolumeEffect};
pub use error::ModuleError;
pub use instrument::{
    DuplicateCheckAction, DuplicateCheckType, EnvelopeFlags, NewNoteAction, TrackerEnvelope,
    TrackerInstrument,
};
pub use midi::{MACRO_LENGTH, MidiConfig};
pub use pattern::{TrackerNote, TrackerPattern};
pub use sample::{SampleData, SampleFlags, TrackerSample, VibratoType};

/// Pattern channels
pub const MAX_CHANNELS: usize = 64;
/// Order list entries
pub const MAX_ORDERS: usize = 256;
/// Pattern slots
pub const MAX_PATTERNS: usize = 240;
/// Sample slots (numbers 1..MAX_SAMPLES)
pub const MAX_SAMPLES: usize = 236;
/// Instrument slots (numbers 1..MAX_INSTRUMENTS)
pub const MAX_INSTRUMENTS: usize = MAX_SAMPLES;
/// Longest sample in frames
pub const MAX_SAMPLE_LENGTH: u32 = 16_000_000;

/// Order list marker: skip this entry (`+++`)
pub const ORDER_SKIP: u8 = 254;
/// Order list marker: end of song (`---`)
pub const ORDER_LAST: u8 = 255;

// =============================================================================
// Module
// =============================================================================

/// Unified tracker module
#[derive(Debug, Clone)]
pub struct TrackerModule {
    /// Module name
    pub name: String,
    /// Optional song message
    pub message: Option<String>,
    /// Pattern order table; entries past the end read as [`ORDER_LAST`]
    pub orders: Vec<u8>,
    /// Pattern data, sparse. Missing patterns play as 64 empty rows.
    pub patterns: Vec<Option<TrackerPattern>>,
    /// Sample definitions; sample `n` is `samples[n - 1]`
    pub samples: Vec<TrackerSample>,
    /// Instrument definitions; instrument `n` is `instruments[n - 1]`
    pub instruments: Vec<TrackerInstrument>,
    /// Initial per-channel settings
    pub channels: [ChannelSettings; MAX_CHANNELS],
    /// MIDI macro table
    pub midi_config: MidiConfig,
    /// Initial speed (ticks per row)
    pub initial_speed: u8,
    /// Initial tempo (BPM)
    pub initial_tempo: u8,
    /// Initial global volume (0-128)
    pub initial_global_volume: u8,
    /// Mixing volume (0-128)
    pub mixing_volume: u8,
    /// Panning separation: 0 = mono, 128 = full stereo
    pub pan_separation: u8,
    /// Playback behavior flags
    pub flags: SongFlags,
}

impl Default for TrackerModule {
    fn default() -> Self {
        Self {
            name: String::new(),
            message: None,
            orders: Vec::new(),
            patterns: Vec::new(),
            samples: Vec::new(),
            instruments: Vec::new(),
            channels: [ChannelSettings::default(); MAX_CHANNELS],
            midi_config: MidiConfig::default(),
            initial_speed: 6,
            initial_tempo: 125,
            initial_global_volume: 128,
            mixing_volume: 0x30,
            pan_separation: 128,
            flags: SongFlags::empty(),
        }
    }
}

impl TrackerModule {
    /// Order list entry, [`ORDER_LAST`] past the end
    pub fn order(&self, index: usize) -> u8 {
        self.orders.get(index).copied().unwrap_or(ORDER_LAST)
    }

    /// Get the pattern at the given order position
    pub fn pattern_at_order(&self, order: usize) -> Option<&TrackerPattern> {
        let pattern_idx = self.order(order);
        if pattern_idx >= ORDER_SKIP {
            return None;
        }
        self.pattern(pattern_idx as usize)
    }

    /// Allocated pattern by number
    pub fn pattern(&self, index: usize) -> Option<&TrackerPattern> {
        self.patterns.get(index)?.as_ref()
    }

    /// Row count of a pattern slot; empty slots count as 64 rows
    pub fn pattern_rows(&self, index: usize) -> u16 {
        self.pattern(index)
            .map_or(TrackerPattern::DEFAULT_ROWS, |p| p.num_rows)
    }

    /// Sample by 1-based number
    pub fn sample(&self, number: usize) -> Option<&TrackerSample> {
        self.samples.get(number.checked_sub(1)?)
    }

    /// Instrument by 1-based number
    pub fn instrument(&self, number: usize) -> Option<&TrackerInstrument> {
        self.instruments.get(number.checked_sub(1)?)
    }

    /// Store a pattern, growing the slot list as needed
    pub fn set_pattern(&mut self, index: usize, pattern: TrackerPattern) {
        if self.patterns.len() <= index {
            self.patterns.resize(index + 1, None);
        }
        self.patterns[index] = Some(pattern);
    }

    /// Last order of the main song (before the first end marker), or 0
    pub fn last_order(&self) -> usize {
        let n = self
            .orders
            .iter()
            .position(|&o| o == ORDER_LAST)
            .unwrap_or(self.orders.len())
            .min(MAX_ORDERS);
        n.saturating_sub(1)
    }

    /// Highest channel index carrying a playable note in any pattern
    pub fn highest_used_channel(&self) -> usize {
        self.patterns
            .iter()
            .flatten()
            .flat_map(|p| p.notes.iter().enumerate())
            .filter(|(_, n)| n.has_note())
            .map(|(i, _)| i % MAX_CHANNELS)
            .max()
            .unwrap_or(0)
    }

    /// Check if linear frequency slides are used (vs Amiga)
    pub fn uses_linear_slides(&self) -> bool {
        self.flags.contains(SongFlags::LINEAR_SLIDES)
    }

    /// Check if this module uses instruments (vs samples-only)
    pub fn uses_instruments(&self) -> bool {
        self.flags.contains(SongFlags::INSTRUMENT_MODE)
    }

    /// Check if this module uses old effects mode
    pub fn uses_old_effects(&self) -> bool {
        self.flags.contains(SongFlags::OLD_EFFECTS)
    }

    /// Check if this module links G memory with E/F for portamento
    pub fn uses_compat_gxx(&self) -> bool {
        self.flags.contains(SongFlags::COMPAT_GXX)
    }

    /// Check the data invariants the replayer relies on.
    ///
    /// The replayer clamps everything it reads, so an invalid module still
    /// plays; this is for loaders that want to reject bad input early.
    pub fn validate(&self) -> Result<(), ModuleError> {
        if self.orders.len() > MAX_ORDERS {
            return Err(ModuleError::TooMany {
                what: "orders",
                count: self.orders.len(),
                max: MAX_ORDERS,
            });
        }
        if self.patterns.len() > MAX_PATTERNS {
            return Err(ModuleError::TooMany {
                what: "patterns",
                count: self.patterns.len(),
                max: MAX_PATTERNS,
            });
        }
        if self.samples.len() >= MAX_SAMPLES {
            return Err(ModuleError::TooMany {
                what: "samples",
                count: self.samples.len(),
                max: MAX_SAMPLES - 1,
            });
        }
        if self.instruments.len() >= MAX_INSTRUMENTS {
            return Err(ModuleError::TooMany {
                what: "instruments",
                count: self.instruments.len(),
                max: MAX_INSTRUMENTS - 1,
            });
        }

        for (i, pattern) in self.patterns.iter().enumerate() {
            let Some(pattern) = pattern else { continue };
            if pattern.num_rows == 0 || pattern.num_rows > TrackerPattern::MAX_ROWS {
                return Err(ModuleError::PatternRows {
                    pattern: i,
                    rows: pattern.num_rows,
                    max: TrackerPattern::MAX_ROWS,
                });
            }
            let expected = pattern.num_rows as usize * MAX_CHANNELS;
            if pattern.notes.len() != expected {
                return Err(ModuleError::PatternData {
                    pattern: i,
                    len: pattern.notes.len(),
                    expected,
                });
            }
        }

        for (i, sample) in self.samples.iter().enumerate() {
            validate_sample(i + 1, sample)?;
        }

        for (i, instrument) in self.instruments.iter().enumerate() {
            let envelopes = [
                ("volume", &instrument.volume_envelope),
                ("panning", &instrument.panning_envelope),
                ("pitch", &instrument.pitch_envelope),
            ];
            for (name, env) in envelopes {
                validate_envelope(i + 1, name, env)?;
            }
        }

        Ok(())
    }
}

fn validate_sample(number: usize, sample: &TrackerSample) -> Result<(), ModuleError> {
    let err = |reason: String| ModuleError::Sample {
        sample: number,
        reason,
    };

    if sample.length > MAX_SAMPLE_LENGTH {
        return Err(err(format!("length {} too long", sample.length)));
    }
    if !sample.flags.contains(SampleFlags::ADLIB) {
        let channels = if sample.flags.contains(SampleFlags::STEREO) { 2 } else { 1 };
        let needed = sample.length as usize * channels;
        if sample.data.len() < needed {
            return Err(err(format!(
                "{} frames declared but only {} values stored",
                sample.length,
                sample.data.len()
            )));
        }
    }
    if sample.flags.contains(SampleFlags::LOOP)
        && (sample.loop_start >= sample.loop_end || sample.loop_end > sample.length)
    {
        return Err(err(format!(
            "loop {}..{} outside sample of {} frames",
            sample.loop_start, sample.loop_end, sample.length
        )));
    }
    if sample.flags.contains(SampleFlags::SUSTAIN_LOOP)
        && (sample.sustain_start >= sample.sustain_end || sample.sustain_end > sample.length)
    {
        return Err(err(format!(
            "sustain loop {}..{} outside sample of {} frames",
            sample.sustain_start, sample.sustain_end, sample.length
        )));
    }
    Ok(())
}

fn validate_envelope(
    instrument: usize,
    envelope: &'static str,
    env: &TrackerEnvelope,
) -> Result<(), ModuleError> {
    let err = |reason: String| ModuleError::Envelope {
        instrument,
        envelope,
        reason,
    };

    if env.points.len() > TrackerEnvelope::MAX_POINTS {
        return Err(err(format!("{} nodes", env.points.len())));
    }
    if env.points.windows(2).any(|w| w[0].0 >= w[1].0) {
        return Err(err("node ticks are not strictly increasing".to_string()));
    }
    if env.points.iter().any(|&(_, v)| v > 64) {
        return Err(err("node value above 64".to_string()));
    }
    let nodes = env.points.len();
    let markers = [
        env.loop_begin,
        env.loop_end,
        env.sustain_begin,
        env.sustain_end,
    ];
    if nodes > 0 && markers.iter().any(|&m| m as usize >= nodes) {
        return Err(err("loop or sustain marker past the last node".to_string()));
    }
    Ok(())
}

/// Song playback flags supplied by the loader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SongFlags(u32);

impl SongFlags {
    /// Embed MIDI macros with the song
    pub const EMBED_MIDI_CONFIG: Self = Self(0x0001);
    /// Old Impulse Tracker effect implementations
    pub const OLD_EFFECTS: Self = Self(0x0004);
    /// Compatible Gxx: portamento memory separate from E/F
    pub const COMPAT_GXX: Self = Self(0x0008);
    /// Use linear frequency slides (vs Amiga slides)
    pub const LINEAR_SLIDES: Self = Self(0x0010);
    /// Use instruments (vs samples-only mode)
    pub const INSTRUMENT_MODE: Self = Self(0x2_0000);
    /// Force mono output
    pub const NO_STEREO: Self = Self(0x8_0000);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for SongFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// =============================================================================
// Channel Settings
// =============================================================================

/// Initial state of one pattern channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSettings {
    /// Panning (0-256)
    pub panning: u16,
    /// Channel volume (0-64)
    pub volume: u8,
    /// Start muted
    pub muted: bool,
    /// Start in surround
    pub surround: bool,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            panning: 128,
            volume: 64,
            muted: false,
            surround: false,
        }
    }
}
