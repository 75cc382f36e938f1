//! Sample data structures

use std::sync::Arc;

/// Unified tracker sample
///
/// Volumes and panning use the replayer's internal ranges, so a sample's
/// default volume of 64 is stored as 256.
#[derive(Debug, Clone)]
pub struct TrackerSample {
    /// Sample name
    pub name: String,
    /// Sample length in frames
    pub length: u32,
    /// Loop begin (frames)
    pub loop_start: u32,
    /// Loop end (frames, exclusive)
    pub loop_end: u32,
    /// Sustain loop begin
    pub sustain_start: u32,
    /// Sustain loop end
    pub sustain_end: u32,
    /// PCM data, shared with any voice playing it
    pub data: SampleData,
    /// Playback rate of C-5 in Hz
    pub c5_speed: u32,
    /// Default panning (0-256), used when [`SampleFlags::PANNING`] is set
    pub panning: u16,
    /// Default volume (0-256)
    pub volume: u16,
    /// Global volume (0-64)
    pub global_volume: u8,
    /// Loop and format flags
    pub flags: SampleFlags,

    // =========================================================================
    // Auto-vibrato
    // =========================================================================
    /// Auto-vibrato waveform
    pub vibrato_type: VibratoType,
    /// Auto-vibrato sweep rate (depth ramp per tick, 1/256 units)
    pub vibrato_rate: u8,
    /// Auto-vibrato depth
    pub vibrato_depth: u8,
    /// Auto-vibrato speed
    pub vibrato_speed: u8,

    /// OPL2 register image for FM samples (see [`SampleFlags::ADLIB`])
    pub adlib_bytes: [u8; 12],
}

impl Default for TrackerSample {
    fn default() -> Self {
        Self {
            name: String::new(),
            length: 0,
            loop_start: 0,
            loop_end: 0,
            sustain_start: 0,
            sustain_end: 0,
            data: SampleData::Empty,
            c5_speed: 8363,
            panning: 128,
            volume: 64 * 4,
            global_volume: 64,
            flags: SampleFlags::empty(),
            vibrato_type: VibratoType::Sine,
            vibrato_rate: 0,
            vibrato_depth: 0,
            vibrato_speed: 0,
            adlib_bytes: [0; 12],
        }
    }
}

impl TrackerSample {
    /// Mono 8-bit sample from raw PCM
    pub fn from_pcm8(data: Vec<i8>) -> Self {
        Self {
            length: data.len() as u32,
            data: SampleData::Pcm8(data.into()),
            ..Default::default()
        }
    }

    /// Mono 16-bit sample from raw PCM
    pub fn from_pcm16(data: Vec<i16>) -> Self {
        Self {
            length: data.len() as u32,
            data: SampleData::Pcm16(data.into()),
            flags: SampleFlags::SIXTEEN_BIT,
            ..Default::default()
        }
    }

    /// FM instrument sample from an OPL register image
    pub fn adlib(bytes: [u8; 12]) -> Self {
        Self {
            // A nonzero length keeps the voice alive; no PCM is ever read.
            length: 1,
            adlib_bytes: bytes,
            flags: SampleFlags::ADLIB,
            ..Default::default()
        }
    }

    /// Builder: enable a forward (or ping-pong) loop
    pub fn with_loop(mut self, start: u32, end: u32, pingpong: bool) -> Self {
        self.loop_start = start;
        self.loop_end = end;
        self.flags = self.flags | SampleFlags::LOOP;
        if pingpong {
            self.flags = self.flags | SampleFlags::PINGPONG_LOOP;
        }
        self
    }

    /// Builder: enable a sustain loop
    pub fn with_sustain_loop(mut self, start: u32, end: u32, pingpong: bool) -> Self {
        self.sustain_start = start;
        self.sustain_end = end;
        self.flags = self.flags | SampleFlags::SUSTAIN_LOOP;
        if pingpong {
            self.flags = self.flags | SampleFlags::PINGPONG_SUSTAIN;
        }
        self
    }

    /// Whether this sample has anything to play
    pub fn has_data(&self) -> bool {
        self.flags.contains(SampleFlags::ADLIB) || !self.data.is_empty()
    }

    /// Clamp loop points to the sample, dropping loops shorter than 3 frames
    pub fn adjust_loop(&mut self) {
        if self.data.is_empty() || self.length == 0 {
            return;
        }
        self.loop_end = self.loop_end.min(self.length);
        if self.loop_start + 2 >= self.loop_end {
            self.loop_start = 0;
            self.loop_end = 0;
            self.flags = self.flags.without(SampleFlags::LOOP);
        }
        self.sustain_end = self.sustain_end.min(self.length);
        if self.sustain_start + 2 >= self.sustain_end {
            self.sustain_start = 0;
            self.sustain_end = 0;
            self.flags = self.flags.without(SampleFlags::SUSTAIN_LOOP);
        }
    }
}

/// Raw PCM storage
///
/// Stereo data is interleaved (`L R L R ...`); [`SampleFlags::STEREO`] says
/// which layout applies.
#[derive(Debug, Clone, Default)]
pub enum SampleData {
    #[default]
    Empty,
    Pcm8(Arc<[i8]>),
    Pcm16(Arc<[i16]>),
}

impl SampleData {
    /// Number of stored values (frames times channels)
    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Pcm8(d) => d.len(),
            Self::Pcm16(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_16bit(&self) -> bool {
        matches!(self, Self::Pcm16(_))
    }

    /// Value at `index`, scaled to the 16-bit range.
    ///
    /// Reads past the end repeat the last value, which is what an
    /// interpolator looking ahead of the final frame expects.
    #[inline]
    pub fn get(&self, index: usize) -> i32 {
        match self {
            Self::Empty => 0,
            Self::Pcm8(d) => match d.get(index).or_else(|| d.last()) {
                Some(&v) => (v as i32) << 8,
                None => 0,
            },
            Self::Pcm16(d) => match d.get(index).or_else(|| d.last()) {
                Some(&v) => v as i32,
                None => 0,
            },
        }
    }

    /// Whether two handles share the same PCM buffer
    pub fn same_buffer(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Pcm8(a), Self::Pcm8(b)) => Arc::ptr_eq(a, b),
            (Self::Pcm16(a), Self::Pcm16(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Sample flags
///
/// Bit values match the replayer's voice flags so they can be copied onto a
/// voice unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleFlags(u32);

impl SampleFlags {
    pub const SIXTEEN_BIT: Self = Self(0x01);
    pub const LOOP: Self = Self(0x02);
    pub const PINGPONG_LOOP: Self = Self(0x04);
    pub const SUSTAIN_LOOP: Self = Self(0x08);
    pub const PINGPONG_SUSTAIN: Self = Self(0x10);
    /// Default panning is set
    pub const PANNING: Self = Self(0x20);
    pub const STEREO: Self = Self(0x40);
    /// FM instrument played on the OPL emulator
    pub const ADLIB: Self = Self(0x2000_0000);

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

    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl std::ops::BitOr for SampleFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Vibrato / tremolo / panbrello / auto-vibrato waveform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum VibratoType {
    #[default]
    Sine = 0,
    RampDown = 1,
    Square = 2,
    Random = 3,
}

impl VibratoType {
    pub const fn from_u8(v: u8) -> Self {
        match v & 3 {
            1 => Self::RampDown,
            2 => Self::Square,
            3 => Self::Random,
            _ => Self::Sine,
        }
    }
}
