//! Instrument data structures and envelopes

/// Unified tracker instrument
#[derive(Debug, Clone)]
pub struct TrackerInstrument {
    /// Instrument name
    pub name: String,
    /// New Note Action
    pub nna: NewNoteAction,
    /// Duplicate check type
    pub dct: DuplicateCheckType,
    /// Duplicate check action
    pub dca: DuplicateCheckAction,
    /// Fadeout speed (0-8192, subtracted twice per tick from a 16-bit level)
    pub fadeout: u32,
    /// Global volume (0-128)
    pub global_volume: u8,
    /// Default panning (0-256), None if not set
    pub default_pan: Option<u16>,
    /// Note -> sample number, indexed by `note - 1`
    pub sample_map: [u8; 128],
    /// Note -> played note, indexed by `note - 1`
    pub note_map: [u8; 128],
    /// Volume envelope (values 0-64)
    pub volume_envelope: TrackerEnvelope,
    /// Panning envelope (values 0-64, centre 32)
    pub panning_envelope: TrackerEnvelope,
    /// Pitch envelope (values 0-64, centre 32), or filter envelope with
    /// [`EnvelopeFlags::FILTER`]
    pub pitch_envelope: TrackerEnvelope,
    /// Random panning variation (0-64)
    pub pan_swing: u8,
    /// Random volume variation (0-100 percent)
    pub vol_swing: u8,
    /// Initial filter cutoff, bit 7 set when enabled
    pub filter_cutoff: u8,
    /// Initial filter resonance, bit 7 set when enabled
    pub filter_resonance: u8,
    /// MIDI bank (-1 = none)
    pub midi_bank: i32,
    /// MIDI program (-1 = none)
    pub midi_program: i32,
    /// MIDI channel mask; nonzero routes the instrument to MIDI output.
    /// Values of 0x10000 and above mean "tracker channel modulo 16".
    pub midi_channel_mask: u32,
    /// Pitch-pan separation (-32 to +32)
    pub pitch_pan_separation: i8,
    /// Pitch-pan center note (0-119, C-5 = 60)
    pub pitch_pan_center: u8,
}

impl Default for TrackerInstrument {
    fn default() -> Self {
        Self::for_sample(0)
    }
}

impl TrackerInstrument {
    /// Instrument mapping every note to itself on one sample
    pub fn for_sample(sample: u8) -> Self {
        let mut note_map = [0u8; 128];
        for (i, entry) in note_map.iter_mut().enumerate() {
            *entry = i as u8 + 1;
        }

        Self {
            name: String::new(),
            nna: NewNoteAction::Cut,
            dct: DuplicateCheckType::Off,
            dca: DuplicateCheckAction::Cut,
            fadeout: 0,
            global_volume: 128,
            default_pan: None,
            sample_map: [sample; 128],
            note_map,
            volume_envelope: TrackerEnvelope::flat(64),
            panning_envelope: TrackerEnvelope::flat(32),
            pitch_envelope: TrackerEnvelope::flat(32),
            pan_swing: 0,
            vol_swing: 0,
            filter_cutoff: 0,
            filter_resonance: 0,
            midi_bank: -1,
            midi_program: -1,
            midi_channel_mask: 0,
            pitch_pan_separation: 0,
            pitch_pan_center: 60,
        }
    }

    /// Get the sample number for a given note (1-based note)
    pub fn sample_for_note(&self, note: u8) -> Option<u8> {
        let idx = (note as usize).checked_sub(1)?;
        match self.sample_map.get(idx) {
            Some(&s) if s > 0 => Some(s),
            _ => None,
        }
    }

    /// Translate a played note through the note map
    pub fn map_note(&self, note: u8) -> u8 {
        match (note as usize).checked_sub(1).and_then(|i| self.note_map.get(i)) {
            Some(&n) => n,
            None => note,
        }
    }

    /// Whether notes on this instrument go to MIDI output
    pub fn is_midi(&self) -> bool {
        self.midi_channel_mask != 0
    }
}

/// New Note Action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum NewNoteAction {
    /// Cut the previous note immediately
    #[default]
    Cut = 0,
    /// Continue playing in background
    Continue = 1,
    /// Release the previous note
    NoteOff = 2,
    /// Fade out the previous note
    NoteFade = 3,
}

impl NewNoteAction {
    pub const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Continue,
            2 => Self::NoteOff,
            3 => Self::NoteFade,
            _ => Self::Cut,
        }
    }
}

/// Duplicate Check Type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DuplicateCheckType {
    /// No duplicate checking
    #[default]
    Off = 0,
    /// Check for same note
    Note = 1,
    /// Check for same sample
    Sample = 2,
    /// Check for same instrument
    Instrument = 3,
}

/// Duplicate Check Action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DuplicateCheckAction {
    /// Cut the duplicate note
    #[default]
    Cut = 0,
    /// Release the duplicate note
    NoteOff = 1,
    /// Fade out the duplicate note
    NoteFade = 2,
}

/// Instrument envelope
///
/// Nodes are `(tick, value)` pairs with strictly increasing ticks. Loop and
/// sustain markers are node indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerEnvelope {
    /// Envelope points: (tick, value), value 0-64
    pub points: Vec<(u16, u8)>,
    /// Loop begin point index
    pub loop_begin: u8,
    /// Loop end point index
    pub loop_end: u8,
    /// Sustain loop begin point index
    pub sustain_begin: u8,
    /// Sustain loop end point index
    pub sustain_end: u8,
    /// Envelope flags
    pub flags: EnvelopeFlags,
}

impl Default for TrackerEnvelope {
    fn default() -> Self {
        Self::flat(64)
    }
}

impl TrackerEnvelope {
    /// Maximum number of nodes
    pub const MAX_POINTS: usize = 25;

    /// Disabled two-node envelope holding `value`
    pub fn flat(value: u8) -> Self {
        Self {
            points: vec![(0, value), (100, value)],
            loop_begin: 0,
            loop_end: 0,
            sustain_begin: 0,
            sustain_end: 0,
            flags: EnvelopeFlags::empty(),
        }
    }

    /// Check if envelope is enabled
    pub fn is_enabled(&self) -> bool {
        self.flags.contains(EnvelopeFlags::ENABLED)
    }

    /// Check if envelope has loop
    pub fn has_loop(&self) -> bool {
        self.flags.contains(EnvelopeFlags::LOOP)
    }

    /// Check if envelope has sustain loop
    pub fn has_sustain(&self) -> bool {
        self.flags.contains(EnvelopeFlags::SUSTAIN_LOOP)
    }

    /// Check if envelope position carries over to the next note
    pub fn is_carry(&self) -> bool {
        self.flags.contains(EnvelopeFlags::CARRY)
    }

    /// Check if this is a filter envelope (for pitch envelope type)
    pub fn is_filter(&self) -> bool {
        self.flags.contains(EnvelopeFlags::FILTER)
    }

    /// Tick of node `index`, clamped to the last node
    pub fn tick_at(&self, index: u8) -> i32 {
        let idx = (index as usize).min(self.points.len().saturating_sub(1));
        self.points.get(idx).map_or(0, |&(t, _)| t as i32)
    }

    /// Value of node `index`, clamped to the last node
    pub fn value_at_node(&self, index: u8) -> u8 {
        let idx = (index as usize).min(self.points.len().saturating_sub(1));
        self.points.get(idx).map_or(0, |&(_, v)| v)
    }

    /// Tick of the final node
    pub fn last_tick(&self) -> i32 {
        self.points.last().map_or(0, |&(t, _)| t as i32)
    }

    /// Interpolated value at `pos`.
    ///
    /// `scale` maps a raw node value to the caller's unit. Before the first
    /// node the curve starts from `origin` at tick 0; past the last node it
    /// holds the last value.
    pub fn interpolate(&self, pos: i32, origin: i32, scale: impl Fn(u8) -> i32) -> i32 {
        let Some(last) = self.points.len().checked_sub(1) else {
            return origin;
        };
        let pt = self.points[..last]
            .iter()
            .position(|&(t, _)| pos <= t as i32)
            .unwrap_or(last);

        let (x2, v2) = self.points[pt];
        let x2 = x2 as i32;
        let y2 = scale(v2);
        let (x1, y1) = if pos >= x2 {
            (x2, y2)
        } else if pt > 0 {
            let (t, v) = self.points[pt - 1];
            (t as i32, scale(v))
        } else {
            (0, origin)
        };

        let pos = pos.min(x2);
        if x2 > x1 && pos > x1 {
            y1 + (pos - x1) * (y2 - y1) / (x2 - x1)
        } else {
            y1
        }
    }
}

/// Envelope flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnvelopeFlags(u8);

impl EnvelopeFlags {
    pub const ENABLED: Self = Self(0x01);
    pub const LOOP: Self = Self(0x02);
    pub const SUSTAIN_LOOP: Self = Self(0x04);
    pub const CARRY: Self = Self(0x08);
    pub const FILTER: Self = Self(0x80);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for EnvelopeFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}
