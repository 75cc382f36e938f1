//! Pattern and note data structures

use crate::MAX_CHANNELS;
use crate::effects::{Effect, VolumeEffect};

/// Tracker pattern
///
/// Rows are always [`MAX_CHANNELS`] wide so channel indices never need
/// remapping.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerPattern {
    /// Number of rows (1-200)
    pub num_rows: u16,
    /// Note data, row-major: `notes[row * MAX_CHANNELS + channel]`
    pub notes: Vec<TrackerNote>,
}

impl TrackerPattern {
    /// Default pattern length
    pub const DEFAULT_ROWS: u16 = 64;
    /// Longest pattern the replayer accepts
    pub const MAX_ROWS: u16 = 200;

    /// Create an empty pattern
    pub fn empty(num_rows: u16) -> Self {
        Self {
            num_rows,
            notes: vec![TrackerNote::default(); num_rows as usize * MAX_CHANNELS],
        }
    }

    /// Get note at specific row and channel
    pub fn get_note(&self, row: u16, channel: usize) -> Option<&TrackerNote> {
        if row >= self.num_rows || channel >= MAX_CHANNELS {
            return None;
        }
        self.notes.get(row as usize * MAX_CHANNELS + channel)
    }

    /// Mutable access to a note, for builders
    pub fn note_mut(&mut self, row: u16, channel: usize) -> Option<&mut TrackerNote> {
        if row >= self.num_rows || channel >= MAX_CHANNELS {
            return None;
        }
        self.notes.get_mut(row as usize * MAX_CHANNELS + channel)
    }

    /// All channels of one row
    pub fn row(&self, row: u16) -> Option<&[TrackerNote]> {
        let start = row as usize * MAX_CHANNELS;
        self.notes.get(start..start + MAX_CHANNELS)
    }

    /// Whether every note in the pattern is blank
    pub fn is_blank(&self) -> bool {
        self.notes.iter().all(TrackerNote::is_empty)
    }
}

impl Default for TrackerPattern {
    fn default() -> Self {
        Self::empty(Self::DEFAULT_ROWS)
    }
}

/// Single note/command in a pattern
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerNote {
    /// Note value (1-120 = C-0 to B-9, see the `NOTE_*` constants)
    pub note: u8,
    /// Instrument (or sample, in sample mode) number, 1-based, 0 = none
    pub instrument: u8,
    /// Volume column command
    pub vol_effect: VolumeEffect,
    /// Volume column parameter
    pub vol_param: u8,
    /// Effect column command
    pub effect: Effect,
    /// Effect column parameter
    pub param: u8,
}

impl TrackerNote {
    pub const NOTE_NONE: u8 = 0;
    pub const NOTE_FIRST: u8 = 1;
    /// C-5
    pub const NOTE_MIDDLE_C: u8 = 61;
    pub const NOTE_LAST: u8 = 120;
    /// Fade the playing note (`~~~`)
    pub const NOTE_FADE: u8 = 246;
    /// Cut the playing note (`^^^`)
    pub const NOTE_CUT: u8 = 254;
    /// Release the playing note (`===`)
    pub const NOTE_OFF: u8 = 255;

    /// Shorthand for a note with instrument and nothing else
    pub const fn new(note: u8, instrument: u8) -> Self {
        Self {
            note,
            instrument,
            vol_effect: VolumeEffect::None,
            vol_param: 0,
            effect: Effect::None,
            param: 0,
        }
    }

    /// Builder: set the effect column
    pub const fn with_effect(mut self, effect: Effect, param: u8) -> Self {
        self.effect = effect;
        self.param = param;
        self
    }

    /// Builder: set the volume column
    pub const fn with_volume(mut self, vol_effect: VolumeEffect, vol_param: u8) -> Self {
        self.vol_effect = vol_effect;
        self.vol_param = vol_param;
        self
    }

    /// Anything playable, C-0 to B-9
    pub const fn is_note(note: u8) -> bool {
        note > Self::NOTE_NONE && note <= Self::NOTE_LAST
    }

    /// Not a note, but not empty either (cut, off, fade, invalid)
    pub const fn is_control(note: u8) -> bool {
        note > Self::NOTE_LAST
    }

    /// Check if this has a valid note
    pub fn has_note(&self) -> bool {
        Self::is_note(self.note)
    }

    /// Check if this has an instrument
    pub fn has_instrument(&self) -> bool {
        self.instrument > 0
    }

    /// Check if there's an effect
    pub fn has_effect(&self) -> bool {
        self.effect != Effect::None
    }

    /// Nothing at all in any column
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
