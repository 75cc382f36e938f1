//! MIDI macro configuration
//!
//! Macros are short strings of hex nibbles and substitution letters that the
//! replayer expands into MIDI bytes. `F0 F0 xx` sequences address the
//! internal resonant filter instead of an external device.

/// Longest macro the replayer reads (characters)
pub const MACRO_LENGTH: usize = 32;

/// Macro strings for song events, parametered (SFx) and fixed (Zxx) macros
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiConfig {
    pub start: String,
    pub stop: String,
    pub tick: String,
    pub note_on: String,
    pub note_off: String,
    pub set_volume: String,
    pub set_panning: String,
    pub set_bank: String,
    pub set_program: String,
    /// Parametered macros selected by SFx, used by Z00-Z7F
    pub sfx: [String; 16],
    /// Fixed macros for Z80-ZFF
    pub zxx: [String; 128],
}

impl Default for MidiConfig {
    fn default() -> Self {
        let sfx = std::array::from_fn(|i| match i {
            0 => "F0F000z".to_string(),
            _ => String::new(),
        });
        // Z80-Z8F step the filter cutoff in eighths.
        let zxx = std::array::from_fn(|i| {
            if i < 16 {
                format!("F0F001{:02x}", i * 8)
            } else {
                String::new()
            }
        });

        Self {
            start: "FF".to_string(),
            stop: "FC".to_string(),
            tick: String::new(),
            note_on: "9c n v".to_string(),
            note_off: "9c n 0".to_string(),
            set_volume: String::new(),
            set_panning: String::new(),
            set_bank: String::new(),
            set_program: "Cc p".to_string(),
            sfx,
            zxx,
        }
    }
}

impl MidiConfig {
    /// Macro text for a Zxx parameter given the channel's active SFx slot
    pub fn macro_for_param(&self, param: u8, active_macro: u8) -> &str {
        if param < 0x80 {
            self.sfx
                .get(active_macro as usize & 0x0F)
                .map_or("", String::as_str)
        } else {
            self.zxx
                .get(param as usize & 0x7F)
                .map_or("", String::as_str)
        }
    }
}
