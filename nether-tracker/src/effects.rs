//! Effect column and volume column commands
//!
//! Commands are stored exactly as the replayer interprets them: a command
//! code plus a raw parameter byte on the note. The parameter is not decoded
//! here because its meaning depends on effect memory, the current tick and
//! the song's compatibility flags.

/// Effect column command
///
/// Letters in the docs are the Impulse Tracker mnemonics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(u8)]
pub enum Effect {
    /// No effect
    #[default]
    None = 0,

    // =========================================================================
    // Pitch
    // =========================================================================
    /// Jxy: arpeggio between the note, +x and +y semitones
    Arpeggio = 1,
    /// Fxx: pitch slide up (FFx fine, EFx extra fine)
    PortamentoUp = 2,
    /// Exx: pitch slide down (EFx fine, EEx extra fine)
    PortamentoDown = 3,
    /// Gxx: slide toward the row's note
    TonePortamento = 4,
    /// Hxy: vibrato with speed x, depth y
    Vibrato = 5,
    /// Lxx: continue tone portamento plus volume slide
    TonePortaVol = 6,
    /// Kxx: continue vibrato plus volume slide
    VibratoVol = 7,
    /// Uxy: fine vibrato (quarter depth)
    FineVibrato = 26,
    /// IMF Gxy: slide up y semitones every x ticks
    NoteSlideUp = 32,
    /// IMF Hxy: slide down y semitones every x ticks
    NoteSlideDown = 33,

    // =========================================================================
    // Volume and panning
    // =========================================================================
    /// Rxy: tremolo with speed x, depth y
    Tremolo = 8,
    /// Xxx: set panning (0-255)
    Panning = 9,
    /// Dxy: volume slide
    VolumeSlide = 11,
    /// FT2 Cxx: set volume (0-64)
    Volume = 13,
    /// Ixy: tremor, x ticks on then y ticks off
    Tremor = 18,
    /// Mxx: set channel volume (0-64)
    ChannelVolume = 21,
    /// Nxy: channel volume slide
    ChannelVolSlide = 22,
    /// Vxx: set global volume (0-128)
    GlobalVolume = 23,
    /// Wxy: global volume slide
    GlobalVolSlide = 24,
    /// Yxy: panbrello with speed x, depth y
    Panbrello = 27,
    /// Pxy: panning slide
    PanningSlide = 29,

    // =========================================================================
    // Sample and note control
    // =========================================================================
    /// Oxx: sample offset (high byte from SAx)
    Offset = 10,
    /// Qxy: retrigger every y ticks, volume change x
    Retrig = 15,
    /// FT2 Kxx: key off after xx ticks
    KeyOff = 25,
    /// FT2 Lxx: set envelope position
    SetEnvPosition = 30,

    // =========================================================================
    // Flow control
    // =========================================================================
    /// Bxx: jump to order
    PositionJump = 12,
    /// Cxx: break to row xx of the next order
    PatternBreak = 14,
    /// Axx: set speed (ticks per row)
    Speed = 16,
    /// Txx: set tempo, T0x/T1x slide it
    Tempo = 17,

    // =========================================================================
    // Extended
    // =========================================================================
    /// Sxy: extended command dispatched on x
    Special = 20,
    /// Zxx: MIDI macro
    Midi = 31,
}

impl Effect {
    /// Decode a raw command code. Unknown codes decode to [`Effect::None`].
    pub const fn from_u8(code: u8) -> Self {
        match code {
            1 => Self::Arpeggio,
            2 => Self::PortamentoUp,
            3 => Self::PortamentoDown,
            4 => Self::TonePortamento,
            5 => Self::Vibrato,
            6 => Self::TonePortaVol,
            7 => Self::VibratoVol,
            8 => Self::Tremolo,
            9 => Self::Panning,
            10 => Self::Offset,
            11 => Self::VolumeSlide,
            12 => Self::PositionJump,
            13 => Self::Volume,
            14 => Self::PatternBreak,
            15 => Self::Retrig,
            16 => Self::Speed,
            17 => Self::Tempo,
            18 => Self::Tremor,
            20 => Self::Special,
            21 => Self::ChannelVolume,
            22 => Self::ChannelVolSlide,
            23 => Self::GlobalVolume,
            24 => Self::GlobalVolSlide,
            25 => Self::KeyOff,
            26 => Self::FineVibrato,
            27 => Self::Panbrello,
            29 => Self::PanningSlide,
            30 => Self::SetEnvPosition,
            31 => Self::Midi,
            32 => Self::NoteSlideUp,
            33 => Self::NoteSlideDown,
            _ => Self::None,
        }
    }

    /// Raw command code
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Tracker display letter, `.` for no effect
    pub const fn letter(self) -> char {
        match self {
            Self::None => '.',
            Self::Arpeggio => 'J',
            Self::PortamentoUp => 'F',
            Self::PortamentoDown => 'E',
            Self::TonePortamento => 'G',
            Self::Vibrato => 'H',
            Self::TonePortaVol => 'L',
            Self::VibratoVol => 'K',
            Self::Tremolo => 'R',
            Self::Panning => 'X',
            Self::Offset => 'O',
            Self::VolumeSlide => 'D',
            Self::PositionJump => 'B',
            Self::Volume => '!',
            Self::PatternBreak => 'C',
            Self::Retrig => 'Q',
            Self::Speed => 'A',
            Self::Tempo => 'T',
            Self::Tremor => 'I',
            Self::Special => 'S',
            Self::ChannelVolume => 'M',
            Self::ChannelVolSlide => 'N',
            Self::GlobalVolume => 'V',
            Self::GlobalVolSlide => 'W',
            Self::KeyOff => '$',
            Self::FineVibrato => 'U',
            Self::Panbrello => 'Y',
            Self::PanningSlide => 'P',
            Self::SetEnvPosition => '&',
            Self::Midi => 'Z',
            Self::NoteSlideUp => '(',
            Self::NoteSlideDown => ')',
        }
    }

    /// Effects that slide the pitch toward a target instead of retriggering
    pub const fn is_tone_portamento(self) -> bool {
        matches!(self, Self::TonePortamento | Self::TonePortaVol)
    }
}

/// Volume column command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(u8)]
pub enum VolumeEffect {
    #[default]
    None = 0,
    /// Set volume (0-64)
    Volume = 1,
    /// Set panning (0-64)
    Panning = 2,
    /// Cx: volume slide up
    VolSlideUp = 3,
    /// Dx: volume slide down
    VolSlideDown = 4,
    /// Ax: fine volume up
    FineVolUp = 5,
    /// Bx: fine volume down
    FineVolDown = 6,
    /// FT2 Ax: vibrato speed
    VibratoSpeed = 7,
    /// Hx: vibrato depth
    VibratoDepth = 8,
    /// FT2 Dx: pan slide left
    PanSlideLeft = 9,
    /// FT2 Ex: pan slide right
    PanSlideRight = 10,
    /// Gx: tone portamento
    TonePortamento = 11,
    /// Fx: pitch slide up
    PortaUp = 12,
    /// Ex: pitch slide down
    PortaDown = 13,
}

impl VolumeEffect {
    /// Decode a raw volume command code. Unknown codes decode to [`VolumeEffect::None`].
    pub const fn from_u8(code: u8) -> Self {
        match code {
            1 => Self::Volume,
            2 => Self::Panning,
            3 => Self::VolSlideUp,
            4 => Self::VolSlideDown,
            5 => Self::FineVolUp,
            6 => Self::FineVolDown,
            7 => Self::VibratoSpeed,
            8 => Self::VibratoDepth,
            9 => Self::PanSlideLeft,
            10 => Self::PanSlideRight,
            11 => Self::TonePortamento,
            12 => Self::PortaUp,
            13 => Self::PortaDown,
            _ => Self::None,
        }
    }

    pub const fn code(self) -> u8 {
        self as u8
    }
}
