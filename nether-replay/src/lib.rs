//! Nether-Replay: tick-accurate tracker playback
//!
//! Plays a [`TrackerModule`](nether_tracker::TrackerModule) the way Impulse
//! Tracker does: the same tick timing, effect memories, slide tables, New
//! Note Actions and resonant filter, mixed to PCM at any supported rate.
//! Instruments carrying OPL patches go through the [`nether_opl`] chip
//! emulator; instruments routed to MIDI produce General MIDI messages for
//! a host-provided sink.
//!
//! # Architecture
//!
//! ```text
//!   Player (Arc<Mutex<Song>>)
//!          │  read(&mut [u8])
//!          ▼
//!   ┌──────────────────────────────────────────────┐
//!   │ Song                                         │
//!   │  tick ──▶ effects ──▶ notes / nna ──▶ voices │
//!   │                                       │      │
//!   │  render: envelopes, ramps, voice limit│      │
//!   │          mixer kernels ◀──────────────┘      │
//!   │          OPL ─┐  EQ / noise reduction        │
//!   │               └▶ clip + convert ──▶ PCM      │
//!   └──────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use nether_replay::{MixerConfig, Player};
//! use nether_tracker::{TrackerModule, TrackerPattern};
//!
//! let mut module = TrackerModule::default();
//! module.orders = vec![0];
//! module.set_pattern(0, TrackerPattern::empty(64));
//!
//! let player = Player::new(module, MixerConfig::default());
//! player.start_once();
//! let mut buffer = vec![0u8; 4096];
//! while player.read(&mut buffer) > 0 {
//!     // hand the buffer to the audio device
//! }
//! ```

pub mod config;
pub mod gm;
pub(crate) mod mixer;
mod player;
pub mod song;
pub(crate) mod tables;
pub(crate) mod voice;


pub use config::{ConfigError, Interpolation, MixerConfig};
pub use gm::GmDriver;
pub use player::Player;
pub use song::{
    MidiOutState, MidiSink, NoteCallback, PlayFlags, Song, VoiceInfo, position_at_ms, song_length_ms,
};

/// Voices in the pool: one per channel plus background voices for NNA
pub const MAX_VOICES: usize = 256;

/// Frames mixed per pass through the accumulator
pub const MIX_BUFFER_SIZE: usize = 512;
