//! Nether-OPL: register-level OPL2 (YM3812) FM synthesis emulation
//!
//! Two layers:
//!
//! - [`Opl`]: the chip itself. Nine two-operator channels, each operator with
//!   its own envelope generator (attack, decay, sustain, release) and phase
//!   counter, a shared tremolo/vibrato LFO, a 23-bit noise generator and the
//!   rhythm mode that turns channels 6-8 into five drum voices. Driven purely
//!   through register writes.
//! - [`OplDriver`]: the adapter a tracker talks to. It owns one chip,
//!   assigns logical voices to the nine chip channels (free channels first,
//!   then released ones), and translates patch/frequency/volume/pan/key-off
//!   events into register writes.
//!
//! There is no global state; every session owns its own driver.
//!
//! # Example
//!
//! ```
//! use nether_opl::OplDriver;
//!
//! let mut driver = OplDriver::new(44100);
//! let patch = [0x21, 0x21, 0x10, 0x00, 0xF4, 0xF4, 0x2F, 0x2F, 0, 0, 0x01, 0];
//! driver.patch(0, &patch);
//! driver.hertz_touch(0, 440_000, false);
//! driver.touch(0, 63);
//!
//! let mut mix = vec![0i32; 2 * 256];
//! driver.mix_to(&mut mix, 256);
//! ```

mod chip;
mod driver;
mod tables;

pub use chip::{EnvelopePhase, OPL_CHANNELS, Opl};
pub use driver::{
    MAX_LOGICAL_VOICES, OPL_RATE_BASE, OPL_VOLUME, OplDriver, fnum_to_millihertz,
    millihertz_to_fnum,
};
