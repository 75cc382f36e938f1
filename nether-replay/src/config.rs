//! Mixer configuration (`mixer.toml`)
//!
//! Output format, resampling quality, ramping and the optional DSP stages.
//! Everything has a default so a partial (or empty) file is valid. Values
//! the mixer cannot honour are replaced by [`MixerConfig::validated`]
//! rather than rejected.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Lowest supported output rate
pub const MIN_SAMPLE_RATE: u32 = 4000;
/// Highest supported output rate
pub const MAX_SAMPLE_RATE: u32 = 192_000;
/// Equalizer bands per output side
pub const MAX_EQ_BANDS: usize = 6;

/// Failure reading a configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid mixer configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Resampling kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    /// Take the nearest source sample
    Nearest,
    /// Two-point linear interpolation
    #[default]
    Linear,
    /// Four-tap cubic spline
    Spline,
    /// Eight-tap windowed sinc
    Fir,
}

/// Mixer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixerConfig {
    /// Output rate in Hz (default: 44100, range: 4000-192000)
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Output channels, 1 or 2 (default: 2)
    #[serde(default = "default_channels")]
    pub channels: u32,
    /// Bits per output sample: 8, 16, 24 or 32 (default: 16)
    #[serde(default = "default_bits")]
    pub bits: u32,
    /// Resampling kernel (default: linear)
    #[serde(default)]
    pub interpolation: Interpolation,
    /// Voices mixed per period; quieter ones are skipped (default: 128)
    #[serde(default = "default_max_voices")]
    pub max_voices: u32,
    /// Ramp volume changes to avoid clicks (default: true)
    #[serde(default = "default_true")]
    pub ramping: bool,
    /// Length of a rising volume ramp (default: 1460)
    #[serde(default = "default_ramp_us")]
    pub ramp_up_us: u32,
    /// Length of a falling volume ramp (default: 1460)
    #[serde(default = "default_ramp_us")]
    pub ramp_down_us: u32,
    /// One-pole low-pass on the output (default: false)
    #[serde(default)]
    pub noise_reduction: bool,
    /// Swap left and right (default: false)
    #[serde(default)]
    pub reverse_stereo: bool,
    /// Play surround channels as plain centre (default: false)
    #[serde(default)]
    pub no_surround: bool,
    /// Enable the graphic equalizer (default: false)
    #[serde(default)]
    pub eq: bool,
    /// Band gains 0-127, 0 meaning flat (default: all 0)
    #[serde(default)]
    pub eq_gains: [u32; MAX_EQ_BANDS],
    /// Band centre frequencies in Hz
    #[serde(default = "default_eq_freqs")]
    pub eq_freqs: [u32; MAX_EQ_BANDS],
    /// Ignore jumps to earlier orders (default: false)
    #[serde(default)]
    pub no_backward_jumps: bool,
    /// Muted channels keep advancing silently instead of being skipped
    /// (default: true)
    #[serde(default = "default_true")]
    pub mute_channel_mode: bool,
    /// Drive MIDI instruments like a General MIDI device (default: false)
    #[serde(default)]
    pub midi_like_tracker: bool,
}

fn default_sample_rate() -> u32 {
    44100
}
fn default_channels() -> u32 {
    2
}
fn default_bits() -> u32 {
    16
}
fn default_max_voices() -> u32 {
    128
}
fn default_ramp_us() -> u32 {
    1460
}
fn default_eq_freqs() -> [u32; MAX_EQ_BANDS] {
    [120, 600, 1200, 3000, 6000, 10000]
}
fn default_true() -> bool {
    true
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            bits: default_bits(),
            interpolation: Interpolation::default(),
            max_voices: default_max_voices(),
            ramping: default_true(),
            ramp_up_us: default_ramp_us(),
            ramp_down_us: default_ramp_us(),
            noise_reduction: false,
            reverse_stereo: false,
            no_surround: false,
            eq: false,
            eq_gains: [0; MAX_EQ_BANDS],
            eq_freqs: default_eq_freqs(),
            no_backward_jumps: false,
            mute_channel_mode: default_true(),
            midi_like_tracker: false,
        }
    }
}

impl MixerConfig {
    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Read a file, falling back to defaults when it is missing or broken.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(config) => config.validated(),
            Err(e) => {
                warn!("{e}; using default mixer configuration");
                Self::default()
            }
        }
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Copy with every field forced into a range the mixer supports
    pub fn validated(mut self) -> Self {
        let defaults = Self::default();
        self.sample_rate = self.sample_rate.clamp(MIN_SAMPLE_RATE, MAX_SAMPLE_RATE);
        if !matches!(self.channels, 1 | 2) {
            warn!(channels = self.channels, "unsupported channel count");
            self.channels = defaults.channels;
        }
        if !matches!(self.bits, 8 | 16 | 24 | 32) {
            warn!(bits = self.bits, "unsupported bit depth");
            self.bits = defaults.bits;
        }
        self.max_voices = self.max_voices.clamp(1, crate::MAX_VOICES as u32);
        for gain in &mut self.eq_gains {
            *gain = (*gain).min(127);
        }
        self
    }

    /// Bytes in one output frame
    pub fn frame_size(&self) -> usize {
        (self.channels * self.bits / 8) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = MixerConfig::default();
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.channels, 2);
        assert_eq!(config.bits, 16);
        assert_eq!(config.interpolation, Interpolation::Linear);
        assert!(config.ramping);
        assert_eq!(config.frame_size(), 4);
    }

    #[test]
    fn test_config_deserialize_empty() {
        let config = MixerConfig::from_toml("").unwrap();
        assert_eq!(config, MixerConfig::default(), "empty file gives defaults");
    }

    #[test]
    fn test_config_deserialize_partial() {
        let config = MixerConfig::from_toml(
            r#"
sample_rate = 22050
interpolation = "fir"
eq_gains = [10, 0, 0, 0, 0, 64]
"#,
        )
        .unwrap();
        assert_eq!(config.sample_rate, 22050);
        assert_eq!(config.interpolation, Interpolation::Fir);
        assert_eq!(config.eq_gains[5], 64);
        assert_eq!(config.bits, 16, "unset fields keep their default");
    }

    #[test]
    fn test_config_serialize_roundtrip() {
        let config = MixerConfig {
            channels: 1,
            bits: 24,
            interpolation: Interpolation::Spline,
            reverse_stereo: true,
            ..Default::default()
        };
        let parsed = MixerConfig::from_toml(&config.to_toml()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_validated_clamps() {
        let config = MixerConfig {
            sample_rate: 1,
            channels: 0,
            bits: 12,
            max_voices: 10_000,
            eq_gains: [200; MAX_EQ_BANDS],
            ..Default::default()
        }
        .validated();
        assert_eq!(config.sample_rate, MIN_SAMPLE_RATE, "rate clamps up");
        assert_eq!(config.channels, 2, "zero channels falls back to stereo");
        assert_eq!(config.bits, 16, "12-bit falls back to 16");
        assert_eq!(config.max_voices, crate::MAX_VOICES as u32);
        assert!(config.eq_gains.iter().all(|&g| g == 127));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bits = 8\nchannels = 1").unwrap();
        let config = MixerConfig::load(file.path()).unwrap();
        assert_eq!(config.bits, 8);
        assert_eq!(config.frame_size(), 1);
    }

    #[test]
    fn test_load_or_default_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert_eq!(MixerConfig::load_or_default(&missing), MixerConfig::default());

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "sample_rate = \"fast\"").unwrap();
        assert!(matches!(MixerConfig::load(&broken), Err(ConfigError::Parse(_))));
        assert_eq!(MixerConfig::load_or_default(&broken), MixerConfig::default());
    }

    #[test]
    fn test_load_or_default_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixer.toml");
        std::fs::write(&path, "sample_rate = 500000").unwrap();
        assert_eq!(MixerConfig::load_or_default(&path).sample_rate, MAX_SAMPLE_RATE);
    }
}
