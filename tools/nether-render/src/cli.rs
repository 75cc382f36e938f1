//! CLI command definitions using clap

use clap::{Args, Parser, Subcommand, ValueEnum};
use nether_replay::{Interpolation, MixerConfig};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "nether-render")]
#[command(about = "Render the built-in demo song through the tracker replayer")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Render the demo song to a WAV file
    Render {
        /// Output WAV path
        #[arg(short, long, default_value = "demo.wav")]
        out: PathBuf,

        #[command(flatten)]
        mixer: MixerArgs,

        /// Loop the song this many extra times
        #[arg(long, default_value_t = 0)]
        loops: u32,
    },
    /// Print the demo song's length
    Length,
    /// Print the default mixer configuration as TOML
    Config,
}

#[derive(Args)]
pub struct MixerArgs {
    /// Mixer configuration file (TOML); flags below override it
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Output sample rate in Hz
    #[arg(long)]
    pub rate: Option<u32>,

    /// Output bit depth (8, 16, 24 or 32)
    #[arg(long)]
    pub bits: Option<u32>,

    /// Mix to a single channel
    #[arg(long)]
    pub mono: bool,

    /// Resampling filter
    #[arg(long, value_enum)]
    pub interpolation: Option<Resampler>,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Resampler {
    Nearest,
    Linear,
    Spline,
    Fir,
}

impl From<Resampler> for Interpolation {
    fn from(r: Resampler) -> Self {
        match r {
            Resampler::Nearest => Interpolation::Nearest,
            Resampler::Linear => Interpolation::Linear,
            Resampler::Spline => Interpolation::Spline,
            Resampler::Fir => Interpolation::Fir,
        }
    }
}

impl MixerArgs {
    /// Config file (or defaults) with command-line overrides applied
    pub fn to_config(&self) -> anyhow::Result<MixerConfig> {
        let mut config = match &self.config {
            Some(path) => MixerConfig::load(path)?,
            None => MixerConfig::default(),
        };
        if let Some(rate) = self.rate {
            config.sample_rate = rate;
        }
        if let Some(bits) = self.bits {
            config.bits = bits;
        }
        if self.mono {
            config.channels = 1;
        }
        if let Some(r) = self.interpolation {
            config.interpolation = r.into();
        }
        Ok(config.validated())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("nether-render").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_flags_override_defaults() {
        let Commands::Render { mixer, loops, .. } = parse(&["render", "--rate", "22050", "--mono", "--interpolation", "fir"]).command
        else {
            panic!("expected render");
        };
        let config = mixer.to_config().unwrap();
        assert_eq!(config.sample_rate, 22050);
        assert_eq!(config.channels, 1);
        assert_eq!(config.bits, 16, "untouched fields keep defaults");
        assert_eq!(config.interpolation, Interpolation::Fir);
        assert_eq!(loops, 0);
    }

    #[test]
    fn test_flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "sample_rate = 48000\nbits = 24").unwrap();
        let path = file.path().to_str().unwrap().to_owned();

        let Commands::Render { mixer, .. } = parse(&["render", "--config", &path, "--bits", "8"]).command else {
            panic!("expected render");
        };
        let config = mixer.to_config().unwrap();
        assert_eq!(config.sample_rate, 48000, "from the file");
        assert_eq!(config.bits, 8, "flag wins over the file");
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let Commands::Render { mixer, .. } = parse(&["render", "-c", "/nonexistent/mixer.toml"]).command else {
            panic!("expected render");
        };
        assert!(mixer.to_config().is_err());
    }
}
