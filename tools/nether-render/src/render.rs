//! Pull PCM out of a [`Player`] and write it to a WAV file

use std::path::Path;

use anyhow::{Context, Result};
use hound::{SampleFormat, WavSpec, WavWriter};
use nether_replay::{MixerConfig, Player};
use nether_tracker::TrackerModule;
use tracing::{debug, info};

/// Frames requested per read
const CHUNK_FRAMES: usize = 4096;

/// Render summary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rendered {
    pub frames: u64,
    pub sample_rate: u32,
}

impl Rendered {
    pub fn seconds(&self) -> f64 {
        self.frames as f64 / self.sample_rate as f64
    }
}

fn spec(config: &MixerConfig) -> WavSpec {
    WavSpec {
        channels: config.channels as u16,
        sample_rate: config.sample_rate,
        bits_per_sample: config.bits as u16,
        sample_format: SampleFormat::Int,
    }
}

/// Write raw mixer output to `writer`, one sample at a time
fn write_pcm<W: std::io::Write + std::io::Seek>(writer: &mut WavWriter<W>, pcm: &[u8], bits: u32) -> Result<()> {
    match bits {
        // Mixer output is unsigned; hound takes signed and flips it back.
        8 => {
            for &b in pcm {
                writer.write_sample((b ^ 0x80) as i8)?;
            }
        }
        16 => {
            for s in pcm.chunks_exact(2) {
                writer.write_sample(i16::from_le_bytes([s[0], s[1]]))?;
            }
        }
        24 => {
            for s in pcm.chunks_exact(3) {
                writer.write_sample(i32::from_le_bytes([0, s[0], s[1], s[2]]) >> 8)?;
            }
        }
        _ => {
            for s in pcm.chunks_exact(4) {
                writer.write_sample(i32::from_le_bytes([s[0], s[1], s[2], s[3]]))?;
            }
        }
    }
    Ok(())
}

/// Play `module` through to the end, `loops` extra times, into `path`.
pub fn render_to_wav(module: TrackerModule, config: MixerConfig, loops: u32, path: &Path) -> Result<Rendered> {
    let frame_size = config.frame_size();
    let bits = config.bits;
    let sample_rate = config.sample_rate;
    let wav_spec = spec(&config);

    let player = Player::new(module, config);
    player.start_once();
    if loops > 0 {
        player.with(|song| song.set_repeat_count(-(loops as i32) - 1));
    }

    let mut writer =
        WavWriter::create(path, wav_spec).with_context(|| format!("creating {}", path.display()))?;
    let mut buf = vec![0u8; CHUNK_FRAMES * frame_size];
    let mut frames: u64 = 0;
    loop {
        let n = player.read(&mut buf);
        if n == 0 {
            break;
        }
        write_pcm(&mut writer, &buf[..n * frame_size], bits)?;
        frames += n as u64;
        debug!(frames, position = ?player.position(), "rendered chunk");
    }
    writer.finalize().with_context(|| format!("finalizing {}", path.display()))?;

    let rendered = Rendered { frames, sample_rate };
    info!(path = %path.display(), frames, seconds = rendered.seconds(), "wrote WAV");
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nether_replay::Interpolation;
    use nether_tracker::{TrackerNote, TrackerPattern, TrackerSample};

    fn tone_module(rows: u16) -> TrackerModule {
        let mut module = TrackerModule::default();
        module.orders = vec![0];
        let mut pattern = TrackerPattern::empty(rows);
        if let Some(n) = pattern.note_mut(0, 0) {
            *n = TrackerNote::new(TrackerNote::NOTE_MIDDLE_C, 1);
        }
        module.set_pattern(0, pattern);
        let cycle: Vec<i8> = (0..32).map(|i| if i < 16 { 64 } else { -64 }).collect();
        module.samples.push(TrackerSample::from_pcm8(cycle).with_loop(0, 32, false));
        module
    }

    /// The final read rings out to the end of its chunk
    fn padded(frames: u64) -> u64 {
        frames.div_ceil(CHUNK_FRAMES as u64) * CHUNK_FRAMES as u64
    }

    #[test]
    fn test_wav_header_and_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let rendered = render_to_wav(tone_module(2), MixerConfig::default(), 0, &path).unwrap();

        // 2 rows x 6 ticks x 882 frames
        assert_eq!(rendered.frames, padded(12 * 882));
        let reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.sample_rate, 44100);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(reader.duration() as u64, rendered.frames, "frames on disk");
    }

    #[test]
    fn test_wav_contains_the_tone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        render_to_wav(tone_module(4), MixerConfig::default(), 0, &path).unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert!(samples.iter().any(|&s| s > 256));
        assert!(samples.iter().any(|&s| s < -256));
    }

    #[test]
    fn test_mono_8bit_and_loops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        let config = MixerConfig {
            channels: 1,
            bits: 8,
            sample_rate: 22050,
            interpolation: Interpolation::Nearest,
            ..MixerConfig::default()
        };
        let rendered = render_to_wav(tone_module(8), config, 1, &path).unwrap();

        // two passes of 48 ticks at 441 frames
        assert_eq!(rendered.frames, padded(2 * 48 * 441));
        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.spec().bits_per_sample, 8);
        assert_eq!(reader.duration() as u64, rendered.frames);
    }

    #[test]
    fn test_24bit_samples_sign_extend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deep.wav");
        let mut writer = WavWriter::create(
            &path,
            WavSpec {
                channels: 1,
                sample_rate: 8000,
                bits_per_sample: 24,
                sample_format: SampleFormat::Int,
            },
        )
        .unwrap();
        write_pcm(&mut writer, &[0xFF, 0xFF, 0xFF, 0x10, 0x00, 0x00], 24).unwrap();
        writer.finalize().unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        let samples: Vec<i32> = reader.samples::<i32>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![-1, 16]);
    }
}
