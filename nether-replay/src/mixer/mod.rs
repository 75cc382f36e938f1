//! Voice mixing
//!
//! Each mix period every active voice renders into a shared interleaved
//! stereo `i32` accumulator with [`MIXING_ATTENUATION`](convert) bits of
//! headroom. A voice is mixed in spans: [`sample_count`] finds how many
//! output frames can be produced before the cursor reaches a loop point,
//! the sample end or the end of a volume ramp, the span is rendered with
//! the selected kernel, and the loop is resolved before the next span.
//!
//! # Kernel selection
//!
//! The kernel is chosen once per voice per period from the configured
//! [`Interpolation`] and the voice's `NO_IDO` flag (set when the step is
//! 1.0, or large enough that interpolation would not be audible). Ramping
//! and filtering are per-span switches inside the same generic loop.
//!
//! # Click removal
//!
//! When a voice stops, the last value it contributed is kept as an offset
//! that decays towards zero over the following frames (`left_ofs`,
//! `right_ofs`), so a voice cut mid-waveform does not leave a step in the
//! output.

pub(crate) mod convert;
pub(crate) mod dsp;
pub(crate) mod eq;
mod filter;
pub(crate) mod kernels;

use crate::config::Interpolation;
use crate::voice::{Voice, VoiceFlags};
use kernels::{Fir, Linear, Nearest, Resampler, SampleView, Spline};

/// Fractional bits of the ramp accumulators
pub(crate) const VOLUME_RAMP_PRECISION: u32 = 12;

/// Reflection fudge for ping-pong loops: the turn-around sample plays once
const PINGPONG_OFFSET: i64 = 1;

const OFS_DECAY_SHIFT: u32 = 8;
const OFS_DECAY_MASK: i32 = 0xFF;

const ONE: i64 = 1 << 32;

#[inline]
fn whole(n: i64) -> i64 {
    ONE * n
}

/// Frames needed to move from `from` to just before `to` at step `inc`
#[inline]
fn distance(from: i64, to: i64, inc: i64) -> i32 {
    if inc == 0 {
        return 0;
    }
    ((to - from - ONE) / inc) as i32 + 1
}

/// Resolve loop wrap-around for `voice` and return how many frames (at
/// most `samples`) can be rendered before the next boundary. Zero means
/// the voice has finished.
pub(crate) fn sample_count(voice: &mut Voice, samples: i32) -> i32 {
    let looping = voice.flags.contains(VoiceFlags::LOOP);
    let loop_start = if looping { voice.loop_start as i64 } else { 0 };
    let length = voice.length as i64;

    if samples <= 0 || voice.increment == 0 || length == 0 {
        return 0;
    }

    if voice.position < whole(loop_start) {
        if voice.increment < 0 {
            // Reflect off the loop start and go forward again
            let delta = whole(loop_start) - voice.position;
            voice.position = whole(loop_start) + delta;
            if voice.position < whole(loop_start) || voice.position >= whole((loop_start + length) / 2) {
                voice.position = whole(loop_start);
            }
            voice.increment = -voice.increment;
            voice.flags.remove(VoiceFlags::PINGPONG_FLAG);

            if !looping || voice.position >= whole(length) {
                voice.position = whole(length);
                return 0;
            }
        } else if voice.position < 0 {
            voice.position = 0;
        }
    } else if voice.position >= whole(length) {
        if !looping {
            return 0;
        }
        if voice.flags.contains(VoiceFlags::PINGPONG_LOOP) {
            if voice.increment > 0 {
                voice.increment = -voice.increment;
            }
            voice.flags.insert(VoiceFlags::PINGPONG_FLAG);
            let overshoot = voice.position - whole(length);
            let loop_length = whole(voice.loop_end as i64 - voice.loop_start as i64 - PINGPONG_OFFSET);
            voice.position = if overshoot < loop_length {
                whole(length - PINGPONG_OFFSET) - overshoot
            } else {
                whole(voice.loop_start as i64)
            };
        } else {
            if voice.increment < 0 {
                voice.increment = -voice.increment;
            }
            voice.position += whole(loop_start - length);
            if voice.position < whole(loop_start) {
                voice.position = whole(voice.loop_start as i64);
            }
        }
    }

    let pos = voice.position_whole();
    if pos < loop_start && (pos < 0 || voice.increment < 0) {
        return 0;
    }
    if pos < 0 || pos >= length {
        return 0;
    }

    let inc = (voice.increment as i64) << 16;
    let inv = inc.abs();
    let max_samples = (16384 / ((inv >> 32) + 1)).max(2) as i32;
    let mut count = samples.min(max_samples);

    let pos_dest = (voice.position + inc * (count as i64 - 1)) >> 32;
    if inc < 0 {
        if pos_dest < loop_start {
            count = distance(whole(loop_start), voice.position, inv);
        }
    } else if pos_dest >= length {
        count = distance(voice.position, whole(length), inv);
    }

    count.clamp(1, samples)
}

/// Render one span of `voice` into `out` (interleaved stereo frames).
fn mix_span<R: Resampler>(voice: &mut Voice, view: &SampleView<'_>, out: &mut [i32]) {
    let inc = (voice.increment as i64) << 16;
    let ramping = voice.ramp_length > 0;
    let filtering = voice.flags.contains(VoiceFlags::FILTER);
    let mut pos = voice.position;
    let mut left_ramp = voice.left_ramp_volume;
    let mut right_ramp = voice.right_ramp_volume;
    let mut vu = voice.vu_meter;

    for frame in out.chunks_exact_mut(2) {
        let (mut l, mut r) = if view.stereo {
            (R::fetch(view, pos, 0), R::fetch(view, pos, 1))
        } else {
            let v = R::fetch(view, pos, 0);
            (v, v)
        };

        if filtering {
            l = voice.filter_sample(0, l);
            r = if view.stereo { voice.filter_sample(1, r) } else { l };
        }

        let (vl, vr) = if ramping {
            left_ramp += voice.left_ramp;
            right_ramp += voice.right_ramp;
            (
                l.wrapping_mul(left_ramp >> VOLUME_RAMP_PRECISION),
                r.wrapping_mul(right_ramp >> VOLUME_RAMP_PRECISION),
            )
        } else {
            (l.wrapping_mul(voice.left_volume), r.wrapping_mul(voice.right_volume))
        };

        let avg = ((vl.unsigned_abs() as u64 + vr.unsigned_abs() as u64) / 2) as u32;
        vu = vu.max(avg);

        frame[0] = frame[0].wrapping_add(vl);
        frame[1] = frame[1].wrapping_add(vr);
        pos += inc;
    }

    voice.position = pos;
    voice.vu_meter = vu;
    if ramping {
        voice.left_ramp_volume = left_ramp;
        voice.right_ramp_volume = right_ramp;
        voice.left_volume = left_ramp >> VOLUME_RAMP_PRECISION;
        voice.right_volume = right_ramp >> VOLUME_RAMP_PRECISION;
    }
}

/// Mix `voice` into `buffer` (`buffer.len() / 2` frames).
///
/// `over_limit` voices advance without rendering. Offsets left by a voice
/// that stops are moved into `dry` so they keep decaying in later periods.
/// Returns true if the voice contributed audio.
pub(crate) fn mix_voice(
    voice: &mut Voice,
    buffer: &mut [i32],
    interpolation: Interpolation,
    over_limit: bool,
    dry: &mut [i32; 2],
) -> bool {
    let data = voice.current_sample_data.clone();
    let adlib = voice.flags.contains(VoiceFlags::ADLIB);
    let kernel = if voice.flags.contains(VoiceFlags::NO_IDO) {
        Interpolation::Nearest
    } else {
        interpolation
    };

    let mut added = false;
    let mut offset = 0;
    let mut remaining = (buffer.len() / 2) as i32;
    voice.vu_meter <<= 16;

    while remaining > 0 {
        let mut span = remaining;
        if voice.ramp_length > 0 {
            span = span.min(voice.ramp_length);
        }

        let count = match &data {
            Some(_) if adlib => span,
            Some(_) => sample_count(voice, span),
            None => 0,
        };

        if count <= 0 {
            voice.current_sample_data = None;
            voice.length = 0;
            voice.position = 0;
            voice.ramp_length = 0;
            end_channel_ofs(voice, &mut buffer[offset..]);
            dry[0] += voice.left_ofs;
            dry[1] += voice.right_ofs;
            voice.left_ofs = 0;
            voice.right_ofs = 0;
            voice.flags.remove(VoiceFlags::PINGPONG_FLAG);
            break;
        }

        let end = offset + count as usize * 2;
        let silent = voice.ramp_length == 0 && (voice.left_volume | voice.right_volume) == 0;
        if over_limit || silent {
            voice.position += ((voice.increment as i64) << 16) * count as i64;
            voice.left_ofs = 0;
            voice.right_ofs = 0;
        } else if let (Some(data), false) = (&data, adlib) {
            let view = SampleView {
                data,
                length: voice.length as i64,
                loop_start: voice.loop_start as i64,
                looping: voice.flags.contains(VoiceFlags::LOOP),
                pingpong: voice.flags.contains(VoiceFlags::PINGPONG_LOOP),
                stereo: voice.flags.contains(VoiceFlags::STEREO),
            };
            let out = &mut buffer[offset..end];
            let (last_l, last_r) = (out[out.len() - 2], out[out.len() - 1]);
            match kernel {
                Interpolation::Nearest => mix_span::<Nearest>(voice, &view, out),
                Interpolation::Linear => mix_span::<Linear>(voice, &view, out),
                Interpolation::Spline => mix_span::<Spline>(voice, &view, out),
                Interpolation::Fir => mix_span::<Fir>(voice, &view, out),
            }
            voice.left_ofs = out[out.len() - 2] - last_l;
            voice.right_ofs = out[out.len() - 1] - last_r;
            added = true;
        }
        if !adlib {
            offset = end;
        }

        remaining -= count;

        if voice.ramp_length > 0 {
            if voice.ramp_length <= count {
                voice.ramp_length = 0;
                voice.left_volume = voice.left_volume_new;
                voice.right_volume = voice.right_volume_new;
                voice.left_ramp = 0;
                voice.right_ramp = 0;
                if voice.flags.contains(VoiceFlags::NOTEFADE) && voice.fadeout_volume == 0 {
                    voice.length = 0;
                    voice.current_sample_data = None;
                }
            } else {
                voice.ramp_length -= count;
            }
        }
    }

    voice.vu_meter = (voice.vu_meter >> 16).min(0xFF);
    added
}

#[inline]
fn decay_step(ofs: i32) -> i32 {
    (ofs + ((-ofs >> 31) & OFS_DECAY_MASK)) >> OFS_DECAY_SHIFT
}

/// Clear `buffer` for a new period, seeded with the decaying dry offsets.
pub(crate) fn stereo_fill(buffer: &mut [i32], dry: &mut [i32; 2]) {
    if dry[0] == 0 && dry[1] == 0 {
        buffer.fill(0);
        return;
    }
    for frame in buffer.chunks_exact_mut(2) {
        let l = decay_step(dry[0]);
        let r = decay_step(dry[1]);
        dry[0] -= l;
        dry[1] -= r;
        frame[0] = l;
        frame[1] = r;
    }
}

/// Fade out the click-removal offsets of a stopping voice into `buffer`.
pub(crate) fn end_channel_ofs(voice: &mut Voice, buffer: &mut [i32]) {
    if voice.left_ofs == 0 && voice.right_ofs == 0 {
        return;
    }
    for frame in buffer.chunks_exact_mut(2) {
        let l = decay_step(voice.left_ofs);
        let r = decay_step(voice.right_ofs);
        voice.left_ofs -= l;
        voice.right_ofs -= r;
        frame[0] += l;
        frame[1] += r;
    }
}

/// Fold interleaved stereo into the first half of `buffer` as mono.
pub(crate) fn mono_from_stereo(buffer: &mut [i32], frames: usize) {
    for i in 0..frames.min(buffer.len() / 2) {
        buffer[i] = (buffer[i * 2] + buffer[i * 2 + 1]) >> 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nether_tracker::SampleData;
    use std::sync::Arc;

    fn voice_with(data: Vec<i16>, increment: i32) -> Voice {
        let length = data.len() as u32;
        Voice {
            current_sample_data: Some(SampleData::Pcm16(Arc::from(data))),
            ptr_sample: Some(1),
            length,
            increment,
            left_volume: 64,
            right_volume: 64,
            flags: VoiceFlags::SIXTEEN_BIT,
            ..Default::default()
        }
    }

    #[test]
    fn test_sample_count_stops_at_end() {
        let mut voice = voice_with(vec![100; 10], 0x10000);
        voice.set_position(6);
        assert_eq!(sample_count(&mut voice, 100), 4, "four frames left");

        voice.set_position(10);
        assert_eq!(sample_count(&mut voice, 100), 0, "past the end without a loop");
    }

    #[test]
    fn test_sample_count_half_speed() {
        let mut voice = voice_with(vec![0; 10], 0x8000);
        voice.set_position(8);
        assert_eq!(sample_count(&mut voice, 100), 3, "positions 8, 8.5 and 9");
    }

    #[test]
    fn test_forward_loop_wraps() {
        let mut voice = voice_with(vec![0; 16], 0x10000);
        voice.flags.insert(VoiceFlags::LOOP);
        voice.loop_start = 4;
        voice.loop_end = 16;
        voice.position = whole(17);
        let n = sample_count(&mut voice, 100);
        assert_eq!(voice.position_whole(), 5, "overshoot carries into the loop");
        assert_eq!(n, 11);
    }

    #[test]
    fn test_pingpong_reflection_stays_in_loop() {
        for overshoot in 0..20 {
            let mut voice = voice_with(vec![0; 16], 0x30000);
            voice.flags.insert(VoiceFlags::LOOP | VoiceFlags::PINGPONG_LOOP);
            voice.loop_start = 4;
            voice.loop_end = 16;
            voice.position = whole(16 + overshoot);
            let n = sample_count(&mut voice, 64);
            let pos = voice.position_whole();
            assert!((4..16).contains(&pos), "overshoot {overshoot} reflected to {pos}");
            assert!(voice.increment < 0, "now playing backwards");
            assert!(voice.flags.contains(VoiceFlags::PINGPONG_FLAG));
            assert!(n >= 1);
        }
    }

    #[test]
    fn test_pingpong_turns_forward_at_loop_start() {
        let mut voice = voice_with(vec![0; 16], -0x10000);
        voice.flags.insert(VoiceFlags::LOOP | VoiceFlags::PINGPONG_LOOP | VoiceFlags::PINGPONG_FLAG);
        voice.loop_start = 4;
        voice.loop_end = 16;
        voice.position = whole(3);
        sample_count(&mut voice, 64);
        assert_eq!(voice.position_whole(), 5);
        assert!(voice.increment > 0);
        assert!(!voice.flags.contains(VoiceFlags::PINGPONG_FLAG));
    }

    #[test]
    fn test_mix_voice_constant_volume() {
        let mut voice = voice_with(vec![1000; 64], 0x10000);
        voice.left_volume = 2;
        voice.right_volume = 3;
        let mut buffer = vec![0; 16];
        let mut dry = [0; 2];
        let added = mix_voice(&mut voice, &mut buffer, Interpolation::Linear, false, &mut dry);
        assert!(added);
        assert!(buffer.chunks(2).all(|f| f == [2000, 3000]));
        assert_eq!(voice.position_whole(), 8);
        assert_eq!((voice.left_ofs, voice.right_ofs), (2000, 3000), "last frame kept for click removal");
    }

    #[test]
    fn test_mix_voice_stops_and_moves_offset_to_dry() {
        let mut voice = voice_with(vec![1000; 4], 0x10000);
        let mut buffer = vec![0; 16];
        let mut dry = [0; 2];
        mix_voice(&mut voice, &mut buffer, Interpolation::Nearest, false, &mut dry);
        assert_eq!(voice.length, 0, "voice stopped at the sample end");
        assert!(voice.current_sample_data.is_none());
        assert!(buffer[8] > 0 && buffer[8] < 64_000, "tail decays instead of stepping");
        assert!(dry[0] > 0, "remaining offset carried into the next period");
    }

    #[test]
    fn test_mix_voice_over_limit_only_advances() {
        let mut voice = voice_with(vec![1000; 64], 0x10000);
        let mut buffer = vec![0; 16];
        let mut dry = [0; 2];
        let added = mix_voice(&mut voice, &mut buffer, Interpolation::Linear, true, &mut dry);
        assert!(!added);
        assert!(buffer.iter().all(|&s| s == 0));
        assert_eq!(voice.position_whole(), 8, "skipped voices keep their place");
    }

    #[test]
    fn test_ramp_reaches_target() {
        let mut voice = voice_with(vec![100; 64], 0x10000);
        voice.left_volume = 0;
        voice.right_volume = 0;
        voice.left_volume_new = 64;
        voice.right_volume_new = 64;
        voice.ramp_length = 4;
        voice.left_ramp = (64 << VOLUME_RAMP_PRECISION) / 4;
        voice.right_ramp = voice.left_ramp;
        voice.left_ramp_volume = 0;
        voice.right_ramp_volume = 0;
        let mut buffer = vec![0; 16];
        let mut dry = [0; 2];
        mix_voice(&mut voice, &mut buffer, Interpolation::Nearest, false, &mut dry);
        assert_eq!(buffer[0], 100 * 16, "first ramp step");
        assert_eq!(buffer[6], 100 * 64, "ramp complete after four frames");
        assert_eq!(buffer[14], 100 * 64);
        assert_eq!(voice.ramp_length, 0);
        assert_eq!(voice.left_volume, 64);
    }

    #[test]
    fn test_stereo_fill_decays() {
        let mut buffer = vec![7; 8];
        let mut dry = [0; 2];
        stereo_fill(&mut buffer, &mut dry);
        assert!(buffer.iter().all(|&s| s == 0));

        let mut dry = [25600, -25600];
        stereo_fill(&mut buffer, &mut dry);
        assert_eq!(buffer[0], 100);
        assert_eq!(buffer[1], -100);
        assert!(dry[0] < 25600 && dry[1] > -25600);
    }

    #[test]
    fn test_mono_from_stereo() {
        let mut buffer = vec![10, 20, -4, 0];
        mono_from_stereo(&mut buffer, 2);
        assert_eq!(&buffer[..2], &[15, -2]);
    }
}
