//! Song duration without mixing
//!
//! Walks the order list row by row, applying only the effects that change
//! timing or position: speed, tempo, jumps, breaks, row delays and pattern
//! loops. A pattern loop adds its body's duration once per repeat instead
//! of replaying it, so the walk is always finite.

use nether_tracker::{Effect, MAX_CHANNELS, MAX_PATTERNS, ORDER_LAST, TrackerModule};

use super::Song;

/// Where a duration walk should stop early
#[derive(Debug, Clone, Copy)]
enum Stop {
    Never,
    /// At the first row at or past this order and row
    Position(u32, u32),
    /// At the first row starting at or after this many milliseconds
    Time(u64),
}

/// Walk the song and return the elapsed milliseconds at the stop point,
/// plus the order and row where the walk ended.
fn walk(module: &TrackerModule, stop: Stop) -> (u64, Option<(u32, u32)>) {
    let mut elapsed: u64 = 0;
    let mut next_row: u32 = 0;
    let mut next_order: u32 = 0;
    let mut speed = match module.initial_speed {
        0 => 6,
        s => s as u32,
    };
    let mut tempo = match module.initial_tempo {
        0 => 125,
        t => (t as u32).max(32),
    };
    let mut patloop = [0u64; MAX_CHANNELS];
    let mut mem_tempo = [0u8; MAX_CHANNELS];
    let mut setloop: u64 = 0;
    let mut repeats: Vec<(usize, u64)> = Vec::new();

    loop {
        let mut speed_count: u32 = 0;
        let mut row = next_row;
        let mut cur_order = next_order;

        let mut pat = module.order(cur_order as usize);
        while pat as usize >= MAX_PATTERNS {
            if pat == ORDER_LAST {
                break;
            }
            cur_order += 1;
            pat = module.order(cur_order as usize);
            next_order = cur_order;
        }
        if pat as usize >= MAX_PATTERNS {
            return (elapsed, None);
        }

        let rows = module.pattern_rows(pat as usize) as u32;
        if row >= rows {
            row = 0;
        }
        next_row = row + 1;
        if next_row >= rows {
            next_order = cur_order + 1;
            next_row = 0;
        }

        match stop {
            Stop::Never => {}
            Stop::Position(order, stop_row) => {
                if order <= cur_order && stop_row <= row {
                    return (elapsed, Some((cur_order, row)));
                }
            }
            Stop::Time(ms) => {
                if elapsed >= ms {
                    return (elapsed, Some((cur_order, row)));
                }
            }
        }

        if row == 0 {
            setloop = u64::MAX;
        }
        if setloop != 0 {
            for (n, start) in patloop.iter_mut().enumerate() {
                if setloop & (1 << n) != 0 {
                    *start = elapsed;
                }
            }
            setloop = 0;
        }

        let cells = module.pattern(pat as usize).and_then(|p| p.row(row as u16)).unwrap_or(&[]);
        for (n, cell) in cells.iter().enumerate().take(MAX_CHANNELS) {
            let param = cell.param as u32;
            match cell.effect {
                Effect::PositionJump => {
                    next_order = if param > cur_order { param } else { cur_order + 1 };
                    next_row = 0;
                }
                Effect::PatternBreak => {
                    next_order = cur_order + 1;
                    next_row = param;
                }
                Effect::Speed => {
                    if param != 0 {
                        speed = param;
                    }
                }
                Effect::Tempo => {
                    let param = if param != 0 {
                        mem_tempo[n] = param as u8;
                        param
                    } else {
                        mem_tempo[n] as u32
                    };
                    let step = (param & 0x0F) as i64;
                    tempo = match param >> 4 {
                        0 => (tempo as i64 - step * (speed as i64 - 1)).clamp(32, 255) as u32,
                        1 => (tempo as i64 + step * (speed as i64 - 1)).clamp(32, 255) as u32,
                        _ => param,
                    };
                }
                Effect::Special => match param >> 4 {
                    0x6 => speed_count = param & 0x0F,
                    0xB => {
                        if param & 0x0F != 0 {
                            repeats.push((n, (param & 0x0F) as u64));
                        } else {
                            patloop[n] = elapsed;
                        }
                    }
                    0xE => speed_count = (param & 0x0F) * speed,
                    _ => {}
                },
                _ => {}
            }
        }

        elapsed += row_duration_ms(speed + speed_count, tempo) as u64;

        // The loop body includes the row carrying SBx
        for (n, count) in repeats.drain(..) {
            elapsed += elapsed.saturating_sub(patloop[n]) * count;
            patloop[n] = u64::MAX;
            setloop |= 1 << n;
        }
    }
}

/// Milliseconds for one row of `ticks` ticks at `tempo`
pub(crate) fn row_duration_ms(ticks: u32, tempo: u32) -> u32 {
    ticks * 2500 / tempo.max(1)
}

/// Playing time of `module` in milliseconds for a single pass, or up to
/// `stop_at` (order, row) when given.
pub fn song_length_ms(module: &TrackerModule, stop_at: Option<(u32, u32)>) -> u64 {
    let stop = match stop_at {
        Some((order, row)) => Stop::Position(order, row),
        None => Stop::Never,
    };
    walk(module, stop).0
}

/// Order and row playing `ms` milliseconds into the song, `None` past
/// the end.
pub fn position_at_ms(module: &TrackerModule, ms: u64) -> Option<(u32, u32)> {
    walk(module, Stop::Time(ms)).1
}

impl Song {
    /// Song length in whole seconds, rounded to nearest. A song with any
    /// playable rows reports at least one second.
    pub fn get_length(&self) -> u32 {
        let ms = self.length_ms();
        if ms == 0 {
            return 0;
        }
        ((ms + 500) / 1000).max(1) as u32
    }

    /// Song length in milliseconds, up to the stop point if one is set
    pub fn length_ms(&self) -> u64 {
        song_length_ms(&self.module, self.stop_at)
    }

    /// Milliseconds from the start of the song to `row` of `order`
    pub fn length_to(&self, order: u32, row: u32) -> u64 {
        song_length_ms(&self.module, Some((order, row)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MixerConfig;
    use nether_tracker::{TrackerNote, TrackerPattern};

    fn module(orders: &[u8], rows: u16) -> TrackerModule {
        let mut module = TrackerModule::default();
        module.orders = orders.to_vec();
        for &o in orders {
            if (o as usize) < MAX_PATTERNS {
                module.set_pattern(o as usize, TrackerPattern::empty(rows));
            }
        }
        module
    }

    fn put(module: &mut TrackerModule, pattern: usize, row: u16, channel: usize, effect: Effect, param: u8) {
        if let Some(Some(p)) = module.patterns.get_mut(pattern)
            && let Some(n) = p.note_mut(row, channel)
        {
            *n = TrackerNote::default().with_effect(effect, param);
        }
    }

    #[test]
    fn test_row_duration() {
        assert_eq!(row_duration_ms(6, 125), 120);
        assert_eq!(row_duration_ms(3, 150), 50);
    }

    #[test]
    fn test_plain_pattern_length() {
        let m = module(&[0, 1], 64);
        assert_eq!(song_length_ms(&m, None), 2 * 64 * 120);
    }

    #[test]
    fn test_skip_and_missing_patterns() {
        let mut m = module(&[0], 4);
        m.orders = vec![0, nether_tracker::ORDER_SKIP, 9];
        assert_eq!(song_length_ms(&m, None), (4 + 64) * 120, "pattern 9 plays as 64 blank rows");
    }

    #[test]
    fn test_speed_and_tempo_changes() {
        let mut m = module(&[0], 4);
        put(&mut m, 0, 1, 0, Effect::Speed, 3);
        put(&mut m, 0, 2, 5, Effect::Tempo, 250);
        assert_eq!(song_length_ms(&m, None), 120 + 60 + 30 + 30);
    }

    #[test]
    fn test_tempo_slide_uses_speed() {
        let mut m = module(&[0], 2);
        put(&mut m, 0, 0, 0, Effect::Tempo, 0x15);
        // 125 + 5 * (6 - 1) = 150
        assert_eq!(song_length_ms(&m, None), 2 * 100);
    }

    #[test]
    fn test_row_delays() {
        let mut m = module(&[0], 2);
        put(&mut m, 0, 0, 0, Effect::Special, 0x62);
        put(&mut m, 0, 1, 0, Effect::Special, 0xE1);
        assert_eq!(song_length_ms(&m, None), 8 * 20 + 12 * 20);
    }

    #[test]
    fn test_pattern_loop_repeats_body() {
        let mut m = module(&[0], 4);
        put(&mut m, 0, 1, 0, Effect::Special, 0xB0);
        put(&mut m, 0, 2, 0, Effect::Special, 0xB2);
        // rows 1..=2 play three times in total
        assert_eq!(song_length_ms(&m, None), (4 + 2 * 2) * 120);
    }

    #[test]
    fn test_break_and_jump_are_followed() {
        let mut m = module(&[0, 1, 2], 8);
        put(&mut m, 0, 0, 0, Effect::PatternBreak, 6);
        put(&mut m, 1, 6, 0, Effect::PositionJump, 0);
        // order 0 row 0, order 1 rows 6..=6, then the backward jump moves on
        assert_eq!(song_length_ms(&m, None), (1 + 1 + 8) * 120);
    }

    #[test]
    fn test_stop_position_and_lookup() {
        let m = module(&[0, 1], 8);
        assert_eq!(song_length_ms(&m, Some((1, 2))), 10 * 120);
        assert_eq!(position_at_ms(&m, 10 * 120), Some((1, 2)));
        assert_eq!(position_at_ms(&m, 1_000_000), None);
    }

    #[test]
    fn test_get_length_rounds_to_seconds() {
        let song = Song::new(module(&[0], 2), MixerConfig::default());
        assert_eq!(song.length_ms(), 240);
        assert_eq!(song.get_length(), 1, "a short song still reports a second");
        let empty = Song::new(TrackerModule::default(), MixerConfig::default());
        assert_eq!(empty.get_length(), 0);
        let long = Song::new(module(&[0, 1, 0], 64), MixerConfig::default());
        assert_eq!(long.get_length(), 23, "23.04 s");
    }
}
