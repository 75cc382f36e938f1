//! Graphic equalizer: six peaking bands per output side

use crate::config::MAX_EQ_BANDS;

const EQ_BANDWIDTH: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
struct EqBand {
    a0: f32,
    a1: f32,
    a2: f32,
    b1: f32,
    b2: f32,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
    gain: f32,
    center_frequency: f32,
    enabled: bool,
}

impl EqBand {
    fn flat(center_frequency: f32) -> Self {
        Self {
            a0: 0.0,
            a1: 0.0,
            a2: 0.0,
            b1: 0.0,
            b2: 0.0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
            gain: 1.0,
            center_frequency,
            enabled: false,
        }
    }

    fn clear_history(&mut self) {
        self.x1 = 0.0;
        self.x2 = 0.0;
        self.y1 = 0.0;
        self.y2 = 0.0;
    }

    fn is_active(&self) -> bool {
        self.enabled && self.gain != 1.0
    }

    fn update(&mut self, reset: bool, mix_rate: f32) {
        if !self.enabled {
            *self = Self {
                gain: self.gain,
                center_frequency: self.center_frequency,
                ..Self::flat(self.center_frequency)
            };
            return;
        }

        let f = self.center_frequency / mix_rate;
        if f > 0.45 {
            self.gain = 1.0;
        }
        let k = f * std::f32::consts::PI;
        let k = k + k * f;
        let k2 = k * k;
        let width = if self.gain < 1.0 { 0.5 / EQ_BANDWIDTH } else { 1.0 / EQ_BANDWIDTH };
        let v0 = self.gain * width;
        let v1 = width;
        let denom = 1.0 + v1 * k + k2;

        let coefs = [
            (1.0 + v0 * k + k2) / denom,
            2.0 * (k2 - 1.0) / denom,
            (1.0 - v0 * k + k2) / denom,
            -2.0 * (k2 - 1.0) / denom,
            -(1.0 - v1 * k + k2) / denom,
        ];
        let changed = coefs != [self.a0, self.a1, self.a2, self.b1, self.b2];
        [self.a0, self.a1, self.a2, self.b1, self.b2] = coefs;
        if reset || changed {
            self.clear_history();
        }
    }

    /// Filter every `stride`-th value of `buffer`
    fn process(&mut self, buffer: &mut [i32], stride: usize) {
        for s in buffer.iter_mut().step_by(stride) {
            let x = *s as f32;
            let y = self.a1 * self.x1 + self.a2 * self.x2 + self.a0 * x + self.b1 * self.y1 + self.b2 * self.y2;
            self.x2 = self.x1;
            self.y2 = self.y1;
            self.x1 = x;
            self.y1 = y;
            *s = y as i32;
        }
    }
}

/// Equalizer state for both output sides
#[derive(Debug, Clone)]
pub(crate) struct Equalizer {
    bands: [EqBand; MAX_EQ_BANDS * 2],
}

impl Default for Equalizer {
    fn default() -> Self {
        const FREQS: [f32; MAX_EQ_BANDS] = [120.0, 600.0, 1200.0, 3000.0, 6000.0, 10000.0];
        Self {
            bands: std::array::from_fn(|i| EqBand::flat(FREQS[i % MAX_EQ_BANDS])),
        }
    }
}

impl Equalizer {
    /// Set band gains (0..=127, where 0 is flat and 64 doubles the band)
    /// and centre frequencies. Bands past `gains.len()` or at 20 Hz and
    /// below are disabled.
    pub fn set_gains(&mut self, gains: &[u32], freqs: &[u32], reset: bool, mix_rate: u32) {
        for i in 0..MAX_EQ_BANDS {
            let (gain, freq) = match gains.get(i) {
                Some(&n) => (1.0 + n as f32 / 64.0, freqs.get(i).map_or(0.0, |&f| f as f32)),
                None => (1.0, 0.0),
            };
            let enabled = freq > 20.0 && i < gains.len();
            for band in [i, i + MAX_EQ_BANDS] {
                self.bands[band].gain = gain;
                self.bands[band].center_frequency = freq;
                self.bands[band].enabled = enabled;
            }
        }
        self.initialize(reset, mix_rate);
    }

    /// Recompute coefficients for a new mix rate
    pub fn initialize(&mut self, reset: bool, mix_rate: u32) {
        for band in &mut self.bands {
            band.update(reset, mix_rate as f32);
        }
    }

    /// Equalize interleaved stereo frames
    pub fn process_stereo(&mut self, buffer: &mut [i32]) {
        let (left, right) = self.bands.split_at_mut(MAX_EQ_BANDS);
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            if l.is_active() {
                l.process(buffer, 2);
            }
            if r.is_active() {
                if let Some(tail) = buffer.get_mut(1..) {
                    r.process(tail, 2);
                }
            }
        }
    }

    /// Equalize mono samples
    pub fn process_mono(&mut self, buffer: &mut [i32]) {
        for band in self.bands[..MAX_EQ_BANDS].iter_mut().filter(|b| b.is_active()) {
            band.process(buffer, 1);
        }
    }
}
