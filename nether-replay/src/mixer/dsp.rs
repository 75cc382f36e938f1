//! Noise reduction: a one-pole averaging low-pass on the output

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct NoiseReduction {
    left: i32,
    right: i32,
}

impl NoiseReduction {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn process_stereo(&mut self, buffer: &mut [i32]) {
        for frame in buffer.chunks_exact_mut(2) {
            let l = frame[0] >> 1;
            frame[0] = l + self.left;
            self.left = l;
            let r = frame[1] >> 1;
            frame[1] = r + self.right;
            self.right = r;
        }
    }

    pub fn process_mono(&mut self, buffer: &mut [i32]) {
        for s in buffer {
            let v = *s >> 1;
            *s = v + self.left;
            self.left = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_averages_neighbours() {
        let mut nr = NoiseReduction::default();
        let mut buf = [100, 200, 300];
        nr.process_mono(&mut buf);
        assert_eq!(buf, [50, 150, 250]);

        let mut next = [0];
        nr.process_mono(&mut next);
        assert_eq!(next, [150], "history carries across buffers");
    }

    #[test]
    fn test_stereo_keeps_sides_apart() {
        let mut nr = NoiseReduction::default();
        let mut buf = [1000, 0, 1000, 0];
        nr.process_stereo(&mut buf);
        assert_eq!(buf, [500, 0, 1000, 0]);
        nr.reset();
        assert_eq!(nr, NoiseReduction::default());
    }
}
