use std::sync::Arc;

/// Decoded, ready-to-play audio.
///
/// Samples are interleaved f32 in [-1.0, 1.0]. Cloning is cheap: the sample
/// data is shared, so the same buffer can sit in the speech cache and in the
/// mixer at once.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Arc<[f32]>,
    sample_rate: u32,
    channels: u16,
}

impl AudioBuffer {
    /// `samples` must hold a whole number of frames for `channels`.
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        debug_assert!(channels > 0);
        debug_assert_eq!(samples.len() % channels as usize, 0);
        Self {
            samples: samples.into(),
            sample_rate,
            channels,
        }
    }

    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::new(samples, sample_rate, 1)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Down-mixed value of frame `index`, averaging all channels.
    pub fn frame_mono(&self, index: usize) -> f32 {
        let ch = self.channels as usize;
        if ch == 1 {
            return self.samples[index];
        }
        let frame = &self.samples[index * ch..(index + 1) * ch];
        frame.iter().sum::<f32>() / ch as f32
    }

    /// True when both handles share the same sample storage.
    pub fn same_data(&self, other: &AudioBuffer) -> bool {
        Arc::ptr_eq(&self.samples, &other.samples)
    }
}
