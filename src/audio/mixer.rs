//! Software mixer behind every output device.
//!
//! Sources are buffers pinned to an absolute start frame on the device
//! clock. Each render pass sums whatever overlaps the rendered window,
//! applies the smoothed master gain and advances the clock. Sources whose
//! last frame has been rendered (or that were stopped) hand back their
//! completion hook; the caller runs it outside any lock.

use super::buffer::AudioBuffer;

pub type SourceId = u64;

/// Runs once when a source finishes naturally or is stopped.
pub type EndedHook = Box<dyn FnOnce() + Send + 'static>;

struct Source {
    id: SourceId,
    buffer: AudioBuffer,
    start_frame: u64,
    end_frame: u64,
    gain: f32,
    /// Buffer frames consumed per device frame.
    step: f64,
    on_ended: EndedHook,
}

impl Source {
    fn sample_at(&self, device_frame: u64) -> f32 {
        let offset = (device_frame - self.start_frame) as f64;
        let frames = self.buffer.frames();
        if self.step == 1.0 {
            return self.buffer.frame_mono(offset as usize);
        }
        // linear interpolation when the buffer rate differs from the device
        let pos = offset * self.step;
        let idx = pos.floor() as usize;
        if idx + 1 >= frames {
            return self.buffer.frame_mono(frames - 1);
        }
        let frac = (pos - idx as f64) as f32;
        let a = self.buffer.frame_mono(idx);
        let b = self.buffer.frame_mono(idx + 1);
        a + (b - a) * frac
    }
}

pub struct Mixer {
    sample_rate: u32,
    clock: u64,
    sources: Vec<Source>,
    next_id: SourceId,
    gain: f32,
    gain_target: f32,
    gain_coeff: f32,
}

impl Mixer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            clock: 0,
            sources: Vec::new(),
            next_id: 1,
            gain: 1.0,
            gain_target: 1.0,
            gain_coeff: 1.0,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames rendered so far.
    pub fn clock_frames(&self) -> u64 {
        self.clock
    }

    /// Device clock in seconds.
    pub fn current_time(&self) -> f64 {
        self.clock as f64 / self.sample_rate as f64
    }

    fn time_to_frame(&self, time: f64) -> u64 {
        (time * self.sample_rate as f64).round().max(0.0) as u64
    }

    /// Pin `buffer` to `start_time` (seconds on the device clock). Start
    /// times already in the past play from the next rendered frame.
    pub fn schedule(
        &mut self,
        buffer: AudioBuffer,
        start_time: f64,
        gain: f32,
        on_ended: Option<EndedHook>,
    ) -> SourceId {
        let id = self.next_id;
        self.next_id += 1;

        let step = buffer.sample_rate() as f64 / self.sample_rate as f64;
        let length = if step == 1.0 {
            buffer.frames() as u64
        } else {
            (buffer.frames() as f64 / step).ceil() as u64
        };
        let start_frame = self.time_to_frame(start_time).max(self.clock);

        self.sources.push(Source {
            id,
            buffer,
            start_frame,
            end_frame: start_frame + length,
            gain,
            step,
            on_ended: on_ended.unwrap_or_else(|| Box::new(|| {})),
        });
        id
    }

    /// Remove a source. Returns its hook, or `None` if it already ended.
    pub fn stop(&mut self, id: SourceId) -> Option<EndedHook> {
        let pos = self.sources.iter().position(|s| s.id == id)?;
        Some(self.sources.swap_remove(pos).on_ended)
    }

    /// Remove every source, returning all their hooks.
    pub fn stop_all(&mut self) -> Vec<EndedHook> {
        self.sources.drain(..).map(|s| s.on_ended).collect()
    }

    pub fn is_active(&self, id: SourceId) -> bool {
        self.sources.iter().any(|s| s.id == id)
    }

    pub fn active_sources(&self) -> usize {
        self.sources.len()
    }

    /// Approach `target` exponentially with the given time constant,
    /// starting from the current gain.
    pub fn set_gain_target(&mut self, target: f32, time_constant: f32) {
        self.gain_target = target;
        self.gain_coeff = if time_constant <= 0.0 {
            1.0
        } else {
            1.0 - (-1.0 / (time_constant * self.sample_rate as f32)).exp()
        };
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn gain_target(&self) -> f32 {
        self.gain_target
    }

    /// Render `out.len()` mono frames and advance the clock.
    pub fn render(&mut self, out: &mut [f32]) -> Vec<EndedHook> {
        out.fill(0.0);
        let window_start = self.clock;
        let window_end = self.clock + out.len() as u64;

        for source in &self.sources {
            let from = source.start_frame.max(window_start);
            let to = source.end_frame.min(window_end);
            for frame in from..to {
                out[(frame - window_start) as usize] += source.sample_at(frame) * source.gain;
            }
        }

        for sample in out.iter_mut() {
            if self.gain != self.gain_target {
                self.gain += (self.gain_target - self.gain) * self.gain_coeff;
                if (self.gain_target - self.gain).abs() < 1e-5 {
                    self.gain = self.gain_target;
                }
            }
            *sample *= self.gain;
        }

        self.clock = window_end;

        let mut ended = Vec::new();
        let mut i = 0;
        while i < self.sources.len() {
            if self.sources[i].end_frame <= self.clock {
                ended.push(self.sources.swap_remove(i).on_ended);
            } else {
                i += 1;
            }
        }
        ended
    }
}
