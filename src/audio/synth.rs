//! Procedural sound effects. Every effect is rendered into a short buffer
//! up front; nothing is loaded from disk.

use std::f64::consts::PI;

use rand::Rng;

use super::buffer::AudioBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Square,
    Sawtooth,
    Triangle,
}

impl Waveform {
    /// One period sampled at `phase` in [0, 1).
    fn sample(self, phase: f64) -> f64 {
        match self {
            Waveform::Sine => (2.0 * PI * phase).sin(),
            Waveform::Square => {
                if phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Waveform::Sawtooth => 2.0 * phase - 1.0,
            Waveform::Triangle => {
                if phase < 0.25 {
                    4.0 * phase
                } else if phase < 0.75 {
                    2.0 - 4.0 * phase
                } else {
                    4.0 * phase - 4.0
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RampShape {
    Hold,
    Linear,
    Exponential,
}

/// A parameter moving from `from` to `to` over `over` seconds, then
/// holding `to`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ramp {
    pub from: f64,
    pub to: f64,
    pub over: f64,
    pub shape: RampShape,
}

impl Ramp {
    pub fn constant(value: f64) -> Self {
        Self { from: value, to: value, over: 0.0, shape: RampShape::Hold }
    }

    pub fn linear(from: f64, to: f64, over: f64) -> Self {
        Self { from, to, over, shape: RampShape::Linear }
    }

    /// Both ends must be non-zero and share a sign.
    pub fn exponential(from: f64, to: f64, over: f64) -> Self {
        Self { from, to, over, shape: RampShape::Exponential }
    }

    pub fn value_at(&self, t: f64) -> f64 {
        if self.shape == RampShape::Hold || self.over <= 0.0 {
            return self.from;
        }
        if t >= self.over {
            return self.to;
        }
        let x = (t / self.over).max(0.0);
        match self.shape {
            RampShape::Linear => self.from + (self.to - self.from) * x,
            RampShape::Exponential => self.from * (self.to / self.from).powf(x),
            RampShape::Hold => self.from,
        }
    }
}

fn frames_for(duration: f64, sample_rate: u32) -> usize {
    (duration * sample_rate as f64).round().max(0.0) as usize
}

/// Render an oscillator with frequency and gain automation.
pub fn oscillator(
    waveform: Waveform,
    frequency: Ramp,
    gain: Ramp,
    duration: f64,
    sample_rate: u32,
) -> AudioBuffer {
    let frames = frames_for(duration, sample_rate);
    let sr = sample_rate as f64;
    let mut phase = 0.0f64;
    let mut out = Vec::with_capacity(frames);
    for i in 0..frames {
        let t = i as f64 / sr;
        out.push((waveform.sample(phase) * gain.value_at(t)) as f32);
        phase = (phase + frequency.value_at(t) / sr).fract();
    }
    AudioBuffer::mono(out, sample_rate)
}

/// Plain tone: fixed pitch, exponential decay from `volume` to 0.001.
pub fn tone(frequency: f64, waveform: Waveform, duration: f64, volume: f64, sample_rate: u32) -> AudioBuffer {
    oscillator(
        waveform,
        Ramp::constant(frequency),
        Ramp::exponential(volume.max(0.001), 0.001, duration),
        duration,
        sample_rate,
    )
}

/// RBJ low-pass biquad, direct form I.
struct LowPass {
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

impl LowPass {
    const Q: f64 = std::f64::consts::FRAC_1_SQRT_2;

    fn new() -> Self {
        Self { x1: 0.0, x2: 0.0, y1: 0.0, y2: 0.0 }
    }

    fn process(&mut self, x: f64, cutoff: f64, sample_rate: f64) -> f64 {
        let w0 = 2.0 * PI * (cutoff / sample_rate).min(0.49);
        let alpha = w0.sin() / (2.0 * Self::Q);
        let cos = w0.cos();
        let a0 = 1.0 + alpha;
        let b0 = (1.0 - cos) / 2.0 / a0;
        let b1 = (1.0 - cos) / a0;
        let b2 = b0;
        let a1 = -2.0 * cos / a0;
        let a2 = (1.0 - alpha) / a0;

        let y = b0 * x + b1 * self.x1 + b2 * self.x2 - a1 * self.y1 - a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

/// White noise through a sweeping low-pass filter.
pub fn filtered_noise<R: Rng + ?Sized>(
    rng: &mut R,
    cutoff: Ramp,
    gain: Ramp,
    duration: f64,
    sample_rate: u32,
) -> AudioBuffer {
    let frames = frames_for(duration, sample_rate);
    let sr = sample_rate as f64;
    let mut filter = LowPass::new();
    let mut out = Vec::with_capacity(frames);
    for i in 0..frames {
        let t = i as f64 / sr;
        let noise: f64 = rng.gen_range(-1.0..1.0);
        let y = filter.process(noise, cutoff.value_at(t), sr);
        out.push((y * gain.value_at(t)) as f32);
    }
    AudioBuffer::mono(out, sample_rate)
}

/// A piece of a composite effect, `offset` seconds after "now".
pub struct Voice {
    pub offset: f64,
    pub buffer: AudioBuffer,
}

pub fn click(sample_rate: u32) -> AudioBuffer {
    tone(800.0, Waveform::Sine, 0.1, 0.1, sample_rate)
}

pub fn pop(sample_rate: u32) -> AudioBuffer {
    oscillator(
        Waveform::Sine,
        Ramp::exponential(400.0, 1200.0, 0.15),
        Ramp::exponential(0.1, 0.001, 0.15),
        0.15,
        sample_rate,
    )
}

/// C5 E5 G5 C6, each a little later and the last one ringing longest.
pub fn success_chime(sample_rate: u32) -> Vec<Voice> {
    const NOTES: [(f64, f64, f64); 4] = [
        (523.25, 0.0, 0.3),
        (659.25, 0.1, 0.3),
        (783.99, 0.2, 0.4),
        (1046.50, 0.3, 0.8),
    ];
    NOTES
        .iter()
        .map(|&(freq, offset, duration)| Voice {
            offset,
            buffer: tone(freq, Waveform::Sine, duration, 0.1, sample_rate),
        })
        .collect()
}

pub fn failure(sample_rate: u32) -> AudioBuffer {
    oscillator(
        Waveform::Triangle,
        Ramp::linear(300.0, 200.0, 0.4),
        Ramp::linear(0.1, 0.0, 0.4),
        0.4,
        sample_rate,
    )
}

pub fn page_turn<R: Rng + ?Sized>(rng: &mut R, sample_rate: u32) -> AudioBuffer {
    filtered_noise(
        rng,
        Ramp::linear(200.0, 1000.0, 0.2),
        Ramp::exponential(0.05, 0.001, 0.3),
        0.5,
        sample_rate,
    )
}
