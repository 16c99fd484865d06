//! Opening and negotiating ALSA PCM handles. Everything is interleaved
//! S16LE; the rate is fixed by the caller and the hardware may round it.

use alsa::pcm::{Access, Format, Frames, HwParams, PCM};
use alsa::{Direction, ValueOr};

use crate::error::{AudioError, Result};

const EPERM: i32 = 1;
const EACCES: i32 = 13;

/// What the hardware actually agreed to.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    pub sample_rate: u32,
    pub channels: u32,
    /// Frames per period
    pub period_size: usize,
}

#[derive(Debug, Clone, Copy)]
pub enum Stream {
    Microphone,
    Speaker,
}

impl Stream {
    fn direction(self) -> Direction {
        match self {
            Stream::Microphone => Direction::Capture,
            Stream::Speaker => Direction::Playback,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PcmRequest<'a> {
    pub device: &'a str,
    pub stream: Stream,
    pub sample_rate: u32,
    pub channels: u32,
    /// `None` leaves the period size to ALSA.
    pub period_size: Option<usize>,
}

impl<'a> PcmRequest<'a> {
    /// Mono microphone at `sample_rate`.
    pub fn microphone(device: &'a str, sample_rate: u32) -> Self {
        Self {
            device,
            stream: Stream::Microphone,
            sample_rate,
            channels: 1,
            period_size: None,
        }
    }

    /// Speaker output; a `period_size` of 0 means "ALSA decides".
    pub fn speaker(device: &'a str, sample_rate: u32, channels: u32, period_size: usize) -> Self {
        Self {
            device,
            stream: Stream::Speaker,
            sample_rate,
            channels,
            period_size: (period_size > 0).then_some(period_size),
        }
    }

    pub fn open(&self) -> Result<(PCM, AlsaParams)> {
        let pcm = PCM::new(self.device, self.stream.direction(), false).map_err(|e| self.open_error(e))?;
        self.configure(&pcm)?;
        let params = negotiated(&pcm)?;

        log::info!(
            "ALSA {:?} '{}' ready: {}Hz x{} ch, period {} frames",
            self.stream,
            self.device,
            params.sample_rate,
            params.channels,
            params.period_size,
        );
        if params.sample_rate != self.sample_rate {
            // playback clocks the mixer at this rate, capture resamples
            log::warn!(
                "ALSA {:?} '{}' runs at {}Hz instead of {}Hz",
                self.stream,
                self.device,
                params.sample_rate,
                self.sample_rate
            );
        }
        Ok((pcm, params))
    }

    fn configure(&self, pcm: &PCM) -> Result<()> {
        let hwp = HwParams::any(pcm).map_err(hw("HwParams::any"))?;
        hwp.set_access(Access::RWInterleaved).map_err(hw("set_access"))?;
        hwp.set_format(Format::S16LE).map_err(hw("set_format"))?;
        hwp.set_channels(self.channels).map_err(hw("set_channels"))?;
        hwp.set_rate_near(self.sample_rate, ValueOr::Nearest)
            .map_err(hw("set_rate_near"))?;
        if let Some(frames) = self.period_size {
            hwp.set_period_size_near(frames as Frames, ValueOr::Nearest)
                .map_err(hw("set_period_size_near"))?;
        }
        pcm.hw_params(&hwp).map_err(hw("hw_params"))
    }

    /// Denied access is a permission problem, anything else a device one.
    fn open_error(&self, e: alsa::Error) -> AudioError {
        let msg = format!("cannot open '{}' ({:?}): {}", self.device, self.stream, e);
        match e.errno() {
            EPERM | EACCES => AudioError::Permission(msg),
            _ => AudioError::Device(msg),
        }
    }
}

fn negotiated(pcm: &PCM) -> Result<AlsaParams> {
    let hwp = pcm.hw_params_current().map_err(hw("hw_params_current"))?;
    Ok(AlsaParams {
        sample_rate: hwp.get_rate().map_err(hw("get_rate"))?,
        channels: hwp.get_channels().map_err(hw("get_channels"))?,
        period_size: hwp.get_period_size().map_err(hw("get_period_size"))? as usize,
    })
}

fn hw(call: &'static str) -> impl Fn(alsa::Error) -> AudioError {
    move |e| AudioError::Device(format!("ALSA {} failed: {}", call, e))
}
