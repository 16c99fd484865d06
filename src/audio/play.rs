use alsa::pcm::PCM;
use anyhow::Result;

use super::alsa_device::{AlsaParams, PcmRequest};
use super::codec::float_to_i16;
use super::device::PcmSink;
use crate::config::DeviceConfig;

/// Recovery attempts per period before the remaining frames are dropped.
const MAX_RECOVERY_RETRIES: u32 = 3;

/// ALSA playback endpoint fed by an output device's render thread.
///
/// The mixer renders mono; each frame is duplicated across however many
/// channels the hardware negotiated.
pub struct AlsaSink {
    pcm: PCM,
    params: AlsaParams,
    interleaved: Vec<i16>,
}

impl AlsaSink {
    pub fn open(config: &DeviceConfig, sample_rate: u32) -> crate::error::Result<Self> {
        let request = PcmRequest::speaker(
            &config.playback_device,
            sample_rate,
            config.playback_channels,
            config.period_size,
        );
        let (pcm, params) = request.open()?;
        Ok(Self {
            pcm,
            params,
            interleaved: Vec::new(),
        })
    }
}

impl PcmSink for AlsaSink {
    fn sample_rate(&self) -> u32 {
        self.params.sample_rate
    }

    fn period_frames(&self) -> usize {
        self.params.period_size
    }

    fn write(&mut self, frames: &[f32]) -> Result<()> {
        let channels = self.params.channels as usize;
        let pcm16 = float_to_i16(frames);
        self.interleaved.clear();
        for s in pcm16 {
            for _ in 0..channels {
                self.interleaved.push(s);
            }
        }

        let io = self.pcm.io_i16()?;

        // Retry short writes and XRUNs without losing frames
        let total_frames = frames.len();
        let mut frames_written = 0;
        let mut retry_count = 0u32;

        while frames_written < total_frames {
            let offset = frames_written * channels;
            match io.writei(&self.interleaved[offset..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;

                    self.pcm.prepare()?;

                    // Hardware keeps falling behind: drop the rest of this period
                    if retry_count >= MAX_RECOVERY_RETRIES {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            total_frames - frames_written
                        );
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
