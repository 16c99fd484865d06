use std::sync::Arc;

use tokio::sync::mpsc;

use super::device::OutputDevice;
use super::play::AlsaSink;
use super::record::AlsaCapture;
use crate::config::DeviceConfig;
use crate::error::Result;

/// An open microphone.
pub trait CaptureStream: Send {
    /// Windows of mono f32 samples. Can be taken once.
    fn take_frames(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<f32>>>;

    /// Release the hardware. Safe to call repeatedly.
    fn stop(&mut self);

    fn is_open(&self) -> bool;
}

/// Factory for the hardware the core needs.
pub trait AudioHost: Send + Sync {
    fn open_output(&self, label: &str, sample_rate: u32) -> Result<Arc<OutputDevice>>;

    /// Fails with `AudioError::Permission` when access is denied.
    fn open_microphone(&self, sample_rate: u32, window: usize) -> Result<Box<dyn CaptureStream>>;
}

pub struct AlsaHost {
    config: DeviceConfig,
}

impl AlsaHost {
    pub fn new(config: DeviceConfig) -> Self {
        Self { config }
    }
}

impl AudioHost for AlsaHost {
    fn open_output(&self, label: &str, sample_rate: u32) -> Result<Arc<OutputDevice>> {
        let sink = AlsaSink::open(&self.config, sample_rate)?;
        Ok(OutputDevice::init(label, Box::new(sink)))
    }

    fn open_microphone(&self, sample_rate: u32, window: usize) -> Result<Box<dyn CaptureStream>> {
        let capture = AlsaCapture::open(&self.config.capture_device, sample_rate, window)?;
        Ok(Box::new(capture))
    }
}
