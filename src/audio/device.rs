//! Output device: one mixer, one clock, one render thread.
//!
//! The device is an explicit context object. It starts `Suspended`; the
//! first `resume()` hands the PCM sink to a dedicated OS thread that
//! renders one period at a time and writes it out, so the clock advances
//! at hardware pace. Real-time I/O stays off the tokio runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use super::buffer::AudioBuffer;
use super::mixer::{EndedHook, Mixer, SourceId};
use crate::error::{AudioError, Result};

/// Where rendered mono frames go.
pub trait PcmSink: Send + 'static {
    /// Rate the hardware actually runs at; the device clock follows it.
    fn sample_rate(&self) -> u32;

    /// Frames rendered per write.
    fn period_frames(&self) -> usize;

    /// Write one period of mono f32 frames, blocking until accepted.
    fn write(&mut self, frames: &[f32]) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Suspended,
    Running,
    Closed,
}

pub struct OutputDevice {
    label: String,
    sample_rate: u32,
    mixer: Arc<Mutex<Mixer>>,
    state: Mutex<DeviceState>,
    running: Arc<AtomicBool>,
    sink: Mutex<Option<Box<dyn PcmSink>>>,
    render_handle: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl OutputDevice {
    /// Create a device that renders into `sink` once resumed.
    pub fn init(label: impl Into<String>, sink: Box<dyn PcmSink>) -> Arc<Self> {
        let sample_rate = sink.sample_rate();
        Self::build(label.into(), sample_rate, Some(sink))
    }

    /// A device with no hardware behind it. Its clock only moves when
    /// [`OutputDevice::render`] is called.
    pub fn detached(label: impl Into<String>, sample_rate: u32) -> Arc<Self> {
        Self::build(label.into(), sample_rate, None)
    }

    fn build(label: String, sample_rate: u32, sink: Option<Box<dyn PcmSink>>) -> Arc<Self> {
        log::info!("Output device '{}' created at {}Hz", label, sample_rate);
        Arc::new(Self {
            label,
            sample_rate,
            mixer: Arc::new(Mutex::new(Mixer::new(sample_rate))),
            state: Mutex::new(DeviceState::Suspended),
            running: Arc::new(AtomicBool::new(false)),
            sink: Mutex::new(sink),
            render_handle: Mutex::new(None),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn state(&self) -> DeviceState {
        *lock(&self.state)
    }

    /// Device clock in seconds. Read-only for callers.
    pub fn current_time(&self) -> f64 {
        lock(&self.mixer).current_time()
    }

    /// Bring a suspended device to `Running`. Idempotent.
    pub async fn resume(&self) -> Result<()> {
        let mut state = lock(&self.state);
        match *state {
            DeviceState::Running => return Ok(()),
            DeviceState::Closed => {
                return Err(AudioError::Device(format!("device '{}' is closed", self.label)));
            }
            DeviceState::Suspended => {}
        }

        if let Some(sink) = lock(&self.sink).take() {
            self.running.store(true, Ordering::SeqCst);
            let mixer = self.mixer.clone();
            let running = self.running.clone();
            let handle = thread::Builder::new()
                .name(format!("audio-out-{}", self.label))
                .spawn(move || render_thread(mixer, running, sink))
                .map_err(|e| AudioError::Device(e.to_string()))?;
            *lock(&self.render_handle) = Some(handle);
        }

        *state = DeviceState::Running;
        log::info!("Output device '{}' running", self.label);
        Ok(())
    }

    /// Schedule `buffer` at `start_time` on the device clock. Returns
    /// `None` once the device has been disposed.
    pub fn schedule(
        &self,
        buffer: AudioBuffer,
        start_time: f64,
        gain: f32,
        on_ended: Option<EndedHook>,
    ) -> Option<SourceId> {
        if self.state() == DeviceState::Closed {
            return None;
        }
        Some(lock(&self.mixer).schedule(buffer, start_time, gain, on_ended))
    }

    /// Remove a source without running its completion hook; the caller
    /// runs it, typically after dropping its own locks.
    pub fn take_source(&self, id: SourceId) -> Option<EndedHook> {
        lock(&self.mixer).stop(id)
    }

    /// Stop a source. Its completion hook runs before this returns.
    /// Returns false if the source had already finished.
    pub fn stop(&self, id: SourceId) -> bool {
        let hook = lock(&self.mixer).stop(id);
        match hook {
            Some(hook) => {
                hook();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, id: SourceId) -> bool {
        lock(&self.mixer).is_active(id)
    }

    pub fn active_sources(&self) -> usize {
        lock(&self.mixer).active_sources()
    }

    pub fn set_gain_target(&self, target: f32, time_constant: f32) {
        lock(&self.mixer).set_gain_target(target, time_constant);
    }

    pub fn gain(&self) -> f32 {
        lock(&self.mixer).gain()
    }

    pub fn gain_target(&self) -> f32 {
        lock(&self.mixer).gain_target()
    }

    /// Render frames by hand, advancing the clock. Meant for detached
    /// devices; a device with a live render thread should not be driven
    /// from outside.
    pub fn render(&self, out: &mut [f32]) {
        let hooks = lock(&self.mixer).render(out);
        hooks.into_iter().for_each(|h| h());
    }

    /// Stop the render thread and drop every source. Idempotent.
    pub fn dispose(&self) {
        {
            let mut state = lock(&self.state);
            if *state == DeviceState::Closed {
                return;
            }
            *state = DeviceState::Closed;
        }
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = lock(&self.render_handle).take() {
            let _ = h.join();
        }
        lock(&self.sink).take();

        let hooks = lock(&self.mixer).stop_all();
        hooks.into_iter().for_each(|h| h());
        log::info!("Output device '{}' closed", self.label);
    }
}

impl Drop for OutputDevice {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn render_thread(mixer: Arc<Mutex<Mixer>>, running: Arc<AtomicBool>, mut sink: Box<dyn PcmSink>) {
    let mut period = vec![0.0f32; sink.period_frames().max(1)];
    log::info!("Render thread started: period={}", period.len());

    while running.load(Ordering::Relaxed) {
        let hooks = lock(&mixer).render(&mut period);
        hooks.into_iter().for_each(|h| h());

        if let Err(e) = sink.write(&period) {
            log::error!("Output write failed, stopping render thread: {}", e);
            break;
        }
    }

    log::info!("Render thread stopped");
}
