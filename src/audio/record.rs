use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use alsa::pcm::PCM;
use tokio::sync::mpsc;

use super::alsa_device::{AlsaParams, PcmRequest};
use super::codec::{i16_to_float, resample_linear};
use super::host::CaptureStream;
use crate::error::{AudioError, Result};

/// Mono ALSA microphone delivering fixed-size f32 windows.
///
/// The PCM handle is opened on the caller's thread so a permission
/// failure surfaces from `open`; reading then happens on a dedicated OS
/// thread until `stop`.
pub struct AlsaCapture {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    frames: Option<mpsc::UnboundedReceiver<Vec<f32>>>,
}

impl AlsaCapture {
    pub fn open(device: &str, sample_rate: u32, window: usize) -> Result<Self> {
        let (pcm, params) = PcmRequest::microphone(device, sample_rate).open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let running = running.clone();
            thread::Builder::new()
                .name("audio-record".into())
                .spawn(move || {
                    if let Err(e) = record_thread(pcm, params, sample_rate, window, tx, &running) {
                        log::error!("Recording thread error: {}", e);
                    }
                })
                .map_err(|e| AudioError::Device(e.to_string()))?
        };

        Ok(Self {
            running,
            handle: Some(handle),
            frames: Some(rx),
        })
    }
}

impl CaptureStream for AlsaCapture {
    fn take_frames(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<f32>>> {
        self.frames.take()
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            join_off_runtime(h);
        }
    }

    fn is_open(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for AlsaCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The capture thread may sit in `readi` for up to a period. Inside a
/// tokio runtime the join moves to the blocking pool so async callers
/// never wait on it.
fn join_off_runtime(handle: JoinHandle<()>) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(move || {
                if handle.join().is_err() {
                    log::error!("Recording thread panicked");
                }
            });
        }
        Err(_) => {
            if handle.join().is_err() {
                log::error!("Recording thread panicked");
            }
        }
    }
}

/// Cuts hardware-rate samples into windows at the requested rate.
struct CaptureWindows {
    /// Hardware samples per window
    native: usize,
    /// Samples per delivered window
    window: usize,
    pending: Vec<f32>,
}

impl CaptureWindows {
    fn new(native_rate: u32, target_rate: u32, window: usize) -> Self {
        let window = window.max(1);
        let native = (window as f64 * native_rate as f64 / target_rate.max(1) as f64).round() as usize;
        Self {
            native: native.max(1),
            window,
            pending: Vec::with_capacity(window * 2),
        }
    }

    fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        while self.pending.len() >= self.native {
            let chunk: Vec<f32> = self.pending.drain(..self.native).collect();
            out.push(if self.native == self.window {
                chunk
            } else {
                resample_linear(&chunk, self.window)
            });
        }
        out
    }
}

fn record_thread(
    pcm: PCM,
    params: AlsaParams,
    target_rate: u32,
    window: usize,
    tx: mpsc::UnboundedSender<Vec<f32>>,
    running: &AtomicBool,
) -> anyhow::Result<()> {
    let period_size = params.period_size;
    let mut windows = CaptureWindows::new(params.sample_rate, target_rate, window);
    let mut read_buf = vec![0i16; period_size * params.channels as usize];

    let io = pcm.io_i16()?;

    log::info!(
        "Recording started: rate={} (delivered at {}), ch={}, period={}, window={}",
        params.sample_rate,
        target_rate,
        params.channels,
        period_size,
        windows.window,
    );

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                let samples = i16_to_float(&read_buf[..frames * params.channels as usize]);
                for frame in windows.push(&samples) {
                    if tx.send(frame).is_err() {
                        log::warn!("Capture receiver dropped, stopping recording");
                        return Ok(());
                    }
                }
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                if let Err(e2) = pcm.prepare() {
                    log::error!("Failed to recover PCM capture: {}", e2);
                    break;
                }
            }
        }
    }

    log::info!("Recording stopped");
    Ok(())
}
