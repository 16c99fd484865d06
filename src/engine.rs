//! Sound effects, mute and the narration voice slot on top of one
//! output device.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::audio::device::lock;
use crate::audio::mixer::EndedHook;
use crate::audio::synth::{self, Waveform};
use crate::audio::{AudioBuffer, OutputDevice, SourceId};
use crate::error::Result;

/// Time constant of the master-gain ramp applied on mute/unmute.
pub const MUTE_TIME_CONSTANT: f32 = 0.1;

/// The one narration source allowed to sound.
struct SlotEntry {
    seq: u64,
    source: SourceId,
    buffer: AudioBuffer,
}

pub struct AudioOutputEngine {
    device: Arc<OutputDevice>,
    muted: AtomicBool,
    slot: Arc<Mutex<Option<SlotEntry>>>,
    voice_seq: AtomicU64,
}

impl AudioOutputEngine {
    pub fn new(device: Arc<OutputDevice>) -> Self {
        Self {
            device,
            muted: AtomicBool::new(false),
            slot: Arc::new(Mutex::new(None)),
            voice_seq: AtomicU64::new(0),
        }
    }

    pub fn device(&self) -> &Arc<OutputDevice> {
        &self.device
    }

    /// Wait until the device is running. Audible output before this
    /// completes is not guaranteed.
    pub async fn resume(&self) -> Result<()> {
        self.device.resume().await
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Flip mute with a smoothed gain ramp. Returns the new muted flag.
    pub fn toggle_mute(&self) -> bool {
        let muted = !self.muted.fetch_xor(true, Ordering::SeqCst);
        let target = if muted { 0.0 } else { 1.0 };
        self.device.set_gain_target(target, MUTE_TIME_CONSTANT);
        log::info!("Mute {}", if muted { "on" } else { "off" });
        muted
    }

    // --- voice ---

    /// Stop whatever narration is playing, then start `buffer` now.
    pub fn play_voice(&self, buffer: AudioBuffer) {
        self.play_voice_if(buffer, || true);
    }

    /// Like `play_voice`, but only if `wanted` still holds once the slot
    /// is locked. Replacing the old voice, scheduling the new one and
    /// recording it happen under that one lock, so concurrent callers
    /// always leave exactly one voice behind. Returns whether `buffer`
    /// started.
    pub fn play_voice_if(&self, buffer: AudioBuffer, wanted: impl FnOnce() -> bool) -> bool {
        let (started, replaced) = {
            let mut current = lock(&self.slot);
            if !wanted() {
                return false;
            }
            let replaced = self.detach_voice(&mut current);

            let seq = self.voice_seq.fetch_add(1, Ordering::SeqCst) + 1;
            let slot = self.slot.clone();
            let on_ended = Box::new(move || {
                let mut current = lock(&slot);
                if current.as_ref().is_some_and(|e| e.seq == seq) {
                    *current = None;
                }
            });

            let now = self.device.current_time();
            let started = match self.device.schedule(buffer.clone(), now, 1.0, Some(on_ended)) {
                Some(source) => {
                    log::debug!("Voice #{} started ({:.2}s)", seq, buffer.duration());
                    *current = Some(SlotEntry { seq, source, buffer });
                    true
                }
                None => {
                    log::warn!("Voice dropped: output device '{}' is closed", self.device.label());
                    false
                }
            };
            (started, replaced)
        };
        // hooks take the slot lock themselves
        finish_interrupted(replaced);
        started
    }

    /// Stop the current narration, if any. No-op when nothing plays or
    /// the voice already finished on its own.
    pub fn stop_voice(&self) {
        let replaced = self.detach_voice(&mut lock(&self.slot));
        finish_interrupted(replaced);
    }

    /// Empty the slot and pull its source off the mixer. The hook comes
    /// back unrun; the source may already have ended on its own.
    fn detach_voice(&self, current: &mut Option<SlotEntry>) -> Option<(u64, EndedHook)> {
        let entry = current.take()?;
        self.device.take_source(entry.source).map(|hook| (entry.seq, hook))
    }

    /// Buffer in the voice slot, while it is sounding.
    pub fn current_voice(&self) -> Option<AudioBuffer> {
        lock(&self.slot).as_ref().map(|e| e.buffer.clone())
    }

    /// Number of narration buffers started so far.
    pub fn voice_starts(&self) -> u64 {
        self.voice_seq.load(Ordering::SeqCst)
    }

    // --- effects ---

    pub fn play_tone(&self, frequency: f64, waveform: Waveform, duration: f64, start_offset: f64, volume: f64) {
        let buffer = synth::tone(frequency, waveform, duration, volume, self.device.sample_rate());
        self.schedule_effect(buffer, start_offset);
    }

    fn schedule_effect(&self, buffer: AudioBuffer, start_offset: f64) {
        let at = self.device.current_time() + start_offset.max(0.0);
        if self.device.schedule(buffer, at, 1.0, None).is_none() {
            log::debug!("Effect dropped: device closed");
        }
    }

    pub fn click(&self) {
        self.schedule_effect(synth::click(self.device.sample_rate()), 0.0);
    }

    pub fn pop(&self) {
        self.schedule_effect(synth::pop(self.device.sample_rate()), 0.0);
    }

    pub fn success(&self) {
        for note in synth::success_chime(self.device.sample_rate()) {
            self.schedule_effect(note.buffer, note.offset);
        }
    }

    pub fn failure(&self) {
        self.schedule_effect(synth::failure(self.device.sample_rate()), 0.0);
    }

    pub fn page_turn(&self) {
        let buffer = synth::page_turn(&mut rand::thread_rng(), self.device.sample_rate());
        self.schedule_effect(buffer, 0.0);
    }
}

fn finish_interrupted(replaced: Option<(u64, EndedHook)>) {
    if let Some((seq, hook)) = replaced {
        hook();
        log::debug!("Voice #{} interrupted", seq);
    }
}
