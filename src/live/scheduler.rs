use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::audio::device::lock;
use crate::audio::{AudioBuffer, OutputDevice, SourceId};

/// Where and for how long a reply chunk was placed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub source: SourceId,
    pub start: f64,
    pub duration: f64,
}

impl ScheduledChunk {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

#[derive(Default)]
struct Cursor {
    next_start_time: f64,
    next_seq: u64,
    sounding: HashMap<u64, SourceId>,
}

/// Gapless, additive playback of streamed reply audio.
///
/// Each chunk starts at `max(now, next_start_time)` and pushes the cursor
/// forward by its duration, so chunks play back to back in arrival order.
/// The cursor never moves backward.
pub struct ReplyScheduler {
    device: Arc<OutputDevice>,
    cursor: Arc<Mutex<Cursor>>,
}

impl ReplyScheduler {
    pub fn new(device: Arc<OutputDevice>) -> Self {
        Self {
            device,
            cursor: Arc::new(Mutex::new(Cursor::default())),
        }
    }

    pub fn schedule(&self, buffer: AudioBuffer) -> Option<ScheduledChunk> {
        let now = self.device.current_time();
        let duration = buffer.duration();

        let mut cursor = lock(&self.cursor);
        let start = cursor.next_start_time.max(now);
        let seq = cursor.next_seq;
        cursor.next_seq += 1;

        let shared = self.cursor.clone();
        let on_ended = Box::new(move || {
            lock(&shared).sounding.remove(&seq);
        });

        // the hook cannot run before the cursor lock is released
        let source = self.device.schedule(buffer, start, 1.0, Some(on_ended))?;
        cursor.next_start_time = start + duration;
        cursor.sounding.insert(seq, source);

        log::debug!("Reply chunk #{} at {:.3}s for {:.3}s", seq, start, duration);
        Some(ScheduledChunk { source, start, duration })
    }

    /// Stop every chunk that is sounding or still waiting to sound.
    pub fn stop_all(&self) {
        let sounding: Vec<SourceId> = lock(&self.cursor).sounding.drain().map(|(_, id)| id).collect();
        for id in sounding {
            self.device.stop(id);
        }
    }

    /// True while any scheduled chunk has not finished.
    pub fn is_speaking(&self) -> bool {
        !lock(&self.cursor).sounding.is_empty()
    }

    pub fn sounding(&self) -> usize {
        lock(&self.cursor).sounding.len()
    }

    pub fn next_start_time(&self) -> f64 {
        lock(&self.cursor).next_start_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 1000;

    fn chunk(frames: usize) -> AudioBuffer {
        AudioBuffer::mono(vec![0.5; frames], SR)
    }

    #[test]
    fn first_chunk_starts_now_and_later_ones_follow_back_to_back() {
        let device = OutputDevice::detached("live", SR);
        device.render(&mut vec![0.0; 250]);
        let scheduler = ReplyScheduler::new(device.clone());

        let durations = [100usize, 40, 300, 7];
        let chunks: Vec<ScheduledChunk> = durations
            .iter()
            .map(|&frames| scheduler.schedule(chunk(frames)).unwrap())
            .collect();

        assert_eq!(chunks[0].start, device.current_time());
        for k in 1..chunks.len() {
            assert_eq!(chunks[k].start, chunks[k - 1].end());
        }
        assert_eq!(scheduler.next_start_time(), chunks[3].end());
        assert!(scheduler.is_speaking());
    }

    #[test]
    fn scheduled_audio_has_no_gaps_or_overlaps() {
        let device = OutputDevice::detached("live", SR);
        let scheduler = ReplyScheduler::new(device.clone());
        for frames in [30, 20, 50] {
            scheduler.schedule(chunk(frames)).unwrap();
        }
        let mut out = vec![0.0f32; 120];
        device.render(&mut out);
        assert!(out[..100].iter().all(|&s| s == 0.5));
        assert!(out[100..].iter().all(|&s| s == 0.0));
        assert!(!scheduler.is_speaking());
    }

    #[test]
    fn a_late_chunk_starts_at_the_clock_not_in_the_past() {
        let device = OutputDevice::detached("live", SR);
        let scheduler = ReplyScheduler::new(device.clone());
        let first = scheduler.schedule(chunk(10)).unwrap();
        device.render(&mut vec![0.0; 500]);
        let second = scheduler.schedule(chunk(10)).unwrap();
        assert_eq!(first.start, 0.0);
        assert_eq!(second.start, 0.5);
        assert!(second.start > first.end());
    }

    #[test]
    fn stop_all_silences_pending_chunks_without_rewinding() {
        let device = OutputDevice::detached("live", SR);
        let scheduler = ReplyScheduler::new(device.clone());
        scheduler.schedule(chunk(100)).unwrap();
        scheduler.schedule(chunk(100)).unwrap();
        let cursor = scheduler.next_start_time();

        scheduler.stop_all();
        scheduler.stop_all();
        assert!(!scheduler.is_speaking());
        assert_eq!(device.active_sources(), 0);
        assert_eq!(scheduler.next_start_time(), cursor);

        let mut out = vec![1.0f32; 50];
        device.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn closed_device_schedules_nothing() {
        let device = OutputDevice::detached("live", SR);
        let scheduler = ReplyScheduler::new(device.clone());
        device.dispose();
        assert!(scheduler.schedule(chunk(10)).is_none());
        assert_eq!(scheduler.next_start_time(), 0.0);
    }
}
