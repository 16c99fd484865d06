//! Narration: text → decoded speech, fetched once and kept for the life
//! of the process.
//!
//! Only the newest `speak` may reach the speaker. Older requests keep
//! running and still fill the cache, but their token is no longer active
//! when they finish, so they never play.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio::task::JoinHandle;

use crate::audio::AudioBuffer;
use crate::audio::codec::decode_pcm16;
use crate::audio::device::lock;
use crate::engine::AudioOutputEngine;
use crate::error::{AudioError, Result};
use crate::tts_client::SpeechSynthesizer;

/// Issues request tokens. Issuing one retires every earlier token.
#[derive(Debug, Default)]
pub struct RequestGate {
    active: Arc<AtomicU64>,
}

/// Permission for one narration request to start playback.
#[derive(Debug, Clone)]
pub struct RequestToken {
    id: u64,
    active: Arc<AtomicU64>,
}

impl RequestGate {
    pub fn issue(&self) -> RequestToken {
        let id = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        RequestToken {
            id,
            active: self.active.clone(),
        }
    }

    pub fn active_id(&self) -> u64 {
        self.active.load(Ordering::SeqCst)
    }
}

impl RequestToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) == self.id
    }
}

type SharedFetch = Shared<BoxFuture<'static, Option<AudioBuffer>>>;

struct Inner {
    engine: Arc<AudioOutputEngine>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    sample_rate: u32,
    channels: u16,
    cache: Mutex<HashMap<String, AudioBuffer>>,
    in_flight: Mutex<HashMap<String, SharedFetch>>,
    gate: RequestGate,
    network_fetches: AtomicU64,
}

#[derive(Clone)]
pub struct SpeechCache {
    inner: Arc<Inner>,
}

impl SpeechCache {
    /// `sample_rate`/`channels` describe the PCM the synthesizer returns.
    pub fn new(
        engine: Arc<AudioOutputEngine>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        sample_rate: u32,
        channels: u16,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                synthesizer,
                sample_rate,
                channels,
                cache: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                gate: RequestGate::default(),
                network_fetches: AtomicU64::new(0),
            }),
        }
    }

    /// Narrate `text`, interrupting any earlier narration.
    ///
    /// A cached phrase starts playing before this returns and `None` comes
    /// back. Otherwise the fetch continues on the returned task; callers
    /// may drop the handle.
    pub fn speak(&self, text: impl Into<String>) -> Option<JoinHandle<()>> {
        let text = text.into();
        let inner = &self.inner;

        // issued before silencing, so an older fetch landing in between
        // already sees itself superseded
        let token = inner.gate.issue();
        inner.engine.stop_voice();

        if let Some(buffer) = self.cached(&text) {
            if inner.engine.play_voice_if(buffer, || token.is_active()) {
                log::debug!("Narration #{} served from cache", token.id());
            }
            return None;
        }

        let inner = inner.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = inner.engine.resume().await {
                log::warn!("Could not resume narration device: {}", e);
            }

            let Some(buffer) = inner.fetch(&text).await else {
                return;
            };

            if !inner.engine.play_voice_if(buffer, || token.is_active()) {
                log::debug!(
                    "Narration #{} superseded by #{}, cached only",
                    token.id(),
                    inner.gate.active_id()
                );
            }
        }))
    }

    /// Warm the cache without playing anything or touching the active
    /// request.
    pub fn prefetch<S: AsRef<str>>(&self, texts: &[S]) {
        for text in texts {
            let text = text.as_ref();
            if !self.is_cached(text) {
                // the fetch drives itself to completion
                drop(self.inner.fetch(text));
            }
        }
    }

    pub fn is_cached(&self, text: &str) -> bool {
        lock(&self.inner.cache).contains_key(text)
    }

    pub fn cached(&self, text: &str) -> Option<AudioBuffer> {
        lock(&self.inner.cache).get(text).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.cache).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Requests sent to the synthesizer so far.
    pub fn network_fetches(&self) -> u64 {
        self.inner.network_fetches.load(Ordering::SeqCst)
    }
}

impl Inner {
    /// Join the in-flight fetch for `text`, or start one. The fetch is
    /// spawned, so it completes and fills the cache even when nobody is
    /// left waiting for it.
    fn fetch(self: &Arc<Self>, text: &str) -> SharedFetch {
        let mut in_flight = lock(&self.in_flight);
        if let Some(pending) = in_flight.get(text) {
            return pending.clone();
        }
        // finished between the caller's cache check and now
        if let Some(buffer) = lock(&self.cache).get(text).cloned() {
            return futures_util::future::ready(Some(buffer)).boxed().shared();
        }

        let inner = self.clone();
        let key = text.to_string();
        let fut = async move {
            let buffer = match inner.fetch_and_decode(&key).await {
                Ok(buffer) => {
                    lock(&inner.cache).insert(key.clone(), buffer.clone());
                    Some(buffer)
                }
                Err(e) => {
                    log::warn!("TTS fetch failed for {:?}: {}", key, e);
                    None
                }
            };
            lock(&inner.in_flight).remove(&key);
            buffer
        }
        .boxed()
        .shared();

        in_flight.insert(text.to_string(), fut.clone());
        tokio::spawn(fut.clone());
        fut
    }

    async fn fetch_and_decode(&self, text: &str) -> Result<AudioBuffer> {
        self.network_fetches.fetch_add(1, Ordering::SeqCst);
        let bytes = self.synthesizer.synthesize(text).await?;
        if bytes.is_empty() {
            return Err(AudioError::Decode("No audio data returned".into()));
        }
        decode_pcm16(&bytes, self.sample_rate, self.channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_latest_token_is_active() {
        let gate = RequestGate::default();
        let first = gate.issue();
        assert!(first.is_active());
        let second = gate.issue();
        assert!(!first.is_active());
        assert!(second.is_active());
        assert!(second.id() > first.id());
        assert_eq!(gate.active_id(), second.id());
    }
}
