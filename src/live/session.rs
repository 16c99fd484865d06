//! Full-duplex voice conversation.
//!
//! ```text
//! Idle --connect--> Connecting --setupComplete--> Open
//!   ^                  |                            |
//!   |           failure/disconnect      disconnect/remote close/error
//!   |                  v                            v
//!   +---------------- Idle <-------------------- Closing
//! ```
//!
//! Every resource acquired while connecting is released on every exit
//! path, a dropped `connect` future included. Teardown is idempotent and
//! `on_close` fires once per opened link. Locks are taken state first,
//! then `active` or `attempt`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use super::link::{LinkChannels, LinkCommand, LinkEvent, LiveConnector};
use super::scheduler::ReplyScheduler;
use crate::audio::codec;
use crate::audio::device::lock;
use crate::audio::{AudioBuffer, AudioHost, CaptureStream, OutputDevice};
use crate::config::LiveConfig;
use crate::error::{AudioError, Result};
use crate::protocol::{AudioTranscriptionConfig, Content, GenerationConfig, Setup};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closing,
}

/// Receives what happens during a conversation. Callbacks run on the
/// session's receive task; keep them short.
pub trait LiveObserver: Send + Sync {
    fn on_audio_data(&self, _buffer: &AudioBuffer) {}

    fn on_transcription(&self, _text: &str, _is_user: bool) {}

    fn on_close(&self) {}
}

/// Observer that only logs.
pub struct LogObserver;

impl LiveObserver for LogObserver {
    fn on_transcription(&self, text: &str, is_user: bool) {
        log::info!("{}: {}", if is_user { "child" } else { "model" }, text);
    }

    fn on_close(&self) {
        log::info!("Live session closed");
    }
}

struct Active {
    microphone: Box<dyn CaptureStream>,
    playback: Arc<OutputDevice>,
    scheduler: Arc<ReplyScheduler>,
    commands: mpsc::Sender<LinkCommand>,
    capture_task: JoinHandle<()>,
    receive_task: Option<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<SessionState>,
    active: Mutex<Option<Active>>,
    attempt: Mutex<Option<Attempt>>,
    next_attempt: AtomicU64,
    abort: Notify,
    observer: Arc<dyn LiveObserver>,
}

impl Shared {
    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set_state(&self, next: SessionState) {
        let mut state = lock(&self.state);
        if *state != next {
            log::debug!("Live session {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    /// Release everything held by an open session. The caller that takes
    /// the resources does the work; everyone else returns at once.
    fn teardown(&self, abort_receiver: bool) {
        let active = {
            let mut state = lock(&self.state);
            let Some(active) = lock(&self.active).take() else {
                return;
            };
            *state = SessionState::Closing;
            active
        };

        let Active {
            mut microphone,
            playback,
            scheduler,
            commands,
            capture_task,
            receive_task,
        } = active;

        scheduler.stop_all();
        microphone.stop();
        capture_task.abort();
        if commands.try_send(LinkCommand::Close).is_err() {
            log::debug!("Close not queued, link sees the dropped sender instead");
        }
        drop(commands);
        if abort_receiver {
            if let Some(task) = receive_task {
                task.abort();
            }
        }
        playback.dispose();

        self.set_state(SessionState::Idle);
        log::info!("Live session torn down");
        self.observer.on_close();
    }
}

/// Resources acquired so far by an unfinished `connect`.
#[derive(Default)]
struct Pending {
    microphone: Option<Box<dyn CaptureStream>>,
    playback: Option<Arc<OutputDevice>>,
    commands: Option<mpsc::Sender<LinkCommand>>,
}

impl Pending {
    fn merge(&mut self, piece: Pending) {
        if piece.microphone.is_some() {
            self.microphone = piece.microphone;
        }
        if piece.playback.is_some() {
            self.playback = piece.playback;
        }
        if piece.commands.is_some() {
            self.commands = piece.commands;
        }
    }

    fn release(mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.try_send(LinkCommand::Close);
        }
        if let Some(playback) = self.playback.take() {
            playback.dispose();
        }
        if let Some(mut microphone) = self.microphone.take() {
            microphone.stop();
        }
    }
}

/// The one `connect` currently allowed to hold resources.
struct Attempt {
    id: u64,
    pending: Pending,
}

impl Shared {
    /// Hand a freshly acquired resource to attempt `id`. When the attempt
    /// was already released the resource is released here instead.
    fn stash(&self, id: u64, piece: Pending) -> Result<()> {
        let rejected = {
            let mut attempt = lock(&self.attempt);
            match attempt.as_mut() {
                Some(current) if current.id == id => {
                    current.pending.merge(piece);
                    None
                }
                _ => Some(piece),
            }
        };
        match rejected {
            None => Ok(()),
            Some(piece) => {
                piece.release();
                Err(AudioError::Cancelled)
            }
        }
    }

    /// Release an unfinished connect and go back to `Idle`. `Some(id)`
    /// only touches that attempt; `None` releases whichever is running.
    /// Returns false when there was nothing to release.
    fn release_attempt(&self, id: Option<u64>) -> bool {
        let pending = {
            let mut state = lock(&self.state);
            if *state != SessionState::Connecting {
                return false;
            }
            let mut attempt = lock(&self.attempt);
            if id.is_some_and(|id| attempt.as_ref().is_none_or(|a| a.id != id)) {
                return false;
            }
            *state = SessionState::Closing;
            attempt.take().map(|a| a.pending)
        };
        // wake the connect before anyone can start a new one
        self.abort.notify_waiters();
        if let Some(pending) = pending {
            pending.release();
        }
        self.set_state(SessionState::Idle);
        true
    }
}

/// Releases the attempt if the `connect` future ends anywhere short of
/// `Open`, including being dropped by a timeout.
struct AttemptGuard<'a> {
    shared: &'a Shared,
    id: u64,
    armed: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.shared.release_attempt(Some(self.id)) {
            log::info!("Live session connect abandoned, resources released");
        }
    }
}

pub struct LiveSession {
    config: LiveConfig,
    host: Arc<dyn AudioHost>,
    connector: Arc<dyn LiveConnector>,
    shared: Arc<Shared>,
}

impl LiveSession {
    pub fn new(
        config: LiveConfig,
        host: Arc<dyn AudioHost>,
        connector: Arc<dyn LiveConnector>,
        observer: Arc<dyn LiveObserver>,
    ) -> Self {
        Self {
            config,
            host,
            connector,
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::Idle),
                active: Mutex::new(None),
                attempt: Mutex::new(None),
                next_attempt: AtomicU64::new(0),
                abort: Notify::new(),
                observer,
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// True while reply audio is sounding or queued.
    pub fn is_speaking(&self) -> bool {
        lock(&self.shared.active)
            .as_ref()
            .is_some_and(|a| a.scheduler.is_speaking())
    }

    fn setup_message(&self) -> Setup {
        Setup {
            model: self.config.model.clone(),
            generation_config: GenerationConfig::audio(&self.config.voice),
            system_instruction: Some(Content::text(self.config.system_instruction.clone())),
            input_audio_transcription: Some(AudioTranscriptionConfig::default()),
            output_audio_transcription: Some(AudioTranscriptionConfig::default()),
        }
    }

    /// Open the microphone, the reply device and the link, then stream
    /// until `disconnect` or the remote side ends the conversation.
    ///
    /// Cancel-safe: dropping the future before it resolves releases
    /// whatever was acquired and leaves the session `Idle`.
    pub async fn connect(&self) -> Result<()> {
        let aborted = self.shared.abort.notified();
        tokio::pin!(aborted);
        aborted.as_mut().enable();

        let id = {
            let mut state = lock(&self.shared.state);
            if *state != SessionState::Idle {
                return Err(AudioError::AlreadyActive);
            }
            let id = self.shared.next_attempt.fetch_add(1, Ordering::SeqCst) + 1;
            *lock(&self.shared.attempt) = Some(Attempt {
                id,
                pending: Pending::default(),
            });
            *state = SessionState::Connecting;
            id
        };
        let mut guard = AttemptGuard {
            shared: &self.shared,
            id,
            armed: true,
        };
        log::info!("Live session connecting");

        let result = tokio::select! {
            biased;
            _ = &mut aborted => Err(AudioError::Cancelled),
            r = self.establish(id) => r,
        };
        let events = match result {
            Ok(events) => events,
            Err(e) => {
                log::warn!("Live session failed to connect: {}", e);
                return Err(e);
            }
        };

        // `disconnect` may have won the race after the acknowledgement
        let mut state = lock(&self.shared.state);
        let attempt = {
            let mut attempt = lock(&self.shared.attempt);
            let ours = *state == SessionState::Connecting && attempt.as_ref().is_some_and(|a| a.id == id);
            if ours { attempt.take() } else { None }
        };
        let Some(Attempt { pending, .. }) = attempt else {
            return Err(AudioError::Cancelled);
        };
        guard.armed = false;

        let (mut microphone, playback, commands) = match (pending.microphone, pending.playback, pending.commands) {
            (Some(microphone), Some(playback), Some(commands)) => (microphone, playback, commands),
            (microphone, playback, commands) => {
                *state = SessionState::Closing;
                drop(state);
                Pending { microphone, playback, commands }.release();
                self.shared.set_state(SessionState::Idle);
                return Err(AudioError::Device("connect finished without its resources".into()));
            }
        };

        let scheduler = Arc::new(ReplyScheduler::new(playback.clone()));
        let capture_task = match microphone.take_frames() {
            Some(mut frames) => {
                // audio captured while the link was still being set up is stale
                while frames.try_recv().is_ok() {}
                tokio::spawn(capture_loop(frames, commands.clone()))
            }
            None => tokio::spawn(async {}),
        };

        let receive_task = tokio::spawn(receive_loop(
            self.shared.clone(),
            events,
            scheduler.clone(),
            self.config.output_sample_rate,
        ));

        *lock(&self.shared.active) = Some(Active {
            microphone,
            playback,
            scheduler,
            commands,
            capture_task,
            receive_task: Some(receive_task),
        });
        *state = SessionState::Open;
        drop(state);

        log::info!("Live session open");
        Ok(())
    }

    async fn establish(&self, id: u64) -> Result<mpsc::Receiver<LinkEvent>> {
        let microphone = self
            .host
            .open_microphone(self.config.input_sample_rate, self.config.capture_window)?;
        self.shared.stash(id, Pending {
            microphone: Some(microphone),
            ..Pending::default()
        })?;

        let playback = self
            .host
            .open_output("live-playback", self.config.output_sample_rate)?;
        self.shared.stash(id, Pending {
            playback: Some(playback.clone()),
            ..Pending::default()
        })?;
        playback.resume().await?;

        let LinkChannels { commands, mut events } = self.connector.open(self.setup_message()).await?;
        self.shared.stash(id, Pending {
            commands: Some(commands),
            ..Pending::default()
        })?;

        loop {
            match events.recv().await {
                Some(LinkEvent::Ready) => return Ok(events),
                Some(LinkEvent::Error(e)) => return Err(AudioError::Transport(e)),
                Some(LinkEvent::Closed) | None => {
                    return Err(AudioError::Transport("link closed before setup completed".into()));
                }
                Some(other) => log::debug!("Ignoring {:?} before setup completed", other),
            }
        }
    }

    /// Stop everything and return to `Idle`. Safe in any state, any
    /// number of times. When a connect is still in progress its
    /// resources are released before this returns and that `connect`
    /// reports `Cancelled`.
    pub async fn disconnect(&self) {
        if self.shared.release_attempt(None) {
            log::info!("Live session connect cancelled");
            return;
        }
        self.shared.teardown(true);
    }
}

/// Microphone windows out to the link, in order.
async fn capture_loop(mut frames: mpsc::UnboundedReceiver<Vec<f32>>, commands: mpsc::Sender<LinkCommand>) {
    while let Some(window) = frames.recv().await {
        let data = codec::encode_capture_frame(&window);
        if commands.send(LinkCommand::Audio(data)).await.is_err() {
            break;
        }
    }
}

async fn receive_loop(
    shared: Arc<Shared>,
    mut events: mpsc::Receiver<LinkEvent>,
    scheduler: Arc<ReplyScheduler>,
    sample_rate: u32,
) {
    while let Some(event) = events.recv().await {
        if shared.state() != SessionState::Open {
            break;
        }
        match event {
            LinkEvent::Audio(data) => match codec::decode_transport_audio(&data, sample_rate, 1) {
                Ok(buffer) => {
                    scheduler.schedule(buffer.clone());
                    shared.observer.on_audio_data(&buffer);
                }
                Err(e) => log::warn!("Dropping reply chunk: {}", e),
            },
            LinkEvent::Transcript { text, is_user } => shared.observer.on_transcription(&text, is_user),
            LinkEvent::Interrupted => {
                log::debug!("Reply interrupted, {} chunk(s) stopped", scheduler.sounding());
                scheduler.stop_all();
            }
            LinkEvent::Ready => {}
            LinkEvent::Error(e) => {
                log::error!("Live link error: {}", e);
                break;
            }
            LinkEvent::Closed => {
                log::info!("Live link closed by remote");
                break;
            }
        }
    }
    shared.teardown(false);
}
