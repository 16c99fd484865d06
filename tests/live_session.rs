use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use bilge_audio::audio::codec::{encode_base64, encode_capture_frame, pcm16_to_bytes};
use bilge_audio::audio::{AudioBuffer, AudioHost, CaptureStream, DeviceState, OutputDevice};
use bilge_audio::config::LiveConfig;
use bilge_audio::live::{
    LinkChannels, LinkCommand, LinkEvent, LiveConnector, LiveObserver, LiveSession, SessionState,
};
use bilge_audio::protocol::Setup;
use bilge_audio::{AudioError, Result};

const SR: u32 = 1000;

// ---------- fake hardware ----------

#[derive(Default)]
struct FakeHost {
    deny_microphone: bool,
    mic_open: Arc<AtomicBool>,
    mic_feed: Mutex<Option<mpsc::UnboundedSender<Vec<f32>>>>,
    outputs: Mutex<Vec<Arc<OutputDevice>>>,
}

struct FakeMic {
    open: Arc<AtomicBool>,
    frames: Option<mpsc::UnboundedReceiver<Vec<f32>>>,
}

impl CaptureStream for FakeMic {
    fn take_frames(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<f32>>> {
        self.frames.take()
    }

    fn stop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl AudioHost for FakeHost {
    fn open_output(&self, label: &str, sample_rate: u32) -> Result<Arc<OutputDevice>> {
        let device = OutputDevice::detached(label, sample_rate);
        self.outputs.lock().unwrap().push(device.clone());
        Ok(device)
    }

    fn open_microphone(&self, _sample_rate: u32, _window: usize) -> Result<Box<dyn CaptureStream>> {
        if self.deny_microphone {
            return Err(AudioError::Permission("NotAllowedError".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.mic_feed.lock().unwrap() = Some(tx);
        self.mic_open.store(true, Ordering::SeqCst);
        Ok(Box::new(FakeMic {
            open: self.mic_open.clone(),
            frames: Some(rx),
        }))
    }
}

impl FakeHost {
    fn output(&self) -> Arc<OutputDevice> {
        self.outputs.lock().unwrap().last().cloned().expect("no output opened")
    }

    fn speak_into_mic(&self, window: Vec<f32>) {
        let feed = self.mic_feed.lock().unwrap();
        feed.as_ref().expect("mic not opened").send(window).unwrap();
    }
}

// ---------- fake remote ----------

/// The far side of one link, as seen by the test.
struct Remote {
    setup: Setup,
    events: mpsc::Sender<LinkEvent>,
    commands: mpsc::Receiver<LinkCommand>,
}

impl Remote {
    fn drain_commands(&mut self) -> Vec<LinkCommand> {
        let mut out = Vec::new();
        while let Ok(cmd) = self.commands.try_recv() {
            out.push(cmd);
        }
        out
    }
}

#[derive(Default)]
struct FakeConnector {
    refuse: bool,
    /// Sent before `open` returns; `Ready` acknowledges the setup.
    greeting: Vec<LinkEvent>,
    /// This many opens skip the greeting and never acknowledge.
    silent_opens: AtomicUsize,
    remote: Mutex<Option<Remote>>,
}

impl FakeConnector {
    fn acking() -> Self {
        Self {
            greeting: vec![LinkEvent::Ready],
            ..Default::default()
        }
    }

    fn remote(&self) -> Remote {
        self.remote.lock().unwrap().take().expect("link not opened")
    }

    fn opened(&self) -> bool {
        self.remote.lock().unwrap().is_some()
    }
}

#[async_trait]
impl LiveConnector for FakeConnector {
    async fn open(&self, setup: Setup) -> Result<LinkChannels> {
        if self.refuse {
            return Err(AudioError::Transport("connection refused".into()));
        }
        let (cmd_tx, cmd_rx) = mpsc::channel(100);
        let (event_tx, event_rx) = mpsc::channel(100);
        let silent = self
            .silent_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !silent {
            for event in &self.greeting {
                event_tx.send(event.clone()).await.unwrap();
            }
        }
        *self.remote.lock().unwrap() = Some(Remote {
            setup,
            events: event_tx,
            commands: cmd_rx,
        });
        Ok(LinkChannels {
            commands: cmd_tx,
            events: event_rx,
        })
    }
}

// ---------- observer ----------

#[derive(Default)]
struct Recorder {
    audio_frames: Mutex<Vec<usize>>,
    transcripts: Mutex<Vec<(String, bool)>>,
    closes: AtomicUsize,
}

impl LiveObserver for Recorder {
    fn on_audio_data(&self, buffer: &AudioBuffer) {
        self.audio_frames.lock().unwrap().push(buffer.frames());
    }

    fn on_transcription(&self, text: &str, is_user: bool) {
        self.transcripts.lock().unwrap().push((text.to_string(), is_user));
    }

    fn on_close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------- helpers ----------

fn live_config() -> LiveConfig {
    LiveConfig {
        ws_url: "wss://example.invalid/live".into(),
        model: "models/test-native-audio".into(),
        voice: "Aoede".into(),
        input_sample_rate: 16000,
        output_sample_rate: SR,
        capture_window: 4,
        system_instruction: "Kısa ve neşeli cümleler kur.".into(),
    }
}

struct Rig {
    host: Arc<FakeHost>,
    connector: Arc<FakeConnector>,
    observer: Arc<Recorder>,
    session: Arc<LiveSession>,
}

fn rig(host: FakeHost, connector: FakeConnector) -> Rig {
    let host = Arc::new(host);
    let connector = Arc::new(connector);
    let observer = Arc::new(Recorder::default());
    let session = Arc::new(LiveSession::new(
        live_config(),
        host.clone(),
        connector.clone(),
        observer.clone(),
    ));
    Rig {
        host,
        connector,
        observer,
        session,
    }
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// base64 PCM16 reply chunk of `frames` samples at half scale.
fn reply_chunk(frames: usize) -> LinkEvent {
    LinkEvent::Audio(encode_base64(&pcm16_to_bytes(&vec![16384; frames])))
}

// ---------- tests ----------

#[tokio::test]
async fn connect_opens_and_streams_the_microphone() {
    let rig = rig(FakeHost::default(), FakeConnector::acking());

    rig.session.connect().await.unwrap();
    assert_eq!(rig.session.state(), SessionState::Open);
    assert!(rig.host.mic_open.load(Ordering::SeqCst));
    assert_eq!(rig.host.output().state(), DeviceState::Running);

    let mut remote = rig.connector.remote();
    assert_eq!(remote.setup.model, "models/test-native-audio");
    assert!(remote.setup.input_audio_transcription.is_some());
    assert_eq!(
        remote.setup.system_instruction.as_ref().unwrap().parts[0].text.as_deref(),
        Some("Kısa ve neşeli cümleler kur.")
    );

    let first = vec![0.25, -0.5, 1.0, 0.0];
    let second = vec![0.1; 4];
    rig.host.speak_into_mic(first.clone());
    rig.host.speak_into_mic(second.clone());
    settle().await;

    assert_eq!(
        remote.drain_commands(),
        vec![
            LinkCommand::Audio(encode_capture_frame(&first)),
            LinkCommand::Audio(encode_capture_frame(&second)),
        ]
    );
}

#[tokio::test]
async fn connect_twice_is_rejected() {
    let rig = rig(FakeHost::default(), FakeConnector::acking());
    rig.session.connect().await.unwrap();
    assert!(matches!(rig.session.connect().await, Err(AudioError::AlreadyActive)));
    assert_eq!(rig.session.state(), SessionState::Open);
}

#[tokio::test]
async fn disconnect_is_safe_in_any_state_and_releases_everything() {
    let rig = rig(FakeHost::default(), FakeConnector::acking());

    // never connected
    rig.session.disconnect().await;
    assert_eq!(rig.session.state(), SessionState::Idle);
    assert_eq!(rig.observer.closes.load(Ordering::SeqCst), 0);

    rig.session.connect().await.unwrap();
    let mut remote = rig.connector.remote();

    rig.session.disconnect().await;
    rig.session.disconnect().await;
    settle().await;

    assert_eq!(rig.session.state(), SessionState::Idle);
    assert!(!rig.host.mic_open.load(Ordering::SeqCst));
    assert_eq!(rig.host.output().state(), DeviceState::Closed);
    assert_eq!(rig.observer.closes.load(Ordering::SeqCst), 1);
    assert!(remote.drain_commands().contains(&LinkCommand::Close));
}

#[tokio::test]
async fn a_new_session_can_follow_a_closed_one() {
    let rig = rig(FakeHost::default(), FakeConnector::acking());
    rig.session.connect().await.unwrap();
    rig.session.disconnect().await;
    rig.session.connect().await.unwrap();
    assert_eq!(rig.session.state(), SessionState::Open);
    assert_eq!(rig.host.outputs.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn denied_microphone_leaves_the_session_idle() {
    let host = FakeHost {
        deny_microphone: true,
        ..Default::default()
    };
    let rig = rig(host, FakeConnector::acking());

    let err = rig.session.connect().await.unwrap_err();
    assert!(matches!(err, AudioError::Permission(_)));
    assert_eq!(rig.session.state(), SessionState::Idle);
    assert!(rig.host.outputs.lock().unwrap().is_empty());
    assert!(!rig.connector.opened());
    assert_eq!(rig.observer.closes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn refused_link_releases_the_hardware() {
    let connector = FakeConnector {
        refuse: true,
        ..Default::default()
    };
    let rig = rig(FakeHost::default(), connector);

    let err = rig.session.connect().await.unwrap_err();
    assert!(matches!(err, AudioError::Transport(_)));
    assert_eq!(rig.session.state(), SessionState::Idle);
    assert!(!rig.host.mic_open.load(Ordering::SeqCst));
    assert_eq!(rig.host.output().state(), DeviceState::Closed);
}

#[tokio::test]
async fn link_closing_before_setup_completes_is_a_transport_error() {
    let connector = FakeConnector {
        greeting: vec![LinkEvent::Closed],
        ..Default::default()
    };
    let rig = rig(FakeHost::default(), connector);

    let err = rig.session.connect().await.unwrap_err();
    assert!(matches!(err, AudioError::Transport(_)));
    assert_eq!(rig.session.state(), SessionState::Idle);
    assert!(!rig.host.mic_open.load(Ordering::SeqCst));
    assert_eq!(rig.host.output().state(), DeviceState::Closed);
}

#[tokio::test]
async fn disconnect_while_connecting_cancels_the_attempt() {
    // no acknowledgement ever arrives
    let rig = rig(FakeHost::default(), FakeConnector::default());

    let session = rig.session.clone();
    let connecting = tokio::spawn(async move { session.connect().await });
    settle().await;
    assert_eq!(rig.session.state(), SessionState::Connecting);
    let mut remote = rig.connector.remote();

    rig.session.disconnect().await;
    // released by the time disconnect returns, before `connect` runs again
    assert_eq!(rig.session.state(), SessionState::Idle);
    assert!(!rig.host.mic_open.load(Ordering::SeqCst));
    assert_eq!(rig.host.output().state(), DeviceState::Closed);
    assert!(remote.drain_commands().contains(&LinkCommand::Close));

    let result = connecting.await.unwrap();
    assert!(matches!(result, Err(AudioError::Cancelled)));
    assert_eq!(rig.session.state(), SessionState::Idle);
    assert_eq!(rig.observer.closes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn connect_after_a_cancelled_attempt_is_not_disturbed_by_it() {
    let connector = FakeConnector::acking();
    connector.silent_opens.store(1, Ordering::SeqCst);
    let rig = rig(FakeHost::default(), connector);

    let session = rig.session.clone();
    let stale = tokio::spawn(async move { session.connect().await });
    settle().await;
    rig.session.disconnect().await;

    // a fresh attempt starts before the old future has even woken up
    rig.session.connect().await.unwrap();
    assert!(matches!(stale.await.unwrap(), Err(AudioError::Cancelled)));
    settle().await;

    assert_eq!(rig.session.state(), SessionState::Open);
    assert!(rig.host.mic_open.load(Ordering::SeqCst));
    assert_eq!(rig.host.output().state(), DeviceState::Running);
}

#[tokio::test(start_paused = true)]
async fn dropping_a_pending_connect_releases_everything() {
    let connector = FakeConnector::acking();
    connector.silent_opens.store(1, Ordering::SeqCst);
    let rig = rig(FakeHost::default(), connector);

    let attempt = tokio::time::timeout(Duration::from_millis(20), rig.session.connect()).await;
    assert!(attempt.is_err(), "the silent link should have timed out");

    assert_eq!(rig.session.state(), SessionState::Idle);
    assert!(!rig.host.mic_open.load(Ordering::SeqCst));
    assert_eq!(rig.host.output().state(), DeviceState::Closed);
    assert!(rig.connector.remote().drain_commands().contains(&LinkCommand::Close));

    // nothing is left behind to block the next attempt
    rig.session.disconnect().await;
    rig.session.connect().await.unwrap();
    assert_eq!(rig.session.state(), SessionState::Open);
    assert_eq!(rig.host.outputs.lock().unwrap().len(), 2);
    assert_eq!(rig.observer.closes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn remote_close_tears_down_once() {
    let rig = rig(FakeHost::default(), FakeConnector::acking());
    rig.session.connect().await.unwrap();
    let remote = rig.connector.remote();

    remote.events.send(LinkEvent::Closed).await.unwrap();
    settle().await;

    assert_eq!(rig.session.state(), SessionState::Idle);
    assert!(!rig.host.mic_open.load(Ordering::SeqCst));
    assert_eq!(rig.observer.closes.load(Ordering::SeqCst), 1);

    rig.session.disconnect().await;
    assert_eq!(rig.observer.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn link_error_closes_the_session() {
    let rig = rig(FakeHost::default(), FakeConnector::acking());
    rig.session.connect().await.unwrap();
    let remote = rig.connector.remote();

    remote.events.send(LinkEvent::Error("reset by peer".into())).await.unwrap();
    settle().await;

    assert_eq!(rig.session.state(), SessionState::Idle);
    assert_eq!(rig.observer.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reply_audio_plays_back_to_back() {
    let rig = rig(FakeHost::default(), FakeConnector::acking());
    rig.session.connect().await.unwrap();
    let remote = rig.connector.remote();

    for frames in [30, 50, 20] {
        remote.events.send(reply_chunk(frames)).await.unwrap();
    }
    settle().await;

    assert_eq!(*rig.observer.audio_frames.lock().unwrap(), vec![30, 50, 20]);
    assert!(rig.session.is_speaking());

    let device = rig.host.output();
    let mut out = vec![0.0f32; 120];
    device.render(&mut out);
    assert!(out[..100].iter().all(|&s| s == 0.5));
    assert!(out[100..].iter().all(|&s| s == 0.0));
    assert!(!rig.session.is_speaking());
}

#[tokio::test]
async fn malformed_reply_audio_is_skipped() {
    let rig = rig(FakeHost::default(), FakeConnector::acking());
    rig.session.connect().await.unwrap();
    let remote = rig.connector.remote();

    remote.events.send(LinkEvent::Audio("not base64!".into())).await.unwrap();
    remote.events.send(reply_chunk(10)).await.unwrap();
    settle().await;

    assert_eq!(*rig.observer.audio_frames.lock().unwrap(), vec![10]);
    assert_eq!(rig.session.state(), SessionState::Open);
}

#[tokio::test]
async fn transcripts_reach_the_observer() {
    let rig = rig(FakeHost::default(), FakeConnector::acking());
    rig.session.connect().await.unwrap();
    let remote = rig.connector.remote();

    remote
        .events
        .send(LinkEvent::Transcript { text: "bir masal anlat".into(), is_user: true })
        .await
        .unwrap();
    remote
        .events
        .send(LinkEvent::Transcript { text: "Tabii!".into(), is_user: false })
        .await
        .unwrap();
    settle().await;

    assert_eq!(
        *rig.observer.transcripts.lock().unwrap(),
        vec![("bir masal anlat".to_string(), true), ("Tabii!".to_string(), false)]
    );
}

#[tokio::test]
async fn interruption_stops_queued_reply_audio() {
    let rig = rig(FakeHost::default(), FakeConnector::acking());
    rig.session.connect().await.unwrap();
    let remote = rig.connector.remote();

    remote.events.send(reply_chunk(100)).await.unwrap();
    remote.events.send(reply_chunk(100)).await.unwrap();
    settle().await;
    assert!(rig.session.is_speaking());

    remote.events.send(LinkEvent::Interrupted).await.unwrap();
    settle().await;

    assert!(!rig.session.is_speaking());
    assert_eq!(rig.host.output().active_sources(), 0);
    assert_eq!(rig.session.state(), SessionState::Open);
}

#[tokio::test]
async fn disconnect_silences_reply_audio() {
    let rig = rig(FakeHost::default(), FakeConnector::acking());
    rig.session.connect().await.unwrap();
    let remote = rig.connector.remote();

    remote.events.send(reply_chunk(100)).await.unwrap();
    settle().await;
    let device = rig.host.output();
    assert_eq!(device.active_sources(), 1);

    rig.session.disconnect().await;
    assert_eq!(device.active_sources(), 0);
    assert!(!rig.session.is_speaking());
}
