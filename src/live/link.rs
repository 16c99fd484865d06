use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::error::{AudioError, Result};
use crate::protocol::{ClientMessage, ServerMessage, Setup};

const CHANNEL_CAPACITY: usize = 100;

/// Outbound traffic for an open link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkCommand {
    /// base64 PCM16LE microphone window.
    Audio(String),
    /// Close the websocket. Repeats are ignored.
    Close,
}

/// What the remote side said, already unpacked from the wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Setup acknowledged; the session may start streaming.
    Ready,
    /// base64 PCM16LE reply audio.
    Audio(String),
    Transcript { text: String, is_user: bool },
    /// The model stopped its reply because the user spoke over it.
    Interrupted,
    Error(String),
    /// Terminal. Nothing follows.
    Closed,
}

pub struct LinkChannels {
    pub commands: mpsc::Sender<LinkCommand>,
    pub events: mpsc::Receiver<LinkEvent>,
}

/// Opens a bidirectional link to the conversational model.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    /// Connect and send `setup`. `LinkEvent::Ready` arrives once the remote
    /// side acknowledges it.
    async fn open(&self, setup: Setup) -> Result<LinkChannels>;
}

/// Unpack one server message into link events, in wire order.
pub fn translate(msg: ServerMessage) -> Vec<LinkEvent> {
    let mut events = Vec::new();
    if msg.setup_complete.is_some() {
        events.push(LinkEvent::Ready);
    }
    if let Some(content) = msg.server_content {
        if let Some(turn) = &content.model_turn {
            events.extend(turn.audio_payloads().map(|data| LinkEvent::Audio(data.to_string())));
        }
        if let Some(text) = content.input_transcription.and_then(|t| t.text) {
            events.push(LinkEvent::Transcript { text, is_user: true });
        }
        if let Some(text) = content.output_transcription.and_then(|t| t.text) {
            events.push(LinkEvent::Transcript { text, is_user: false });
        }
        if content.interrupted {
            events.push(LinkEvent::Interrupted);
        }
        if content.turn_complete {
            log::debug!("Model turn complete");
        }
    }
    if msg.go_away.is_some() {
        log::warn!("Server announced it is going away");
    }
    events
}

/// Gemini live API over tokio-tungstenite.
pub struct WebSocketConnector {
    ws_url: String,
    api_key: String,
    input_sample_rate: u32,
}

impl WebSocketConnector {
    pub fn new(ws_url: impl Into<String>, api_key: impl Into<String>, input_sample_rate: u32) -> Self {
        Self {
            ws_url: ws_url.into(),
            api_key: api_key.into(),
            input_sample_rate,
        }
    }

    fn endpoint(&self) -> Result<Url> {
        let mut url = Url::parse(&self.ws_url).map_err(|e| AudioError::Transport(e.to_string()))?;
        url.query_pairs_mut().append_pair("key", &self.api_key);
        Ok(url)
    }
}

#[async_trait]
impl LiveConnector for WebSocketConnector {
    async fn open(&self, setup: Setup) -> Result<LinkChannels> {
        if self.api_key.is_empty() {
            return Err(AudioError::Transport("no API key configured".into()));
        }
        let url = self.endpoint()?;

        log::info!("Connecting to {}...", self.ws_url);
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        log::info!("Connected!");

        let (mut write, read) = ws_stream.split();

        let setup_json = serde_json::to_string(&ClientMessage::Setup(setup))
            .map_err(|e| AudioError::Transport(e.to_string()))?;
        log::debug!("Sending setup: {}", setup_json);
        write.send(Message::Text(setup_json.into())).await?;

        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let link = LinkLoop {
            write,
            read,
            commands: cmd_rx,
            events: event_tx,
            input_sample_rate: self.input_sample_rate,
        };
        tokio::spawn(link.run());

        Ok(LinkChannels {
            commands: cmd_tx,
            events: event_rx,
        })
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct LinkLoop {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
    commands: mpsc::Receiver<LinkCommand>,
    events: mpsc::Sender<LinkEvent>,
    input_sample_rate: u32,
}

impl LinkLoop {
    async fn run(mut self) {
        if let Err(e) = self.pump().await {
            log::error!("Live link error: {}", e);
            let _ = self.events.send(LinkEvent::Error(e.to_string())).await;
        }
        // a second close after the peer's is harmless
        let _ = self.write.close().await;
        let _ = self.events.send(LinkEvent::Closed).await;
        log::info!("Live link closed");
    }

    /// Ok on a local or remote close, Err on transport failure.
    async fn pump(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                msg = self.read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if !self.forward(text.as_str()).await {
                                return Ok(());
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            // the live API sends JSON in binary frames too
                            match std::str::from_utf8(&data) {
                                Ok(text) => {
                                    if !self.forward(text).await {
                                        return Ok(());
                                    }
                                }
                                Err(_) => log::warn!("Dropping non-UTF-8 binary frame ({} bytes)", data.len()),
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            log::info!("Server closed connection: {:?}", frame);
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(()),
                    }
                }
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(LinkCommand::Audio(data)) => {
                            let msg = ClientMessage::audio_chunk(data, self.input_sample_rate);
                            let json = serde_json::to_string(&msg)
                                .map_err(|e| AudioError::Transport(e.to_string()))?;
                            self.write.send(Message::Text(json.into())).await?;
                        }
                        // every sender gone counts as a close
                        Some(LinkCommand::Close) | None => {
                            self.write.send(Message::Close(None)).await?;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// False once nobody listens for events any more.
    async fn forward(&self, text: &str) -> bool {
        let msg: ServerMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Unparseable server message: {}", e);
                return true;
            }
        };
        for event in translate(msg) {
            if self.events.send(event).await.is_err() {
                return false;
            }
        }
        true
    }
}
