use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

use bilge_audio::audio::{AlsaHost, AudioHost};
use bilge_audio::config::{API_KEY_ENV, Config};
use bilge_audio::engine::AudioOutputEngine;
use bilge_audio::live::{LiveSession, LogObserver, WebSocketConnector};
use bilge_audio::speech_cache::SpeechCache;
use bilge_audio::tts_client::GeminiTts;

const HELP: &str = "commands: speak <text> | stop | mute | click | pop | success | failure | page | live on | live off | status | quit";

#[derive(Debug, PartialEq)]
enum Command {
    Speak(String),
    Stop,
    Mute,
    Click,
    Pop,
    Success,
    Failure,
    Page,
    LiveOn,
    LiveOff,
    Status,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let cmd = match (word, rest) {
            ("speak", text) if !text.is_empty() => Command::Speak(text.to_string()),
            ("stop", "") => Command::Stop,
            ("mute", "") => Command::Mute,
            ("click", "") => Command::Click,
            ("pop", "") => Command::Pop,
            ("success", "") => Command::Success,
            ("failure", "") => Command::Failure,
            ("page", "") => Command::Page,
            ("live", "on") => Command::LiveOn,
            ("live", "off") => Command::LiveOff,
            ("status", "") => Command::Status,
            ("quit", "") | ("exit", "") => Command::Quit,
            _ => return None,
        };
        Some(cmd)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Config::new().map_err(anyhow::Error::msg)?;
    if !config.has_api_key() {
        log::warn!("No API key configured; set {} or [network].api_key", API_KEY_ENV);
    }

    let host: Arc<dyn AudioHost> = Arc::new(AlsaHost::new(config.device.clone()));

    let device = host
        .open_output("narration", config.narration.sample_rate)
        .context("Failed to open narration output")?;
    let engine = Arc::new(AudioOutputEngine::new(device));
    if let Err(e) = engine.resume().await {
        log::warn!("Narration device not running yet: {}", e);
    }

    let synthesizer = Arc::new(GeminiTts::new(&config.narration, &config.api_key));
    let speech = SpeechCache::new(
        engine.clone(),
        synthesizer,
        config.narration.sample_rate,
        config.narration.channels,
    );
    speech.prefetch(&config.narration.prefetch);

    let connector = Arc::new(WebSocketConnector::new(
        config.live.ws_url.clone(),
        config.api_key.clone(),
        config.live.input_sample_rate,
    ));
    let live = Arc::new(LiveSession::new(
        config.live.clone(),
        host.clone(),
        connector,
        Arc::new(LogObserver),
    ));

    println!("Bilge audio started. {}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }

            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        log::error!("Failed to read stdin: {}", e);
                        break;
                    }
                };

                match Command::parse(&line) {
                    Some(Command::Quit) => break,
                    Some(cmd) => execute(cmd, &engine, &speech, &live),
                    None if line.trim().is_empty() => {}
                    None => println!("Unknown command. {}", HELP),
                }
            }
        }
    }

    live.disconnect().await;
    engine.device().dispose();
    log::info!("Bye");
    Ok(())
}

fn execute(cmd: Command, engine: &Arc<AudioOutputEngine>, speech: &SpeechCache, live: &Arc<LiveSession>) {
    match cmd {
        Command::Speak(text) => {
            // the handle is not needed; failures are logged by the cache
            drop(speech.speak(text));
        }
        Command::Stop => engine.stop_voice(),
        Command::Mute => {
            let muted = engine.toggle_mute();
            println!("muted: {}", muted);
        }
        Command::Click => engine.click(),
        Command::Pop => engine.pop(),
        Command::Success => engine.success(),
        Command::Failure => engine.failure(),
        Command::Page => engine.page_turn(),
        Command::LiveOn => {
            let live = live.clone();
            tokio::spawn(async move {
                if let Err(e) = live.connect().await {
                    log::error!("Live session failed: {}", e);
                }
            });
        }
        Command::LiveOff => {
            let live = live.clone();
            tokio::spawn(async move { live.disconnect().await });
        }
        Command::Status => {
            println!(
                "muted: {} | narrating: {} | cached phrases: {} | live: {:?} | live speaking: {}",
                engine.is_muted(),
                engine.current_voice().is_some(),
                speech.len(),
                live.state(),
                live.is_speaking(),
            );
        }
        Command::Quit => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_console_commands() {
        assert_eq!(Command::parse("speak  Merhaba dünya "), Some(Command::Speak("Merhaba dünya".into())));
        assert_eq!(Command::parse("live on"), Some(Command::LiveOn));
        assert_eq!(Command::parse(" live   off"), Some(Command::LiveOff));
        assert_eq!(Command::parse("page"), Some(Command::Page));
        assert_eq!(Command::parse("exit"), Some(Command::Quit));
    }

    #[test]
    fn rejects_malformed_commands() {
        assert_eq!(Command::parse("speak"), None);
        assert_eq!(Command::parse("live"), None);
        assert_eq!(Command::parse("stop now"), None);
        assert_eq!(Command::parse(""), None);
    }
}
