use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    audio: Audio,
    narration: Narration,
    live: Live,
    network: Network,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Audio {
    playback_device: String,
    capture_device: String,
    playback_channels: u32,
    period_size: usize,
}

#[derive(Deserialize)]
struct Narration {
    endpoint: String,
    model: String,
    voice: String,
    sample_rate: u32,
    channels: u16,
    #[serde(default)]
    prefetch: Vec<String>,
}

#[derive(Deserialize)]
struct Live {
    ws_url: String,
    model: String,
    voice: String,
    input_sample_rate: u32,
    output_sample_rate: u32,
    capture_window: usize,
    system_instruction: String,
}

#[derive(Deserialize)]
struct Network {
    api_key: String,
}

/// rustc-env values are single-line; phrases are joined with this separator.
const PHRASE_SEPARATOR: char = '|';

fn single_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

// Read config.toml at build time and expose every value as an env var
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    for phrase in &config.narration.prefetch {
        if phrase.contains(PHRASE_SEPARATOR) {
            panic!("prefetch phrase must not contain '{}': {}", PHRASE_SEPARATOR, phrase);
        }
    }

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // ALSA devices
    println!("cargo:rustc-env=AUDIO_PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=AUDIO_CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=AUDIO_PLAYBACK_CHANNELS={}", config.audio.playback_channels);
    println!("cargo:rustc-env=AUDIO_PERIOD_SIZE={}", config.audio.period_size);

    // Narration (text-to-speech)
    println!("cargo:rustc-env=NARRATION_ENDPOINT={}", config.narration.endpoint);
    println!("cargo:rustc-env=NARRATION_MODEL={}", config.narration.model);
    println!("cargo:rustc-env=NARRATION_VOICE={}", config.narration.voice);
    println!("cargo:rustc-env=NARRATION_SAMPLE_RATE={}", config.narration.sample_rate);
    println!("cargo:rustc-env=NARRATION_CHANNELS={}", config.narration.channels);
    let phrases: Vec<String> = config.narration.prefetch.iter().map(|p| single_line(p)).collect();
    println!(
        "cargo:rustc-env=NARRATION_PREFETCH={}",
        phrases.join(&PHRASE_SEPARATOR.to_string())
    );

    // Live conversation
    println!("cargo:rustc-env=LIVE_WS_URL={}", config.live.ws_url);
    println!("cargo:rustc-env=LIVE_MODEL={}", config.live.model);
    println!("cargo:rustc-env=LIVE_VOICE={}", config.live.voice);
    println!("cargo:rustc-env=LIVE_INPUT_SAMPLE_RATE={}", config.live.input_sample_rate);
    println!("cargo:rustc-env=LIVE_OUTPUT_SAMPLE_RATE={}", config.live.output_sample_rate);
    println!("cargo:rustc-env=LIVE_CAPTURE_WINDOW={}", config.live.capture_window);
    println!(
        "cargo:rustc-env=LIVE_SYSTEM_INSTRUCTION={}",
        single_line(&config.live.system_instruction)
    );

    println!("cargo:rustc-env=API_KEY={}", config.network.api_key);
}
