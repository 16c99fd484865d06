/// ALSA device selection shared by every output device and the microphone.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub playback_device: String,
    pub capture_device: String,
    /// Channel count requested from ALSA; the mixer itself is mono.
    pub playback_channels: u32,
    /// Desired ALSA period size in frames (0 = let ALSA decide)
    pub period_size: usize,
}

#[derive(Debug, Clone)]
pub struct NarrationConfig {
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    pub sample_rate: u32,
    pub channels: u16,
    /// Phrases warmed into the speech cache at start-up.
    pub prefetch: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub ws_url: String,
    pub model: String,
    pub voice: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    /// Microphone samples per realtime-input frame
    pub capture_window: usize,
    pub system_instruction: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub device: DeviceConfig,
    pub narration: NarrationConfig,
    pub live: LiveConfig,
    pub api_key: String,
}

/// Runtime override for the key baked in from config.toml.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

impl Config {
    /// Build the configuration from the env vars set by build.rs.
    /// Every value comes from config.toml at compile time.
    pub fn new() -> Result<Self, &'static str> {
        let api_key = std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .unwrap_or_else(|| env!("API_KEY").to_string());

        Ok(Self {
            device: DeviceConfig {
                playback_device: env!("AUDIO_PLAYBACK_DEVICE").to_string(),
                capture_device: env!("AUDIO_CAPTURE_DEVICE").to_string(),
                playback_channels: env!("AUDIO_PLAYBACK_CHANNELS").parse()
                    .map_err(|_| "Failed to parse AUDIO_PLAYBACK_CHANNELS")?,
                period_size: env!("AUDIO_PERIOD_SIZE").parse()
                    .map_err(|_| "Failed to parse AUDIO_PERIOD_SIZE")?,
            },
            narration: NarrationConfig {
                endpoint: env!("NARRATION_ENDPOINT").to_string(),
                model: env!("NARRATION_MODEL").to_string(),
                voice: env!("NARRATION_VOICE").to_string(),
                sample_rate: env!("NARRATION_SAMPLE_RATE").parse()
                    .map_err(|_| "Failed to parse NARRATION_SAMPLE_RATE")?,
                channels: env!("NARRATION_CHANNELS").parse()
                    .map_err(|_| "Failed to parse NARRATION_CHANNELS")?,
                prefetch: split_phrases(env!("NARRATION_PREFETCH")),
            },
            live: LiveConfig {
                ws_url: env!("LIVE_WS_URL").to_string(),
                model: env!("LIVE_MODEL").to_string(),
                voice: env!("LIVE_VOICE").to_string(),
                input_sample_rate: env!("LIVE_INPUT_SAMPLE_RATE").parse()
                    .map_err(|_| "Failed to parse LIVE_INPUT_SAMPLE_RATE")?,
                output_sample_rate: env!("LIVE_OUTPUT_SAMPLE_RATE").parse()
                    .map_err(|_| "Failed to parse LIVE_OUTPUT_SAMPLE_RATE")?,
                capture_window: env!("LIVE_CAPTURE_WINDOW").parse()
                    .map_err(|_| "Failed to parse LIVE_CAPTURE_WINDOW")?,
                system_instruction: env!("LIVE_SYSTEM_INSTRUCTION").to_string(),
            },
            api_key,
        })
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }
}

fn split_phrases(joined: &str) -> Vec<String> {
    joined
        .split('|')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phrases_are_split_and_trimmed() {
        let phrases = split_phrases("Merhaba | Hoş geldin!||");
        assert_eq!(phrases, vec!["Merhaba".to_string(), "Hoş geldin!".to_string()]);
    }

    #[test]
    fn baked_config_parses() {
        let config = Config::new().unwrap();
        assert_eq!(config.narration.sample_rate, 24000);
        assert_eq!(config.live.input_sample_rate, 16000);
        assert_eq!(config.live.output_sample_rate, 24000);
        assert!(!config.narration.prefetch.is_empty());
    }
}
