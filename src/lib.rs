pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod live;
pub mod protocol;
pub mod speech_cache;
pub mod tts_client;

pub use error::{AudioError, Result};
