//! audio - output devices, microphone capture, synthesis and codecs
//!
//! Uses ALSA for audio I/O. Each `OutputDevice` owns a software mixer
//! rendered on its own OS thread; capture runs on a separate thread and
//! hands fixed-size windows to async code over a channel.

mod alsa_device;
pub mod buffer;
pub mod codec;
pub mod device;
pub mod host;
pub mod mixer;
mod play;
mod record;
pub mod synth;

pub use buffer::AudioBuffer;
pub use device::{DeviceState, OutputDevice, PcmSink};
pub use host::{AlsaHost, AudioHost, CaptureStream};
pub use mixer::SourceId;
pub use synth::Waveform;
