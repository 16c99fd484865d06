//! Live conversation with the model: microphone up, spoken replies down.

pub mod link;
pub mod scheduler;
pub mod session;

pub use link::{LinkChannels, LinkCommand, LinkEvent, LiveConnector, WebSocketConnector};
pub use scheduler::{ReplyScheduler, ScheduledChunk};
pub use session::{LiveObserver, LiveSession, LogObserver, SessionState};
