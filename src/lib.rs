pub mod audio;
pub mod codec;
pub mod config;
pub mod deck;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod tools;

pub use error::{Result, SessionError};
pub use session::{LiveSession, SessionState};
