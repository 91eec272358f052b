//! idevkit WebDriverAgent client
//!
//! Drives the WebDriverAgent HTTP service running on an iOS device: session
//! lifecycle plus taps, screenshots, window geometry, foreground app and
//! hardware buttons.

pub mod blocking;
pub mod session;
pub mod types;

pub use blocking::BlockingSessionClient;
pub use session::SessionClient;
pub use types::{buttons, ActiveAppInfo, AgentStatus, SessionInfo, WindowSize};
