//! Device side of the bridge: the KC868 relay controller's TCP text protocol
//! and the connection manager that speaks it.

pub mod client;
pub mod codec;
pub mod reconnect;

pub use client::{RelayClient, SessionState};
pub use codec::{Command, Frame, FrameError, Report};
