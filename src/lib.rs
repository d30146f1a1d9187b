//! Client-side glue for the AnyTalk speech-recognition daemon.
//!
//! Three pieces, composed bottom-up:
//!
//! - [`MessageChannel`]: one unix-socket connection at a time, a background
//!   receive loop framing newline-delimited JSON, typed sends.
//! - [`DaemonSupervisor`]: spawns the daemon with its credentials, probes
//!   liveness, terminates it gracefully (then forcefully).
//! - [`SessionController`]: the state machine mapping toggle-recording intent
//!   and daemon-pushed events onto one coherent state, delivering recognized
//!   text to exactly one focused [`Destination`].
//!
//! Hosts normally only touch [`SessionController::spawn`] and the returned
//! [`SessionHandle`].

mod channel;
mod config;
mod protocol;
mod session;
mod supervisor;

pub use channel::{socket_path, MessageChannel};
pub use config::ClientConfig;
pub use protocol::{ClientMsg, ConnectionState, DaemonMsg, RecordingMode};
pub use session::{Destination, SessionController, SessionHandle};
pub use supervisor::DaemonSupervisor;
