//! Channel multiplexing for the skiff SSH client.
//!
//! Given an established transport connection (already keyed and
//! authenticated), this crate multiplexes logical channels over it: a
//! single-threaded [`Engine`] polls the transport socket alongside every
//! channel's watched fds, drives each channel through its
//! open/request/data/close protocol, and delivers events to host-supplied
//! [`ChannelHandler`]s.
//!
//! The transport itself — key exchange, ciphers, packet encryption — lives
//! behind the [`Transport`] trait and is not part of this crate.

pub mod channel;
pub mod constants;
pub mod engine;
pub mod error;
pub mod handler;
pub mod msg;
pub mod poll_set;
pub mod session;
pub mod transport;

pub use channel::{Channel, ChannelKind, ChannelStatus};
pub use engine::{ChannelConfig, Engine};
pub use error::{MuxError, TransportError};
pub use handler::{ChannelControl, ChannelHandler, EventResult, OpenFailure};
pub use poll_set::{Interest, PollEntry, PollSet, PollSetFull};
pub use session::SessionConfig;
pub use transport::Transport;
