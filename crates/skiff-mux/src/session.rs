//! The `session` channel type: configuration and startup request payloads.
//!
//! After the peer confirms a session channel, the engine issues the
//! type-specific follow-ups built here: an optional `pty-req`, then `shell`
//! or `exec` depending on whether a command is configured.

use serde::Deserialize;
use skiff_wire::{Buffer, WireError};

/// What to start on the remote side and what terminal to request.
///
/// Deserializable so hosts can load session settings from their own
/// configuration files.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Remote command to run; `None` starts the default shell.
    pub command: Option<String>,
    /// Request a pty before starting the shell or command.
    pub allocate_pty: bool,
    /// TERM environment value for the pty request.
    pub term: String,
    /// Terminal width in character cells.
    pub width: u32,
    /// Terminal height in character cells.
    pub height: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command: None,
            allocate_pty: true,
            term: "xterm".to_owned(),
            width: 80,
            height: 24,
        }
    }
}

/// `pty-req` payload: TERM, character geometry, zero pixel sizes, and an
/// empty encoded-modes string. No reply is requested.
pub(crate) fn encode_pty_req(
    buf: &mut Buffer,
    remote_num: u32,
    cfg: &SessionConfig,
) -> Result<(), WireError> {
    buf.write_u32(remote_num)?;
    buf.write_str("pty-req")?;
    buf.write_bool(false)?;
    buf.write_str(&cfg.term)?;
    buf.write_u32(cfg.width)?;
    buf.write_u32(cfg.height)?;
    buf.write_u32(0)?;
    buf.write_u32(0)?;
    buf.write_data(b"")
}

/// `exec` with the configured command, or `shell`. The peer must reply so
/// the engine can move the channel to Open.
pub(crate) fn encode_start(
    buf: &mut Buffer,
    remote_num: u32,
    cfg: &SessionConfig,
) -> Result<(), WireError> {
    buf.write_u32(remote_num)?;
    match &cfg.command {
        Some(command) => {
            buf.write_str("exec")?;
            buf.write_bool(true)?;
            buf.write_str(command)
        }
        None => {
            buf.write_str("shell")?;
            buf.write_bool(true)
        }
    }
}
