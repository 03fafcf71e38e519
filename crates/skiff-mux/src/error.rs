//! Engine error types.
//!
//! Would-block is never an error at this layer: the transport reports it as
//! `Ok(None)` / pending output, and the poll wrapper retries `EINTR`
//! transparently. What remains is genuinely fatal to the connection
//! (misbehaving peer, dead transport) or confined to one call site
//! (`TooManyWatches`).

use skiff_wire::WireError;

use crate::poll_set::PollSetFull;

/// Failures of the transport beneath the engine.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Eof,

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the channel engine.
///
/// Parsing errors inside an inbound packet and protocol violations are fatal
/// to the connection; the peer is misbehaving.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("poll failed: {0}")]
    Poll(#[source] std::io::Error),

    #[error("peer addressed unknown channel {num}")]
    UnknownChannel { num: u32 },

    #[error("unexpected {msg} for channel {chan} in state {status}")]
    UnexpectedMessage {
        msg: &'static str,
        chan: u32,
        status: &'static str,
    },

    #[error("peer overran the local window on channel {chan}: {len} bytes with {window} available")]
    WindowOverrun { chan: u32, len: u32, window: u32 },

    #[error("too many watched fds: {0}")]
    TooManyWatches(#[from] PollSetFull),
}
