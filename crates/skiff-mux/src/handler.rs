//! Host-facing channel events and the per-callback channel handle.
//!
//! A [`ChannelHandler`] is the host's side of a channel: the engine calls
//! into it for every channel event, and the handler's own fields play the
//! role the opaque `user_data` pointer would in a C API. Every method has a
//! no-op default so hosts implement only the capabilities they need.
//!
//! Handlers run on the engine's single thread and must return promptly; the
//! [`ChannelControl`] they receive is valid only for the duration of the
//! call and exposes the full set of host operations: `watch_fd`, `close`,
//! `send`, and `send_ext`.

use std::os::fd::RawFd;

use crate::channel::{Channel, ChannelStatus};
use crate::error::MuxError;
use crate::msg;
use crate::poll_set::Interest;
use crate::transport::Transport;

/// Outcome of a fallible channel event. An `Err` is logged and closes the
/// channel it came from; it never touches other channels.
pub type EventResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Why the peer refused to open a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFailure {
    /// RFC 4254 §5.1 reason code (see [`crate::msg`]).
    pub reason: u32,
    /// The peer's description, lossily decoded.
    pub description: String,
}

pub trait ChannelHandler {
    /// The channel reached Open. An error closes it again.
    fn on_open(&mut self, chan: &mut ChannelControl<'_>) -> EventResult {
        let _ = chan;
        Ok(())
    }

    /// The peer refused the open request. Mutually exclusive with
    /// [`on_open`](ChannelHandler::on_open); the channel is closed.
    fn on_open_failed(&mut self, failure: &OpenFailure) {
        let _ = failure;
    }

    /// The channel closed (locally or by the peer). At most once per
    /// channel, and only after it reached Open.
    fn on_closed(&mut self, chan: &mut ChannelControl<'_>) {
        let _ = chan;
    }

    /// A watched fd reported readiness. An error closes the channel.
    fn on_fd_ready(&mut self, chan: &mut ChannelControl<'_>, fd: RawFd, readiness: Interest) -> EventResult {
        let _ = (chan, fd, readiness);
        Ok(())
    }

    /// Payload from the peer. The slice borrows the packet buffer; copy
    /// anything that must outlive the callback.
    fn on_data(&mut self, chan: &mut ChannelControl<'_>, data: &[u8]) {
        let _ = (chan, data);
    }

    /// Extended payload (e.g. stderr, code [`msg::EXTENDED_DATA_STDERR`]).
    fn on_ext_data(&mut self, chan: &mut ChannelControl<'_>, code: u32, data: &[u8]) {
        let _ = (chan, code, data);
    }
}

/// Engine-held borrow of one channel plus the transport, handed to handler
/// callbacks.
pub struct ChannelControl<'a> {
    chan: &'a mut Channel,
    transport: &'a mut (dyn Transport + 'a),
}

impl<'a> ChannelControl<'a> {
    pub(crate) fn new(chan: &'a mut Channel, transport: &'a mut (dyn Transport + 'a)) -> Self {
        Self { chan, transport }
    }

    /// The engine-assigned local channel number.
    pub fn num(&self) -> u32 {
        self.chan.local_num()
    }

    /// Merge interest flags for a host-owned fd into this channel's watch
    /// set. The engine polls it but never closes it.
    pub fn watch_fd(&mut self, fd: RawFd, enable: Interest, disable: Interest) -> Result<(), MuxError> {
        self.chan.watch_fd(fd, enable, disable)
    }

    /// Request closure. Idempotent; the engine sweeps the channel on the
    /// next loop iteration and suppresses further callbacks.
    pub fn close(&mut self) {
        self.chan.mark_closed();
    }

    /// Send payload on the channel, segmented to the peer's maximum packet
    /// size and bounded by its window. Returns the bytes accepted, which
    /// may be fewer than offered when the window is exhausted, and zero on
    /// a channel that is not Open.
    pub fn send(&mut self, data: &[u8]) -> Result<usize, MuxError> {
        self.send_inner(None, data)
    }

    /// Like [`send`](ChannelControl::send), with an extended-data type code.
    pub fn send_ext(&mut self, code: u32, data: &[u8]) -> Result<usize, MuxError> {
        self.send_inner(Some(code), data)
    }

    fn send_inner(&mut self, code: Option<u32>, data: &[u8]) -> Result<usize, MuxError> {
        if self.chan.status() != ChannelStatus::Open {
            return Ok(0);
        }
        let Some(remote_num) = self.chan.remote_num() else {
            return Ok(0);
        };

        let mut sent = 0;
        while sent < data.len() {
            let budget = self.chan.send_budget();
            if budget == 0 {
                tracing::trace!(
                    chan = self.chan.local_num(),
                    accepted = sent,
                    offered = data.len(),
                    "remote window exhausted"
                );
                break;
            }
            let chunk = budget.min(data.len() - sent);

            let buf = self.transport.new_packet(match code {
                Some(_) => msg::CHANNEL_EXTENDED_DATA,
                None => msg::CHANNEL_DATA,
            });
            buf.write_u32(remote_num)?;
            if let Some(code) = code {
                buf.write_u32(code)?;
            }
            buf.write_data(&data[sent..sent + chunk])?;
            self.transport.send_packet()?;

            self.chan.debit_remote_window(chunk as u32);
            sent += chunk;
        }
        Ok(sent)
    }
}
