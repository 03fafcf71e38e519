//! The contract the engine consumes from the transport layer.
//!
//! Key exchange, ciphers, and MACs live behind this trait; the engine only
//! ever sees decrypted packet payloads and a pollable socket. All methods
//! are nonblocking: `recv_packet` reports would-block as `Ok(None)`, and
//! `flush` keeps unsent bytes pending (`send_is_pending`) rather than
//! surfacing would-block as an error.

use std::os::fd::RawFd;

use skiff_wire::Buffer;

use crate::error::TransportError;

pub trait Transport {
    /// Begin a new outbound packet whose payload starts with `msg_type`.
    /// Returns the payload buffer to append fields to; the packet is not
    /// queued until [`send_packet`](Transport::send_packet).
    fn new_packet(&mut self, msg_type: u8) -> &mut Buffer;

    /// Finalize the packet begun by `new_packet`: pad, MAC, encrypt, and
    /// queue it for the wire.
    fn send_packet(&mut self) -> Result<(), TransportError>;

    /// Push queued bytes to the socket. A partial write is not an error;
    /// leftover bytes stay pending.
    fn flush(&mut self) -> Result<(), TransportError>;

    /// Whether queued output is waiting on the socket to become writable.
    fn send_is_pending(&self) -> bool;

    /// Receive one decrypted packet payload (starting with its message
    /// byte). `Ok(None)` means the socket would block.
    fn recv_packet(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    /// The underlying socket, for the engine's poll set.
    fn raw_fd(&self) -> RawFd;

    /// Switch the socket's blocking mode.
    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), TransportError>;
}
