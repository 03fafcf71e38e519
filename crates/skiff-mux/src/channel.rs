//! Per-channel protocol state.
//!
//! A [`Channel`] tracks everything the engine knows about one logical
//! channel: its lifecycle status, the two channel numbers, both flow-control
//! windows, and the fds its handler watches. It is deliberately decoupled
//! from I/O: methods here update state and return decisions (such as a
//! window-replenish delta) that the engine acts on.

use crate::constants::{DEFAULT_MAX_PACKET, DEFAULT_WINDOW, MAX_WATCH_FDS, WINDOW_REFILL_THRESHOLD};
use crate::error::MuxError;
use crate::poll_set::{Interest, PollSet};
use crate::session::SessionConfig;

/// Channel lifecycle.
///
/// ```text
/// Created ──register──► Requested ──CHANNEL_SUCCESS──► Open ──close──► Closed
///                           │
///                           └── CHANNEL_OPEN_FAILURE ──► Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Created,
    Requested,
    Open,
    Closed,
}

impl ChannelStatus {
    pub fn name(self) -> &'static str {
        match self {
            ChannelStatus::Created => "created",
            ChannelStatus::Requested => "requested",
            ChannelStatus::Open => "open",
            ChannelStatus::Closed => "closed",
        }
    }
}

/// Supported channel types with their type-specific configuration.
#[derive(Debug, Clone)]
pub enum ChannelKind {
    /// An interactive session: shell, command, or subsystem.
    Session(SessionConfig),
}

impl ChannelKind {
    /// The type name sent in CHANNEL_OPEN.
    pub fn name(&self) -> &'static str {
        match self {
            ChannelKind::Session(_) => "session",
        }
    }
}

pub struct Channel {
    status: ChannelStatus,
    local_num: u32,
    remote_num: Option<u32>,
    local_window: u32,
    local_max_packet: u32,
    remote_window: u32,
    remote_max_packet: u32,
    kind: ChannelKind,
    watches: PollSet,
    close_sent: bool,
    reached_open: bool,
    closed_notified: bool,
}

impl Channel {
    pub(crate) fn new(local_num: u32, kind: ChannelKind) -> Self {
        Self {
            status: ChannelStatus::Created,
            local_num,
            remote_num: None,
            local_window: DEFAULT_WINDOW,
            local_max_packet: DEFAULT_MAX_PACKET,
            remote_window: 0,
            remote_max_packet: 0,
            kind,
            watches: PollSet::with_capacity(MAX_WATCH_FDS),
            close_sent: false,
            reached_open: false,
            closed_notified: false,
        }
    }

    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    pub fn local_num(&self) -> u32 {
        self.local_num
    }

    pub fn remote_num(&self) -> Option<u32> {
        self.remote_num
    }

    pub fn local_window(&self) -> u32 {
        self.local_window
    }

    pub fn local_max_packet(&self) -> u32 {
        self.local_max_packet
    }

    pub fn remote_window(&self) -> u32 {
        self.remote_window
    }

    pub fn remote_max_packet(&self) -> u32 {
        self.remote_max_packet
    }

    pub fn kind(&self) -> &ChannelKind {
        &self.kind
    }

    pub(crate) fn watches(&self) -> &PollSet {
        &self.watches
    }

    // ------------------------------------------------------------------ //
    // Lifecycle transitions (engine-owned)
    // ------------------------------------------------------------------ //

    pub(crate) fn mark_requested(&mut self) {
        self.status = ChannelStatus::Requested;
    }

    /// Record the peer's half of the open exchange. The channel stays
    /// Requested until the startup request is confirmed.
    pub(crate) fn confirm_open(&mut self, remote_num: u32, window: u32, max_packet: u32) {
        self.remote_num = Some(remote_num);
        self.remote_window = window;
        self.remote_max_packet = max_packet;
    }

    pub(crate) fn mark_open(&mut self) {
        self.status = ChannelStatus::Open;
        self.reached_open = true;
    }

    /// Idempotent transition to Closed; the sweeper frees the channel.
    pub(crate) fn mark_closed(&mut self) {
        self.status = ChannelStatus::Closed;
    }

    pub(crate) fn close_sent(&self) -> bool {
        self.close_sent
    }

    pub(crate) fn set_close_sent(&mut self) {
        self.close_sent = true;
    }

    /// Whether the `closed` notification is due now. Fires at most once, and
    /// only for channels that actually reached Open.
    pub(crate) fn take_closed_notification(&mut self) -> bool {
        if self.status == ChannelStatus::Closed && self.reached_open && !self.closed_notified {
            self.closed_notified = true;
            return true;
        }
        false
    }

    // ------------------------------------------------------------------ //
    // Flow control
    // ------------------------------------------------------------------ //

    /// Account for `len` inbound payload bytes against the local window.
    ///
    /// A peer that sends more than the advertised window is misbehaving and
    /// the connection is torn down. Once the window falls to the refill
    /// threshold it is restored to the default and the delta to advertise in
    /// a WINDOW_ADJUST is returned.
    pub(crate) fn consume_local_window(&mut self, len: u32) -> Result<Option<u32>, MuxError> {
        if len > self.local_window {
            return Err(MuxError::WindowOverrun {
                chan: self.local_num,
                len,
                window: self.local_window,
            });
        }
        self.local_window -= len;
        if self.local_window <= WINDOW_REFILL_THRESHOLD {
            let delta = DEFAULT_WINDOW - self.local_window;
            self.local_window = DEFAULT_WINDOW;
            return Ok(Some(delta));
        }
        Ok(None)
    }

    /// Peer granted more send credit.
    pub(crate) fn add_remote_window(&mut self, delta: u32) {
        self.remote_window = self.remote_window.saturating_add(delta);
    }

    /// Largest payload we may send right now: bounded by the peer's window
    /// and its maximum packet size.
    pub(crate) fn send_budget(&self) -> usize {
        self.remote_window.min(self.remote_max_packet) as usize
    }

    pub(crate) fn debit_remote_window(&mut self, len: u32) {
        self.remote_window = self.remote_window.saturating_sub(len);
    }

    // ------------------------------------------------------------------ //
    // Watched fds
    // ------------------------------------------------------------------ //

    /// Merge interest flags for `fd` into the watch set (§ poll set merge
    /// semantics), then drop entries nothing watches anymore.
    pub(crate) fn watch_fd(
        &mut self,
        fd: std::os::fd::RawFd,
        enable: Interest,
        disable: Interest,
    ) -> Result<(), MuxError> {
        self.watches.update(fd, enable, disable)?;
        self.watches.sweep();
        Ok(())
    }
}
