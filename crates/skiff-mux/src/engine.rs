//! The channel engine: registration, the poll loop, and inbound dispatch.
//!
//! One engine drives one connection, strictly single-threaded: every packet,
//! every poll wakeup, and every handler callback runs on the caller of
//! [`Engine::run`]. The loop owns the channel table; channels are swept (and
//! their pending CHANNEL_CLOSE emitted) between iterations, and the loop
//! returns once the table is empty.

use std::os::fd::RawFd;

use nix::poll::PollTimeout;
use skiff_wire::Reader;

use crate::channel::{Channel, ChannelKind, ChannelStatus};
use crate::constants::MAX_WATCH_FDS;
use crate::error::MuxError;
use crate::handler::{ChannelControl, ChannelHandler, OpenFailure};
use crate::msg;
use crate::poll_set::{Interest, PollEntry, PollSet};
use crate::session;
use crate::transport::Transport;

/// One channel to establish when the engine starts: its type (with the
/// type-specific configuration) and the host's event handler.
pub struct ChannelConfig {
    pub kind: ChannelKind,
    pub handler: Box<dyn ChannelHandler>,
}

struct ChannelSlot {
    chan: Channel,
    handler: Box<dyn ChannelHandler>,
}

/// The channel multiplexing engine for one SSH connection.
pub struct Engine<T: Transport> {
    transport: T,
    slots: Vec<ChannelSlot>,
}

/// Smallest non-negative integer not present in `used`.
fn smallest_free_num(mut used: Vec<u32>) -> u32 {
    used.sort_unstable();
    used.dedup();
    let mut candidate = 0u32;
    for num in used {
        if num == candidate {
            candidate += 1;
        } else if num > candidate {
            break;
        }
    }
    candidate
}

impl<T: Transport> Engine<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            slots: Vec::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Establish the configured channels and service them until every one
    /// has closed. Returns an error only for connection-fatal conditions:
    /// transport failure, malformed packets, or protocol violations.
    pub fn run(&mut self, configs: Vec<ChannelConfig>) -> Result<(), MuxError> {
        self.transport.set_nonblocking(true)?;
        for config in configs {
            self.register(config)?;
        }
        let result = self.event_loop();
        if result.is_err() {
            self.teardown();
        }
        result
    }

    /// Allocate a local number, send CHANNEL_OPEN, and add the channel to
    /// the table in Requested state.
    fn register(&mut self, config: ChannelConfig) -> Result<(), MuxError> {
        let used = self.slots.iter().map(|s| s.chan.local_num()).collect();
        let local_num = smallest_free_num(used);
        let mut chan = Channel::new(local_num, config.kind);

        let buf = self.transport.new_packet(msg::CHANNEL_OPEN);
        buf.write_str(chan.kind().name())?;
        buf.write_u32(local_num)?;
        buf.write_u32(chan.local_window())?;
        buf.write_u32(chan.local_max_packet())?;
        self.transport.send_packet()?;
        chan.mark_requested();

        tracing::debug!(
            chan = local_num,
            kind = chan.kind().name(),
            "channel open requested"
        );
        self.slots.push(ChannelSlot {
            chan,
            handler: config.handler,
        });
        Ok(())
    }

    // ------------------------------------------------------------------ //
    // Event loop
    // ------------------------------------------------------------------ //

    fn event_loop(&mut self) -> Result<(), MuxError> {
        loop {
            self.sweep_closed()?;
            if self.slots.is_empty() {
                tracing::debug!("all channels closed");
                return Ok(());
            }

            let mut poll_set = PollSet::with_capacity(1 + self.slots.len() * MAX_WATCH_FDS);
            let mut socket_interest = Interest::READ;
            if self.transport.send_is_pending() {
                socket_interest = socket_interest | Interest::WRITE;
            }
            poll_set.update(self.transport.raw_fd(), socket_interest, Interest::NONE)?;
            for slot in &self.slots {
                for entry in slot.chan.watches().entries() {
                    poll_set.update(entry.fd, entry.interest, Interest::NONE)?;
                }
            }

            tracing::trace!(fds = poll_set.len(), "polling");
            poll_set.poll(PollTimeout::NONE).map_err(MuxError::Poll)?;

            let entries: Vec<PollEntry> = poll_set.entries().to_vec();
            let socket = entries[0];
            if socket.readiness.intersects(Interest::READ | Interest::CLOSE) {
                self.process_inbound()?;
            }
            if socket.readiness.contains(Interest::WRITE) {
                self.transport.flush()?;
            }
            for entry in &entries[1..] {
                if !entry.readiness.is_empty() {
                    self.dispatch_fd_ready(entry.fd, entry.readiness);
                }
            }
        }
    }

    /// Remove Closed channels, firing their pending `closed` notification
    /// and emitting our CHANNEL_CLOSE where the peer has not seen one.
    fn sweep_closed(&mut self) -> Result<(), MuxError> {
        let mut idx = 0;
        while idx < self.slots.len() {
            if self.slots[idx].chan.status() != ChannelStatus::Closed {
                idx += 1;
                continue;
            }
            self.notify_closed(idx);
            let slot = self.slots.remove(idx);
            if !slot.chan.close_sent() {
                if let Some(remote_num) = slot.chan.remote_num() {
                    self.send_close(remote_num)?;
                }
            }
            tracing::debug!(chan = slot.chan.local_num(), "channel swept");
        }
        Ok(())
    }

    /// Invoke `on_closed` if it is due for this channel (at most once, only
    /// after the channel reached Open).
    fn notify_closed(&mut self, idx: usize) {
        let Engine { transport, slots } = self;
        let slot = &mut slots[idx];
        if slot.chan.take_closed_notification() {
            tracing::debug!(chan = slot.chan.local_num(), "channel closed");
            let mut ctl = ChannelControl::new(&mut slot.chan, transport);
            slot.handler.on_closed(&mut ctl);
        }
    }

    /// Fan readiness out to every non-Closed channel watching `fd`; at most
    /// one call per channel per loop iteration.
    fn dispatch_fd_ready(&mut self, fd: RawFd, readiness: Interest) {
        for idx in 0..self.slots.len() {
            {
                let chan = &self.slots[idx].chan;
                if chan.status() == ChannelStatus::Closed || !chan.watches().contains(fd) {
                    continue;
                }
            }
            let result = {
                let Engine { transport, slots } = self;
                let slot = &mut slots[idx];
                let mut ctl = ChannelControl::new(&mut slot.chan, transport);
                slot.handler.on_fd_ready(&mut ctl, fd, readiness)
            };
            if let Err(err) = result {
                tracing::warn!(
                    chan = self.slots[idx].chan.local_num(),
                    fd,
                    %err,
                    "fd handler failed; closing channel"
                );
                self.slots[idx].chan.mark_closed();
            }
            self.notify_closed(idx);
        }
    }

    /// Drain and tear down after a fatal error: every channel closes, the
    /// handlers hear about it, and pending CLOSEs go out best-effort.
    fn teardown(&mut self) {
        for idx in 0..self.slots.len() {
            self.slots[idx].chan.mark_closed();
            self.notify_closed(idx);
        }
        if self.sweep_closed().is_err() {
            tracing::debug!("transport unavailable during teardown");
        }
        let _ = self.transport.flush();
    }

    // ------------------------------------------------------------------ //
    // Inbound packets
    // ------------------------------------------------------------------ //

    /// Pull decrypted packets until the transport would block.
    fn process_inbound(&mut self) -> Result<(), MuxError> {
        loop {
            match self.transport.recv_packet()? {
                Some(payload) => self.dispatch_packet(&payload)?,
                None => return Ok(()),
            }
        }
    }

    fn dispatch_packet(&mut self, payload: &[u8]) -> Result<(), MuxError> {
        let mut r = Reader::new(payload);
        let msg_type = r.read_u8()?;
        match msg_type {
            msg::GLOBAL_REQUEST => {
                let name = r.read_string()?;
                let want_reply = r.read_bool()?;
                tracing::debug!(
                    request = %String::from_utf8_lossy(name),
                    want_reply,
                    "refusing global request"
                );
                // no global capabilities are advertised
                if want_reply {
                    self.transport.new_packet(msg::REQUEST_FAILURE);
                    self.transport.send_packet()?;
                }
            }
            msg::CHANNEL_OPEN => {
                // the client role never accepts server-initiated channels
                let kind = r.read_string()?;
                let sender = r.read_u32()?;
                let _window = r.read_u32()?;
                let _max_packet = r.read_u32()?;
                tracing::debug!(
                    kind = %String::from_utf8_lossy(kind),
                    sender,
                    "refusing peer channel open"
                );
                let buf = self.transport.new_packet(msg::CHANNEL_OPEN_FAILURE);
                buf.write_u32(sender)?;
                buf.write_u32(msg::OPEN_UNKNOWN_CHANNEL_TYPE)?;
                buf.write_str("server-initiated channels not supported")?;
                buf.write_str("")?;
                self.transport.send_packet()?;
            }
            msg::CHANNEL_OPEN_CONFIRMATION => {
                let num = r.read_u32()?;
                let remote_num = r.read_u32()?;
                let window = r.read_u32()?;
                let max_packet = r.read_u32()?;
                self.handle_open_confirmation(num, remote_num, window, max_packet)?;
            }
            msg::CHANNEL_OPEN_FAILURE => {
                let num = r.read_u32()?;
                let reason = r.read_u32()?;
                let description = r.read_string()?;
                let _language = r.read_string()?;
                self.handle_open_failure(num, reason, description)?;
            }
            msg::CHANNEL_SUCCESS => {
                let num = r.read_u32()?;
                self.handle_channel_success(num)?;
            }
            msg::CHANNEL_FAILURE => {
                let num = r.read_u32()?;
                self.handle_channel_failure(num)?;
            }
            msg::CHANNEL_WINDOW_ADJUST => {
                let num = r.read_u32()?;
                let delta = r.read_u32()?;
                let idx = self.index_of(num)?;
                self.slots[idx].chan.add_remote_window(delta);
                tracing::trace!(chan = num, delta, "window adjust");
            }
            msg::CHANNEL_DATA => {
                let num = r.read_u32()?;
                let data = r.read_string()?;
                self.handle_data(num, None, data)?;
            }
            msg::CHANNEL_EXTENDED_DATA => {
                let num = r.read_u32()?;
                let code = r.read_u32()?;
                let data = r.read_string()?;
                self.handle_data(num, Some(code), data)?;
            }
            msg::CHANNEL_EOF => {
                let num = r.read_u32()?;
                let idx = self.index_of(num)?;
                tracing::debug!(chan = num, "peer sent eof");
                self.slots[idx].chan.mark_closed();
                self.notify_closed(idx);
            }
            msg::CHANNEL_CLOSE => {
                let num = r.read_u32()?;
                let idx = self.index_of(num)?;
                let reply_to = {
                    let chan = &mut self.slots[idx].chan;
                    chan.mark_closed();
                    if chan.close_sent() {
                        None
                    } else {
                        chan.remote_num()
                    }
                };
                if let Some(remote_num) = reply_to {
                    self.send_close(remote_num)?;
                    self.slots[idx].chan.set_close_sent();
                }
                tracing::debug!(chan = num, "peer closed channel");
                self.notify_closed(idx);
            }
            msg::REQUEST_SUCCESS | msg::REQUEST_FAILURE => {
                tracing::debug!(msg = msg::msg_name(msg_type), "ignoring global reply");
            }
            other => {
                tracing::debug!(msg = other, name = msg::msg_name(other), "ignoring packet");
            }
        }
        Ok(())
    }

    fn handle_open_confirmation(
        &mut self,
        num: u32,
        remote_num: u32,
        window: u32,
        max_packet: u32,
    ) -> Result<(), MuxError> {
        let idx = self.index_of(num)?;
        {
            let chan = &mut self.slots[idx].chan;
            match chan.status() {
                ChannelStatus::Requested => {}
                ChannelStatus::Closed => return Ok(()),
                status => {
                    return Err(MuxError::UnexpectedMessage {
                        msg: msg::msg_name(msg::CHANNEL_OPEN_CONFIRMATION),
                        chan: num,
                        status: status.name(),
                    })
                }
            }
            chan.confirm_open(remote_num, window, max_packet);
        }
        tracing::debug!(
            chan = num,
            remote = remote_num,
            window,
            max_packet,
            "channel open confirmed"
        );

        // type-specific startup; the channel stays Requested until the
        // want-reply request below is answered
        match self.slots[idx].chan.kind().clone() {
            ChannelKind::Session(cfg) => {
                if cfg.allocate_pty {
                    let buf = self.transport.new_packet(msg::CHANNEL_REQUEST);
                    session::encode_pty_req(buf, remote_num, &cfg)?;
                    self.transport.send_packet()?;
                }
                let buf = self.transport.new_packet(msg::CHANNEL_REQUEST);
                session::encode_start(buf, remote_num, &cfg)?;
                self.transport.send_packet()?;
            }
        }
        Ok(())
    }

    fn handle_open_failure(
        &mut self,
        num: u32,
        reason: u32,
        description: &[u8],
    ) -> Result<(), MuxError> {
        let idx = self.index_of(num)?;
        if self.slots[idx].chan.status() == ChannelStatus::Closed {
            return Ok(());
        }
        let failure = OpenFailure {
            reason,
            description: String::from_utf8_lossy(description).into_owned(),
        };
        tracing::debug!(
            chan = num,
            reason,
            description = %failure.description,
            "channel open failed"
        );
        self.slots[idx].handler.on_open_failed(&failure);
        self.slots[idx].chan.mark_closed();
        Ok(())
    }

    fn handle_channel_success(&mut self, num: u32) -> Result<(), MuxError> {
        let idx = self.index_of(num)?;
        match self.slots[idx].chan.status() {
            ChannelStatus::Requested => {
                self.slots[idx].chan.mark_open();
                tracing::debug!(chan = num, "channel open");
                let result = {
                    let Engine { transport, slots } = self;
                    let slot = &mut slots[idx];
                    let mut ctl = ChannelControl::new(&mut slot.chan, transport);
                    slot.handler.on_open(&mut ctl)
                };
                if let Err(err) = result {
                    tracing::warn!(chan = num, %err, "open handler failed; closing channel");
                    self.slots[idx].chan.mark_closed();
                }
                self.notify_closed(idx);
            }
            // replies to requests issued after startup
            ChannelStatus::Open => {
                tracing::debug!(chan = num, "ignoring success for open channel");
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_channel_failure(&mut self, num: u32) -> Result<(), MuxError> {
        let idx = self.index_of(num)?;
        if self.slots[idx].chan.status() == ChannelStatus::Requested {
            // the shell/exec request was refused; the channel never opens
            let failure = OpenFailure {
                reason: 0,
                description: "channel request refused by peer".to_owned(),
            };
            tracing::debug!(chan = num, "startup request refused");
            self.slots[idx].handler.on_open_failed(&failure);
            self.slots[idx].chan.mark_closed();
        } else {
            tracing::debug!(chan = num, "ignoring channel failure");
        }
        Ok(())
    }

    fn handle_data(&mut self, num: u32, code: Option<u32>, data: &[u8]) -> Result<(), MuxError> {
        let idx = self.index_of(num)?;
        let (replenish, remote_num, deliver) = {
            let chan = &mut self.slots[idx].chan;
            if chan.status() == ChannelStatus::Closed {
                tracing::trace!(chan = num, "dropping data for closed channel");
                return Ok(());
            }
            let Some(remote_num) = chan.remote_num() else {
                // data on a channel the peer never confirmed
                return Err(MuxError::UnexpectedMessage {
                    msg: msg::msg_name(match code {
                        Some(_) => msg::CHANNEL_EXTENDED_DATA,
                        None => msg::CHANNEL_DATA,
                    }),
                    chan: num,
                    status: chan.status().name(),
                });
            };
            let replenish = chan.consume_local_window(data.len() as u32)?;
            (replenish, remote_num, chan.status() == ChannelStatus::Open)
        };

        if let Some(delta) = replenish {
            let buf = self.transport.new_packet(msg::CHANNEL_WINDOW_ADJUST);
            buf.write_u32(remote_num)?;
            buf.write_u32(delta)?;
            self.transport.send_packet()?;
            tracing::trace!(chan = num, delta, "replenished local window");
        }

        if deliver {
            let Engine { transport, slots } = self;
            let slot = &mut slots[idx];
            let mut ctl = ChannelControl::new(&mut slot.chan, transport);
            match code {
                Some(code) => slot.handler.on_ext_data(&mut ctl, code, data),
                None => slot.handler.on_data(&mut ctl, data),
            }
        } else {
            tracing::warn!(chan = num, len = data.len(), "dropping data for channel not yet open");
        }
        self.notify_closed(idx);
        Ok(())
    }

    fn send_close(&mut self, remote_num: u32) -> Result<(), MuxError> {
        let buf = self.transport.new_packet(msg::CHANNEL_CLOSE);
        buf.write_u32(remote_num)?;
        self.transport.send_packet()?;
        Ok(())
    }

    fn index_of(&self, num: u32) -> Result<usize, MuxError> {
        self.slots
            .iter()
            .position(|slot| slot.chan.local_num() == num)
            .ok_or(MuxError::UnknownChannel { num })
    }
}


#[cfg(test)]
mod proptests {
    use super::smallest_free_num;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn allocation_is_collision_free_and_minimal(used in proptest::collection::vec(0u32..64, 0..64)) {
            let num = smallest_free_num(used.clone());
            prop_assert!(!used.contains(&num));
            for candidate in 0..num {
                prop_assert!(used.contains(&candidate));
            }
        }
    }
}
