//! Engine tunables.
//!
//! The window and packet defaults match what mainstream SSH clients
//! advertise for interactive sessions; the RFC only requires consistency.

/// Flow-control window advertised to the peer for each new channel, in bytes.
pub const DEFAULT_WINDOW: u32 = 262_144;

/// Largest packet payload advertised to the peer.
pub const DEFAULT_MAX_PACKET: u32 = 65_536;

/// Once the local window falls to this level, a single WINDOW_ADJUST
/// restores it to [`DEFAULT_WINDOW`].
pub const WINDOW_REFILL_THRESHOLD: u32 = DEFAULT_WINDOW / 2;

/// Watched-fd capacity per channel.
pub const MAX_WATCH_FDS: usize = 8;
