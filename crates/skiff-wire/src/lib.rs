//! Packet-framed byte substrate for the skiff SSH client.
//!
//! This crate defines the growable [`Buffer`] used to build outgoing packets,
//! the borrowed [`Reader`] cursor used to parse incoming ones, and the
//! big-endian SSH codec primitives shared by both: `u32` integers, one-byte
//! booleans, and the length-prefixed "string" encoding (`u32 length || bytes`).
//!
//! Every read is bounds-checked and every size computation is
//! overflow-checked; parsing untrusted wire data can fail, but never panic.

pub mod buffer;
pub mod error;
pub mod reader;

pub use buffer::{Buffer, GROW_QUANTUM};
pub use error::WireError;
pub use reader::Reader;
