//! Wire substrate error types.

/// Failures of the byte buffer and reader layer.
///
/// `ReadPastEnd` is the malformed-input error: a length field or a truncated
/// packet asked for more bytes than the backing store holds. The remaining
/// variants guard size arithmetic and buffer edits.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("size overflow: {base} + {add} wraps")]
    SizeOverflow { base: usize, add: usize },

    #[error("out of memory growing buffer to {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("string of {len} bytes exceeds the u32 wire limit")]
    StringTooLong { len: usize },

    #[error("read past end: need {need} bytes at position {pos}, length {len}")]
    ReadPastEnd { pos: usize, need: usize, len: usize },

    #[error("seek to invalid position {pos} (length {len})")]
    BadSeek { pos: usize, len: usize },

    #[error("remove of {len} bytes at offset {offset} outside buffer of {buf_len}")]
    BadRemove {
        offset: usize,
        len: usize,
        buf_len: usize,
    },
}
