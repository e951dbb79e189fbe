//! On-disk state record
//!
//! `[length: u64, native byte order][length payload bytes][NUL]`, always the
//! complete file contents starting at offset 0. The terminator is not counted
//! in `length`. Publishing overwrites the file in place without truncating it,
//! so bytes of an older, longer record may follow the terminator; the length
//! prefix is the only authority on where the payload ends.

use bytes::{BufMut, BytesMut};

/// Width of the length prefix
pub const LEN_FIELD_SIZE: usize = std::mem::size_of::<u64>();

/// Total number of bytes a record of `payload_len` occupies
pub fn encoded_len(payload_len: usize) -> usize {
    LEN_FIELD_SIZE + payload_len + 1
}

/// Serialize a payload into one contiguous record buffer
pub fn encode(payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(encoded_len(payload.len()));
    buf.put_slice(&(payload.len() as u64).to_ne_bytes());
    buf.put_slice(payload);
    buf.put_u8(0);
    buf
}

/// Result of interpreting the bytes read back from a state file
#[derive(Debug, PartialEq, Eq)]
pub enum RecordView<'a> {
    /// The declared payload and its terminator lie within the bytes read
    Complete(&'a [u8]),
    /// The declared length reaches past the bytes read: the file is being rewritten
    Incomplete { declared: u64 },
    /// Not even the length prefix could be read
    TooShort,
}

/// Interpret `data`, the bytes read from offset 0
pub fn decode(data: &[u8]) -> RecordView<'_> {
    let Some(prefix) = data.get(..LEN_FIELD_SIZE) else {
        return RecordView::TooShort;
    };
    let mut raw = [0u8; LEN_FIELD_SIZE];
    raw.copy_from_slice(prefix);
    let declared = u64::from_ne_bytes(raw);

    let available = (data.len() - LEN_FIELD_SIZE) as u64;
    if declared >= available {
        return RecordView::Incomplete { declared };
    }

    let end = LEN_FIELD_SIZE + declared as usize;
    RecordView::Complete(&data[LEN_FIELD_SIZE..end])
}
