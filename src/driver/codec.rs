//! Byte layout of activity buffers
//!
//! A buffer is a sequence of frames. Each frame is a little-endian `u32`
//! payload length followed by the MessagePack encoding of one
//! [`ActivityRecord`]. A zero length terminates the buffer early.

use super::records::ActivityRecord;
use crate::error::{DriverError, DriverResult};

const HEADER_LEN: usize = 4;

/// Encode one record as a frame
pub fn encode_record(record: &ActivityRecord) -> DriverResult<Vec<u8>> {
    let payload =
        rmp_serde::to_vec(record).map_err(|e| DriverError::MalformedRecord(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| DriverError::MalformedRecord("record too large".to_string()))?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Encode records back to back into a single byte vector
pub fn encode_records<'a>(records: impl IntoIterator<Item = &'a ActivityRecord>) -> DriverResult<Vec<u8>> {
    let mut bytes = Vec::new();
    for record in records {
        bytes.extend_from_slice(&encode_record(record)?);
    }
    Ok(bytes)
}

/// Copy `frame` into `buffer` at `offset` if it fits; returns the new offset
pub fn write_frame(buffer: &mut [u8], offset: usize, frame: &[u8]) -> Option<usize> {
    let end = offset.checked_add(frame.len())?;
    buffer.get_mut(offset..end)?.copy_from_slice(frame);
    Some(end)
}

/// Decode the frame at `cursor` and advance past it.
///
/// Returns `Ok(None)` at the end of the buffer.
pub fn next_record(buffer: &[u8], cursor: &mut usize) -> DriverResult<Option<ActivityRecord>> {
    let rest = buffer.get(*cursor..).unwrap_or(&[]);
    if rest.is_empty() {
        return Ok(None);
    }
    let header: [u8; HEADER_LEN] = rest
        .get(..HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| DriverError::MalformedRecord("truncated frame header".to_string()))?;
    let len = u32::from_le_bytes(header) as usize;
    if len == 0 {
        *cursor = buffer.len();
        return Ok(None);
    }
    let payload = rest
        .get(HEADER_LEN..HEADER_LEN + len)
        .ok_or_else(|| DriverError::MalformedRecord(format!("frame of {len} bytes truncated")))?;
    let record = rmp_serde::from_slice(payload).map_err(|e| DriverError::MalformedRecord(e.to_string()))?;
    *cursor += HEADER_LEN + len;
    Ok(Some(record))
}
