//! Cursor codecs and CRC frame helpers shared by every wire surface.
//!
//! All framed streams in the cluster (log records, peer RPCs, ingress,
//! egress, service control, snapshots) use the same record layout:
//! `len: u32 | crc: u32 | payload`, big-endian, crc32 over the payload.

use anyhow::ensure;

/// Bytes occupied by the `len | crc` frame header.
pub const FRAME_HEADER_LEN: usize = 8;

pub fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub fn put_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub fn put_i64(out: &mut Vec<u8>, value: i64) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub fn put_bool(out: &mut Vec<u8>, value: bool) {
    out.push(u8::from(value));
}

pub fn put_u8_tag(out: &mut Vec<u8>, tag: u8) {
    out.push(tag);
}

/// Length-prefixed byte slice (`u32` length).
pub fn put_bytes(out: &mut Vec<u8>, value: &[u8]) {
    put_u32(out, value.len() as u32);
    out.extend_from_slice(value);
}

pub fn put_str(out: &mut Vec<u8>, value: &str) {
    put_bytes(out, value.as_bytes());
}

pub fn read_u32_at(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    ensure!(*offset + 4 <= data.len(), "record short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

pub fn read_u64_at(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    ensure!(*offset + 8 <= data.len(), "record short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

pub fn read_i32_at(data: &[u8], offset: &mut usize) -> anyhow::Result<i32> {
    Ok(read_u32_at(data, offset)? as i32)
}

pub fn read_i64_at(data: &[u8], offset: &mut usize) -> anyhow::Result<i64> {
    Ok(read_u64_at(data, offset)? as i64)
}

pub fn read_u8_tag_at(data: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    ensure!(*offset + 1 <= data.len(), "record short tag");
    let tag = data[*offset];
    *offset += 1;
    Ok(tag)
}

pub fn read_bool_at(data: &[u8], offset: &mut usize) -> anyhow::Result<bool> {
    ensure!(*offset + 1 <= data.len(), "record short bool");
    let value = data[*offset] != 0;
    *offset += 1;
    Ok(value)
}

pub fn read_bytes_at(data: &[u8], offset: &mut usize) -> anyhow::Result<Vec<u8>> {
    let len = read_u32_at(data, offset)? as usize;
    ensure!(*offset + len <= data.len(), "record short bytes");
    let value = data[*offset..*offset + len].to_vec();
    *offset += len;
    Ok(value)
}

pub fn read_str_at(data: &[u8], offset: &mut usize) -> anyhow::Result<String> {
    let bytes = read_bytes_at(data, offset)?;
    String::from_utf8(bytes).map_err(|_| anyhow::anyhow!("record string not utf-8"))
}

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Append one framed record to `out` and return the framed length.
pub fn write_frame(out: &mut Vec<u8>, payload: &[u8]) -> usize {
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&checksum(payload).to_be_bytes());
    out.extend_from_slice(payload);
    FRAME_HEADER_LEN + payload.len()
}

/// Total framed length a payload would occupy.
pub fn framed_len(payload_len: usize) -> usize {
    FRAME_HEADER_LEN + payload_len
}

/// Parse the frame starting at `offset`, verifying the checksum.
///
/// Returns `Ok(None)` when the buffer holds no complete frame at `offset`.
pub fn read_frame(data: &[u8], offset: usize) -> anyhow::Result<Option<&[u8]>> {
    if offset + FRAME_HEADER_LEN > data.len() {
        return Ok(None);
    }
    let mut cursor = offset;
    let len = read_u32_at(data, &mut cursor)? as usize;
    let expected_crc = read_u32_at(data, &mut cursor)?;
    if cursor + len > data.len() {
        return Ok(None);
    }
    let payload = &data[cursor..cursor + len];
    ensure!(checksum(payload) == expected_crc, "frame checksum mismatch");
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let mut buf = Vec::new();
        let written = write_frame(&mut buf, b"hello");
        assert_eq!(written, FRAME_HEADER_LEN + 5);

        let payload = read_frame(&buf, 0).unwrap().unwrap();
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn partial_frame_is_not_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello");
        buf.truncate(buf.len() - 1);
        assert!(read_frame(&buf, 0).unwrap().is_none());
    }

    #[test]
    fn corrupt_frame_fails_checksum() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello");
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(read_frame(&buf, 0).is_err());
    }

    #[test]
    fn cursor_readers_reject_short_buffers() {
        let mut offset = 0;
        assert!(read_u64_at(&[0u8; 4], &mut offset).is_err());
        let mut offset = 0;
        assert!(read_bytes_at(&[0, 0, 0, 9, 1], &mut offset).is_err());
    }

    #[test]
    fn string_round_trip() {
        let mut out = Vec::new();
        put_str(&mut out, "mem://egress?endpoint=client-0");
        let mut offset = 0;
        let value = read_str_at(&out, &mut offset).unwrap();
        assert_eq!(value, "mem://egress?endpoint=client-0");
        assert_eq!(offset, out.len());
    }
}
