//! Length-prefixed field helpers shared by the command and RPC encodings.
//!
//! All integers are little-endian. Strings are `len: u32` followed by UTF-8.

use bytes::{Buf, BufMut, BytesMut};

pub fn put_str(buf: &mut BytesMut, value: &str) {
    // Safe cast: every string we encode is bounded by `Limits` or
    // `MAX_FRAME_BYTES`, both far below u32::MAX.
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

/// Returns `None` if the buffer is short or the bytes are not UTF-8.
pub fn get_str(buf: &mut impl Buf) -> Option<String> {
    let len = usize::try_from(get_u32(buf)?).ok()?;
    if buf.remaining() < len {
        return None;
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).ok()
}

pub fn get_u8(buf: &mut impl Buf) -> Option<u8> {
    (buf.remaining() >= 1).then(|| buf.get_u8())
}

pub fn get_u32(buf: &mut impl Buf) -> Option<u32> {
    (buf.remaining() >= 4).then(|| buf.get_u32_le())
}

pub fn get_u64(buf: &mut impl Buf) -> Option<u64> {
    (buf.remaining() >= 8).then(|| buf.get_u64_le())
}

pub fn put_opt_str(buf: &mut BytesMut, value: Option<&str>) {
    match value {
        Some(value) => {
            buf.put_u8(1);
            put_str(buf, value);
        }
        None => buf.put_u8(0),
    }
}

/// Outer `None` means malformed, inner `None` an absent value.
pub fn get_opt_str(buf: &mut impl Buf) -> Option<Option<String>> {
    match get_u8(buf)? {
        0 => Some(None),
        1 => get_str(buf).map(Some),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_str_roundtrip_and_truncation() {
        let mut buf = BytesMut::new();
        put_str(&mut buf, "sessions");
        put_opt_str(&mut buf, None);
        put_opt_str(&mut buf, Some("k"));

        let mut bytes = buf.freeze();
        assert_eq!(get_str(&mut bytes).as_deref(), Some("sessions"));
        assert_eq!(get_opt_str(&mut bytes), Some(None));
        assert_eq!(get_opt_str(&mut bytes), Some(Some("k".to_string())));
        assert_eq!(get_u8(&mut bytes), None);

        let mut short = &[5u8, 0, 0, 0, b'a'][..];
        assert_eq!(get_str(&mut short), None);
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut buf = &[2u8, 0, 0, 0, 0xff, 0xfe][..];
        assert_eq!(get_str(&mut buf), None);
    }
}
