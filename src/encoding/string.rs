use crate::constants::limits::MAX_STRING_LENGTH;
use crate::error::{MqttError, Result};
use bytes::{Buf, BufMut};

/// Encodes a UTF-8 string with a 2-byte length prefix
///
/// # Errors
///
/// Returns an error if the string contains U+0000 or is longer than 65,535 bytes
pub fn encode_string<B: BufMut>(buf: &mut B, string: &str) -> Result<()> {
    if string.contains('\0') {
        return Err(MqttError::MalformedPacket(
            "String contains null character".to_string(),
        ));
    }

    let bytes = string.as_bytes();
    let len = u16::try_from(bytes.len()).map_err(|_| {
        MqttError::MalformedPacket(format!(
            "String length {} exceeds maximum {MAX_STRING_LENGTH}",
            bytes.len()
        ))
    })?;
    buf.put_u16(len);
    buf.put_slice(bytes);
    Ok(())
}

/// Decodes a UTF-8 string with a 2-byte length prefix
///
/// # Errors
///
/// Returns `MalformedPacket` on truncation, invalid UTF-8 or an embedded U+0000
pub fn decode_string<B: Buf>(buf: &mut B) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(MqttError::MalformedPacket(
            "Insufficient bytes for string length".to_string(),
        ));
    }

    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(MqttError::MalformedPacket(format!(
            "Insufficient bytes for string data: expected {len}, got {}",
            buf.remaining()
        )));
    }

    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);

    let string = String::from_utf8(bytes)
        .map_err(|e| MqttError::MalformedPacket(format!("Invalid UTF-8: {e}")))?;
    if string.contains('\0') {
        return Err(MqttError::MalformedPacket(
            "String contains null character".to_string(),
        ));
    }
    Ok(string)
}

/// Decodes a v5 UTF-8 string pair (user property)
///
/// # Errors
///
/// Returns an error if either string fails to decode
pub fn decode_string_pair<B: Buf>(buf: &mut B) -> Result<(String, String)> {
    let key = decode_string(buf)?;
    let value = decode_string(buf)?;
    Ok((key, value))
}

/// Calculates the encoded length of a string (2 bytes for length + string bytes)
#[must_use]
pub fn string_len(string: &str) -> usize {
    2 + string.len()
}
