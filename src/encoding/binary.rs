use crate::error::{MqttError, Result};
use bytes::{Buf, BufMut, Bytes};

/// Encodes binary data with a 2-byte length prefix
///
/// # Errors
///
/// Returns an error if the data length exceeds 65,535 bytes
pub fn encode_binary<B: BufMut>(buf: &mut B, data: &[u8]) -> Result<()> {
    let len = u16::try_from(data.len()).map_err(|_| {
        MqttError::MalformedPacket(format!(
            "Binary data length {} exceeds maximum 65535",
            data.len()
        ))
    })?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

/// Decodes binary data with a 2-byte length prefix
///
/// # Errors
///
/// Returns an error if there are insufficient bytes in the buffer
pub fn decode_binary<B: Buf>(buf: &mut B) -> Result<Bytes> {
    if buf.remaining() < 2 {
        return Err(MqttError::MalformedPacket(
            "Insufficient bytes for binary data length".to_string(),
        ));
    }

    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(MqttError::MalformedPacket(format!(
            "Insufficient bytes for binary data: expected {len}, got {}",
            buf.remaining()
        )));
    }

    Ok(buf.copy_to_bytes(len))
}

#[must_use]
pub fn binary_len(data: &[u8]) -> usize {
    2 + data.len()
}
