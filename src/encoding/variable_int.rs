//! Variable byte integers as used for the remaining length and v5 property values.

use crate::error::{MqttError, Result};
use bytes::{Buf, BufMut};
use std::fmt;

/// Maximum value that can be encoded as a variable byte integer (268,435,455)
pub const VARIABLE_INT_MAX: u32 = 268_435_455;

const MAX_ENCODED_BYTES: usize = 4;

/// Variable length integer as defined by MQTT specification
///
/// Encodes values using 1-4 bytes:
/// - 0-127: 1 byte
/// - 128-16,383: 2 bytes
/// - 16,384-2,097,151: 3 bytes
/// - 2,097,152-268,435,455: 4 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariableInt {
    value: u32,
}

impl VariableInt {
    /// Creates a new `VariableInt` from a u32 value
    ///
    /// # Errors
    ///
    /// Returns `MqttError::PacketTooLarge` if the value exceeds the maximum
    pub fn new(value: u32) -> Result<Self> {
        if value > VARIABLE_INT_MAX {
            return Err(MqttError::PacketTooLarge {
                size: value as usize,
                max: VARIABLE_INT_MAX as usize,
            });
        }
        Ok(Self { value })
    }

    #[must_use]
    pub fn value(&self) -> u32 {
        self.value
    }

    /// Returns the number of bytes needed to encode this value
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        match self.value {
            0..=127 => 1,
            128..=16_383 => 2,
            16_384..=2_097_151 => 3,
            _ => 4,
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        let mut val = self.value;
        loop {
            let mut byte = (val % 128) as u8;
            val /= 128;
            if val > 0 {
                byte |= crate::constants::masks::CONTINUATION_BIT;
            }
            buf.put_u8(byte);
            if val == 0 {
                break;
            }
        }
    }

    /// Decodes a variable integer from a buffer that must hold all of it
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` if the buffer runs out or more than 4 bytes are used
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let mut value = 0u32;
        let mut shift = 0u32;

        for _ in 0..MAX_ENCODED_BYTES {
            if !buf.has_remaining() {
                return Err(MqttError::MalformedPacket(
                    "Insufficient bytes for variable integer".to_string(),
                ));
            }
            let byte = buf.get_u8();
            value |= u32::from(byte & crate::constants::masks::VARIABLE_BYTE_VALUE) << shift;
            if byte & crate::constants::masks::CONTINUATION_BIT == 0 {
                return Ok(Self { value });
            }
            shift += 7;
        }

        Err(MqttError::MalformedPacket(
            "Variable integer exceeds 4 bytes".to_string(),
        ))
    }
}

impl fmt::Display for VariableInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl From<VariableInt> for u32 {
    fn from(v: VariableInt) -> Self {
        v.value
    }
}

impl TryFrom<usize> for VariableInt {
    type Error = MqttError;

    fn try_from(value: usize) -> Result<Self> {
        let narrowed = u32::try_from(value).map_err(|_| MqttError::PacketTooLarge {
            size: value,
            max: VARIABLE_INT_MAX as usize,
        })?;
        Self::new(narrowed)
    }
}

/// Encodes a u32 value as a variable byte integer
///
/// # Errors
///
/// Returns `MqttError::PacketTooLarge` if the value exceeds the maximum
pub fn encode_variable_int<B: BufMut>(buf: &mut B, value: u32) -> Result<()> {
    VariableInt::new(value)?.encode(buf);
    Ok(())
}

/// Decodes a variable byte integer from the buffer
///
/// # Errors
///
/// Returns an error if decoding fails
pub fn decode_variable_int<B: Buf>(buf: &mut B) -> Result<u32> {
    Ok(VariableInt::decode(buf)?.value())
}

/// Reads a variable byte integer from the front of a possibly partial stream
///
/// Returns `Ok(None)` while the continuation bits ask for bytes that have not
/// arrived yet, otherwise the value and the number of bytes it occupied.
///
/// # Errors
///
/// Returns `MalformedPacket` when a fifth byte would be needed
pub fn peek_variable_int(bytes: &[u8]) -> Result<Option<(u32, usize)>> {
    let mut value = 0u32;
    for (index, byte) in bytes.iter().take(MAX_ENCODED_BYTES).enumerate() {
        value |= u32::from(byte & crate::constants::masks::VARIABLE_BYTE_VALUE) << (7 * index);
        if byte & crate::constants::masks::CONTINUATION_BIT == 0 {
            return Ok(Some((value, index + 1)));
        }
    }
    if bytes.len() >= MAX_ENCODED_BYTES {
        return Err(MqttError::MalformedPacket(
            "Variable integer exceeds 4 bytes".to_string(),
        ));
    }
    Ok(None)
}

/// Calculates the number of bytes needed to encode a value
#[must_use]
pub fn variable_int_len(value: u32) -> usize {
    VariableInt {
        value: value.min(VARIABLE_INT_MAX),
    }
    .encoded_size()
}
