//! Bit-oriented read/write buffers backing every wire message
//!
//! Bits are packed least-significant first within each byte. Writers grow on
//! demand up to a hard byte capacity; crossing it is reported as
//! [`ProtocolError::Overflow`] and leaves already written bits untouched.

use crate::game::physics::Vec2;

use super::protocol::ProtocolError;

/// Growable bit writer with a hard capacity
#[derive(Debug, Clone)]
pub struct BitStream {
    buf: Vec<u8>,
    bit_index: usize,
    capacity: usize,
}

impl BitStream {
    /// Create a stream pre-sized to `initial` bytes that may grow to `capacity` bytes
    pub fn with_capacity(initial: usize, capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(initial.min(capacity)),
            bit_index: 0,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn bit_index(&self) -> usize {
        self.bit_index
    }

    /// Bytes touched so far, including a trailing partial byte
    pub fn byte_len(&self) -> usize {
        self.bit_index.div_ceil(8)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.byte_len()]
    }

    pub fn is_empty(&self) -> bool {
        self.bit_index == 0
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.bit_index = 0;
    }

    /// Drop everything written after `bit_index`
    pub fn truncate_bits(&mut self, bit_index: usize) {
        if bit_index >= self.bit_index {
            return;
        }
        self.bit_index = bit_index;
        self.buf.truncate(self.byte_len());
        let rem = bit_index % 8;
        if rem != 0 {
            if let Some(last) = self.buf.last_mut() {
                *last &= (1u8 << rem) - 1;
            }
        }
    }

    fn reserve_bits(&mut self, bits: usize) -> Result<(), ProtocolError> {
        let needed = (self.bit_index + bits).div_ceil(8);
        if needed > self.capacity {
            return Err(ProtocolError::Overflow {
                capacity: self.capacity,
            });
        }
        if needed > self.buf.len() {
            self.buf.resize(needed, 0);
        }
        Ok(())
    }

    pub fn write_bits(&mut self, value: u32, bits: u32) -> Result<(), ProtocolError> {
        debug_assert!(bits <= 32);
        self.reserve_bits(bits as usize)?;
        for i in 0..bits {
            if (value >> i) & 1 == 1 {
                let idx = self.bit_index;
                self.buf[idx >> 3] |= 1 << (idx & 7);
            }
            self.bit_index += 1;
        }
        Ok(())
    }

    pub fn write_bool(&mut self, value: bool) -> Result<(), ProtocolError> {
        self.write_bits(value as u32, 1)
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), ProtocolError> {
        self.write_bits(value as u32, 8)
    }

    pub fn write_u16(&mut self, value: u16) -> Result<(), ProtocolError> {
        self.write_bits(value as u32, 16)
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), ProtocolError> {
        self.write_bits(value, 32)
    }

    /// Quantize `value` in `[min, max]` to `bits` bits
    pub fn write_float(&mut self, value: f32, min: f32, max: f32, bits: u32) -> Result<(), ProtocolError> {
        let range = ((1u64 << bits) - 1) as f32;
        let t = ((value.clamp(min, max) - min) / (max - min)).clamp(0.0, 1.0);
        self.write_bits((t * range + 0.5) as u32, bits)
    }

    pub fn write_vec(&mut self, value: Vec2, min: Vec2, max: Vec2, bits: u32) -> Result<(), ProtocolError> {
        self.write_float(value.x, min.x, max.x, bits)?;
        self.write_float(value.y, min.y, max.y, bits)
    }

    pub fn write_unit_vec(&mut self, value: Vec2, bits: u32) -> Result<(), ProtocolError> {
        self.write_vec(value, Vec2::new(-1.0001, -1.0001), Vec2::new(1.0001, 1.0001), bits)
    }

    /// ASCII string of at most `max_len` bytes, zero-terminated when shorter
    pub fn write_string(&mut self, value: &str, max_len: usize) -> Result<(), ProtocolError> {
        let mut written = 0;
        for ch in value.chars().take(max_len) {
            let byte = if ch.is_ascii() && ch != '\0' { ch as u8 } else { b'?' };
            self.write_u8(byte)?;
            written += 1;
        }
        if written < max_len {
            self.write_u8(0)?;
        }
        Ok(())
    }

    /// Pad with zero bits up to the next byte boundary
    pub fn align_to_byte(&mut self) -> Result<(), ProtocolError> {
        let pad = (8 - self.bit_index % 8) % 8;
        self.reserve_bits(pad)?;
        self.bit_index += pad;
        Ok(())
    }

    /// Byte-aligned raw copy of a pre-serialized sub-stream
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.align_to_byte()?;
        self.reserve_bits(bytes.len() * 8)?;
        let start = self.bit_index / 8;
        self.buf[start..start + bytes.len()].copy_from_slice(bytes);
        self.bit_index += bytes.len() * 8;
        Ok(())
    }
}

/// Bit reader over a borrowed byte slice
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    bit_index: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, bit_index: 0 }
    }

    pub fn remaining_bits(&self) -> usize {
        self.data.len() * 8 - self.bit_index
    }

    pub fn is_at_end(&self) -> bool {
        self.remaining_bits() == 0
    }

    fn check(&self, bits: usize) -> Result<(), ProtocolError> {
        let remaining = self.remaining_bits();
        if bits > remaining {
            return Err(ProtocolError::Truncated {
                needed: bits - remaining,
            });
        }
        Ok(())
    }

    pub fn read_bits(&mut self, bits: u32) -> Result<u32, ProtocolError> {
        debug_assert!(bits <= 32);
        self.check(bits as usize)?;
        let mut value = 0u32;
        for i in 0..bits {
            let idx = self.bit_index;
            if (self.data[idx >> 3] >> (idx & 7)) & 1 == 1 {
                value |= 1 << i;
            }
            self.bit_index += 1;
        }
        Ok(value)
    }

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.read_bits(1)? == 1)
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.read_bits(8)? as u8)
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(self.read_bits(16)? as u16)
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        self.read_bits(32)
    }

    pub fn read_float(&mut self, min: f32, max: f32, bits: u32) -> Result<f32, ProtocolError> {
        let range = ((1u64 << bits) - 1) as f32;
        let raw = self.read_bits(bits)? as f32;
        Ok(min + (max - min) * (raw / range))
    }

    pub fn read_vec(&mut self, min: Vec2, max: Vec2, bits: u32) -> Result<Vec2, ProtocolError> {
        let x = self.read_float(min.x, max.x, bits)?;
        let y = self.read_float(min.y, max.y, bits)?;
        Ok(Vec2::new(x, y))
    }

    pub fn read_unit_vec(&mut self, bits: u32) -> Result<Vec2, ProtocolError> {
        self.read_vec(Vec2::new(-1.0001, -1.0001), Vec2::new(1.0001, 1.0001), bits)
    }

    pub fn read_string(&mut self, max_len: usize) -> Result<String, ProtocolError> {
        let mut out = String::new();
        for _ in 0..max_len {
            let byte = self.read_u8()?;
            if byte == 0 {
                break;
            }
            if !byte.is_ascii() {
                return Err(ProtocolError::InvalidField("string"));
            }
            out.push(byte as char);
        }
        Ok(out)
    }

    pub fn align_to_byte(&mut self) -> Result<(), ProtocolError> {
        let pad = (8 - self.bit_index % 8) % 8;
        self.check(pad)?;
        self.bit_index += pad;
        Ok(())
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        self.align_to_byte()?;
        self.check(len * 8)?;
        let start = self.bit_index / 8;
        self.bit_index += len * 8;
        Ok(&self.data[start..start + len])
    }
}
