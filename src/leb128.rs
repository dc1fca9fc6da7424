//! LEB128 and fixed width little endian decoding over a byte slice.
//!
//! The CFI parser and interpreter and the location expression decoder all read their operands
//! through [`ByteReader`].

use crate::errors::{DebuggerError, Result};

/// A cursor over a byte slice
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// The bytes not read yet
    #[must_use]
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos.min(self.data.len())..]
    }

    /// Takes the next `len` bytes
    ///
    /// # Errors
    ///
    /// Fails if fewer than `len` bytes are left.
    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(DebuggerError::UnexpectedEof("byte block"));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads a NUL terminated string, without the NUL
    pub fn cstr(&mut self) -> Result<&'a [u8]> {
        let rest = self.rest();
        let len = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(DebuggerError::UnexpectedEof("NUL terminated string"))?;
        self.pos += len + 1;
        Ok(&rest[..len])
    }

    pub fn uleb128(&mut self) -> Result<u64> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.u8().map_err(|_| DebuggerError::UnexpectedEof("ULEB128"))?;
            let low = u64::from(byte & 0x7f);
            if shift >= 64 || (shift == 63 && low > 1) {
                return Err(DebuggerError::Leb128Overflow);
            }
            result |= low << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    pub fn sleb128(&mut self) -> Result<i64> {
        let mut result: i64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.u8().map_err(|_| DebuggerError::UnexpectedEof("SLEB128"))?;
            if shift >= 64 {
                return Err(DebuggerError::Leb128Overflow);
            }
            result |= i64::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                // the second highest bit of the last byte is the sign
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
    }
}

/// Decodes one unsigned LEB128 value from the start of `data`
///
/// Returns the value and the number of bytes it took.
///
/// # Errors
///
/// Fails on truncated input or values wider than 64 bits.
pub fn decode_uleb128(data: &[u8]) -> Result<(u64, usize)> {
    let mut rd = ByteReader::new(data);
    let v = rd.uleb128()?;
    Ok((v, rd.position()))
}

/// Decodes one signed LEB128 value from the start of `data`
///
/// # Errors
///
/// Fails on truncated input or values wider than 64 bits.
pub fn decode_sleb128(data: &[u8]) -> Result<(i64, usize)> {
    let mut rd = ByteReader::new(data);
    let v = rd.sleb128()?;
    Ok((v, rd.position()))
}

#[must_use]
pub fn encode_uleb128(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

#[must_use]
pub fn encode_sleb128(mut value: i64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_uleb128_values() {
        for n in [0u64, 1, 127, 128, 255, 624_485, u64::from(u32::MAX), u64::MAX] {
            let enc = encode_uleb128(n);
            assert_eq!(decode_uleb128(&enc).unwrap(), (n, enc.len()), "{n}");
        }
        assert_eq!(encode_uleb128(624_485), vec![0xe5, 0x8e, 0x26]);
    }

    #[test]
    fn test_sleb128_values() {
        for n in [0i64, 1, -1, 63, 64, -64, -65, 127, -128, -123_456, i64::MIN, i64::MAX] {
            let enc = encode_sleb128(n);
            assert_eq!(decode_sleb128(&enc).unwrap(), (n, enc.len()), "{n}");
        }
        assert_eq!(decode_sleb128(&[0x78]).unwrap(), (-8, 1));
        assert_eq!(decode_sleb128(&[0x7f]).unwrap(), (-1, 1));
        assert_eq!(decode_sleb128(&[0x80, 0x7f]).unwrap(), (-128, 2));
    }

    #[test]
    fn test_truncated_leb128() {
        assert!(matches!(
            decode_uleb128(&[0x80, 0x80]),
            Err(DebuggerError::UnexpectedEof(_))
        ));
        assert!(matches!(
            decode_sleb128(&[]),
            Err(DebuggerError::UnexpectedEof(_))
        ));
    }

    #[test]
    fn test_uleb128_overflow() {
        let too_wide = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f];
        assert!(matches!(
            decode_uleb128(&too_wide),
            Err(DebuggerError::Leb128Overflow)
        ));
    }

    #[test]
    fn test_reader_fixed_width_and_strings() {
        let data = [0x34, 0x12, b'z', b'R', 0, 0xaa];
        let mut rd = ByteReader::new(&data);
        assert_eq!(rd.u16().unwrap(), 0x1234);
        assert_eq!(rd.cstr().unwrap(), b"zR");
        assert_eq!(rd.remaining(), 1);
        assert_eq!(rd.u8().unwrap(), 0xaa);
        assert!(rd.is_empty());
        assert!(rd.u32().is_err());
    }
}
