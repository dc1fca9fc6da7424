//! # Section Module
//!
//! Reads the raw bytes of DWARF sections from an ELF image.
//!
//! A section named `.debug_<x>` may instead be present as `.zdebug_<x>`, the old GNU
//! compressed form: the magic `"ZLIB"`, the uncompressed length as 8 byte big endian, then a
//! zlib stream. Such sections are inflated with [`flate2`]. Sections compressed the modern way
//! (`SHF_COMPRESSED`) are handed to [`object`] to decompress.

use std::io::Read;

use flate2::read::ZlibDecoder;
use object::{Object, ObjectSection};
use tracing::{debug, trace};

use crate::errors::{DebuggerError, Result};

/// Magic bytes at the start of a `.zdebug_*` section
pub const ZDEBUG_MAGIC: &[u8; 4] = b"ZLIB";
const ZDEBUG_HEADER_LEN: usize = 12;

/// Name of the compressed twin of a `.debug_*` section
#[must_use]
pub fn compressed_name(name: &str) -> Option<String> {
    name.strip_prefix(".debug_").map(|rest| format!(".zdebug_{rest}"))
}

/// Loads the section `name`, falling back to its `.zdebug_*` twin
///
/// Returns `Ok(None)` if neither form exists.
///
/// # Errors
///
/// Fails if the section data can not be read or inflated.
pub fn load_section(obj: &object::File<'_>, name: &str) -> Result<Option<Vec<u8>>> {
    if let Some(section) = find_exact(obj, name) {
        let data = section.uncompressed_data()?;
        trace!("loaded {name}: {} bytes", data.len());
        return Ok(Some(data.into_owned()));
    }

    let Some(zname) = compressed_name(name) else {
        return Ok(None);
    };
    if let Some(section) = find_exact(obj, &zname) {
        let raw = section.data()?;
        let data = inflate_zdebug(raw)?;
        debug!("inflated {zname}: {} -> {} bytes", raw.len(), data.len());
        return Ok(Some(data));
    }

    Ok(None)
}

/// Like [`load_section`], but a missing section is an error
///
/// # Errors
///
/// Fails with [`DebuggerError::MissingSection`] if neither form of the section exists.
pub fn require_section(obj: &object::File<'_>, name: &str) -> Result<Vec<u8>> {
    load_section(obj, name)?.ok_or_else(|| DebuggerError::MissingSection(name.to_string()))
}

fn find_exact<'data, 'file>(
    obj: &'file object::File<'data>,
    name: &str,
) -> Option<object::Section<'data, 'file>> {
    obj.sections().find(|s| s.name().is_ok_and(|n| n == name))
}

/// Inflates the payload of a `.zdebug_*` section
///
/// Data without the `"ZLIB"` header is returned unchanged, as the GNU tools do.
///
/// # Errors
///
/// Fails if the zlib stream is corrupt or shorter than the announced length.
pub fn inflate_zdebug(raw: &[u8]) -> Result<Vec<u8>> {
    if raw.len() < ZDEBUG_HEADER_LEN || &raw[..4] != ZDEBUG_MAGIC {
        return Ok(raw.to_vec());
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&raw[4..ZDEBUG_HEADER_LEN]);
    let len = u64::from_be_bytes(len_bytes);

    // the announced length is only trusted as a cap, memory grows with the real stream
    let mut out = Vec::new();
    ZlibDecoder::new(&raw[ZDEBUG_HEADER_LEN..])
        .take(len)
        .read_to_end(&mut out)
        .map_err(|e| DebuggerError::DwarfParse(format!("bad zlib stream: {e}")))?;
    if out.len() as u64 != len {
        return Err(DebuggerError::DwarfParse(format!(
            "zlib stream inflates to {} bytes, the header announces {len}",
            out.len()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    use super::*;

    fn zdebug(payload: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(payload).unwrap();
        let mut out = ZDEBUG_MAGIC.to_vec();
        out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        out.extend_from_slice(&enc.finish().unwrap());
        out
    }

    #[test]
    fn test_inflate_zdebug() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(4000).collect();
        assert_eq!(inflate_zdebug(&zdebug(&payload)).unwrap(), payload);
    }

    #[test]
    fn test_inflate_without_header_is_identity() {
        assert_eq!(inflate_zdebug(b"\x01\x02\x03").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_inflate_truncated_stream() {
        let mut data = zdebug(b"hello debug frame");
        data.truncate(ZDEBUG_HEADER_LEN + 2);
        assert!(matches!(
            inflate_zdebug(&data),
            Err(DebuggerError::DwarfParse(_))
        ));
    }

    #[test]
    fn test_inflate_with_oversized_length() {
        let mut data = zdebug(b"hello debug frame");
        data[4..ZDEBUG_HEADER_LEN].copy_from_slice(&u64::MAX.to_be_bytes());
        assert!(matches!(
            inflate_zdebug(&data),
            Err(DebuggerError::DwarfParse(_))
        ));
    }

    #[test]
    fn test_compressed_name() {
        assert_eq!(
            compressed_name(".debug_frame").as_deref(),
            Some(".zdebug_frame")
        );
        assert_eq!(compressed_name(".text"), None);
    }

    #[test]
    fn test_load_from_own_executable() {
        let data = std::fs::read(std::env::current_exe().unwrap()).unwrap();
        let obj = object::File::parse(&*data).unwrap();
        assert!(load_section(&obj, ".text").unwrap().is_some());
        assert!(load_section(&obj, ".debug_nonexistent").unwrap().is_none());
        assert!(matches!(
            require_section(&obj, ".debug_nonexistent"),
            Err(DebuggerError::MissingSection(_))
        ));
    }
}
