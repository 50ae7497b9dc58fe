//! Record framing.
//!
//! Each record is written as a small, self-delimiting frame so that a reader resuming from an
//! arbitrary (previously recorded) byte offset can decode exactly one record and learn where the
//! next one starts:
//!
//! ```text
//!   body_len: u32 (little-endian)
//!   crc32:    u32 (little-endian), crc32(body)
//!   body:     [u8; body_len]
//! ```
//!
//! `body` is the user's payload, optionally DEFLATE-compressed first (see [`crate::config`]). The
//! checksum covers the bytes actually written to disk (i.e. the compressed form, when compression
//! is enabled), matching the "CRC is over the framed bytes" invariant.

use std::io::{self, Read, Write};

use crc32fast::Hasher;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::RecordError;

const HEADER_LEN: usize = 8;

/// Refuse to trust a declared body length past this; real payloads are bounded well below it, and
/// anything larger is a sign the header itself is garbage rather than a legitimately huge record.
const MAX_PLAUSIBLE_BODY_LEN: u32 = 1024 * 1024 * 1024;

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Encodes `payload` as a framed record, ready to be appended to a bucket file.
///
/// When `compress` is set, `payload` is DEFLATE-compressed before being wrapped; the checksum is
/// computed over the compressed bytes.
pub fn encode(payload: &[u8], compress: bool) -> io::Result<Vec<u8>> {
    let body = if compress {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload)?;
        encoder.finish()?
    } else {
        payload.to_vec()
    };

    let checksum = crc32(&body);
    let mut framed = Vec::with_capacity(HEADER_LEN + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
    framed.extend_from_slice(&checksum.to_le_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// Decodes exactly one framed record from `reader`, which must be positioned at a record
/// boundary.
///
/// Returns the decoded (decompressed, if `compress`) payload on success. A reader sitting at true
/// end-of-file, or in the middle of a record whose tail hasn't been written yet, yields
/// [`RecordError::Eof`] — this is the common case of "nothing new to read yet", not a failure. A
/// frame that is fully present but fails its checksum (or fails to decompress) yields
/// [`RecordError::Corrupt`].
pub fn decode<R: Read>(reader: &mut R, compress: bool) -> Result<Vec<u8>, RecordError> {
    let mut header = [0u8; HEADER_LEN];
    read_exact_or_eof(reader, &mut header)?;

    let body_len = u32::from_le_bytes(header[0..4].try_into().unwrap());
    let stored_crc = u32::from_le_bytes(header[4..8].try_into().unwrap());

    if body_len > MAX_PLAUSIBLE_BODY_LEN {
        return Err(RecordError::Corrupt {
            reason: "declared body length is implausibly large",
        });
    }

    let mut body = vec![0u8; body_len as usize];
    read_exact_or_eof(reader, &mut body)?;

    if crc32(&body) != stored_crc {
        return Err(RecordError::Corrupt {
            reason: "checksum mismatch",
        });
    }

    if compress {
        let mut decoder = ZlibDecoder::new(&body[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).map_err(|_| RecordError::Corrupt {
            reason: "failed to decompress body",
        })?;
        Ok(out)
    } else {
        Ok(body)
    }
}

/// Like [`Read::read_exact`], but a genuine end-of-file (zero bytes available, or a partial read
/// that runs out of data) is reported as [`RecordError::Eof`] rather than an I/O error, since both
/// mean "the rest of this record hasn't been written yet".
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), RecordError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(RecordError::Eof),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(RecordError::Io(e)),
        }
    }
    Ok(())
}
