//! Transport encoding for the patch shipped to the pod.
//!
//! Wire format: raw patch bytes, newline-terminated, gzip at maximum
//! compression, standard base64. The sidecar reverses it with `base64 -d | gunzip`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::Write;

/// Largest encoded diff accepted for embedding in a run.
pub const MAX_ENCODED_DIFF_LEN: usize = 10_000;

/// Compress and base64-encode a diff. A missing trailing newline is added so
/// `git apply` sees a complete last line.
pub fn encode_diff(patch: &[u8]) -> std::io::Result<String> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::best());
    enc.write_all(patch)?;
    if !patch.ends_with(b"\n") {
        enc.write_all(b"\n")?;
    }
    let compressed = enc.finish()?;
    Ok(STANDARD.encode(compressed))
}

/// Enforce the size ceiling on an encoded diff. Returns the offending length.
pub fn check_ceiling(encoded: &str) -> Result<(), usize> {
    match encoded.len() {
        n if n > MAX_ENCODED_DIFF_LEN => Err(n),
        _ => Ok(()),
    }
}

#[cfg(test)]
pub(crate) fn decode_diff(encoded: &str) -> Vec<u8> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let bytes = STANDARD.decode(encoded).unwrap();
    let mut out = Vec::new();
    GzDecoder::new(bytes.as_slice())
        .read_to_end(&mut out)
        .unwrap();
    out
}
