// gzip.rs — in-memory gzip helpers
//
// The level file, the event log, and the world bytes sent to joining
// clients all travel as gzip streams; these helpers cover the in-memory
// cases.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

pub fn gzip_compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn gzip_decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let compressed = gzip_compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(gzip_decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_empty_input() {
        let compressed = gzip_compress(&[]).unwrap();
        assert_eq!(gzip_decompress(&compressed).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_garbage_input_fails() {
        assert!(gzip_decompress(b"not a gzip stream").is_err());
    }
}
