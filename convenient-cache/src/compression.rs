//! Compression of cached blobs
//!
//! The decoder sniffs the format from magic bytes, so blobs written with any
//! supported algorithm (or none) can be read back without extra metadata.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Compression algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionAlgorithm {
    /// Stored as is
    None,
    /// Zstandard
    #[default]
    Zstd,
    /// LZ4 frame format
    Lz4,
    /// gzip, for interoperability with generic HTTP caches
    Gzip,
}

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
const LZ4_MAGIC: [u8; 4] = [0x04, 0x22, 0x4D, 0x18];
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

impl CompressionAlgorithm {
    /// Default level for the algorithm
    #[must_use]
    pub fn default_level(self) -> i32 {
        match self {
            Self::Zstd => 3,
            Self::Gzip => 6,
            Self::None | Self::Lz4 => 0,
        }
    }

    /// Detect compression from magic bytes
    #[must_use]
    pub fn detect(data: &[u8]) -> Self {
        if data.starts_with(&ZSTD_MAGIC) {
            Self::Zstd
        } else if data.starts_with(&LZ4_MAGIC) {
            Self::Lz4
        } else if data.starts_with(&GZIP_MAGIC) {
            Self::Gzip
        } else {
            Self::None
        }
    }
}

/// Compress everything from `reader` into `writer`
///
/// # Errors
///
/// Propagates I/O and encoder errors
pub fn compress_stream<R: Read, W: Write>(
    mut reader: R,
    writer: W,
    algorithm: CompressionAlgorithm,
) -> io::Result<()> {
    match algorithm {
        CompressionAlgorithm::None => {
            let mut writer = writer;
            let _ = io::copy(&mut reader, &mut writer)?;
            writer.flush()
        }
        CompressionAlgorithm::Zstd => zstd::stream::copy_encode(reader, writer, algorithm.default_level()),
        CompressionAlgorithm::Lz4 => {
            let mut encoder = lz4::EncoderBuilder::new().build(writer)?;
            let _ = io::copy(&mut reader, &mut encoder)?;
            let (_, result) = encoder.finish();
            result
        }
        CompressionAlgorithm::Gzip => {
            let level = u32::try_from(algorithm.default_level()).unwrap_or(6);
            let mut encoder = flate2::write::GzEncoder::new(writer, flate2::Compression::new(level));
            let _ = io::copy(&mut reader, &mut encoder)?;
            let _ = encoder.finish()?;
            Ok(())
        }
    }
}

/// Decompress `reader` into `writer`, detecting the format
///
/// # Errors
///
/// Propagates I/O errors and corrupt input
pub fn decompress_stream<R: Read, W: Write>(reader: R, mut writer: W) -> io::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut magic = [0u8; 4];
    let mut filled = 0;
    while filled < magic.len() {
        let n = reader.read(&mut magic[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let algorithm = CompressionAlgorithm::detect(&magic[..filled]);
    let mut input = (&magic[..filled]).chain(reader);

    match algorithm {
        CompressionAlgorithm::None => {
            let _ = io::copy(&mut input, &mut writer)?;
        }
        CompressionAlgorithm::Zstd => zstd::stream::copy_decode(input, &mut writer)?,
        CompressionAlgorithm::Lz4 => {
            let mut decoder = lz4::Decoder::new(input)?;
            let _ = io::copy(&mut decoder, &mut writer)?;
        }
        CompressionAlgorithm::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(input);
            let _ = io::copy(&mut decoder, &mut writer)?;
        }
    }
    writer.flush()
}

/// Compress a byte slice
///
/// # Errors
///
/// Propagates encoder errors
pub fn compress(data: &[u8], algorithm: CompressionAlgorithm) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    compress_stream(data, &mut out, algorithm)?;
    Ok(out)
}

/// Decompress a byte slice of any supported format
///
/// # Errors
///
/// Fails on corrupt input
pub fn decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    decompress_stream(data, &mut out)?;
    Ok(out)
}

/// Compress file `src` into `dst`
///
/// # Errors
///
/// Propagates I/O errors
pub fn compress_file(src: &Path, dst: &Path, algorithm: CompressionAlgorithm) -> io::Result<()> {
    let reader = BufReader::new(File::open(src)?);
    let writer = BufWriter::new(File::create(dst)?);
    compress_stream(reader, writer, algorithm)
}

/// Decompress file `src` into `dst`
///
/// # Errors
///
/// Propagates I/O errors and corrupt input
pub fn decompress_file(src: &Path, dst: &Path) -> io::Result<()> {
    let reader = File::open(src)?;
    let writer = BufWriter::new(File::create(dst)?);
    decompress_stream(reader, writer)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [CompressionAlgorithm; 4] = [
        CompressionAlgorithm::None,
        CompressionAlgorithm::Zstd,
        CompressionAlgorithm::Lz4,
        CompressionAlgorithm::Gzip,
    ];

    #[test]
    fn test_detect_matches_algorithm() {
        let data = b"Hello, World! ".repeat(100);
        for algorithm in ALL {
            let compressed = compress(&data, algorithm).unwrap();
            assert_eq!(CompressionAlgorithm::detect(&compressed), algorithm);
            assert_eq!(decompress(&compressed).unwrap(), data);
        }
    }

    #[test]
    fn test_short_input_is_uncompressed() {
        assert_eq!(decompress(b"ab").unwrap(), b"ab");
        assert_eq!(decompress(b"").unwrap(), b"");
    }

    #[test]
    fn test_corrupt_zstd_fails() {
        let mut data = compress(&b"payload ".repeat(64), CompressionAlgorithm::Zstd).unwrap();
        data.truncate(8);
        assert!(decompress(&data).is_err());
    }

    #[test]
    fn test_file_helpers() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("src");
        let packed = dir.path().join("packed");
        let unpacked = dir.path().join("unpacked");
        std::fs::write(&src, b"manifest bytes".repeat(10)).unwrap();

        compress_file(&src, &packed, CompressionAlgorithm::Zstd).unwrap();
        decompress_file(&packed, &unpacked).unwrap();
        assert_eq!(std::fs::read(&unpacked).unwrap(), std::fs::read(&src).unwrap());
    }
}
