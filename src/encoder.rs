mod huffman;

use std::io::{self, Write};

use flate2::write::GzEncoder;
use thiserror::Error;

pub use huffman::HuffmanEncoder;

use crate::level::CompressionLevel;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("unsupported compression level: {0}")]
    Level(CompressionLevel),
    #[error("failed to initialize encoder: {0}")]
    Io(#[from] io::Error),
}

/// A compression stream bound to an underlying writer.
///
/// Nothing written is guaranteed to reach the underlying writer until [`Encoder::finish`]
/// returns, which also writes the stream trailer.
pub trait Encoder<W: Write>: Write {
    fn get_ref(&self) -> &W;

    fn get_mut(&mut self) -> &mut W;

    fn finish(self) -> io::Result<W>;
}

/// Builds a fresh [`Encoder`] for every compressed response.
pub trait MakeEncoder {
    type Encoder<W: Write>: Encoder<W>;

    fn make_encoder<W: Write>(
        &self,
        out: W,
        level: CompressionLevel,
    ) -> Result<Self::Encoder<W>, EncoderError>;
}

/// Produces RFC 1952 gzip streams.
#[derive(Debug, Default, Clone, Copy)]
pub struct Gzip;

impl MakeEncoder for Gzip {
    type Encoder<W: Write> = GzipEncoder<W>;

    fn make_encoder<W: Write>(
        &self,
        out: W,
        level: CompressionLevel,
    ) -> Result<Self::Encoder<W>, EncoderError> {
        GzipEncoder::new(out, level)
    }
}

pub enum GzipEncoder<W: Write> {
    Deflate(GzEncoder<W>),
    /// flate2 has no way to pick a deflate strategy, so huffman only streams are framed here.
    Huffman(HuffmanEncoder<W>),
}

impl<W: Write> GzipEncoder<W> {
    pub fn new(out: W, level: CompressionLevel) -> Result<Self, EncoderError> {
        match level {
            CompressionLevel::HuffmanOnly => Ok(Self::Huffman(HuffmanEncoder::new(out))),
            level => level
                .as_flate2()
                .map(|compression| Self::Deflate(GzEncoder::new(out, compression)))
                .ok_or(EncoderError::Level(level)),
        }
    }
}

impl<W: Write> Write for GzipEncoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Deflate(encoder) => encoder.write(buf),
            Self::Huffman(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Deflate(encoder) => encoder.flush(),
            Self::Huffman(encoder) => encoder.flush(),
        }
    }
}

impl<W: Write> Encoder<W> for GzipEncoder<W> {
    fn get_ref(&self) -> &W {
        match self {
            Self::Deflate(encoder) => encoder.get_ref(),
            Self::Huffman(encoder) => encoder.get_ref(),
        }
    }

    fn get_mut(&mut self) -> &mut W {
        match self {
            Self::Deflate(encoder) => encoder.get_mut(),
            Self::Huffman(encoder) => encoder.get_mut(),
        }
    }

    fn finish(self) -> io::Result<W> {
        match self {
            Self::Deflate(encoder) => encoder.finish(),
            Self::Huffman(encoder) => encoder.finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;

    fn gunzip(data: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        GzDecoder::new(data).read_to_end(&mut buf).unwrap();
        buf
    }

    fn payload() -> Vec<u8> {
        (0..4096_u32)
            .flat_map(|i| format!("line {} of a fairly repetitive body\n", i % 17).into_bytes())
            .collect()
    }

    #[test]
    fn every_named_level_decodes_to_the_same_content() {
        let body = payload();

        for level in [
            CompressionLevel::NoCompression,
            CompressionLevel::BestSpeed,
            CompressionLevel::BestCompression,
            CompressionLevel::Default,
            CompressionLevel::HuffmanOnly,
        ] {
            let mut encoder = Gzip.make_encoder(Vec::new(), level).unwrap();
            encoder.write_all(&body).unwrap();
            let compressed = encoder.finish().unwrap();

            assert_eq!(gunzip(&compressed), body, "level {level}");
        }
    }

    #[test]
    fn levels_change_the_output_size() {
        let body = payload();

        let compress = |level| {
            let mut encoder = GzipEncoder::new(Vec::new(), level).unwrap();
            encoder.write_all(&body).unwrap();
            encoder.finish().unwrap().len()
        };

        assert!(compress(CompressionLevel::NoCompression) > body.len());
        assert!(compress(CompressionLevel::BestCompression) < compress(CompressionLevel::HuffmanOnly));
    }

    #[test]
    fn empty_streams_are_still_valid_gzip() {
        let encoder = GzipEncoder::new(Vec::new(), CompressionLevel::Default).unwrap();
        let compressed = encoder.finish().unwrap();

        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);
        assert!(gunzip(&compressed).is_empty());
    }

    #[test]
    fn rejects_out_of_range_levels() {
        assert!(matches!(
            GzipEncoder::new(Vec::new(), CompressionLevel::Level(10)),
            Err(EncoderError::Level(CompressionLevel::Level(10)))
        ));
    }

    #[test]
    fn exposes_the_underlying_writer() {
        let mut encoder = GzipEncoder::new(Vec::new(), CompressionLevel::BestSpeed).unwrap();
        assert!(encoder.get_ref().is_empty());
        encoder.get_mut().extend_from_slice(b"prefix");
        assert_eq!(encoder.get_ref(), b"prefix");
    }
}
