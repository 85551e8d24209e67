use std::{fmt, str::FromStr};

use flate2::Compression;
use thiserror::Error;

/// How hard the encoder works to shrink a response.
///
/// The named presets mirror the usual zlib ones. A raw level must be within `0..=9`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionLevel {
    NoCompression,
    BestSpeed,
    BestCompression,
    #[default]
    Default,
    /// Entropy coding only, no string matching.
    HuffmanOnly,
    Level(u32),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LevelError {
    #[error("compression level out of range: {0}")]
    OutOfRange(i64),
    #[error("unknown compression level: {0}")]
    Unknown(String),
}

impl CompressionLevel {
    pub const MAX: u32 = 9;

    pub fn validate(self) -> Result<Self, LevelError> {
        match self {
            CompressionLevel::Level(level) if level > Self::MAX => {
                Err(LevelError::OutOfRange(level.into()))
            }
            level => Ok(level),
        }
    }

    /// The flate2 setting for this level, `None` for [`CompressionLevel::HuffmanOnly`] and for
    /// out of range raw levels.
    pub(crate) fn as_flate2(self) -> Option<Compression> {
        match self {
            CompressionLevel::NoCompression => Some(Compression::none()),
            CompressionLevel::BestSpeed => Some(Compression::fast()),
            CompressionLevel::BestCompression => Some(Compression::best()),
            CompressionLevel::Default => Some(Compression::default()),
            CompressionLevel::HuffmanOnly => None,
            CompressionLevel::Level(level) if level <= Self::MAX => Some(Compression::new(level)),
            CompressionLevel::Level(_) => None,
        }
    }
}

/// Accepts the numeric constants zlib uses: `-2` is huffman only and `-1` the default level.
impl TryFrom<i32> for CompressionLevel {
    type Error = LevelError;

    fn try_from(level: i32) -> Result<Self, Self::Error> {
        match level {
            -2 => Ok(CompressionLevel::HuffmanOnly),
            -1 => Ok(CompressionLevel::Default),
            0 => Ok(CompressionLevel::NoCompression),
            1 => Ok(CompressionLevel::BestSpeed),
            9 => Ok(CompressionLevel::BestCompression),
            2..=8 => Ok(CompressionLevel::Level(level as u32)),
            level => Err(LevelError::OutOfRange(level.into())),
        }
    }
}

impl FromStr for CompressionLevel {
    type Err = LevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "no-compression" | "none" => Ok(CompressionLevel::NoCompression),
            "best-speed" | "fast" => Ok(CompressionLevel::BestSpeed),
            "best-compression" | "best" => Ok(CompressionLevel::BestCompression),
            "default" => Ok(CompressionLevel::Default),
            "huffman-only" => Ok(CompressionLevel::HuffmanOnly),
            other => match other.parse::<i64>() {
                Ok(level) => i32::try_from(level)
                    .map_err(|_| LevelError::OutOfRange(level))
                    .and_then(CompressionLevel::try_from),
                Err(_) => Err(LevelError::Unknown(s.to_string())),
            },
        }
    }
}

impl fmt::Display for CompressionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionLevel::NoCompression => f.write_str("no-compression"),
            CompressionLevel::BestSpeed => f.write_str("best-speed"),
            CompressionLevel::BestCompression => f.write_str("best-compression"),
            CompressionLevel::Default => f.write_str("default"),
            CompressionLevel::HuffmanOnly => f.write_str("huffman-only"),
            CompressionLevel::Level(level) => write!(f, "{level}"),
        }
    }
}
