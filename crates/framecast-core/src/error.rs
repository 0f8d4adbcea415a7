//! Unified error type for the framecast converter.
//!
//! All crates funnel their fatal failures into [`Error`]. The first error in a
//! conversion wins; later failures are attached as causes and never override
//! the original. Recoverable "need more bytes" conditions live in the media
//! crate and are resolved by the demux driver before they ever reach here.

use std::fmt;

use crate::media::ContainerFormat;

/// Direction of a codec failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecDirection {
    Decode,
    Encode,
}

impl fmt::Display for CodecDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode => write!(f, "decode"),
            Self::Encode => write!(f, "encode"),
        }
    }
}

/// Unified error type covering all failure modes in framecast.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The input container violates its wire format.
    #[error("malformed {format} container at offset {offset}: {reason}")]
    MalformedContainer {
        /// Which container format was being parsed.
        format: ContainerFormat,
        /// Byte offset of the offending box/element.
        offset: u64,
        /// What was wrong with it.
        reason: String,
    },

    /// A codec that neither the demuxer nor a muxer can carry.
    #[error("unsupported codec {codec} ({context})")]
    UnsupportedCodec {
        /// The codec identifier as found in the container.
        codec: String,
        /// Where the codec was encountered.
        context: String,
    },

    /// The requested conversion parameters are outside the capability matrix.
    #[error("unsupported configuration: {option} = {value}")]
    UnsupportedConfig {
        /// The offending option name.
        option: String,
        /// The rejected value.
        value: String,
    },

    /// A decoder or encoder failed mid-stream.
    #[error("codec {stage} failure on track {track}: {source}")]
    CodecFailure {
        /// Whether the decoder or the encoder failed.
        stage: CodecDirection,
        /// The track the failing stage belongs to.
        track: u32,
        /// The underlying codec error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The output writer failed; the muxer does not retry.
    #[error("writer failure: {source}")]
    Writer {
        /// The underlying writer error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The conversion was cancelled through its abort token.
    #[error("conversion aborted")]
    Aborted {
        /// The error that triggered the abort, if cancellation was not
        /// user-initiated.
        cause: Option<Box<Error>>,
    },

    /// An I/O operation on the source reader failed.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    /// Convenience constructor for [`Error::MalformedContainer`].
    pub fn malformed(format: ContainerFormat, offset: u64, reason: impl Into<String>) -> Self {
        Error::MalformedContainer {
            format,
            offset,
            reason: reason.into(),
        }
    }

    /// Convenience constructor for [`Error::UnsupportedCodec`].
    pub fn unsupported_codec(codec: impl Into<String>, context: impl Into<String>) -> Self {
        Error::UnsupportedCodec {
            codec: codec.into(),
            context: context.into(),
        }
    }

    /// Convenience constructor for [`Error::UnsupportedConfig`].
    pub fn unsupported_config(option: impl Into<String>, value: impl fmt::Display) -> Self {
        Error::UnsupportedConfig {
            option: option.into(),
            value: value.to_string(),
        }
    }

    /// Convenience constructor for [`Error::CodecFailure`].
    pub fn codec_failure(
        stage: CodecDirection,
        track: u32,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Error::CodecFailure {
            stage,
            track,
            source: source.into(),
        }
    }

    /// Convenience constructor for [`Error::Writer`].
    pub fn writer(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Writer {
            source: source.into(),
        }
    }

    /// A user-initiated abort with no underlying cause.
    pub fn aborted() -> Self {
        Error::Aborted { cause: None }
    }

    /// An abort triggered by an earlier failure.
    pub fn aborted_with(cause: Error) -> Self {
        Error::Aborted {
            cause: Some(Box::new(cause)),
        }
    }

    /// Whether this error came from cancellation rather than data or codecs.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted { .. })
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
