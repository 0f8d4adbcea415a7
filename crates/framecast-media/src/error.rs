//! Error types for the container layer.
//!
//! [`ParseError::Incomplete`] is the one recoverable condition in this crate:
//! it means "feed me more bytes and replay". The demux driver handles it
//! internally; everything else converts into the unified
//! [`framecast_core::Error`] at the pipeline boundary.

use framecast_core::media::ContainerFormat;

/// Result type for parsing operations.
pub type ParseResult<T> = std::result::Result<T, ParseError>;

/// Error type for container parsing and serialization.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// Not enough bytes buffered to complete the current read. The cursor is
    /// left at the offset it held before the failing call.
    #[error("need more bytes")]
    Incomplete,

    /// The data violates the container format.
    #[error("malformed {context} at offset {offset}: {reason}")]
    Malformed {
        /// The box/element being parsed (e.g. "trun", "SimpleBlock").
        context: &'static str,
        /// Absolute byte offset of the offending structure.
        offset: u64,
        /// What was wrong.
        reason: String,
    },

    /// A codec or feature the container layer cannot carry.
    #[error("unsupported {what}: {detail}")]
    Unsupported {
        /// The kind of thing that is unsupported ("codec", "lacing", ...).
        what: &'static str,
        /// The specific value encountered.
        detail: String,
    },
}

impl ParseError {
    /// Convenience constructor for [`ParseError::Malformed`].
    pub fn malformed(context: &'static str, offset: u64, reason: impl Into<String>) -> Self {
        ParseError::Malformed {
            context,
            offset,
            reason: reason.into(),
        }
    }

    /// Convenience constructor for [`ParseError::Unsupported`].
    pub fn unsupported(what: &'static str, detail: impl Into<String>) -> Self {
        ParseError::Unsupported {
            what: what.into(),
            detail: detail.into(),
        }
    }

    /// Whether this is the recoverable "need more bytes" condition.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ParseError::Incomplete)
    }

    /// Convert into the unified pipeline error, tagging the input format.
    ///
    /// `Incomplete` maps to a truncation error: by the time this conversion
    /// runs the driver has already exhausted the source.
    pub fn into_core(self, format: ContainerFormat) -> framecast_core::Error {
        match self {
            ParseError::Incomplete => {
                framecast_core::Error::malformed(format, 0, "source ended mid-structure")
            }
            ParseError::Malformed {
                context,
                offset,
                reason,
            } => framecast_core::Error::malformed(format, offset, format!("{context}: {reason}")),
            ParseError::Unsupported { what: _, detail } => {
                framecast_core::Error::unsupported_codec(detail, format.to_string())
            }
        }
    }
}
