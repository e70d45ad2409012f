//! Bidirectional payload conversion between the Anthropic Messages,
//! OpenAI Chat Completions, and Codex Responses wire formats.

pub mod anthropic;
pub mod codex;
pub mod openai;
pub mod python_fix;
pub mod request;
pub mod response;
pub mod stream;

use thiserror::Error;

/// A request or response could not be converted between formats.
#[derive(Debug, Error)]
pub enum ConvertError {
    /// The payload did not deserialize as the expected format.
    #[error("malformed {format} payload: {detail}")]
    Malformed {
        /// Source format name.
        format: &'static str,
        /// Parse error detail.
        detail: String,
    },

    /// A required field was missing or invalid.
    #[error("invalid {format} payload: {detail}")]
    Invalid {
        /// Source format name.
        format: &'static str,
        /// What was wrong.
        detail: String,
    },
}

impl ConvertError {
    pub(crate) fn malformed(format: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Malformed {
            format,
            detail: err.to_string(),
        }
    }

    pub(crate) fn invalid(format: &'static str, detail: impl Into<String>) -> Self {
        Self::Invalid {
            format,
            detail: detail.into(),
        }
    }
}
