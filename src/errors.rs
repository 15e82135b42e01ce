// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Crate-wide error type.

/// Errors surfaced by the archive, matcher, TLS broker and transformers.
///
/// `NotFound` is part of the matcher contract: the replay handler maps it to
/// a 404 instead of treating it as a failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found")]
    NotFound,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("wire format error: {0}")]
    Wire(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("transform error: {0}")]
    Transform(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("certificate generation error: {0}")]
    Rcgen(#[from] rcgen::RcgenError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when the error is the matcher's miss signal rather than a fault.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn not_found_is_distinguishable() {
        assert!(Error::NotFound.is_not_found());
        assert!(!Error::Archive("corrupt".into()).is_not_found());
    }

    #[test]
    fn io_errors_keep_their_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.source().is_some());
    }

    #[test]
    fn display_includes_context() {
        let err = Error::Wire("truncated header block".into());
        assert_eq!(err.to_string(), "wire format error: truncated header block");
    }
}
