//! Application-wide error types.
//!
//! This module provides a unified error hierarchy for the indexing core.
//! Library modules return specific [`Error`] variants via `thiserror`,
//! while the CLI binary unwraps those into `anyhow` at its top level.
//!
//! All errors implement `std::error::Error` for compatibility.

use std::path::PathBuf;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level application error.
///
/// Aggregates the taxonomy from every subsystem (store, extractor, scanner,
/// watcher, volume manager) into one enum so callers can match narrowly
/// where they care and propagate with `?` everywhere else.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error surfaced directly from sqlx (connection, syntax, etc).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// No row matches a lookup by path.
    #[error("not found: {0}")]
    NotFound(PathBuf),

    /// Attempted to insert a record that violates a store precondition
    /// (non-absolute path, or `type` not in `{Audio, Video, Image}`).
    #[error("constraint violated: {0}")]
    ConstraintError(String),

    /// A read-only store open found a schema version it doesn't support.
    #[error("schema mismatch: store has version {found}, expected {expected}")]
    SchemaMismatch { found: i64, expected: i64 },

    /// An order was requested that the query kind cannot satisfy
    /// (e.g. albums ordered by rank).
    #[error("invalid order for this query: {0:?}")]
    InvalidOrder(crate::model::OrderBy),

    /// `detect` rejected a path because its content type is a known-bad
    /// playlist type.
    #[error("blacklisted content type: {0}")]
    Blacklisted(String),

    /// `detect` could not classify a path into Audio/Video/Image.
    #[error("unsupported content type: {0}")]
    UnsupportedType(String),

    /// The extractor worker returned a structured failure.
    #[error("extraction failed: {0}")]
    ExtractFailed(String),

    /// The extractor worker's reply channel closed unexpectedly.
    #[error("worker gave no reply")]
    NoReply,

    /// The store exhausted its `SQLITE_BUSY` retry budget.
    #[error("store busy, retry budget exhausted")]
    Busy,

    /// Configuration could not be loaded or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// The filesystem watcher's backend failed (inotify limits, removed
    /// watch root, etc).
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    /// `lofty` rejected or failed to parse an audio file's tags.
    #[error("tag read error: {0}")]
    Tag(#[from] lofty::error::LoftyError),

    /// The symphonia probe (run out-of-process, see the extractor worker)
    /// failed to read a media stream.
    #[error("decode error: {0}")]
    Decode(#[from] symphonia::core::errors::Error),

    /// Generic error with added context, chaining to the original cause.
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        Self::NotFound(path.into())
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self::ConstraintError(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Add context to an error.
    pub fn context(self, ctx: impl Into<String>) -> Self {
        Self::WithContext {
            context: ctx.into(),
            source: Box::new(self),
        }
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(ctx))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Io(e).context(ctx))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, sqlx::Error> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Database(e).context(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::not_found("/path/to/file.mp3");
        assert!(err.to_string().contains("/path/to/file.mp3"));
    }

    #[test]
    fn test_error_with_context() {
        let err = Error::NoReply.context("while extracting track1.ogg");
        let msg = err.to_string();
        assert!(msg.contains("while extracting track1.ogg"));
    }

    #[test]
    fn test_constraint_error() {
        let err = Error::constraint("filename must be absolute");
        let msg = err.to_string();
        assert!(msg.contains("must be absolute"));
    }

    #[test]
    fn test_result_ext() {
        let result: Result<()> = Err(Error::Busy);
        let with_ctx = result.with_context("committing transaction");
        assert!(with_ctx.unwrap_err().to_string().contains("committing transaction"));
    }
}
