use std::path::PathBuf;
use thiserror::Error;

/// A specialized `Result` type for matching and configuration operations.
pub type FinderResult<T> = Result<T, FinderError>;

/// The error type for all matching, configuration and chain operations.
///
/// "Nothing found" is never represented here: an empty or below-threshold
/// result is a successful outcome.
#[derive(Debug, Error)]
pub enum FinderError {
    #[error("Invalid value '{value}' for parameter {category}/{name}: {reason}")]
    InvalidValue {
        category: String,
        name: String,
        value: String,
        reason: String,
    },

    #[error("Backend '{backend}' is not among the supported ones for '{category}': {choices:?}")]
    UnknownBackend {
        category: String,
        backend: String,
        choices: Vec<String>,
    },

    #[error("Backend category '{category}' is not supported")]
    UnknownCategory { category: String },

    #[error("Parameter '{name}' is not part of category '{category}'")]
    UnknownParameter { category: String, name: String },

    #[error("Malformed match configuration at line {line}: {reason}")]
    MalformedConfiguration { line: usize, reason: String },

    #[error("Malformed chain step in {path:?} at line {line}: {reason}")]
    MalformedChain {
        path: Option<PathBuf>,
        line: usize,
        reason: String,
    },

    #[error("Backend '{backend}' is not available: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("Invalid needle '{needle}': {reason}")]
    InvalidNeedle { needle: String, reason: String },

    #[error("Invalid haystack '{haystack}': {reason}")]
    InvalidHaystack { haystack: String, reason: String },

    #[error("Target file {path:?} is not among any of the known types")]
    UnsupportedTarget { path: PathBuf },

    #[error("Failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode image {path:?}: {source}")]
    ImageDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

impl FinderError {
    /// Configuration and chain errors are authoring bugs and must not be retried.
    pub fn is_authoring_error(&self) -> bool {
        matches!(
            self,
            FinderError::MalformedConfiguration { .. }
                | FinderError::MalformedChain { .. }
                | FinderError::UnknownBackend { .. }
                | FinderError::UnknownCategory { .. }
                | FinderError::UnknownParameter { .. }
        )
    }

    /// Process exit status for a failed run: authoring bugs are told apart
    /// from runtime failures such as unreadable files or missing engines.
    pub fn exit_status(&self) -> u8 {
        if self.is_authoring_error() {
            3
        } else {
            2
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FinderError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed(line: usize, reason: impl Into<String>) -> Self {
        FinderError::MalformedConfiguration {
            line,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authoring_errors_are_told_apart() {
        let malformed = FinderError::malformed(4, "unknown category [colors]");
        assert!(malformed.is_authoring_error());
        assert_eq!(malformed.exit_status(), 3);

        let missing = FinderError::io("screen.png", std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(!missing.is_authoring_error());
        assert_eq!(missing.exit_status(), 2);

        let unavailable = FinderError::BackendUnavailable {
            backend: "ocr/external".to_string(),
            reason: "no text recognizer registered".to_string(),
        };
        assert_eq!(unavailable.exit_status(), 2);
    }
}
