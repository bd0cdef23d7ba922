use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TagError {
    #[error("Tag codec failed on {}: {source}", path.display())]
    Codec {
        path: PathBuf,
        source: lofty::error::LoftyError,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Rewrite of {} did not verify: {reason}", path.display())]
    Unverified { path: PathBuf, reason: String },

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Tag task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl TagError {
    pub(crate) fn codec(path: &std::path::Path) -> impl FnOnce(lofty::error::LoftyError) -> Self + '_ {
        move |source| TagError::Codec {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn unverified(path: &std::path::Path, reason: impl Into<String>) -> Self {
        TagError::Unverified {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: &std::path::Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| TagError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
