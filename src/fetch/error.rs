use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::catalog::CatalogError;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Remote error fetching {key}: {source}")]
    Remote { key: String, source: CatalogError },

    #[error("Remote stopped sending {key} for {}s", after.as_secs())]
    Stalled { key: String, after: Duration },

    #[error("Disk error at {}: {source}", path.display())]
    Disk {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to re-encode {key}: {source}")]
    Transform {
        key: String,
        source: image::ImageError,
    },

    #[error("Transform task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl FetchError {
    pub(crate) fn disk(path: &std::path::Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| FetchError::Disk {
            path: path.to_path_buf(),
            source,
        }
    }
}
