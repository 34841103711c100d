// ABOUTME: Error types for worker runtime supervision.
// ABOUTME: Startup and image resolution failures are the only fatal outcomes of a spawn.

use thiserror::Error;

use crate::container::ContainerApiError;

#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The worker died before it ever reported ready.
    #[error("worker '{name}' failed to start, check the arguments or entrypoint")]
    StartupFailed { name: String },

    /// The image is missing locally and the registry does not have it either.
    #[error("image '{image}' can not be found locally or remotely")]
    ImageNotFound { image: String },

    #[error("no image reference configured for worker '{0}' (set `uses`)")]
    MissingImage(String),

    #[error("no entrypoint configured for process worker '{0}'")]
    MissingEntrypoint(String),

    #[error("invalid mount spec '{0}'")]
    InvalidMount(String),

    #[error(transparent)]
    Api(#[from] ContainerApiError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// True for the failures that abort worker construction by design.
    pub fn is_fatal_startup(&self) -> bool {
        matches!(self, Self::StartupFailed { .. } | Self::ImageNotFound { .. })
    }
}
