pub mod cache;
pub mod harbor;
pub mod models;
pub mod providers;

pub use providers::{DynamicTransformer, StaticTransformer};

use crate::server::oci::{self, ParseError, Reference};
use async_trait::async_trait;
use thiserror::Error;

/// Error raised when a transformer cannot produce a valid target reference
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("rewriting {image} produced an invalid reference {target:?}: {reason}")]
    InvalidTarget {
        image: String,
        target: String,
        #[source]
        reason: ParseError,
    },
}

/// Reported by [`ContainerTransformer::ready`] while a transformer cannot serve requests
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("transformer not ready: {0}")]
pub struct NotReady(pub String);

/// Trait for image transformation strategies
///
/// Exactly one transformer is active per process. It is shared by every
/// admission request, so implementations must be safe to call concurrently.
#[async_trait]
pub trait ContainerTransformer: Send + Sync {
    /// Decide the pull location for an image
    ///
    /// # Returns
    /// `Some(target)` when the image should be rewritten, `None` to leave it unchanged
    async fn transform(
        &self,
        image: &Reference,
    ) -> Result<Option<Reference>, TransformError>;

    /// Whether the transformer can currently serve transformations
    fn ready(&self) -> Result<(), NotReady>;

    /// Short name used in logs (e.g., "static", "dynamic")
    fn transformer_type(&self) -> &str;
}

/// Rebuild `image` under `target_name`, keeping its tag and digest
///
/// Returns `None` if the result is identical to the input.
pub(crate) fn retarget(
    image: &Reference,
    target_name: &str,
) -> Result<Option<Reference>, TransformError> {
    let target =
        oci::with_name(image, target_name).map_err(|reason| TransformError::InvalidTarget {
            image: image.to_string(),
            target: target_name.to_string(),
            reason,
        })?;

    if &target == image {
        Ok(None)
    } else {
        Ok(Some(target))
    }
}
