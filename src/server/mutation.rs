use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;

use crate::server::oci::{parse_image, ParseError};
use crate::server::transform::{ContainerTransformer, TransformError};

/// Which container list of a pod spec a container belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Regular,
    Init,
    Ephemeral,
}

impl ContainerKind {
    /// Pod spec field holding containers of this kind
    pub fn field(&self) -> &'static str {
        match self {
            ContainerKind::Regular => "containers",
            ContainerKind::Init => "initContainers",
            ContainerKind::Ephemeral => "ephemeralContainers",
        }
    }
}

/// New image for one container slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEdit {
    pub kind: ContainerKind,
    pub index: usize,
    /// Container name, for logging
    pub container: String,
    pub image: String,
}

impl ContainerEdit {
    /// JSON pointer to the image field this edit replaces
    pub fn path(&self) -> PointerBuf {
        let index = self.index.to_string();
        PointerBuf::from_tokens(["spec", self.kind.field(), index.as_str(), "image"])
    }
}

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("container {container:?} has an invalid image {image:?}: {reason}")]
    Decode {
        container: String,
        image: String,
        #[source]
        reason: ParseError,
    },

    #[error(transparent)]
    Transform(#[from] TransformError),
}

/// Compute the image edits for a pod
///
/// Containers are visited in a fixed order: regular containers, then init
/// containers, then ephemeral containers, each in declaration order. The
/// returned edits follow the same order. Any image that fails to parse aborts
/// the whole pod.
pub async fn mutate(
    pod: &Pod,
    transformer: &dyn ContainerTransformer,
) -> Result<Vec<ContainerEdit>, MutationError> {
    let Some(spec) = &pod.spec else {
        return Ok(Vec::new());
    };

    let mut slots: Vec<(ContainerKind, usize, &str, Option<&str>)> = Vec::new();
    for (index, c) in spec.containers.iter().enumerate() {
        slots.push((ContainerKind::Regular, index, c.name.as_str(), c.image.as_deref()));
    }
    for (index, c) in spec.init_containers.iter().flatten().enumerate() {
        slots.push((ContainerKind::Init, index, c.name.as_str(), c.image.as_deref()));
    }
    for (index, c) in spec.ephemeral_containers.iter().flatten().enumerate() {
        slots.push((ContainerKind::Ephemeral, index, c.name.as_str(), c.image.as_deref()));
    }

    let mut edits = Vec::new();
    for (kind, index, name, image) in slots {
        let Some(image) = image else {
            continue;
        };

        let source = parse_image(image).map_err(|reason| MutationError::Decode {
            container: name.to_string(),
            image: image.to_string(),
            reason,
        })?;

        if let Some(target) = transformer.transform(&source).await? {
            edits.push(ContainerEdit {
                kind,
                index,
                container: name.to_string(),
                image: target.to_string(),
            });
        }
    }

    Ok(edits)
}
