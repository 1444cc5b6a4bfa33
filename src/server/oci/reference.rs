use oci_distribution::{ParseError, Reference};

/// Registry assumed when an image reference does not name one
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Parse an image reference, folding Docker Hub host aliases into `docker.io`
///
/// `nginx:1.21` becomes `docker.io/library/nginx:1.21`. Formatting the result
/// yields a pull spec equivalent to the input, though not necessarily the
/// same string.
pub fn parse_image(image: &str) -> Result<Reference, ParseError> {
    let reference = Reference::try_from(image)?;

    let registry = normalize_registry(reference.registry());
    if registry == reference.registry() {
        return Ok(reference);
    }

    // Re-parse under the canonical host so official images gain `library/`
    Reference::try_from(pull_spec(
        &format!("{}/{}", registry, reference.repository()),
        &reference,
    ))
}

/// Registry and repository joined, e.g. `docker.io/library/nginx`
pub fn image_name(reference: &Reference) -> String {
    format!("{}/{}", reference.registry(), reference.repository())
}

/// Build a reference with a different name but the same tag and digest
pub fn with_name(reference: &Reference, name: &str) -> Result<Reference, ParseError> {
    parse_image(&pull_spec(name, reference))
}

/// Normalise a registry hostname, folding Docker Hub aliases into `docker.io`
pub fn normalize_registry(host: &str) -> &str {
    match host {
        "index.docker.io" | "registry-1.docker.io" | "hub.docker.com" => DEFAULT_REGISTRY,
        other => other,
    }
}

fn pull_spec(name: &str, reference: &Reference) -> String {
    let mut spec = name.to_string();
    if let Some(tag) = reference.tag() {
        spec.push(':');
        spec.push_str(tag);
    }
    if let Some(digest) = reference.digest() {
        spec.push('@');
        spec.push_str(digest);
    }
    spec
}
