//! Image verifiers, keyed by image type.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use crate::error::{ProviderError, ProviderResult};
use crate::provider::BoxFuture;

/// Image type used when a rollout does not name one.
pub const DEFAULT_IMAGE_TYPE: &str = "docker";

/// Checks that an image reference is real before it is rolled out.
pub trait ImageVerifier: Send + Sync {
    fn verify<'a>(&'a self, image: &'a str) -> BoxFuture<'a, ProviderResult<()>>;
}

/// Registry of verifiers by image type (`"docker"`, `"ecr"`, ...).
#[derive(Clone, Default)]
pub struct Verifiers {
    by_type: HashMap<String, Arc<dyn ImageVerifier>>,
}

impl Verifiers {
    /// An empty registry. Every rollout that verifies will fail
    /// `invalid_image_type` until a verifier is registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with [`DockerVerifier`] under `"docker"`.
    pub fn with_defaults() -> Self {
        let mut verifiers = Self::new();
        verifiers.register(DEFAULT_IMAGE_TYPE, Arc::new(DockerVerifier));
        verifiers
    }

    pub fn register(&mut self, image_type: &str, verifier: Arc<dyn ImageVerifier>) {
        self.by_type.insert(image_type.to_string(), verifier);
    }

    pub fn get(&self, image_type: &str) -> ProviderResult<Arc<dyn ImageVerifier>> {
        self.by_type
            .get(image_type)
            .cloned()
            .ok_or_else(|| ProviderError::InvalidImageType(image_type.to_string()))
    }

    /// Resolve the verifier for `image_type` and run it.
    pub async fn verify(&self, image_type: &str, image: &str) -> ProviderResult<()> {
        let verifier = self.get(image_type)?;
        verifier.verify(image).await
    }
}

/// A parsed `[registry/]repository[:tag][@digest]` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: Option<String>,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

const REFERENCE_PATTERN: &str = concat!(
    r"^(?:(?P<registry>(?:localhost|[a-zA-Z0-9-]+(?:\.[a-zA-Z0-9-]+)+)(?::[0-9]+)?)/)?",
    r"(?P<repository>[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*)*)",
    r"(?::(?P<tag>[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}))?",
    r"(?:@(?P<digest>[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,}))?$",
);

const MAX_REPOSITORY_LEN: usize = 255;

/// Parse a container image reference.
pub fn parse_reference(image: &str) -> Result<ImageReference, String> {
    let re = Regex::new(REFERENCE_PATTERN).map_err(|e| e.to_string())?;
    let caps = re
        .captures(image)
        .ok_or_else(|| "not a valid image reference".to_string())?;
    let group = |name: &str| caps.name(name).map(|m| m.as_str().to_string());

    let repository = group("repository").unwrap_or_default();
    if repository.len() > MAX_REPOSITORY_LEN {
        return Err(format!("repository name longer than {MAX_REPOSITORY_LEN} characters"));
    }
    Ok(ImageReference {
        registry: group("registry"),
        repository,
        tag: group("tag"),
        digest: group("digest"),
    })
}

/// Verifies Docker image references.
///
/// The reference must parse and must pin a tag or a digest; a bare
/// repository name would silently track whatever `latest` points to.
#[derive(Debug, Clone, Copy, Default)]
pub struct DockerVerifier;

impl ImageVerifier for DockerVerifier {
    fn verify<'a>(&'a self, image: &'a str) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            let invalid = |reason: String| ProviderError::ImageVerification {
                image: image.to_string(),
                source: reason.into(),
            };
            let reference = parse_reference(image).map_err(invalid)?;
            if reference.tag.is_none() && reference.digest.is_none() {
                return Err(invalid("image must pin a tag or digest".to_string()));
            }
            debug!(%image, repository = %reference.repository, "image reference verified");
            Ok(())
        })
    }
}
