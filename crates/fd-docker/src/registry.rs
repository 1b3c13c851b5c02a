//! Registry v2 manifest digest lookup.

use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, WWW_AUTHENTICATE};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";
const DIGEST_HEADER: &str = "Docker-Content-Digest";

const MANIFEST_TYPES: &str = concat!(
    "application/vnd.oci.image.index.v1+json, ",
    "application/vnd.docker.distribution.manifest.list.v2+json, ",
    "application/vnd.oci.image.manifest.v1+json, ",
    "application/vnd.docker.distribution.manifest.v2+json"
);

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    #[error("Registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Registry returned {status} for {image}")]
    Status { image: String, status: StatusCode },

    #[error("Unsupported registry auth challenge: {0}")]
    Challenge(String),

    #[error("Registry response for {0} has no digest")]
    MissingDigest(String),
}

/// A parsed `[registry/]repository[:tag|@digest]` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    /// Tag, or a digest for pinned references.
    pub reference: String,
}

impl ImageReference {
    pub fn parse(image: &str) -> Result<Self, RegistryError> {
        let image = image.trim();
        if image.is_empty() {
            return Err(RegistryError::InvalidReference(image.to_string()));
        }

        let (name, reference) = match image.split_once('@') {
            Some((name, digest)) => (name, digest.to_string()),
            None => {
                let last_slash = image.rfind('/').map(|i| i + 1).unwrap_or(0);
                match image[last_slash..].rfind(':') {
                    Some(colon) => {
                        let colon = last_slash + colon;
                        (&image[..colon], image[colon + 1..].to_string())
                    }
                    None => (image, "latest".to_string()),
                }
            }
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DOCKER_HUB_REGISTRY.to_string(), name.to_string()),
        };
        let registry = match registry.as_str() {
            "docker.io" | "index.docker.io" => DOCKER_HUB_REGISTRY.to_string(),
            _ => registry,
        };
        let repository = if registry == DOCKER_HUB_REGISTRY && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };

        if repository.is_empty() || reference.is_empty() {
            return Err(RegistryError::InvalidReference(image.to_string()));
        }
        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    pub fn is_digest(&self) -> bool {
        self.reference.contains(':')
    }

    fn manifest_url(&self) -> String {
        format!(
            "https://{}/v2/{}/manifests/{}",
            self.registry, self.repository, self.reference
        )
    }
}

/// Parsed `WWW-Authenticate: Bearer realm=...,service=...,scope=...`.
#[derive(Debug, Default, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

fn parse_challenge(header: &str) -> Option<BearerChallenge> {
    let params = header.trim().strip_prefix("Bearer ")?;
    let mut challenge = BearerChallenge::default();
    let mut rest = params.trim();
    while !rest.is_empty() {
        let (key, after) = rest.split_once('=')?;
        let after = after.strip_prefix('"')?;
        let (value, tail) = after.split_once('"')?;
        match key.trim() {
            "realm" => challenge.realm = value.to_string(),
            "service" => challenge.service = Some(value.to_string()),
            "scope" => challenge.scope = Some(value.to_string()),
            _ => {}
        }
        rest = tail.trim_start_matches(',').trim();
    }
    (!challenge.realm.is_empty()).then_some(challenge)
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Looks up the digest a registry currently serves for an image tag.
#[derive(Clone, Default)]
pub struct RegistryClient {
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn latest_digest(&self, image: &str) -> Result<String, RegistryError> {
        let reference = ImageReference::parse(image)?;
        if reference.is_digest() {
            return Ok(reference.reference);
        }

        let url = reference.manifest_url();
        let resp = self.http.head(&url).header(ACCEPT, MANIFEST_TYPES).send().await?;

        let resp = if resp.status() == StatusCode::UNAUTHORIZED {
            let token = self.fetch_token(image, resp.headers()).await?;
            self.http
                .head(&url)
                .header(ACCEPT, MANIFEST_TYPES)
                .header(AUTHORIZATION, format!("Bearer {token}"))
                .send()
                .await?
        } else {
            resp
        };

        if !resp.status().is_success() {
            return Err(RegistryError::Status {
                image: image.to_string(),
                status: resp.status(),
            });
        }

        let digest = resp
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| RegistryError::MissingDigest(image.to_string()))?;
        debug!(image, digest, "Resolved registry digest");
        Ok(digest.to_string())
    }

    async fn fetch_token(&self, image: &str, headers: &HeaderMap) -> Result<String, RegistryError> {
        let header = headers
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let challenge =
            parse_challenge(header).ok_or_else(|| RegistryError::Challenge(header.to_string()))?;

        let mut query = Vec::new();
        if let Some(ref service) = challenge.service {
            query.push(("service", service.as_str()));
        }
        if let Some(ref scope) = challenge.scope {
            query.push(("scope", scope.as_str()));
        }
        let resp = self.http.get(&challenge.realm).query(&query).send().await?;
        if !resp.status().is_success() {
            return Err(RegistryError::Status {
                image: image.to_string(),
                status: resp.status(),
            });
        }
        let body: TokenResponse = resp.json().await?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| RegistryError::Challenge("token response without a token".to_string()))
    }
}

/// The digest part of a `repo@sha256:...` entry.
pub fn repo_digest(entry: &str) -> Option<&str> {
    match entry.split_once('@') {
        Some((_, digest)) if !digest.is_empty() && !digest.contains('@') => Some(digest),
        Some(_) => None,
        None => Some(entry),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(image: &str) -> (String, String, String) {
        let r = ImageReference::parse(image).unwrap();
        (r.registry, r.repository, r.reference)
    }

    #[test]
    fn test_docker_hub_official_image() {
        assert_eq!(
            parsed("nginx"),
            (DOCKER_HUB_REGISTRY.into(), "library/nginx".into(), "latest".into())
        );
        assert_eq!(
            parsed("docker.io/redis:7"),
            (DOCKER_HUB_REGISTRY.into(), "library/redis".into(), "7".into())
        );
    }

    #[test]
    fn test_user_repo_and_custom_registry() {
        assert_eq!(
            parsed("grafana/grafana:10.4.1"),
            (DOCKER_HUB_REGISTRY.into(), "grafana/grafana".into(), "10.4.1".into())
        );
        assert_eq!(
            parsed("ghcr.io/acme/api:v2"),
            ("ghcr.io".into(), "acme/api".into(), "v2".into())
        );
        assert_eq!(
            parsed("localhost:5000/tools/builder"),
            ("localhost:5000".into(), "tools/builder".into(), "latest".into())
        );
    }

    #[test]
    fn test_pinned_digest() {
        let r = ImageReference::parse("nginx@sha256:abc123").unwrap();
        assert!(r.is_digest());
        assert_eq!(r.reference, "sha256:abc123");
        assert!(ImageReference::parse("  ").is_err());
    }

    #[test]
    fn test_parse_bearer_challenge() {
        let header = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull""#;
        let challenge = parse_challenge(header).unwrap();
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(challenge.scope.as_deref(), Some("repository:library/nginx:pull"));

        assert!(parse_challenge(r#"Basic realm="x""#).is_none());
    }

    #[test]
    fn test_repo_digest() {
        assert_eq!(repo_digest("nginx@sha256:feed"), Some("sha256:feed"));
        assert_eq!(repo_digest("sha256:feed"), Some("sha256:feed"));
        assert_eq!(repo_digest("nginx@"), None);
        assert_eq!(repo_digest("a@b@c"), None);
    }
}
