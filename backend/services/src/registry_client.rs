//! Minimal Docker Registry v2 client: tag listing and manifest deletion.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{ServiceError, ServiceResult};

const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
const DIGEST_HEADER: &str = "Docker-Content-Digest";

/// The image registry as seen by the controller and the agents.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Whether `repo:tag` is published.
    async fn has_image(&self, reference: &str) -> ServiceResult<bool>;
    /// Deletes the manifest `repo:tag` points at.
    async fn remove_image(&self, reference: &str) -> ServiceResult<()>;
    /// Reference an engine should pull, prefixed with the registry address.
    fn pull_reference(&self, reference: &str) -> String;
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

pub struct RegistryClient {
    client: reqwest::Client,
    addr: String,
    base_url: String,
    username: String,
    password: String,
}

impl RegistryClient {
    pub fn new(addr: &str, secure: bool, username: &str, password: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(!secure)
            .build()
            .context("Failed to build registry client")?;
        let scheme = if secure { "https" } else { "http" };
        Ok(Self {
            client,
            addr: addr.to_owned(),
            base_url: format!("{}://{}", scheme, addr),
            username: username.to_owned(),
            password: password.to_owned(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        log::debug!("registry {} {}", method, url);
        let builder = self.client.request(method, url);
        if self.username.is_empty() {
            builder
        } else {
            builder.basic_auth(&self.username, Some(&self.password))
        }
    }

    pub async fn tags(&self, repo: &str) -> ServiceResult<Vec<String>> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/v2/{}/tags/list", repo))
            .send()
            .await
            .map_err(registry_error)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let resp = resp.error_for_status().map_err(registry_error)?;
        let list: TagList = resp.json().await.map_err(registry_error)?;
        Ok(list.tags.unwrap_or_default())
    }

    pub async fn manifest_digest(&self, repo: &str, tag: &str) -> ServiceResult<String> {
        let resp = self
            .request(reqwest::Method::HEAD, &format!("/v2/{}/manifests/{}", repo, tag))
            .header(reqwest::header::ACCEPT, MANIFEST_V2)
            .send()
            .await
            .map_err(registry_error)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ServiceError::NotFound(format!("{}:{}", repo, tag)));
        }
        let resp = resp.error_for_status().map_err(registry_error)?;
        resp.headers()
            .get(DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| ServiceError::internal(format!("registry sent no digest for {}:{}", repo, tag)))
    }

    pub async fn delete_manifest(&self, repo: &str, digest: &str) -> ServiceResult<()> {
        self.request(reqwest::Method::DELETE, &format!("/v2/{}/manifests/{}", repo, digest))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(registry_error)?;
        Ok(())
    }
}

#[async_trait]
impl ImageRegistry for RegistryClient {
    async fn has_image(&self, reference: &str) -> ServiceResult<bool> {
        let (repo, tag) = split_reference(reference)?;
        Ok(self.tags(repo).await?.iter().any(|t| t == tag))
    }

    async fn remove_image(&self, reference: &str) -> ServiceResult<()> {
        let (repo, tag) = split_reference(reference)?;
        let digest = self.manifest_digest(repo, tag).await?;
        self.delete_manifest(repo, &digest).await.map_err(|e| {
            log::warn!("delete manifest image={} digest={}: {}", reference, digest, e);
            e
        })
    }

    fn pull_reference(&self, reference: &str) -> String {
        format!("{}/{}", self.addr, reference)
    }
}

fn registry_error(err: reqwest::Error) -> ServiceError {
    ServiceError::internal(format!("registry: {}", err))
}

/// Splits `repo:tag`. A colon inside a `host:port/` prefix is not a tag.
pub fn split_reference(reference: &str) -> ServiceResult<(&str, &str)> {
    match reference.rsplit_once(':') {
        Some((repo, tag)) if !repo.is_empty() && !tag.is_empty() && !tag.contains('/') => {
            Ok((repo, tag))
        }
        _ => Err(ServiceError::invalid(format!("image reference {}", reference))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_split_on_the_tag_colon() {
        assert_eq!(split_reference("nginx:1.25").unwrap(), ("nginx", "1.25"));
        assert_eq!(
            split_reference("10.0.0.1:5000/app/web:v2").unwrap(),
            ("10.0.0.1:5000/app/web", "v2")
        );
        assert!(split_reference("10.0.0.1:5000/app").is_err());
        assert!(split_reference("nginx").is_err());
        assert!(split_reference("nginx:").is_err());
    }

    #[test]
    fn pull_reference_is_prefixed_with_registry_address() {
        let client = RegistryClient::new("127.0.0.1:5000", false, "", "").unwrap();
        assert_eq!(client.pull_reference("web:1"), "127.0.0.1:5000/web:1");
    }
}
