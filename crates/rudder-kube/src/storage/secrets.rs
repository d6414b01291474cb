//! Kubernetes Secrets release store
//!
//! This is the default store. Each revision is a Secret named
//! `rudder.release.v1.<name>.v<version>` in the release namespace, labelled
//! with `name`, `status`, `version` and `owner`, holding the compressed,
//! base64-encoded release JSON under `release`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use rudder_core::Release;

use super::{
    CompressionMethod, LABEL_OWNER, ReleaseFilter, ReleaseStore, decode_release, encode_release,
    release_labels,
};
use crate::error::{KubeError, Result};

/// Secret name prefix
pub const SECRET_PREFIX: &str = "rudder.release.v1.";
/// Secret type
pub const SECRET_TYPE: &str = "rudder.io/release.v1";
/// Data key holding the encoded release
const DATA_KEY: &str = "release";

/// Kubernetes Secrets release store
pub struct SecretsStore {
    api: Api<Secret>,
    owner: String,
    compression: CompressionMethod,
}

impl SecretsStore {
    /// Store revisions as Secrets in `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            owner: "rudder".to_string(),
            compression: CompressionMethod::default(),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_compression(mut self, compression: CompressionMethod) -> Self {
        self.compression = compression;
        self
    }

    fn secret_name(key: &str) -> String {
        format!("{}{}", SECRET_PREFIX, key)
    }

    fn build_secret(&self, key: &str, release: &Release) -> Result<Secret> {
        let encoded = encode_release(release, self.compression)?;
        let data = BTreeMap::from([(DATA_KEY.to_string(), ByteString(encoded.into_bytes()))]);

        Ok(Secret {
            metadata: ObjectMeta {
                name: Some(Self::secret_name(key)),
                labels: Some(release_labels(release, &self.owner)),
                ..Default::default()
            },
            type_: Some(SECRET_TYPE.to_string()),
            data: Some(data),
            ..Default::default()
        })
    }

    fn parse_secret(secret: &Secret) -> Result<Release> {
        let data = secret
            .data
            .as_ref()
            .and_then(|d| d.get(DATA_KEY))
            .ok_or_else(|| KubeError::Storage("Secret missing 'release' data".to_string()))?;

        let encoded = std::str::from_utf8(&data.0)
            .map_err(|e| KubeError::Storage(format!("Invalid UTF-8 in secret: {}", e)))?;

        decode_release(encoded)
    }

    async fn list_by_selector(&self, selector: &str) -> Result<Vec<Release>> {
        let secrets = self.api.list(&ListParams::default().labels(selector)).await?;
        let mut releases = Vec::with_capacity(secrets.items.len());
        for secret in &secrets.items {
            match Self::parse_secret(secret) {
                Ok(release) => releases.push(release),
                Err(e) => tracing::warn!(
                    secret = secret.metadata.name.as_deref().unwrap_or_default(),
                    error = %e,
                    "skipping unreadable release secret"
                ),
            }
        }
        Ok(releases)
    }
}

fn name_from_key(key: &str) -> String {
    key.rsplit_once(".v")
        .map(|(n, _)| n)
        .unwrap_or(key)
        .to_string()
}

/// Render a label map as an equality selector
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ReleaseStore for SecretsStore {
    async fn get(&self, key: &str) -> Result<Release> {
        match self.api.get(&Self::secret_name(key)).await {
            Ok(secret) => Self::parse_secret(&secret),
            Err(kube::Error::Api(e)) if e.code == 404 => Err(KubeError::ReleaseNotFound {
                name: name_from_key(key),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, filter: ReleaseFilter<'_>) -> Result<Vec<Release>> {
        let selector = format!("{}={}", LABEL_OWNER, self.owner);
        let releases = self.list_by_selector(&selector).await?;
        Ok(releases.into_iter().filter(|r| filter(r)).collect())
    }

    async fn query(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Release>> {
        self.list_by_selector(&label_selector(labels)).await
    }

    async fn create(&self, key: &str, release: &Release) -> Result<()> {
        let secret = self.build_secret(key, release)?;
        match self.api.create(&PostParams::default(), &secret).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => Err(KubeError::ReleaseAlreadyExists {
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, key: &str, release: &Release) -> Result<()> {
        let secret = self.build_secret(key, release)?;
        match self
            .api
            .replace(&Self::secret_name(key), &PostParams::default(), &secret)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Err(KubeError::ReleaseNotFound {
                name: name_from_key(key),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<Release> {
        let release = self.get(key).await?;
        match self
            .api
            .delete(&Self::secret_name(key), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(release),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(release),
            Err(e) => Err(e.into()),
        }
    }
}
