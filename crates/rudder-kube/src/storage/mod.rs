//! Release stores
//!
//! Each revision is an immutable record keyed `<name>.v<version>`. Drivers:
//! - **Secrets** (default): one Kubernetes Secret per revision
//! - **Memory**: in-process, for tests and dry runs
//!
//! `Storage` layers the release-level queries (history, last, deployed,
//! purge, pruning) over any driver.

mod memory;
mod secrets;

pub use memory::{MemoryStore, OperationCounts};
pub use secrets::SecretsStore;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rudder_core::{Release, Status};

use crate::error::{KubeError, Result};

/// System label: release name
pub const LABEL_NAME: &str = "name";
/// System label: release status
pub const LABEL_STATUS: &str = "status";
/// System label: revision number
pub const LABEL_VERSION: &str = "version";
/// System label: managing tool
pub const LABEL_OWNER: &str = "owner";

/// Predicate for `ReleaseStore::list`
pub type ReleaseFilter<'a> = &'a (dyn Fn(&Release) -> bool + Send + Sync);

/// Keyed CRUD plus label queries over revisions
///
/// Implementations must reject a duplicate key on `create`; concurrent
/// operations on one release rely on it.
#[async_trait]
pub trait ReleaseStore: Send + Sync {
    /// Get a revision by key
    async fn get(&self, key: &str) -> Result<Release>;

    /// All revisions matching the filter
    async fn list(&self, filter: ReleaseFilter<'_>) -> Result<Vec<Release>>;

    /// Revisions whose labels contain every entry of `labels`
    async fn query(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Release>>;

    /// Create a revision; `ReleaseAlreadyExists` if the key is taken
    async fn create(&self, key: &str, release: &Release) -> Result<()>;

    /// Update a revision; `ReleaseNotFound` if missing
    async fn update(&self, key: &str, release: &Release) -> Result<()>;

    /// Delete a revision and return it
    async fn delete(&self, key: &str) -> Result<Release>;
}

/// Labels stored alongside a revision
///
/// System labels win over custom labels with the same key.
pub fn release_labels(release: &Release, owner: &str) -> BTreeMap<String, String> {
    let mut labels = release.labels.clone();
    labels.insert(LABEL_NAME.to_string(), release.name.clone());
    labels.insert(LABEL_STATUS.to_string(), release.status().to_string());
    labels.insert(LABEL_VERSION.to_string(), release.version.to_string());
    labels.insert(LABEL_OWNER.to_string(), owner.to_string());
    labels
}

/// Check custom labels for reserved keys
pub fn validate_custom_labels(labels: &BTreeMap<String, String>) -> Result<()> {
    let reserved: Vec<&str> = [LABEL_NAME, LABEL_STATUS, LABEL_VERSION, LABEL_OWNER]
        .into_iter()
        .filter(|k| labels.contains_key(*k))
        .collect();
    if reserved.is_empty() {
        Ok(())
    } else {
        Err(KubeError::InvalidConfig(format!(
            "user-defined labels cannot use reserved keys: {}",
            reserved.join(", ")
        )))
    }
}

/// Release-level operations over a `ReleaseStore`
#[derive(Clone)]
pub struct Storage {
    driver: Arc<dyn ReleaseStore>,
    owner: String,
}

impl Storage {
    pub fn new(driver: Arc<dyn ReleaseStore>, owner: impl Into<String>) -> Self {
        Self {
            driver,
            owner: owner.into(),
        }
    }

    pub fn driver(&self) -> &Arc<dyn ReleaseStore> {
        &self.driver
    }

    pub async fn get(&self, name: &str, version: u32) -> Result<Release> {
        self.driver.get(&Release::key_for(name, version)).await
    }

    pub async fn create(&self, release: &Release) -> Result<()> {
        tracing::debug!(release = %release.name, revision = release.version, "creating release record");
        self.driver.create(&release.key(), release).await
    }

    pub async fn update(&self, release: &Release) -> Result<()> {
        tracing::debug!(
            release = %release.name,
            revision = release.version,
            status = %release.status(),
            "updating release record"
        );
        self.driver.update(&release.key(), release).await
    }

    pub async fn delete(&self, name: &str, version: u32) -> Result<Release> {
        self.driver.delete(&Release::key_for(name, version)).await
    }

    fn name_query(&self, name: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_NAME.to_string(), name.to_string()),
            (LABEL_OWNER.to_string(), self.owner.clone()),
        ])
    }

    /// All revisions of a release, oldest first
    pub async fn history(&self, name: &str) -> Result<Vec<Release>> {
        let mut releases = self.driver.query(&self.name_query(name)).await?;
        releases.sort_by_key(|r| r.version);
        Ok(releases)
    }

    /// Highest revision of a release
    pub async fn last(&self, name: &str) -> Result<Release> {
        self.history(name)
            .await?
            .pop()
            .ok_or_else(|| KubeError::ReleaseNotFound {
                name: name.to_string(),
            })
    }

    /// Every revision currently `deployed`, oldest first
    pub async fn deployed_all(&self, name: &str) -> Result<Vec<Release>> {
        let mut query = self.name_query(name);
        query.insert(LABEL_STATUS.to_string(), Status::Deployed.to_string());
        let mut releases = self.driver.query(&query).await?;
        releases.sort_by_key(|r| r.version);
        Ok(releases)
    }

    /// Highest `deployed` revision
    pub async fn deployed(&self, name: &str) -> Result<Release> {
        self.deployed_all(name)
            .await?
            .pop()
            .ok_or_else(|| KubeError::ReleaseNotFound {
                name: name.to_string(),
            })
    }

    /// Delete every revision of a release
    pub async fn purge(&self, name: &str) -> Result<Vec<Release>> {
        let mut deleted = Vec::new();
        let mut errors = Vec::new();
        for release in self.history(name).await? {
            match self.driver.delete(&release.key()).await {
                Ok(r) => deleted.push(r),
                Err(e) => errors.push(e),
            }
        }
        match KubeError::join(errors) {
            Some(e) => Err(e),
            None => Ok(deleted),
        }
    }

    /// Delete the oldest revisions beyond `max_history`
    ///
    /// `0` keeps everything. Deployed revisions are never pruned.
    pub async fn prune(&self, name: &str, max_history: usize) -> Result<Vec<u32>> {
        if max_history == 0 {
            return Ok(Vec::new());
        }
        let history = self.history(name).await?;
        let mut excess = history.len().saturating_sub(max_history);
        let mut pruned = Vec::new();

        for release in &history {
            if excess == 0 {
                break;
            }
            if release.status() == Status::Deployed {
                continue;
            }
            self.driver.delete(&release.key()).await?;
            pruned.push(release.version);
            excess -= 1;
        }

        if !pruned.is_empty() {
            tracing::debug!(release = %name, revisions = ?pruned, "pruned release history");
        }
        Ok(pruned)
    }
}

/// Compression method for stored release data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMethod {
    None,

    /// Gzip compression (Helm-compatible)
    Gzip { level: u32 },

    /// Zstd compression
    #[default]
    Zstd,
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Compress data using the configured method
pub fn compress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Gzip { level } => {
            use std::io::Write;
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(level));
            encoder
                .write_all(data)
                .map_err(|e| KubeError::Compression(e.to_string()))?;
            encoder
                .finish()
                .map_err(|e| KubeError::Compression(e.to_string()))
        }
        CompressionMethod::Zstd => zstd::encode_all(std::io::Cursor::new(data), 3)
            .map_err(|e| KubeError::Compression(e.to_string())),
    }
}

/// Decompress data, detecting the format from its magic bytes
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.starts_with(&ZSTD_MAGIC) {
        zstd::decode_all(std::io::Cursor::new(data))
            .map_err(|e| KubeError::Compression(e.to_string()))
    } else if data.starts_with(&GZIP_MAGIC) {
        use std::io::Read;
        let mut decoder = flate2::read::GzDecoder::new(data);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| KubeError::Compression(e.to_string()))?;
        Ok(out)
    } else {
        Ok(data.to_vec())
    }
}

/// Encode a release for storage (json + compress + base64)
pub fn encode_release(release: &Release, method: CompressionMethod) -> Result<String> {
    let json = serde_json::to_vec(release)?;
    let compressed = compress(&json, method)?;
    Ok(base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        compressed,
    ))
}

/// Decode a stored release (base64 + decompress + json)
pub fn decode_release(data: &str) -> Result<Release> {
    let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, data.trim())
        .map_err(|e| KubeError::Serialization(format!("base64 decode error: {}", e)))?;
    let json = decompress(&decoded)?;
    Ok(serde_json::from_slice(&json)?)
}
