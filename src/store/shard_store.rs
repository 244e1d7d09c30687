//! Content-addressed shard blob store.
//!
//! Shards live under `{root}/models/{model-id}/shard_NNN.bin` next to the
//! model's `manifest.json`. Writes are atomic (temp file + rename) and may
//! verify the content hash before the file is finalized; a mismatch deletes
//! the freshly written blob. Reads support an aligned fast path: offsets are
//! rounded down to 4 KiB, and unaligned requests slice the enlarged read.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::manifest::Manifest;
use crate::store::hasher::HashAlgorithm;

/// Alignment of the synchronous read fast path.
pub const READ_ALIGNMENT: u64 = 4096;

/// Expected content hash for a verified write.
#[derive(Debug, Clone, Copy)]
pub struct ShardCheck<'a> {
    pub expected_hex: &'a str,
    pub algorithm: HashAlgorithm,
}

/// Result of a full-model integrity pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Shard indices with no file on disk.
    pub missing: Vec<u32>,
    /// Shard indices whose content hash mismatches the manifest.
    pub corrupt: Vec<u32>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.corrupt.is_empty()
    }
}

/// Persistent shard store rooted at a storage directory.
#[derive(Debug, Clone)]
pub struct ShardStore {
    root: PathBuf,

    /// Storage quota in bytes; `None` disables the pre-check.
    quota_bytes: Option<u64>,
}

impl ShardStore {
    /// Open (or create) the store under `root`.
    pub async fn open(root: impl Into<PathBuf>, quota_bytes: Option<u64>) -> EngineResult<Self> {
        let root = root.into();
        for sub in ["models", "download-state"] {
            fs::create_dir_all(root.join(sub)).await.map_err(|e| {
                EngineError::StoreUnavailable {
                    path: root.display().to_string(),
                    reason: e.to_string(),
                }
            })?;
        }
        info!(root = %root.display(), "shard store opened");
        Ok(Self { root, quota_bytes })
    }

    /// Directory holding one model's manifest and shards.
    pub fn model_dir(&self, model_id: &str) -> PathBuf {
        self.root.join("models").join(sanitize_model_id(model_id))
    }

    /// Path of one shard file: `shard_NNN.bin`, 3-digit zero-padded.
    pub fn shard_path(&self, model_id: &str, index: u32) -> PathBuf {
        self.model_dir(model_id).join(format!("shard_{index:03}.bin"))
    }

    /// Path of the persisted download-state blob for a model.
    pub fn download_state_path(&self, model_id: &str) -> PathBuf {
        self.root
            .join("download-state")
            .join(format!("{}.json", sanitize_model_id(model_id)))
    }

    /// Create the model's directory if needed.
    pub async fn open_model(&self, model_id: &str) -> EngineResult<()> {
        fs::create_dir_all(self.model_dir(model_id)).await?;
        Ok(())
    }

    /// Write a shard atomically.
    ///
    /// With `check`, the content hash is computed before finalizing; a
    /// mismatch fails `IntegrityFailure` and leaves no file behind. The
    /// quota pre-check runs before any byte lands.
    pub async fn write_shard(
        &self,
        model_id: &str,
        index: u32,
        data: &[u8],
        check: Option<ShardCheck<'_>>,
    ) -> EngineResult<()> {
        if let Some(quota) = self.quota_bytes {
            let used = self.usage_bytes().await?;
            let available = quota.saturating_sub(used);
            if (data.len() as u64) > available {
                return Err(EngineError::QuotaExceeded {
                    requested: data.len() as u64,
                    available,
                });
            }
        }

        if let Some(check) = check {
            let computed = check
                .algorithm
                .digest_hex_blocking(Bytes::copy_from_slice(data))
                .await;
            if !computed.eq_ignore_ascii_case(check.expected_hex) {
                warn!(model_id, shard = index, "integrity failure on write");
                return Err(EngineError::IntegrityFailure {
                    shard: index,
                    expected: check.expected_hex.to_string(),
                    computed,
                });
            }
        }

        self.open_model(model_id).await?;
        let final_path = self.shard_path(model_id, index);
        let tmp_path = final_path.with_extension("bin.part");

        fs::write(&tmp_path, data).await?;
        fs::rename(&tmp_path, &final_path).await?;

        debug!(
            model_id,
            shard = index,
            bytes = data.len(),
            path = %final_path.display(),
            "shard written"
        );
        Ok(())
    }

    /// Read a whole shard.
    pub async fn read_shard(&self, model_id: &str, index: u32) -> EngineResult<Bytes> {
        let path = self.shard_path(model_id, index);
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(EngineError::NotFound(
                format!("shard {index} of model {model_id}"),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Read `length` bytes at `offset` within a shard.
    ///
    /// Aligned requests go straight through; unaligned ones read the
    /// enclosing aligned window and slice out the requested range.
    pub async fn read_range(
        &self,
        model_id: &str,
        index: u32,
        offset: u64,
        length: u64,
    ) -> EngineResult<Bytes> {
        let path = self.shard_path(model_id, index);
        let mut file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::NotFound(format!(
                    "shard {index} of model {model_id}"
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata().await?.len();
        let end = offset
            .checked_add(length)
            .filter(|&e| e <= file_len)
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "range {offset}..{} past end of shard {index} ({file_len} bytes)",
                    offset.saturating_add(length)
                ))
            })?;

        let aligned_start = offset - (offset % READ_ALIGNMENT);
        let aligned_end = end
            .div_ceil(READ_ALIGNMENT)
            .saturating_mul(READ_ALIGNMENT)
            .min(file_len);

        file.seek(std::io::SeekFrom::Start(aligned_start)).await?;
        let mut buf = vec![0u8; (aligned_end - aligned_start) as usize];
        file.read_exact(&mut buf).await?;

        let skip = (offset - aligned_start) as usize;
        Ok(Bytes::from(buf).slice(skip..skip + length as usize))
    }

    /// Whether a shard file exists.
    pub async fn shard_exists(&self, model_id: &str, index: u32) -> bool {
        fs::try_exists(self.shard_path(model_id, index))
            .await
            .unwrap_or(false)
    }

    /// Remove a model's directory (manifest and every shard) and its
    /// download state.
    pub async fn delete_model(&self, model_id: &str) -> EngineResult<()> {
        let dir = self.model_dir(model_id);
        if fs::try_exists(&dir).await? {
            fs::remove_dir_all(&dir).await?;
            info!(model_id, "model deleted from store");
        }
        let state = self.download_state_path(model_id);
        if fs::try_exists(&state).await? {
            fs::remove_file(&state).await?;
        }
        Ok(())
    }

    /// List model ids (sanitized directory names) present in the store.
    pub async fn list_models(&self) -> EngineResult<Vec<String>> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(self.root.join("models")).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.metadata().await?.is_dir() {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Total bytes on disk under the models root.
    pub async fn usage_bytes(&self) -> EngineResult<u64> {
        let mut total = 0u64;
        let mut entries = fs::read_dir(self.root.join("models")).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.metadata().await?.is_dir() {
                let mut files = fs::read_dir(entry.path()).await?;
                while let Some(file) = files.next_entry().await? {
                    let meta = file.metadata().await?;
                    if meta.is_file() {
                        total += meta.len();
                    }
                }
            }
        }
        Ok(total)
    }

    /// Persist a model's manifest next to its shards.
    pub async fn save_manifest(&self, model_id: &str, manifest_json: &str) -> EngineResult<()> {
        self.open_model(model_id).await?;
        let path = self.model_dir(model_id).join("manifest.json");
        fs::write(&path, manifest_json).await?;
        Ok(())
    }

    /// Load a model's persisted manifest JSON.
    pub async fn load_manifest(&self, model_id: &str) -> EngineResult<String> {
        let path = self.model_dir(model_id).join("manifest.json");
        match fs::read_to_string(&path).await {
            Ok(s) => Ok(s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(EngineError::NotFound(
                format!("manifest for model {model_id}"),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Full integrity pass: every shard present and matching its hash.
    pub async fn verify_model(
        &self,
        model_id: &str,
        manifest: &Manifest,
        algorithm: HashAlgorithm,
    ) -> EngineResult<VerifyReport> {
        let mut report = VerifyReport::default();
        for shard in &manifest.shards {
            if !self.shard_exists(model_id, shard.index).await {
                report.missing.push(shard.index);
                continue;
            }
            let data = self.read_shard(model_id, shard.index).await?;
            let computed = algorithm.digest_hex_blocking(data).await;
            if !computed.eq_ignore_ascii_case(&shard.hash) {
                report.corrupt.push(shard.index);
            }
        }
        if !report.is_clean() {
            warn!(
                model_id,
                missing = report.missing.len(),
                corrupt = report.corrupt.len(),
                "model failed integrity verification"
            );
        }
        Ok(report)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Map a model id onto a filesystem-safe directory name.
pub fn sanitize_model_id(model_id: &str) -> String {
    model_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
