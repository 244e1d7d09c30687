//! Resumable shard download.
//!
//! Fetches a model's shards with bounded concurrency, verifies each against
//! its manifest hash, and checkpoints state after every shard so an
//! interrupted download resumes where it left off. Transient failures are
//! retried with exponential backoff; cancellation checkpoints the state as
//! paused.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::DownloadConfig;
use crate::error::{EngineError, EngineResult};
use crate::manifest::{Manifest, ShardRecord};
use crate::store::hasher::HashAlgorithm;
use crate::store::shard_store::{ShardCheck, ShardStore};
use crate::transport::ShardTransport;

/// Download lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Downloading,
    Paused,
    Completed,
    Error,
}

/// Persisted per-model download state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadState {
    pub base_url: String,
    pub completed: BTreeSet<u32>,
    pub status: DownloadStatus,
    pub last_error: Option<String>,
}

impl DownloadState {
    fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            completed: BTreeSet::new(),
            status: DownloadStatus::Downloading,
            last_error: None,
        }
    }
}

/// Snapshot handed to the progress callback.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub completed_shards: usize,
    pub total_shards: usize,
    pub bytes_done: u64,
    pub total_bytes: u64,
    pub bytes_per_sec: Option<f64>,
    pub status: DownloadStatus,
}

/// Progress callback type.
pub type ProgressFn = Arc<dyn Fn(&DownloadProgress) + Send + Sync>;

/// Orchestrates the shard fetch for one model.
pub struct Downloader {
    store: ShardStore,
    config: DownloadConfig,
}

struct Tracker {
    state: DownloadState,
    bytes_done: u64,
    speed_window_start: Instant,
    speed_window_bytes: u64,
    bytes_per_sec: Option<f64>,
}

impl Downloader {
    pub fn new(store: ShardStore, config: DownloadConfig) -> Self {
        Self { store, config }
    }

    /// Download every missing shard of `manifest` from `base_url`.
    ///
    /// Resumes from persisted state when present; the completed set is
    /// cross-checked against the store first, so evicted shards are
    /// rescheduled. On success the state blob is removed.
    pub async fn download(
        &self,
        model_id: &str,
        manifest: &Manifest,
        base_url: &str,
        transport: Arc<dyn ShardTransport>,
        on_progress: Option<ProgressFn>,
        cancel: &CancelToken,
    ) -> EngineResult<()> {
        let algorithm = HashAlgorithm::negotiate(manifest.hash_algorithm.as_deref())?;
        let mut state = self.load_state(model_id).await.unwrap_or_else(|| {
            debug!(model_id, "no prior download state, starting fresh");
            DownloadState::new(base_url)
        });
        state.base_url = base_url.to_string();
        state.status = DownloadStatus::Downloading;
        state.last_error = None;

        // Cross-check resume state against the store: entries may have
        // been evicted since the last checkpoint.
        let mut confirmed = BTreeSet::new();
        for &index in &state.completed {
            if self.store.shard_exists(model_id, index).await {
                confirmed.insert(index);
            } else {
                warn!(model_id, shard = index, "completed shard missing from store, rescheduling");
            }
        }
        state.completed = confirmed;

        self.store
            .save_manifest(model_id, &serde_json::to_string_pretty(&manifest.raw)?)
            .await?;

        let pending: Vec<&ShardRecord> = manifest
            .shards
            .iter()
            .filter(|s| !state.completed.contains(&s.index))
            .collect();
        let total_bytes: u64 = manifest.total_size;
        let done_bytes: u64 = manifest
            .shards
            .iter()
            .filter(|s| state.completed.contains(&s.index))
            .map(|s| s.size)
            .sum();

        info!(
            model_id,
            pending = pending.len(),
            resumed = state.completed.len(),
            "starting shard download"
        );

        let tracker = Arc::new(Mutex::new(Tracker {
            state,
            bytes_done: done_bytes,
            speed_window_start: Instant::now(),
            speed_window_bytes: 0,
            bytes_per_sec: None,
        }));

        let total_shards = manifest.shards.len();
        let results: Vec<EngineResult<()>> = stream::iter(pending)
            .map(|shard| {
                let transport = transport.clone();
                let tracker = tracker.clone();
                let on_progress = on_progress.clone();
                let cancel = cancel.clone();
                async move {
                    cancel.check()?;
                    self.fetch_one(model_id, shard, base_url, algorithm, transport, &cancel)
                        .await?;

                    let mut t = tracker.lock().await;
                    t.state.completed.insert(shard.index);
                    t.bytes_done += shard.size;
                    t.speed_window_bytes += shard.size;
                    let elapsed = t.speed_window_start.elapsed();
                    if elapsed >= Duration::from_millis(self.config.speed_sample_interval_ms) {
                        t.bytes_per_sec =
                            Some(t.speed_window_bytes as f64 / elapsed.as_secs_f64());
                        t.speed_window_start = Instant::now();
                        t.speed_window_bytes = 0;
                    }
                    self.save_state(model_id, &t.state).await?;

                    if let Some(cb) = &on_progress {
                        cb(&DownloadProgress {
                            completed_shards: t.state.completed.len(),
                            total_shards,
                            bytes_done: t.bytes_done,
                            total_bytes,
                            bytes_per_sec: t.bytes_per_sec,
                            status: DownloadStatus::Downloading,
                        });
                    }
                    Ok(())
                }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let failure = results.into_iter().find_map(Result::err);
        let mut t = tracker.lock().await;
        if let Some(err) = failure {
            let status = match &err {
                EngineError::Cancelled => DownloadStatus::Paused,
                _ => DownloadStatus::Error,
            };
            t.state.status = status;
            t.state.last_error = match &err {
                EngineError::Cancelled => None,
                e => Some(e.to_string()),
            };
            self.save_state(model_id, &t.state).await?;
            if let Some(cb) = &on_progress {
                cb(&DownloadProgress {
                    completed_shards: t.state.completed.len(),
                    total_shards,
                    bytes_done: t.bytes_done,
                    total_bytes,
                    bytes_per_sec: t.bytes_per_sec,
                    status,
                });
            }
            return Err(err);
        }

        t.state.status = DownloadStatus::Completed;
        // State is only useful for resuming; a completed download has
        // nothing to resume.
        self.clear_state(model_id).await?;
        if let Some(cb) = &on_progress {
            cb(&DownloadProgress {
                completed_shards: t.state.completed.len(),
                total_shards,
                bytes_done: t.bytes_done,
                total_bytes,
                bytes_per_sec: t.bytes_per_sec,
                status: DownloadStatus::Completed,
            });
        }
        info!(model_id, shards = total_shards, "download complete");
        Ok(())
    }

    /// Fetch one shard with retry, verify, and persist it.
    async fn fetch_one(
        &self,
        model_id: &str,
        shard: &ShardRecord,
        base_url: &str,
        algorithm: HashAlgorithm,
        transport: Arc<dyn ShardTransport>,
        cancel: &CancelToken,
    ) -> EngineResult<()> {
        let url = format!("{}/{}", base_url.trim_end_matches('/'), shard.filename);
        let mut delay = Duration::from_millis(self.config.backoff_base_ms);
        let mut last_err: Option<EngineError> = None;

        for attempt in 1..=self.config.max_attempts {
            cancel.check()?;
            let outcome = async {
                let data = transport.fetch_range(&url, 0, shard.size).await?;
                self.store
                    .write_shard(
                        model_id,
                        shard.index,
                        &data,
                        Some(ShardCheck {
                            expected_hex: &shard.hash,
                            algorithm,
                        }),
                    )
                    .await
            }
            .await;

            match outcome {
                Ok(()) => {
                    debug!(model_id, shard = shard.index, attempt, "shard fetched and verified");
                    return Ok(());
                }
                Err(e @ EngineError::QuotaExceeded { .. }) => return Err(e),
                Err(e) => {
                    warn!(
                        model_id,
                        shard = shard.index,
                        attempt,
                        error = %e,
                        "shard fetch attempt failed"
                    );
                    last_err = Some(e);
                    if attempt < self.config.max_attempts {
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(Duration::from_millis(self.config.backoff_cap_ms));
                    }
                }
            }
        }

        // Integrity failures keep their identity; everything else collapses
        // into a transport failure carrying the attempt count.
        Err(match last_err {
            Some(e @ EngineError::IntegrityFailure { .. }) => e,
            Some(e) => EngineError::TransportFailure {
                attempts: self.config.max_attempts,
                reason: e.to_string(),
            },
            None => EngineError::TransportFailure {
                attempts: self.config.max_attempts,
                reason: "no attempts made".to_string(),
            },
        })
    }

    async fn load_state(&self, model_id: &str) -> Option<DownloadState> {
        let path = self.store.download_state_path(model_id);
        let data = fs::read_to_string(&path).await.ok()?;
        serde_json::from_str(&data).ok()
    }

    async fn save_state(&self, model_id: &str, state: &DownloadState) -> EngineResult<()> {
        let path = self.store.download_state_path(model_id);
        fs::write(&path, serde_json::to_string(state)?).await?;
        Ok(())
    }

    async fn clear_state(&self, model_id: &str) -> EngineResult<()> {
        let path = self.store.download_state_path(model_id);
        if fs::try_exists(&path).await? {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }
}
