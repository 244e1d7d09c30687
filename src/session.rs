//! The engine's public surface.
//!
//! A [`Session`] owns the device capabilities, the shard store, the
//! buffer pool, and at most one loaded model at a time. Every operation
//! the engine exposes to embedders goes through here: download, load,
//! generate, unload, destroy. One generation may be in flight per
//! session; a second `generate` fails fast.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cache::kv::{CacheLayout, KvCache};
use crate::cancel::CancelToken;
use crate::config::{EngineConfig, GenerationOptions};
use crate::error::{EngineError, EngineResult};
use crate::gpu::buffer::BufferPool;
use crate::gpu::device::{self, DeviceCaps};
use crate::kernels::dispatcher::KernelDispatcher;
use crate::manifest::{Architecture, Manifest};
use crate::pipeline::engine::{run_generation, GenerationEvent, InferencePipeline};
use crate::store::download::{Downloader, ProgressFn};
use crate::store::hasher::HashAlgorithm;
use crate::store::shard_store::ShardStore;
use crate::tensor::dtype::Dtype;
use crate::tensor::loader::{LoadProgress, TensorLoader};
use crate::tokenizer::Tokenizer;
use crate::transport::ShardTransport;

/// Summary of a loaded model, returned by [`Session::load`].
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub model_id: String,
    pub architecture: Architecture,
    pub quantization: Dtype,
    pub is_moe: bool,
}

/// Options for [`Session::download`].
#[derive(Default)]
pub struct DownloadRequest {
    /// Override the configured shard concurrency.
    pub concurrency: Option<usize>,
    pub on_progress: Option<ProgressFn>,
    pub cancel: CancelToken,
}

/// Options for [`Session::load`].
#[derive(Default)]
pub struct LoadRequest {
    /// Run a full integrity pass over the stored shards first.
    pub verify: bool,
    pub on_progress: Option<Arc<dyn Fn(LoadProgress) + Send + Sync>>,
    pub cancel: CancelToken,
}

struct LoadedModel {
    manifest: Arc<Manifest>,
    loader: Arc<TensorLoader>,
    pipeline: InferencePipeline,
    draft: Option<InferencePipeline>,
    tokenizer: Arc<dyn Tokenizer>,
}

/// Releases the in-flight-generation flag when the generation task ends,
/// however it ends.
struct GenerationGuard(Arc<AtomicBool>);

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// An engine session: device, stores, and at most one loaded model.
pub struct Session {
    config: EngineConfig,
    caps: DeviceCaps,
    store: ShardStore,
    pool: BufferPool,
    dispatcher: Arc<KernelDispatcher>,
    model: Option<Arc<tokio::sync::Mutex<LoadedModel>>>,
    is_generating: Arc<AtomicBool>,
}

impl Session {
    /// Probe the device and open the persistent store.
    pub async fn init(config: EngineConfig) -> EngineResult<Self> {
        let caps = device::probe()?;
        let store = ShardStore::open(&config.storage_root, config.quota_bytes).await?;
        let pool = BufferPool::new();
        let dispatcher = Arc::new(KernelDispatcher::new(caps.clone(), pool.clone()));
        info!(device = %caps.name, root = %config.storage_root.display(), "session initialized");
        Ok(Self {
            config,
            caps,
            store,
            pool,
            dispatcher,
            model: None,
            is_generating: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn capabilities(&self) -> &DeviceCaps {
        &self.caps
    }

    pub fn store(&self) -> &ShardStore {
        &self.store
    }

    /// Leak-check hook: buffers still leased from the pool.
    pub fn outstanding_buffers(&self) -> usize {
        self.pool.outstanding()
    }

    /// Fetch a model's manifest and every missing shard from `base_url`.
    /// Resumes from checkpointed state when present.
    pub async fn download(
        &self,
        model_id: &str,
        base_url: &str,
        transport: Arc<dyn ShardTransport>,
        request: DownloadRequest,
    ) -> EngineResult<()> {
        let manifest_url = format!("{}/manifest.json", base_url.trim_end_matches('/'));
        let manifest_bytes = transport.fetch(&manifest_url).await?;
        let manifest_json = std::str::from_utf8(&manifest_bytes).map_err(|e| {
            EngineError::ManifestInvalid {
                reasons: vec![format!("manifest is not UTF-8: {e}")],
            }
        })?;
        let manifest = Manifest::parse(manifest_json)?;
        if manifest.model_id != model_id {
            return Err(EngineError::manifest(format!(
                "manifest modelId {:?} does not match requested {model_id:?}",
                manifest.model_id
            )));
        }

        let mut download_config = self.config.download.clone();
        if let Some(concurrency) = request.concurrency {
            download_config.concurrency = concurrency;
        }
        Downloader::new(self.store.clone(), download_config)
            .download(
                model_id,
                &manifest,
                base_url,
                transport,
                request.on_progress,
                &request.cancel,
            )
            .await
    }

    /// Load a stored model: parse its manifest, optionally verify shard
    /// integrity, and materialize the resident weight set.
    pub async fn load(
        &mut self,
        model_id: &str,
        tokenizer: Arc<dyn Tokenizer>,
        request: LoadRequest,
    ) -> EngineResult<ModelInfo> {
        let manifest_json = self.store.load_manifest(model_id).await?;
        let manifest = Arc::new(Manifest::parse(&manifest_json)?);
        let algorithm = HashAlgorithm::negotiate(manifest.hash_algorithm.as_deref())?;

        if request.verify {
            let report = self
                .store
                .verify_model(model_id, &manifest, algorithm)
                .await?;
            if let Some(&shard) = report.missing.first() {
                return Err(EngineError::NotFound(format!(
                    "shard {shard} of model {model_id} (and {} more missing)",
                    report.missing.len().saturating_sub(1)
                )));
            }
            if let Some(&shard) = report.corrupt.first() {
                let expected = manifest
                    .shards
                    .get(shard as usize)
                    .map(|s| s.hash.clone())
                    .unwrap_or_default();
                return Err(EngineError::IntegrityFailure {
                    shard,
                    expected,
                    computed: "verification mismatch".to_string(),
                });
            }
        }

        let is_moe = manifest.moe.is_some();
        self.caps
            .warn_if_tight(manifest.resident_bytes(), is_moe);

        let loader = Arc::new(TensorLoader::new(
            self.store.clone(),
            manifest.clone(),
            self.dispatcher.clone(),
            self.pool.clone(),
        ));
        let weights = InferencePipeline::load_weights(
            &loader,
            self.config.strict_weights,
            request.on_progress.as_deref(),
            &request.cancel,
        )
        .await?;

        let arch = &manifest.architecture;
        let cache = KvCache::new(
            arch.layers,
            arch.num_kv_heads,
            arch.head_dim,
            arch.max_seq_len,
            CacheLayout::choose(arch.max_seq_len, arch.sliding_window, &self.config.cache),
        );
        let pipeline = InferencePipeline::new(
            manifest.clone(),
            weights,
            loader.clone(),
            self.dispatcher.clone(),
            cache,
            self.config.strict_weights,
        );

        let info = ModelInfo {
            model_id: manifest.model_id.clone(),
            architecture: arch.clone(),
            quantization: manifest.quantization,
            is_moe,
        };
        self.model = Some(Arc::new(tokio::sync::Mutex::new(LoadedModel {
            manifest,
            loader,
            pipeline,
            draft: None,
            tokenizer,
        })));
        info!(model_id, is_moe, "model loaded");
        Ok(info)
    }

    /// Load a smaller draft model for speculative decoding. The draft
    /// shares the session's tokenizer and device.
    pub async fn load_draft(&mut self, model_id: &str) -> EngineResult<()> {
        let model = self
            .model
            .clone()
            .ok_or_else(|| EngineError::NotFound("no model loaded".to_string()))?;

        let manifest_json = self.store.load_manifest(model_id).await?;
        let manifest = Arc::new(Manifest::parse(&manifest_json)?);
        let loader = Arc::new(TensorLoader::new(
            self.store.clone(),
            manifest.clone(),
            self.dispatcher.clone(),
            self.pool.clone(),
        ));
        let weights = InferencePipeline::load_weights(
            &loader,
            self.config.strict_weights,
            None,
            &CancelToken::new(),
        )
        .await?;

        let arch = &manifest.architecture;
        let cache = KvCache::new(
            arch.layers,
            arch.num_kv_heads,
            arch.head_dim,
            arch.max_seq_len,
            CacheLayout::choose(arch.max_seq_len, arch.sliding_window, &self.config.cache),
        );
        let draft = InferencePipeline::new(
            manifest,
            weights,
            loader,
            self.dispatcher.clone(),
            cache,
            self.config.strict_weights,
        );

        let mut guard = model.lock().await;
        let main_arch = &guard.manifest.architecture;
        if draft.architecture().layers >= main_arch.layers
            && draft.architecture().hidden_size >= main_arch.hidden_size
        {
            warn!(
                model_id,
                "draft model is not smaller than the main model; speculation will not pay off"
            );
        }
        guard.draft = Some(draft);
        info!(model_id, "draft model loaded");
        Ok(())
    }

    /// Start a generation, streaming events to the returned receiver.
    ///
    /// One generation per session: a concurrent call fails with
    /// `GenerationInProgress`. The receiver yields `Token` events and a
    /// final `Done` (or `Error`).
    pub fn generate(
        &self,
        prompt: &str,
        options: GenerationOptions,
        cancel: CancelToken,
    ) -> EngineResult<mpsc::Receiver<GenerationEvent>> {
        let model = self
            .model
            .clone()
            .ok_or_else(|| EngineError::NotFound("no model loaded".to_string()))?;

        if self
            .is_generating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EngineError::GenerationInProgress);
        }
        let guard = GenerationGuard(self.is_generating.clone());

        let (tx, rx) = mpsc::channel(32);
        let prompt = prompt.to_string();
        let request_id = uuid::Uuid::new_v4();

        tokio::spawn(async move {
            let _guard = guard;
            info!(%request_id, "generation started");
            let mut model = model.lock().await;
            let tokenizer = model.tokenizer.clone();
            let LoadedModel {
                pipeline, draft, ..
            } = &mut *model;

            let result = run_generation(
                pipeline,
                draft.as_mut(),
                tokenizer.as_ref(),
                &prompt,
                &options,
                &cancel,
                &tx,
            )
            .await;

            if let Err(e) = result {
                warn!(%request_id, error = %e, "generation failed");
                let _ = tx.send(GenerationEvent::Error(e.to_string())).await;
            }
        });

        Ok(rx)
    }

    /// Like [`Session::generate`], but wrapped as a `futures::Stream` of
    /// events for callers that compose streams.
    pub fn generate_stream(
        &self,
        prompt: &str,
        options: GenerationOptions,
        cancel: CancelToken,
    ) -> EngineResult<tokio_stream::wrappers::ReceiverStream<GenerationEvent>> {
        Ok(tokio_stream::wrappers::ReceiverStream::new(self.generate(
            prompt,
            options,
            cancel,
        )?))
    }

    /// Drop the loaded model and every buffer acquired through its
    /// loader. Fails if a generation is in flight.
    pub async fn unload(&mut self) -> EngineResult<()> {
        if self.is_generating.load(Ordering::SeqCst) {
            return Err(EngineError::GenerationInProgress);
        }
        if let Some(model) = self.model.take() {
            let model = model.lock().await;
            model.loader.unload();
            drop(model);
        }
        let outstanding = self.pool.outstanding();
        if outstanding > 0 {
            warn!(
                outstanding,
                labels = ?self.pool.outstanding_by_label(),
                "buffers still leased after unload"
            );
        } else {
            info!("model unloaded, buffer pool clean");
        }
        Ok(())
    }

    /// Tear the session down. The persistent store is left intact.
    pub async fn destroy(mut self) -> EngineResult<()> {
        self.unload().await
    }
}
