//! Materializes logical tensors from shard bytes.
//!
//! The loader resolves tensor names (through the alias table), reads the
//! backing byte ranges from the shard store (concatenating multi-shard
//! spans), and produces device buffers in f32 — dequantizing Q4_K through
//! the dispatcher and converting F16 bit-accurately. Expert FFN weights
//! hydrate lazily and are cached per (layer, expert).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{EngineError, EngineResult};
use crate::gpu::buffer::{BufferPool, PooledBuffer};
use crate::kernels::dispatcher::KernelDispatcher;
use crate::manifest::{Manifest, TensorDesc};
use crate::store::shard_store::ShardStore;
use crate::tensor::alias;
use crate::tensor::dtype::{f16_bytes_to_f32, f32_bytes_to_f32, Dtype};

/// Where a caller wants a tensor materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorTarget {
    Cpu,
    Gpu,
}

/// A materialized tensor on the requested target.
pub enum LoadedTensor {
    Cpu(Vec<f32>),
    Device(DeviceTensor),
}

/// A device-resident tensor: a pooled buffer plus its shape.
#[derive(Debug)]
pub struct DeviceTensor {
    pub data: PooledBuffer,
    pub shape: Vec<usize>,
}

impl DeviceTensor {
    pub fn elements(&self) -> usize {
        self.shape.iter().product()
    }
}

impl std::ops::Deref for DeviceTensor {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.data
    }
}

/// One expert's feed-forward weights.
#[derive(Debug)]
pub struct ExpertWeights {
    pub gate: DeviceTensor,
    pub up: DeviceTensor,
    pub down: DeviceTensor,
}

/// Feed-forward weights of one layer: dense, or a MoE router gate whose
/// experts hydrate on demand.
#[derive(Debug)]
pub enum FfnWeights {
    Dense {
        gate: DeviceTensor,
        up: DeviceTensor,
        down: DeviceTensor,
    },
    Moe {
        router: DeviceTensor,
    },
}

/// Weights of one transformer layer.
#[derive(Debug)]
pub struct LayerWeights {
    pub input_norm: DeviceTensor,
    pub q_proj: DeviceTensor,
    pub k_proj: DeviceTensor,
    pub v_proj: DeviceTensor,
    pub o_proj: DeviceTensor,
    pub post_norm: DeviceTensor,
    pub ffn: FfnWeights,
}

/// The full resident weight set (experts excluded; they load lazily).
#[derive(Debug)]
pub struct ModelWeights {
    pub embed: DeviceTensor,
    pub layers: Vec<LayerWeights>,
    pub final_norm: DeviceTensor,
    pub lm_head: DeviceTensor,
}

/// Progress report emitted while loading the resident weight set.
#[derive(Debug, Clone, Copy)]
pub struct LoadProgress {
    pub stage: &'static str,
    pub layer: usize,
    pub total_layers: usize,
}

/// Expert-cache hit/miss counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpertCacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Resolves names to shard bytes and materializes tensors.
///
/// The loader never fabricates data: a tensor the manifest or store
/// lacks is always a `NotFound`. Fallback policy (zero substitution in
/// lenient mode) belongs to the pipeline.
pub struct TensorLoader {
    store: ShardStore,
    manifest: Arc<Manifest>,
    model_id: String,
    dispatcher: Arc<KernelDispatcher>,
    pool: BufferPool,

    experts: Mutex<HashMap<(usize, usize), Arc<ExpertWeights>>>,
    expert_hits: AtomicU64,
    expert_misses: AtomicU64,
}

impl TensorLoader {
    pub fn new(
        store: ShardStore,
        manifest: Arc<Manifest>,
        dispatcher: Arc<KernelDispatcher>,
        pool: BufferPool,
    ) -> Self {
        let model_id = manifest.model_id.clone();
        Self {
            store,
            manifest,
            model_id,
            dispatcher,
            pool,
            experts: Mutex::new(HashMap::new()),
            expert_hits: AtomicU64::new(0),
            expert_misses: AtomicU64::new(0),
        }
    }

    /// Resolve a name through the alias table to a manifest entry.
    pub fn resolve(&self, name: &str) -> EngineResult<(String, &TensorDesc)> {
        for candidate in alias::candidates(name) {
            if let Some(desc) = self.manifest.tensor(&candidate) {
                return Ok((candidate, desc));
            }
        }
        Err(EngineError::NotFound(format!("tensor {name}")))
    }

    /// Load a tensor onto the requested target.
    pub async fn load(&self, name: &str, target: TensorTarget) -> EngineResult<LoadedTensor> {
        let tensor = self.load_device(name).await?;
        match target {
            TensorTarget::Gpu => Ok(LoadedTensor::Device(tensor)),
            TensorTarget::Cpu => Ok(LoadedTensor::Cpu(tensor.data.to_vec())),
        }
    }

    /// Load a tensor as a device buffer.
    pub async fn load_device(&self, name: &str) -> EngineResult<DeviceTensor> {
        let (canonical, desc) = self.resolve(name)?;
        let raw = self.assemble_bytes(desc).await?;
        let elements = desc.elements();

        let data = match desc.dtype {
            Dtype::F32 => self.pool.acquire_from(&f32_bytes_to_f32(&raw), "weight"),
            Dtype::F16 => self.pool.acquire_from(&f16_bytes_to_f32(&raw), "weight"),
            Dtype::Q4K => self.dispatcher.dequant_q4k(&raw, elements)?,
        };
        debug!(tensor = %canonical, elements, dtype = %desc.dtype, "tensor materialized");

        Ok(DeviceTensor {
            data,
            shape: desc.shape.clone(),
        })
    }

    /// Read a tensor's bytes, concatenating multi-shard spans in order.
    async fn assemble_bytes(&self, desc: &TensorDesc) -> EngineResult<Vec<u8>> {
        let spans = desc.spans();
        let mut out = Vec::with_capacity(desc.byte_len() as usize);
        for span in spans {
            let chunk = self
                .store
                .read_range(&self.model_id, span.shard, span.offset, span.length)
                .await?;
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Load one expert's FFN weights, cached by (layer, expert).
    ///
    /// A missing expert tensor is a hard `NotFound`; the MoE forward
    /// pass decides whether to substitute. Only complete experts enter
    /// the cache.
    pub async fn load_expert(&self, layer: usize, expert: usize) -> EngineResult<Arc<ExpertWeights>> {
        if let Some(cached) = self
            .experts
            .lock()
            .expect("expert cache poisoned")
            .get(&(layer, expert))
        {
            self.expert_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached.clone());
        }
        self.expert_misses.fetch_add(1, Ordering::Relaxed);

        let prefix = format!("model.layers.{layer}.mlp.experts.{expert}");
        let weights = Arc::new(ExpertWeights {
            gate: self
                .load_device(&format!("{prefix}.gate_proj.weight"))
                .await?,
            up: self.load_device(&format!("{prefix}.up_proj.weight")).await?,
            down: self
                .load_device(&format!("{prefix}.down_proj.weight"))
                .await?,
        });

        self.experts
            .lock()
            .expect("expert cache poisoned")
            .insert((layer, expert), weights.clone());
        debug!(layer, expert, "expert hydrated");
        Ok(weights)
    }

    /// Load the full resident weight set, layer by layer. Any tensor the
    /// manifest or store lacks fails with `NotFound`; lenient zero
    /// substitution lives in
    /// [`InferencePipeline::load_weights`](crate::pipeline::engine::InferencePipeline::load_weights).
    pub async fn load_all_layers(
        &self,
        on_progress: Option<&(dyn Fn(LoadProgress) + Send + Sync)>,
        cancel: &CancelToken,
    ) -> EngineResult<ModelWeights> {
        crate::pipeline::engine::InferencePipeline::load_weights(self, true, on_progress, cancel)
            .await
    }

    /// Drop every cached expert. The caller drops [`ModelWeights`]
    /// alongside; afterwards the pool reports zero outstanding buffers.
    pub fn unload(&self) {
        let mut experts = self.experts.lock().expect("expert cache poisoned");
        let count = experts.len();
        experts.clear();
        if count > 0 {
            debug!(evicted = count, "expert cache cleared");
        }
    }

    pub fn expert_cache_stats(&self) -> ExpertCacheStats {
        ExpertCacheStats {
            hits: self.expert_hits.load(Ordering::Relaxed),
            misses: self.expert_misses.load(Ordering::Relaxed),
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// The buffer pool tensors are materialized into. The pipeline uses
    /// it to mint zero tensors when it substitutes for missing weights.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }
}
