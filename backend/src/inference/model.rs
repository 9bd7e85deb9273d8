use std::path::Path;
use std::sync::{Arc, Mutex};
use tch::{CModule, Device, Tensor};

/// Length of the embedding produced by the ProtoNet encoder.
pub const EMBEDDING_DIM: i64 = 256;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Failed to load model from {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: tch::TchError,
    },
    #[error("Forward pass failed: {0}")]
    Forward(#[from] tch::TchError),
    #[error("Model lock poisoned")]
    Poisoned,
}

/// Maps a `[1, 3, 224, 224]` image tensor to an embedding on the CPU.
pub trait Embedder: Send + Sync {
    fn embed(&self, input: &Tensor) -> Result<Tensor, ModelError>;
}

/// TorchScript export of the ProtoNet encoder (ResNet-18 trunk + Linear(512, 256)).
pub struct TorchScriptEmbedder {
    module: Mutex<CModule>,
    device: Device,
}

impl TorchScriptEmbedder {
    pub fn load(model_path: &Path) -> Result<Self, ModelError> {
        let device = Device::cuda_if_available();
        let mut module =
            CModule::load_on_device(model_path, device).map_err(|source| ModelError::Load {
                path: model_path.display().to_string(),
                source,
            })?;
        module.set_eval();
        Ok(Self {
            module: Mutex::new(module),
            device,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }
}

impl Embedder for TorchScriptEmbedder {
    fn embed(&self, input: &Tensor) -> Result<Tensor, ModelError> {
        let module = self.module.lock().map_err(|_| ModelError::Poisoned)?;
        let input = input.to_device(self.device);
        let output = tch::no_grad(|| module.forward_ts(&[input]))?;
        Ok(output.to_device(Device::Cpu))
    }
}

/// Process-wide model state, fixed at startup.
#[derive(Clone)]
pub enum ModelHandle {
    Ready(Arc<dyn Embedder>),
    Unavailable,
}

impl ModelHandle {
    /// Never fails: a model that cannot be loaded leaves the handle unavailable.
    pub fn load(model_path: &Path) -> Self {
        match TorchScriptEmbedder::load(model_path) {
            Ok(embedder) => {
                log::info!(
                    "ProtoNet loaded from {} on {:?}",
                    model_path.display(),
                    embedder.device()
                );
                ModelHandle::Ready(Arc::new(embedder))
            }
            Err(e) => {
                log::error!("Could not load ProtoNet: {}", e);
                ModelHandle::Unavailable
            }
        }
    }

    pub fn embedder(&self) -> Option<&Arc<dyn Embedder>> {
        match self {
            ModelHandle::Ready(embedder) => Some(embedder),
            ModelHandle::Unavailable => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, ModelHandle::Ready(_))
    }
}
