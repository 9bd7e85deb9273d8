use chrono::Utc;
use shared::{ClassificationResponse, Prediction, WasteCategory};
use std::cmp::Ordering;
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;
use strum::{EnumCount, IntoEnumIterator};
use tch::nn::{self, Module};
use tch::{Device, Kind, Tensor};

use crate::config::HeadMode;
use crate::inference::model::{EMBEDDING_DIM, Embedder, ModelError, ModelHandle};
use crate::inference::preprocess::{self, Normalization, PreprocessError};
use crate::storage::history_store::{HistoryError, HistoryStore};

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("Model not loaded")]
    ModelUnavailable,
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error("Embedding failed: {0}")]
    Model(#[from] ModelError),
    #[error("Tensor operation failed: {0}")]
    Tensor(#[from] tch::TchError),
    #[error("Unexpected embedding size {actual}, expected {expected}")]
    EmbeddingShape { expected: i64, actual: usize },
    #[error("Model produced no predictions")]
    NoPredictions,
    #[error("Failed to archive image: {0}")]
    Archive(#[from] HistoryError),
    #[error("Classification head lock poisoned")]
    Poisoned,
}

struct LinearHead {
    _vs: nn::VarStore,
    linear: nn::Linear,
}

impl LinearHead {
    /// Untrained: weights come from the default Linear initializer.
    fn random() -> Self {
        let vs = nn::VarStore::new(Device::Cpu);
        let linear = nn::linear(
            vs.root(),
            EMBEDDING_DIM,
            WasteCategory::COUNT as i64,
            Default::default(),
        );
        Self { _vs: vs, linear }
    }
}

enum ClassificationHead {
    Ephemeral,
    Persistent(Mutex<LinearHead>),
}

pub struct Classifier {
    head: ClassificationHead,
    normalization: Normalization,
}

impl Classifier {
    pub fn new(mode: HeadMode, normalization: Normalization) -> Self {
        let head = match mode {
            HeadMode::Ephemeral => ClassificationHead::Ephemeral,
            HeadMode::Persistent => ClassificationHead::Persistent(Mutex::new(LinearHead::random())),
        };
        Self { head, normalization }
    }

    /// Embeds the input, projects it onto the categories and ranks the softmax.
    pub fn predict(
        &self,
        embedder: &dyn Embedder,
        input: &Tensor,
    ) -> Result<Vec<Prediction>, ClassifyError> {
        let embedding = embedder.embed(input)?.to_kind(Kind::Float).flatten(0, -1);
        let actual = embedding.numel();
        if actual != EMBEDDING_DIM as usize {
            return Err(ClassifyError::EmbeddingShape {
                expected: EMBEDDING_DIM,
                actual,
            });
        }
        log::debug!("Embedding shape: {:?}", embedding.size());

        let logits = tch::no_grad(|| self.project(&embedding))?;
        let probabilities = logits.softmax(-1, Kind::Double);
        let probabilities = Vec::<f64>::try_from(&probabilities)?;
        Ok(rank_predictions(&probabilities))
    }

    fn project(&self, embedding: &Tensor) -> Result<Tensor, ClassifyError> {
        match &self.head {
            ClassificationHead::Ephemeral => Ok(LinearHead::random().linear.forward(embedding)),
            ClassificationHead::Persistent(head) => {
                let head = head.lock().map_err(|_| ClassifyError::Poisoned)?;
                Ok(head.linear.forward(embedding))
            }
        }
    }

    /// Full pipeline for an uploaded file: preprocess, predict, then archive a copy
    /// under the capture timestamp.
    pub fn classify_file(
        &self,
        model: &ModelHandle,
        upload_path: &Path,
        filename: &str,
        history: &HistoryStore,
    ) -> Result<ClassificationResponse, ClassifyError> {
        let embedder = model.embedder().ok_or(ClassifyError::ModelUnavailable)?;
        let input = preprocess::preprocess_path(upload_path, self.normalization)?;

        let started = Instant::now();
        let all_predictions = self.predict(embedder.as_ref(), &input)?;
        log::debug!("Inference took {} ms", started.elapsed().as_millis());

        let top = all_predictions
            .first()
            .cloned()
            .ok_or(ClassifyError::NoPredictions)?;

        let captured = Utc::now();
        let image_path = history.archive_at(upload_path, filename, captured.timestamp())?;

        Ok(ClassificationResponse {
            top_category: top.category,
            confidence: top.confidence,
            all_predictions,
            timestamp: captured.timestamp_micros() as f64 / 1_000_000.0,
            filename: filename.to_string(),
            image_path: image_path.display().to_string(),
        })
    }
}

/// Pairs probabilities with categories by index and sorts by descending
/// confidence. The sort is stable, so ties keep category order.
pub fn rank_predictions(probabilities: &[f64]) -> Vec<Prediction> {
    let mut ranked: Vec<Prediction> = WasteCategory::iter()
        .zip(probabilities)
        .map(|(category, &confidence)| Prediction {
            category: category.label().to_string(),
            confidence,
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });
    ranked
}
