use std::{collections::BTreeMap, path::Path};

use image::RgbImage;

use crate::{
    error::ServiceError,
    model::{
        ModelFamily, PredictionResult, TaggingPrediction,
        adapter::ModelAdapter,
        loader::{LoadContext, ModelArtifact},
        mapping,
    },
    tensor::softmax_in_place,
};

pub struct TaggerModel {
    artifact: ModelArtifact,
    labels: Vec<String>,
}

impl TaggerModel {
    pub fn load(dir: &Path, name: &str, ctx: &LoadContext) -> Result<Self, ServiceError> {
        let (artifact, raw) = ModelArtifact::load(ModelFamily::Tagging, dir, name, ctx)?;
        let labels = mapping::parse_labels(&raw).map_err(|e| ServiceError::load(dir, e))?;
        if ctx.probe {
            artifact.probe_channels(labels.len())?;
        }
        tracing::info!(model = %artifact.name, labels = labels.len(), "tagging model loaded");
        Ok(Self { artifact, labels })
    }

    fn tags(&self, logits: &[f32]) -> TaggingPrediction {
        let mut scores = logits.to_vec();
        softmax_in_place(&mut scores);
        let mut tags = BTreeMap::new();
        for (label, score) in self.labels.iter().zip(scores) {
            // A label mapped from several channels keeps its best score.
            let slot = tags.entry(label.clone()).or_insert(score);
            if score > *slot {
                *slot = score;
            }
        }
        TaggingPrediction { tags }
    }
}

impl ModelAdapter for TaggerModel {
    fn artifact(&self) -> &ModelArtifact {
        &self.artifact
    }

    fn num_classes(&self) -> usize {
        self.labels.len()
    }

    fn predict(&self, images: &[RgbImage]) -> Result<Vec<PredictionResult>, ServiceError> {
        let rows = self.artifact.classify(images, self.labels.len())?;
        Ok(rows
            .iter()
            .map(|logits| PredictionResult::Tagging(self.tags(logits)))
            .collect())
    }
}
