use std::path::Path;

use image::RgbImage;

use crate::{
    error::ServiceError,
    model::{
        AttributeGroups, AttributePrediction, AttributeScore, ModelFamily, PredictionResult,
        adapter::ModelAdapter,
        loader::{LoadContext, ModelArtifact},
        mapping::{self, AttributeClass},
    },
    tensor::softmax_in_place,
};

/// Multi-attribute classifier. Each output channel is one value of one
/// attribute; softmax runs within each attribute's channels.
pub struct AttributeModel {
    artifact: ModelArtifact,
    classes: Vec<AttributeClass>,
    /// Attribute name with its channel indices, in first-appearance order.
    groups: Vec<(String, Vec<usize>)>,
}

impl AttributeModel {
    pub fn load(dir: &Path, name: &str, ctx: &LoadContext) -> Result<Self, ServiceError> {
        let (artifact, raw) = ModelArtifact::load(ModelFamily::Attribute, dir, name, ctx)?;
        let classes = mapping::parse_attributes(&raw).map_err(|e| ServiceError::load(dir, e))?;
        if ctx.probe {
            artifact.probe_channels(classes.len())?;
        }
        Ok(Self::from_parts(artifact, classes))
    }

    fn from_parts(artifact: ModelArtifact, classes: Vec<AttributeClass>) -> Self {
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (idx, class) in classes.iter().enumerate() {
            match groups.iter_mut().find(|(n, _)| *n == class.attribute_name) {
                Some((_, members)) => members.push(idx),
                None => groups.push((class.attribute_name.clone(), vec![idx])),
            }
        }
        tracing::info!(
            model = %artifact.name,
            attributes = groups.len(),
            "attribute model loaded"
        );
        Self {
            artifact,
            classes,
            groups,
        }
    }

    pub fn group_scores(&self, logits: &[f32]) -> AttributeGroups {
        let mut out = AttributeGroups::new();
        for (attribute, members) in &self.groups {
            let mut scores: Vec<f32> = members.iter().map(|&i| logits[i]).collect();
            softmax_in_place(&mut scores);
            let entries = members
                .iter()
                .zip(scores)
                .map(|(&i, attr_score)| AttributeScore {
                    attr_value: self.classes[i].attribute_value.clone(),
                    attr_score,
                })
                .collect();
            out.insert(attribute.clone(), entries);
        }
        out
    }
}

impl ModelAdapter for AttributeModel {
    fn artifact(&self) -> &ModelArtifact {
        &self.artifact
    }

    fn num_classes(&self) -> usize {
        self.classes.len()
    }

    fn predict(&self, images: &[RgbImage]) -> Result<Vec<PredictionResult>, ServiceError> {
        let rows = self.artifact.classify(images, self.classes.len())?;
        Ok(rows
            .iter()
            .map(|logits| {
                PredictionResult::Attribute(AttributePrediction {
                    attributes: self.group_scores(logits),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::{
        engine::{
            Device,
            testing::{FakeLoader, FakeNetwork},
        },
        model::adapter::testing::{resize_transforms, write_model_dir},
    };

    fn ctx(batch_size: usize) -> LoadContext {
        LoadContext {
            loader: Arc::new(FakeLoader::new(|_| {
                Some(FakeNetwork::constant_logits(vec![2.0, 1.0, 0.5, 3.0, 0.0]))
            })),
            device: Device::Cuda(0),
            batch_size,
            stride: 32,
            probe: true,
        }
    }

    fn mapping() -> serde_json::Value {
        json!({
            "0": {"attribute_name": "color", "attribute_value": "red"},
            "1": {"attribute_name": "color", "attribute_value": "green"},
            "2": {"attribute_name": "color", "attribute_value": "blue"},
            "3": {"attribute_name": "sleeve", "attribute_value": "long"},
            "4": {"attribute_name": "sleeve", "attribute_value": "short"}
        })
    }

    #[test]
    fn groups_follow_mapping_order_and_sum_to_one() {
        let root = tempfile::tempdir().unwrap();
        write_model_dir(root.path(), "shirt", mapping(), resize_transforms(8, 8));
        let model = AttributeModel::load(&root.path().join("shirt"), "shirt", &ctx(32)).unwrap();
        assert_eq!(model.artifact().device, Device::Cpu);

        let images = vec![RgbImage::new(20, 10), RgbImage::new(7, 13)];
        let results = model.predict(&images).unwrap();
        assert_eq!(results.len(), 2);

        let PredictionResult::Attribute(pred) = &results[1] else {
            panic!("expected attribute result");
        };
        let colors: Vec<&str> = pred.attributes["color"]
            .iter()
            .map(|s| s.attr_value.as_str())
            .collect();
        assert_eq!(colors, vec!["red", "green", "blue"]);
        for group in pred.attributes.values() {
            let total: f32 = group.iter().map(|s| s.attr_score).sum();
            assert!((total - 1.0).abs() < 1e-5);
        }
        assert!(pred.attributes["sleeve"][0].attr_score > pred.attributes["sleeve"][1].attr_score);
    }

    #[test]
    fn attributes_keep_mapping_order() {
        let root = tempfile::tempdir().unwrap();
        let mapping = json!({
            "0": {"attribute_name": "sleeve", "attribute_value": "long"},
            "1": {"attribute_name": "sleeve", "attribute_value": "short"},
            "2": {"attribute_name": "color", "attribute_value": "red"},
            "3": {"attribute_name": "color", "attribute_value": "green"},
            "4": {"attribute_name": "color", "attribute_value": "blue"}
        });
        write_model_dir(root.path(), "shirt", mapping, resize_transforms(8, 8));
        let model = AttributeModel::load(&root.path().join("shirt"), "shirt", &ctx(32)).unwrap();

        let groups = model.group_scores(&[0.0; 5]);
        assert_eq!(groups.keys().collect::<Vec<_>>(), vec!["sleeve", "color"]);
        let json = serde_json::to_string(&groups).unwrap();
        assert!(json.find("sleeve").unwrap() < json.find("color").unwrap());
    }

    #[test]
    fn batches_respect_batch_size() {
        let root = tempfile::tempdir().unwrap();
        write_model_dir(root.path(), "shirt", mapping(), resize_transforms(8, 8));
        let network = Arc::new(FakeNetwork::constant_logits(vec![0.0; 5]));
        let (artifact, _) = ModelArtifact::load(
            ModelFamily::Attribute,
            &root.path().join("shirt"),
            "shirt",
            &ctx(2),
        )
        .unwrap();
        let artifact = ModelArtifact {
            network: network.clone(),
            ..artifact
        };
        let classes = mapping::parse_attributes(&mapping()).unwrap();
        let model = AttributeModel::from_parts(artifact, classes);

        let images = vec![RgbImage::new(4, 4); 5];
        assert_eq!(model.predict(&images).unwrap().len(), 5);
        assert_eq!(*network.batch_sizes.lock(), vec![2, 2, 1]);
    }

    #[test]
    fn channel_mismatch_fails_at_load() {
        let root = tempfile::tempdir().unwrap();
        let short = json!({
            "0": {"attribute_name": "color", "attribute_value": "red"},
            "1": {"attribute_name": "color", "attribute_value": "green"}
        });
        write_model_dir(root.path(), "shirt", short, resize_transforms(8, 8));
        let err = AttributeModel::load(&root.path().join("shirt"), "shirt", &ctx(32))
            .err()
            .unwrap();
        assert!(matches!(err, ServiceError::Load(_)));
    }
}
