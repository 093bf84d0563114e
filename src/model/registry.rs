//! Process-wide model table.
//!
//! Startup populates a [`RegistryBuilder`] on a single thread; [`build`]
//! freezes it into a [`ModelRegistry`] that is only ever read afterwards, so
//! request-time lookups take no lock.
//!
//! [`build`]: RegistryBuilder::build

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use once_cell::sync::Lazy;
use serde::Serialize;

use crate::{
    config::AppConfig,
    engine::NetworkLoader,
    error::ServiceError,
    model::{
        ModelFamily, ModelMetadata,
        adapter::ModelAdapter,
        attribute::AttributeModel,
        detector::DetectorModel,
        loader::{CLASS_MAPPING_FILE, DETECTOR_FILE, LoadContext, NETWORK_FILE, TRANSFORMS_FILE},
        mapping::{self, MappingShape},
        segmentor::SegmentorModel,
        tagger::TaggerModel,
    },
};

pub type FamilyPredicate = fn(&Path) -> bool;
pub type AdapterFactory =
    fn(&Path, &str, &LoadContext) -> Result<Arc<dyn ModelAdapter>, ServiceError>;

#[derive(Clone, Copy)]
pub struct FamilySpec {
    pub family: ModelFamily,
    pub matches: FamilyPredicate,
    pub factory: AdapterFactory,
}

fn has_artifact_files(dir: &Path) -> bool {
    [TRANSFORMS_FILE, CLASS_MAPPING_FILE, NETWORK_FILE]
        .iter()
        .all(|f| dir.join(f).is_file())
}

fn mapping_shape(dir: &Path) -> MappingShape {
    mapping::peek_shape(&dir.join(CLASS_MAPPING_FILE))
}

/// Built-in families in detection priority order.
pub static BUILTIN_FAMILIES: Lazy<Vec<FamilySpec>> = Lazy::new(|| {
    vec![
        FamilySpec {
            family: ModelFamily::Segmentation,
            matches: |dir| has_artifact_files(dir) && mapping_shape(dir) == MappingShape::IndexedList,
            factory: |dir, name, ctx| Ok(Arc::new(SegmentorModel::load(dir, name, ctx)?)),
        },
        FamilySpec {
            family: ModelFamily::Attribute,
            matches: |dir| {
                has_artifact_files(dir) && mapping_shape(dir) == MappingShape::AttributeObject
            },
            factory: |dir, name, ctx| Ok(Arc::new(AttributeModel::load(dir, name, ctx)?)),
        },
        FamilySpec {
            family: ModelFamily::ObjectDetection,
            matches: |dir| {
                has_artifact_files(dir)
                    && dir.join(DETECTOR_FILE).is_file()
                    && mapping_shape(dir) == MappingShape::LabelObject
            },
            factory: |dir, name, ctx| Ok(Arc::new(DetectorModel::load(dir, name, ctx)?)),
        },
        FamilySpec {
            family: ModelFamily::Tagging,
            matches: |dir| {
                has_artifact_files(dir)
                    && !dir.join(DETECTOR_FILE).exists()
                    && mapping_shape(dir) == MappingShape::LabelObject
            },
            factory: |dir, name, ctx| Ok(Arc::new(TaggerModel::load(dir, name, ctx)?)),
        },
    ]
});

type ModelKey = (ModelFamily, String);

#[derive(Debug, Default, Serialize)]
pub struct ScanReport {
    pub loaded: Vec<(ModelFamily, String)>,
    pub skipped: Vec<(PathBuf, String)>,
}

pub struct RegistryBuilder {
    families: Vec<FamilySpec>,
    models: HashMap<ModelKey, Arc<dyn ModelAdapter>>,
    load_order: Vec<ModelKey>,
    configured_defaults: HashMap<ModelFamily, String>,
    ctx: LoadContext,
}

impl RegistryBuilder {
    pub fn new(config: &AppConfig, loader: Arc<dyn NetworkLoader>) -> Self {
        Self {
            families: Vec::new(),
            models: HashMap::new(),
            load_order: Vec::new(),
            configured_defaults: config.default_models.clone(),
            ctx: LoadContext::new(config, loader),
        }
    }

    pub fn with_builtin_families(mut self) -> Self {
        for spec in BUILTIN_FAMILIES.iter() {
            self.register_family(*spec);
        }
        self
    }

    /// Registering a family twice keeps the first registration and its
    /// priority.
    pub fn register_family(&mut self, spec: FamilySpec) {
        if self.families.iter().any(|f| f.family == spec.family) {
            tracing::debug!(family = %spec.family, "family already registered");
            return;
        }
        self.families.push(spec);
    }

    /// First matching family in registration order. Directories that match
    /// several families are reported.
    pub fn detect_family(&self, path: &Path) -> Option<ModelFamily> {
        let matched: Vec<ModelFamily> = self
            .families
            .iter()
            .filter(|spec| (spec.matches)(path))
            .map(|spec| spec.family)
            .collect();
        if matched.len() > 1 {
            tracing::warn!(
                path = %path.display(),
                families = ?matched,
                chosen = %matched[0],
                "model directory matches several families"
            );
        }
        matched.first().copied()
    }

    pub fn load(&mut self, family: ModelFamily, path: &Path, name: &str) -> Result<(), ServiceError> {
        let spec = self
            .families
            .iter()
            .find(|spec| spec.family == family)
            .copied()
            .ok_or_else(|| ServiceError::load(path, format!("family {family} is not registered")))?;

        let adapter = (spec.factory)(path, name, &self.ctx)?;
        let key = (family, name.to_string());
        if self.models.insert(key.clone(), adapter).is_some() {
            tracing::warn!(%family, name, "replacing previously loaded model");
            self.load_order.retain(|k| k != &key);
        }
        self.load_order.push(key);
        tracing::info!(%family, name, path = %path.display(), "model registered");
        Ok(())
    }

    /// Loads every recognizable subdirectory of `root`, in name order. Bad
    /// directories are logged and skipped.
    pub fn scan(&mut self, root: &Path) -> Result<ScanReport, ServiceError> {
        let mut dirs: Vec<PathBuf> = fs::read_dir(root)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        let mut report = ScanReport::default();
        for dir in dirs {
            let Some(name) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            let Some(family) = self.detect_family(&dir) else {
                tracing::warn!(path = %dir.display(), "unrecognized model directory, skipping");
                report.skipped.push((dir, "unrecognized model directory".into()));
                continue;
            };
            match self.load(family, &dir, &name) {
                Ok(()) => report.loaded.push((family, name)),
                Err(err) => {
                    tracing::error!(path = %dir.display(), %family, error = %err, "failed to load model");
                    report.skipped.push((dir, err.to_string()));
                }
            }
        }
        Ok(report)
    }

    pub fn build(self) -> ModelRegistry {
        let mut defaults = HashMap::new();
        for family in ModelFamily::ALL {
            let configured = self
                .configured_defaults
                .get(&family)
                .filter(|name| self.models.contains_key(&(family, (*name).clone())));
            if let (None, Some(wanted)) = (configured, self.configured_defaults.get(&family)) {
                tracing::warn!(%family, model = %wanted, "configured default model is not loaded");
            }
            let latest = self
                .load_order
                .iter()
                .rev()
                .find(|(f, _)| *f == family)
                .map(|(_, name)| name);
            if let Some(name) = configured.or(latest) {
                defaults.insert(family, name.clone());
            }
        }

        ModelRegistry {
            models: self.models,
            load_order: self.load_order,
            defaults,
        }
    }
}

pub struct ModelRegistry {
    models: HashMap<ModelKey, Arc<dyn ModelAdapter>>,
    load_order: Vec<ModelKey>,
    defaults: HashMap<ModelFamily, String>,
}

impl ModelRegistry {
    /// Scans `config.model_dir` with the built-in families.
    pub fn initialize(
        config: &AppConfig,
        loader: Arc<dyn NetworkLoader>,
    ) -> Result<Self, ServiceError> {
        let mut builder = RegistryBuilder::new(config, loader).with_builtin_families();
        let report = builder.scan(&config.model_dir)?;
        tracing::info!(
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            "model directory scanned"
        );
        Ok(builder.build())
    }

    pub fn resolve(
        &self,
        family: ModelFamily,
        name: Option<&str>,
    ) -> Result<Arc<dyn ModelAdapter>, ServiceError> {
        let name = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => name,
            None => self.default_name(family).ok_or_else(|| {
                ServiceError::NotFound(format!("no {family} model is loaded"))
            })?,
        };
        self.models
            .get(&(family, name.to_string()))
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("{family} model {name:?} is not loaded")))
    }

    pub fn default_name(&self, family: ModelFamily) -> Option<&str> {
        self.defaults.get(&family).map(String::as_str)
    }

    pub fn has_family(&self, family: ModelFamily) -> bool {
        self.defaults.contains_key(&family)
    }

    /// Metadata for every loaded model, in load order.
    pub fn models(&self) -> Vec<ModelMetadata> {
        self.load_order
            .iter()
            .filter_map(|key| self.models.get(key).map(|m| (key, m)))
            .map(|((family, name), model)| ModelMetadata {
                is_default: self.default_name(*family) == Some(name.as_str()),
                ..model.metadata()
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
