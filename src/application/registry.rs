use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::application::ports::InferenceEngine;
use crate::domain::{
    errors::{ConfigurationError, DomainError, DomainResult},
    model::{Model, ModelId, ModelState, ModelUpdate},
};

/// A model as seen by one inference run. Entries are replaced, never
/// mutated, so a run keeps the configuration it was scheduled with.
pub struct LoadedModel {
    pub config: Model,
    pub state: ModelState,
    pub engine: Option<Arc<dyn InferenceEngine>>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelView {
    #[serde(flatten)]
    pub model: Model,
    pub status: ModelState,
    pub detail: Option<String>,
}

#[derive(Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<ModelId, Arc<LoadedModel>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_loading(&self, model: Model) -> DomainResult<()> {
        let mut guard = self.write()?;
        if guard.contains_key(&model.id) {
            return Err(ConfigurationError::new("id", format!("model {} already exists", model.id)).into());
        }
        let id = model.id.clone();
        guard.insert(
            id,
            Arc::new(LoadedModel { config: model, state: ModelState::Loading, engine: None, detail: None }),
        );
        Ok(())
    }

    /// Attaches a loaded engine, keeping whatever configuration is current.
    pub fn set_ready(&self, id: &ModelId, engine: Arc<dyn InferenceEngine>) {
        self.replace(id, |current| LoadedModel {
            config: current.config.clone(),
            state: ModelState::Ready,
            engine: Some(engine),
            detail: None,
        });
    }

    pub fn set_failed(&self, id: &ModelId, detail: String) {
        self.replace(id, |current| LoadedModel {
            config: current.config.clone(),
            state: ModelState::Error,
            engine: None,
            detail: Some(detail),
        });
    }

    pub fn update(&self, id: &ModelId, update: &ModelUpdate) -> DomainResult<Model> {
        let mut guard = self.write()?;
        let current = guard
            .get(id)
            .ok_or_else(|| DomainError::NotFound(format!("model {id}")))?;
        let config = current.config.with_update(update)?;
        let next = LoadedModel {
            config: config.clone(),
            state: current.state,
            engine: current.engine.clone(),
            detail: current.detail.clone(),
        };
        guard.insert(id.clone(), Arc::new(next));
        Ok(config)
    }

    pub fn remove(&self, id: &ModelId) -> DomainResult<()> {
        self.write()?
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| DomainError::NotFound(format!("model {id}")))
    }

    pub fn get(&self, id: &ModelId) -> Option<Arc<LoadedModel>> {
        self.models.read().ok().and_then(|guard| guard.get(id).cloned())
    }

    /// Configuration snapshot taken at scheduling time, in the order given.
    pub fn snapshot(&self, ids: &[ModelId]) -> Vec<(ModelId, Option<Arc<LoadedModel>>)> {
        match self.models.read() {
            Ok(guard) => ids.iter().map(|id| (id.clone(), guard.get(id).cloned())).collect(),
            Err(_) => ids.iter().map(|id| (id.clone(), None)).collect(),
        }
    }

    pub fn class_color(&self, model_id: &ModelId, class_id: u32) -> Option<String> {
        self.get(model_id)
            .and_then(|m| m.config.class(class_id).map(|c| c.color.clone()))
    }

    pub fn list(&self) -> Vec<ModelView> {
        let Ok(guard) = self.models.read() else {
            return Vec::new();
        };
        let mut views: Vec<_> = guard
            .values()
            .map(|m| ModelView { model: m.config.clone(), status: m.state, detail: m.detail.clone() })
            .collect();
        views.sort_by(|a, b| a.model.id.cmp(&b.model.id));
        views
    }

    fn replace(&self, id: &ModelId, f: impl FnOnce(&LoadedModel) -> LoadedModel) {
        if let Ok(mut guard) = self.models.write() {
            if let Some(current) = guard.get(id) {
                let next = f(current);
                guard.insert(id.clone(), Arc::new(next));
            }
        }
    }

    fn write(
        &self,
    ) -> DomainResult<std::sync::RwLockWriteGuard<'_, HashMap<ModelId, Arc<LoadedModel>>>> {
        self.models
            .write()
            .map_err(|_| DomainError::OperationFailed("model registry lock poisoned".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{ModelClass, YoloParams};

    fn model() -> Model {
        Model {
            id: ModelId::new("model-1"),
            name: String::new(),
            filename: "m.onnx".into(),
            file_size: 0,
            classes: vec![ModelClass { id: 1, name: "scratch".into(), color: "#f00".into() }],
            confidence: 0.7,
            roi: None,
            params: YoloParams::default(),
        }
    }

    #[test]
    fn snapshot_survives_later_edit() {
        let registry = ModelRegistry::new();
        registry.insert_loading(model()).unwrap();
        let id = ModelId::new("model-1");

        let before = registry.snapshot(&[id.clone()]);
        registry
            .update(&id, &ModelUpdate { confidence: Some(0.2), ..Default::default() })
            .unwrap();

        let held = before[0].1.as_ref().unwrap();
        assert_eq!(held.config.confidence, 0.7);
        assert_eq!(registry.get(&id).unwrap().config.confidence, 0.2);
    }

    #[test]
    fn colour_is_resolved_from_current_config() {
        let registry = ModelRegistry::new();
        registry.insert_loading(model()).unwrap();
        let id = ModelId::new("model-1");
        let recoloured = vec![ModelClass { id: 1, name: "scratch".into(), color: "#00f".into() }];
        registry
            .update(&id, &ModelUpdate { classes: Some(recoloured), ..Default::default() })
            .unwrap();
        assert_eq!(registry.class_color(&id, 1).as_deref(), Some("#00f"));
        assert_eq!(registry.class_color(&id, 9), None);
    }

    #[test]
    fn failed_load_is_reported() {
        let registry = ModelRegistry::new();
        registry.insert_loading(model()).unwrap();
        let id = ModelId::new("model-1");
        registry.set_failed(&id, "file missing".into());
        let view = &registry.list()[0];
        assert_eq!(view.status, ModelState::Error);
        assert_eq!(view.detail.as_deref(), Some("file missing"));
        assert!(registry.insert_loading(model()).is_err());
    }
}
