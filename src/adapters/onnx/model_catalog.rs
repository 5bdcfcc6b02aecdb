use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::application::ports::{InferenceEngine, ModelLoaderPort};
use crate::domain::errors::{InferenceError, InferenceFailure};
use crate::domain::model::Model;

/// Resolves model artifacts under a directory and turns them into engines.
pub struct OnnxModelCatalog {
    model_dir: PathBuf,
}

impl OnnxModelCatalog {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self { model_dir: model_dir.into() }
    }

    /// Artifact path for `model`. Names that try to leave the directory are refused.
    pub fn artifact_path(&self, model: &Model) -> Result<PathBuf, InferenceError> {
        let name = Path::new(&model.filename);
        let plain = name.components().count() == 1 && name.file_name().is_some();
        if !plain {
            return Err(InferenceError::new(
                InferenceFailure::IncompatibleInput,
                format!("invalid artifact name {:?}", model.filename),
            ));
        }
        let path = self.model_dir.join(name);
        if !path.is_file() {
            return Err(InferenceError::new(
                InferenceFailure::ModelNotReady,
                format!("model file not found: {}", path.display()),
            ));
        }
        Ok(path)
    }
}

impl ModelLoaderPort for OnnxModelCatalog {
    fn load(&self, model: &Model) -> Result<Arc<dyn InferenceEngine>, InferenceError> {
        let path = self.artifact_path(model)?;
        load_engine(&path)
    }
}

#[cfg(feature = "onnx")]
fn load_engine(path: &Path) -> Result<Arc<dyn InferenceEngine>, InferenceError> {
    let engine = super::yolo_engine::OnnxYoloEngine::load(path)?;
    Ok(Arc::new(engine))
}

#[cfg(not(feature = "onnx"))]
fn load_engine(path: &Path) -> Result<Arc<dyn InferenceEngine>, InferenceError> {
    Err(InferenceError::new(
        InferenceFailure::RuntimeFault,
        format!("cannot run {}: built without the `onnx` feature", path.display()),
    ))
}
