use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::camera::FrameSize;
use super::detection::BoundingBox;
use super::errors::ConfigurationError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ModelId(pub String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Class id reserved for "OK / no defect".
pub const OK_CLASS_ID: u32 = 0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelClass {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub color: String,
}

/// Region of interest in native camera pixels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub fn fits_within(&self, size: FrameSize) -> bool {
        self.width > 0
            && self.height > 0
            && u64::from(self.x) + u64::from(self.width) <= u64::from(size.width)
            && u64::from(self.y) + u64::from(self.height) <= u64::from(size.height)
    }

    pub fn as_box(&self) -> BoundingBox {
        BoundingBox::new(self.x as f32, self.y as f32, self.width as f32, self.height as f32)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Ready,
    Loading,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct YoloParams {
    pub input_size: u32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

impl Default for YoloParams {
    fn default() -> Self {
        Self { input_size: 640, iou_threshold: 0.45, max_detections: 100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: ModelId,
    #[serde(default)]
    pub name: String,
    /// Path of the weights artifact.
    pub filename: String,
    #[serde(default)]
    pub file_size: u64,
    pub classes: Vec<ModelClass>,
    /// Minimum confidence for a detection to be reported, 0..=1.
    pub confidence: f32,
    #[serde(default)]
    pub roi: Option<Roi>,
    #[serde(default)]
    pub params: YoloParams,
}

impl Model {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.id.0.trim().is_empty() {
            return Err(ConfigurationError::new("id", "model id must not be empty"));
        }
        validate_confidence(self.confidence)?;
        validate_classes(&self.classes)?;
        if let Some(roi) = self.roi {
            if roi.width == 0 || roi.height == 0 {
                return Err(ConfigurationError::new("roi", "width and height must be positive"));
            }
        }
        Ok(())
    }

    pub fn class(&self, class_id: u32) -> Option<&ModelClass> {
        self.classes.iter().find(|c| c.id == class_id)
    }

    /// Applies an operator edit, returning the new configuration without
    /// touching `self`.
    pub fn with_update(&self, update: &ModelUpdate) -> Result<Model, ConfigurationError> {
        let mut next = self.clone();
        if let Some(confidence) = update.confidence {
            next.confidence = confidence;
        }
        if let Some(classes) = &update.classes {
            next.classes = classes.clone();
        }
        if update.clear_roi {
            next.roi = None;
        } else if let Some(roi) = update.roi {
            next.roi = Some(roi);
        }
        next.validate()?;
        Ok(next)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelUpdate {
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub roi: Option<Roi>,
    #[serde(default)]
    pub clear_roi: bool,
    #[serde(default)]
    pub classes: Option<Vec<ModelClass>>,
}

fn validate_confidence(confidence: f32) -> Result<(), ConfigurationError> {
    if !(0.0..=1.0).contains(&confidence) {
        return Err(ConfigurationError::new("confidence", "must be within 0..=1"));
    }
    Ok(())
}

fn validate_classes(classes: &[ModelClass]) -> Result<(), ConfigurationError> {
    let mut seen = HashSet::new();
    for class in classes {
        if !seen.insert(class.id) {
            return Err(ConfigurationError::new(
                "classes",
                format!("duplicate class id {}", class.id),
            ));
        }
        if class.name.trim().is_empty() {
            return Err(ConfigurationError::new(
                "classes",
                format!("class {} has an empty name", class.id),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> Model {
        Model {
            id: ModelId::new("model-1"),
            name: "scratch detector".into(),
            filename: "models/scratch.onnx".into(),
            file_size: 0,
            classes: vec![
                ModelClass { id: 0, name: "OK".into(), color: "#22c55e".into() },
                ModelClass { id: 1, name: "scratch".into(), color: "#ef4444".into() },
            ],
            confidence: 0.7,
            roi: None,
            params: YoloParams::default(),
        }
    }

    #[test]
    fn rejects_duplicate_class_ids() {
        let mut m = model();
        m.classes.push(ModelClass { id: 1, name: "dent".into(), color: String::new() });
        assert_eq!(m.validate().unwrap_err().field, "classes");
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let update = ModelUpdate { confidence: Some(1.2), ..Default::default() };
        assert!(model().with_update(&update).is_err());
    }

    #[test]
    fn update_leaves_original_untouched() {
        let original = model();
        let update = ModelUpdate {
            confidence: Some(0.5),
            roi: Some(Roi { x: 10, y: 10, width: 100, height: 50 }),
            ..Default::default()
        };
        let next = original.with_update(&update).unwrap();
        assert_eq!(next.confidence, 0.5);
        assert!(next.roi.is_some());
        assert_eq!(original.confidence, 0.7);
        assert!(original.roi.is_none());
    }

    #[test]
    fn roi_must_fit_resolution() {
        let roi = Roi { x: 600, y: 0, width: 100, height: 100 };
        assert!(!roi.fits_within(FrameSize { width: 640, height: 480 }));
        assert!(roi.fits_within(FrameSize { width: 700, height: 480 }));
    }
}
