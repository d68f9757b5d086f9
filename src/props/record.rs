use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{FarmError, Result};

pub type Vec3 = [f64; 3];

/// Grip placement of a prop relative to the holding bone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandGrip {
    pub offset: Vec3,
    pub rotation: Vec3,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bone: Option<String>,
}

/// A validated prop. `name` is the identity; everything else is replaced
/// wholesale on re-registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropRecord {
    pub name: String,
    pub model_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    pub bbox: Vec3,
    pub hand_grip: HandGrip,
    pub scale: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physics: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandGripDraft {
    #[serde(default)]
    pub offset: Option<Vec<f64>>,
    #[serde(default)]
    pub rotation: Option<Vec<f64>>,
    #[serde(default)]
    pub bone: Option<String>,
}

/// A prop as submitted by an editor, before validation. Vectors are loose
/// here so a wrong-length vector is reported as a validation error instead
/// of a decode failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropDraft {
    pub name: String,
    #[serde(default, alias = "model")]
    pub model_path: String,
    #[serde(default)]
    pub preview: Option<String>,
    pub bbox: Vec<f64>,
    #[serde(default)]
    pub hand_grip: Option<HandGripDraft>,
    #[serde(default)]
    pub scale: Option<f64>,
    #[serde(default)]
    pub physics: Option<Map<String, Value>>,
}

impl PropDraft {
    pub fn validate(self) -> Result<PropRecord> {
        if self.name.trim().is_empty() {
            return Err(FarmError::Validation("name must not be empty".into()));
        }

        let bbox = vec3("bbox", &self.bbox)?;
        if bbox.iter().any(|c| *c < 0.0) {
            return Err(FarmError::Validation(
                "bbox components must be non-negative".into(),
            ));
        }

        let grip = self.hand_grip.unwrap_or_default();
        let hand_grip = HandGrip {
            offset: optional_vec3("hand_grip.offset", grip.offset.as_deref())?,
            rotation: optional_vec3("hand_grip.rotation", grip.rotation.as_deref())?,
            bone: grip.bone,
        };

        let scale = self.scale.unwrap_or(1.0);
        if !scale.is_finite() || scale <= 0.0 {
            return Err(FarmError::Validation(format!(
                "scale must be a positive number, got {scale}"
            )));
        }

        Ok(PropRecord {
            name: self.name,
            model_path: self.model_path,
            preview: self.preview,
            bbox,
            hand_grip,
            scale,
            physics: self.physics,
        })
    }
}

impl From<PropRecord> for PropDraft {
    fn from(record: PropRecord) -> Self {
        Self {
            name: record.name,
            model_path: record.model_path,
            preview: record.preview,
            bbox: record.bbox.to_vec(),
            hand_grip: Some(HandGripDraft {
                offset: Some(record.hand_grip.offset.to_vec()),
                rotation: Some(record.hand_grip.rotation.to_vec()),
                bone: record.hand_grip.bone,
            }),
            scale: Some(record.scale),
            physics: record.physics,
        }
    }
}

fn vec3(field: &str, values: &[f64]) -> Result<Vec3> {
    let v: Vec3 = values.try_into().map_err(|_| {
        FarmError::Validation(format!(
            "{field} must have exactly 3 components, got {}",
            values.len()
        ))
    })?;
    if v.iter().any(|c| !c.is_finite()) {
        return Err(FarmError::Validation(format!("{field} must be finite")));
    }
    Ok(v)
}

/// Absent vectors become zero; present ones must still be 3 long.
fn optional_vec3(field: &str, values: Option<&[f64]>) -> Result<Vec3> {
    values.map_or(Ok([0.0; 3]), |v| vec3(field, v))
}

/// A registered prop with its revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredProp {
    #[serde(flatten)]
    pub record: PropRecord,
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}
