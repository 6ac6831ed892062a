// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Datalake Developers. All Rights Reserved.

//! Annotation and image validation.
//!
//! An annotation record is a JSON object with three required keys:
//!
//! ```json
//! {
//!   "label": ["bottle", "can"],
//!   "bbox": [[12, 40, 64, 128], [0.5, 0.5, 10.25, 8]],
//!   "image_path": "beach/images/0001.png"
//! }
//! ```
//!
//! - `label`: non-empty list
//! - `bbox`: non-empty list whose entries are lists of exactly four numbers
//! - `image_path`: object name of the image within the source bucket
//!
//! Additional keys are allowed and carried through untouched.

use crate::error::ValidationError;
use serde_json::{Map, Value};
use std::io::Cursor;

/// A validated annotation record.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationRecord {
    pub label: Vec<Value>,
    pub bbox: Vec<[f64; 4]>,
    pub image_path: String,
    /// Keys beyond the required ones.
    pub extra: Map<String, Value>,
}

fn check_annotation(json: &Value) -> Result<(), String> {
    let object = json
        .as_object()
        .ok_or_else(|| "annotation is not a JSON object".to_owned())?;

    for key in ["label", "bbox", "image_path"] {
        if !object.contains_key(key) {
            return Err(format!("missing required key '{}'", key));
        }
    }

    match object.get("label") {
        Some(Value::Array(labels)) if !labels.is_empty() => {}
        _ => return Err("'label' must be a non-empty list".to_owned()),
    }

    let boxes = match object.get("bbox") {
        Some(Value::Array(boxes)) if !boxes.is_empty() => boxes,
        _ => return Err("'bbox' must be a non-empty list".to_owned()),
    };

    for (index, bbox) in boxes.iter().enumerate() {
        match bbox {
            Value::Array(values) if values.len() == 4 && values.iter().all(Value::is_number) => {}
            _ => {
                return Err(format!(
                    "'bbox[{}]' must be a list of exactly 4 numbers",
                    index
                ));
            }
        }
    }

    match object.get("image_path") {
        Some(Value::String(path)) if !path.is_empty() => Ok(()),
        _ => Err("'image_path' must be a non-empty string".to_owned()),
    }
}

/// Returns true if `json` satisfies the annotation record schema.
///
/// Pure function, performs no I/O.
pub fn validate_annotation(json: &Value) -> bool {
    check_annotation(json).is_ok()
}

/// Decode and validate raw annotation bytes.
///
/// Distinguishes undecodable input ([`ValidationError::MalformedJson`]) from
/// well-formed JSON that violates the schema ([`ValidationError::Schema`]).
pub fn parse_annotation(data: &[u8]) -> Result<AnnotationRecord, ValidationError> {
    let text =
        std::str::from_utf8(data).map_err(|e| ValidationError::MalformedJson(e.to_string()))?;
    let json: Value =
        serde_json::from_str(text).map_err(|e| ValidationError::MalformedJson(e.to_string()))?;

    check_annotation(&json).map_err(ValidationError::Schema)?;

    let Value::Object(mut object) = json else {
        return Err(ValidationError::Schema(
            "annotation is not a JSON object".to_owned(),
        ));
    };

    let label = match object.remove("label") {
        Some(Value::Array(labels)) => labels,
        _ => Vec::new(),
    };
    let bbox = match object.remove("bbox") {
        Some(Value::Array(boxes)) => boxes
            .iter()
            .filter_map(|b| {
                let v = b.as_array()?;
                Some([
                    v.first()?.as_f64()?,
                    v.get(1)?.as_f64()?,
                    v.get(2)?.as_f64()?,
                    v.get(3)?.as_f64()?,
                ])
            })
            .collect(),
        _ => Vec::new(),
    };
    let image_path = match object.remove("image_path") {
        Some(Value::String(path)) => path,
        _ => String::new(),
    };

    Ok(AnnotationRecord {
        label,
        bbox,
        image_path,
        extra: object,
    })
}

/// Decode an image and report its dimensions.
///
/// The header is probed first so obviously broken data is rejected without a
/// decoder; the full decode then catches truncated or corrupt pixel data.
pub fn check_image(data: &[u8]) -> Result<(u32, u32), ValidationError> {
    imagesize::blob_size(data).map_err(|e| ValidationError::CorruptImage(e.to_string()))?;

    let image = image::ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| ValidationError::CorruptImage(e.to_string()))?
        .decode()
        .map_err(|e| ValidationError::CorruptImage(e.to_string()))?;

    Ok((image.width(), image.height()))
}

/// Returns true if `data` decodes as an image. Never panics.
pub fn validate_image(data: &[u8]) -> bool {
    check_image(data).is_ok()
}
