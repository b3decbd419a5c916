//! Payload to model-input encoding.
//!
//! Two forms are accepted:
//! - `{"input": [x0, x1, ...]}`: taken verbatim, zero-padded to the input
//!   dimension
//! - any other object: BLAKE3 feature hashing of the action name and each
//!   top-level `key=value` pair, normalised by the feature count
//!
//! Keys of a JSON object are iterated in sorted order, so the encoding is
//! independent of how the caller ordered them.

use lattice_protocol::Action;
use serde_json::Value;

use crate::error::TransitionError;

pub fn encode_input(action: Action, payload: &Value, dim: usize) -> Result<Vec<f64>, TransitionError> {
    let fields = payload
        .as_object()
        .ok_or_else(|| TransitionError::InvalidPayload("payload must be a JSON object".into()))?;

    if let Some(explicit) = fields.get("input") {
        return explicit_input(explicit, dim);
    }

    let mut features = Vec::with_capacity(fields.len() + 1);
    features.push(format!("action={}", action.as_str()));
    for (key, value) in fields {
        features.push(format!("{key}={value}"));
    }
    Ok(hash_features(&features, dim))
}

fn explicit_input(value: &Value, dim: usize) -> Result<Vec<f64>, TransitionError> {
    let items = value
        .as_array()
        .ok_or_else(|| TransitionError::InvalidPayload("`input` must be an array".into()))?;
    if items.len() > dim {
        return Err(TransitionError::DimensionMismatch {
            what: "input",
            expected: dim,
            got: items.len(),
        });
    }
    let mut input = vec![0.0; dim];
    for (slot, item) in input.iter_mut().zip(items) {
        let x = item.as_f64().ok_or_else(|| {
            TransitionError::InvalidPayload(format!("`input` element {item} is not a number"))
        })?;
        if !x.is_finite() {
            return Err(TransitionError::NonFinite("input"));
        }
        *slot = x;
    }
    Ok(input)
}

fn hash_features(features: &[String], dim: usize) -> Vec<f64> {
    let mut input = vec![0.0; dim];
    if dim == 0 || features.is_empty() {
        return input;
    }
    for feature in features {
        let digest = blake3::hash(feature.as_bytes());
        let bytes = digest.as_bytes();
        let mut index = [0u8; 8];
        index.copy_from_slice(&bytes[..8]);
        let slot = (u64::from_le_bytes(index) % dim as u64) as usize;
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
        input[slot] += sign;
    }
    let scale = 1.0 / (features.len() as f64).sqrt();
    input.iter_mut().for_each(|x| *x *= scale);
    input
}
