//! Pure merge rules used by the update paths.

use serde_json::{Map, Value};

/// Apply a message content patch.
///
/// Top-level keys in `patch` replace their counterparts in `existing`. The
/// `metadata` key is the exception: when both sides hold objects they are
/// merged recursively, so a patch can add one metadata flag without
/// dropping the others.
pub fn merge_content(existing: &Value, patch: &Map<String, Value>) -> Value {
    let mut merged = match existing {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    for (key, value) in patch {
        if key == "metadata" {
            if let (Some(Value::Object(current)), Value::Object(incoming)) =
                (merged.get_mut("metadata"), value)
            {
                deep_merge(current, incoming);
                continue;
            }
        }
        merged.insert(key.clone(), value.clone());
    }

    Value::Object(merged)
}

/// Recursively merge `patch` into `target`; patch values win on leaves.
pub fn deep_merge(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        match (target.get_mut(key), value) {
            (Some(Value::Object(current)), Value::Object(incoming)) => {
                deep_merge(current, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Shallow metadata merge: supplied keys win, the rest are kept.
pub fn merge_metadata(
    existing: Option<&Map<String, Value>>,
    patch: Option<&Map<String, Value>>,
) -> Map<String, Value> {
    let mut merged = existing.cloned().unwrap_or_default();
    if let Some(patch) = patch {
        for (key, value) in patch {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}
