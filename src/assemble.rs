//! Build document assembly.
//!
//! Pure data transformation: the extracted bundle metadata plus the build
//! hash become one [`BuildDocument`]. No I/O happens here.

use chrono::NaiveDate;
use serde_json::Value;

use crate::error::ItemError;
use crate::extract::ExtractedBundle;
use crate::models::BuildDocument;

/// Recursively replace every JSON boolean with the string `"true"` or
/// `"false"`, including inside arrays and nested objects.
///
/// The search backend infers field types from the first document it sees and
/// rejects later documents where the same field arrives as a different type.
/// Spec metadata flips between booleans and strings across versions, so every
/// boolean is stored as a string.
pub fn normalize_booleans(value: Value) -> Value {
    match value {
        Value::Bool(b) => Value::String(b.to_string()),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_booleans).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, normalize_booleans(v)))
                .collect(),
        ),
        other => other,
    }
}

/// Combine extracted metadata into the document written to the index.
///
/// # Errors
///
/// [`ItemError::Assemble`] when `spec.json` is not an object with a `spec`
/// field, or when `install_times.json` is not an object.
pub fn assemble(
    hash: &str,
    bundle: ExtractedBundle,
    ingestion_date: NaiveDate,
) -> Result<BuildDocument, ItemError> {
    let spec = match bundle.spec_json {
        Value::Object(mut fields) => fields
            .remove("spec")
            .ok_or_else(|| ItemError::Assemble("spec.json has no 'spec' field".to_string()))?,
        _ => {
            return Err(ItemError::Assemble(
                "spec.json is not a JSON object".to_string(),
            ))
        }
    };

    let install_times = match normalize_booleans(bundle.install_times) {
        Value::Object(map) => map,
        _ => {
            return Err(ItemError::Assemble(
                "install_times.json is not a JSON object".to_string(),
            ))
        }
    };

    Ok(BuildDocument {
        hash: hash.to_string(),
        spec: normalize_booleans(spec),
        install_times,
        build_phase_logs: bundle.phase_logs,
        ingestion_date,
    })
}
