//! JSON-Schema compilation and validation (draft 2020-12).
//!
//! An empty schema validates any input. Compilation is eager at tool
//! registration so malformed schemas surface at load time, not at first use.

use serde_json::Value;

use weft_kernel::EngineError;

/// Validation hook threaded through the safe-invoke path so callers (and
/// tests) can substitute their own.
pub type ValidateFn = fn(&[u8], &Value) -> Result<(), EngineError>;

/// Compiles the schema, returning an error only when the schema itself is
/// invalid. No instance data is validated.
pub fn compile_schema(schema: &[u8]) -> Result<(), EngineError> {
    if schema.is_empty() {
        return Ok(());
    }
    let doc = parse_schema(schema)?;
    jsonschema::Validator::new(&doc)
        .map(|_| ())
        .map_err(|e| EngineError::validation("invalid_schema", e.to_string()))
}

/// Validates `data` against the schema.
pub fn validate_schema(schema: &[u8], data: &Value) -> Result<(), EngineError> {
    if schema.is_empty() {
        return Ok(());
    }
    let doc = parse_schema(schema)?;
    let validator = jsonschema::Validator::new(&doc)
        .map_err(|e| EngineError::validation("invalid_schema", e.to_string()))?;
    if validator.is_valid(data) {
        return Ok(());
    }
    let violations: Vec<String> = validator.iter_errors(data).map(|e| e.to_string()).collect();
    Err(EngineError::validation(
        "schema_violation",
        violations.join("; "),
    ))
}

fn parse_schema(schema: &[u8]) -> Result<Value, EngineError> {
    serde_json::from_slice(schema)
        .map_err(|e| EngineError::validation("invalid_schema", format!("schema is not JSON: {e}")))
}
