//! Response shape validation.

use std::fmt;

use serde_json::Value;

use keystone_types::ValidationIssue;

use crate::FetchSetupError;

/// Checks a (transformed) response value.
///
/// Returns every offending path so the resulting validation failure can
/// point at all of them at once.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, value: &Value) -> Result<(), Vec<ValidationIssue>>;
}

impl<F> SchemaValidator for F
where
    F: Fn(&Value) -> Result<(), Vec<ValidationIssue>> + Send + Sync,
{
    fn validate(&self, value: &Value) -> Result<(), Vec<ValidationIssue>> {
        self(value)
    }
}

/// JSON Schema backed validator.
pub struct JsonSchemaValidator {
    validator: jsonschema::Validator,
}

impl fmt::Debug for JsonSchemaValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonSchemaValidator").finish_non_exhaustive()
    }
}

impl JsonSchemaValidator {
    pub fn new(schema: &Value) -> Result<Self, FetchSetupError> {
        let validator = jsonschema::validator_for(schema)
            .map_err(|e| FetchSetupError::Schema(e.to_string()))?;
        Ok(Self { validator })
    }
}

impl SchemaValidator for JsonSchemaValidator {
    fn validate(&self, value: &Value) -> Result<(), Vec<ValidationIssue>> {
        let issues: Vec<ValidationIssue> = self
            .validator
            .iter_errors(value)
            .map(|error| {
                let schema_path = error.schema_path().to_string();
                let keyword = schema_path
                    .rsplit('/')
                    .find(|segment| !segment.is_empty() && segment.parse::<usize>().is_err())
                    .unwrap_or("schema")
                    .to_string();
                ValidationIssue::new(error.instance_path().to_string(), keyword, error.to_string())
            })
            .collect();

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}
