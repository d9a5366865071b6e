//! Schema compilation and validation. Grounded on the `jsonschema` crate
//! (present in the retrieval pack) compiled once per registered event name,
//! mirroring the teacher's `lazy_static!`-style one-time-setup idiom for
//! metrics registration: schemas are compiled once at startup and reused
//! for every message.

use std::collections::HashMap;

use jsonschema::Validator;
use serde_json::Value;

use crate::error::DispatcherError;
use crate::model::reserved_events;

/// A custom validator delegate, invoked instead of the compiled schema for
/// any event that isn't `register` or `ping`, per spec.md §4.8 step 3.
pub type ValidationCallback = Box<dyn Fn(&str, &Value) -> Result<(), String> + Send + Sync>;

/// The mandatory schema every `redisMetadata` object must satisfy.
fn redis_metadata_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "required": ["origin"],
        "properties": {
            "origin": { "type": "string" }
        }
    })
}

/// Compiled per-event validators plus the mandatory envelope schema,
/// matching the `eventsValidation.eventsValidationFn` /
/// `eventsValidation.validationCbFn` configuration options in spec.md §6.
pub struct Validators {
    redis_metadata: Validator,
    event_schemas: HashMap<String, Validator>,
    callback: Option<ValidationCallback>,
}

impl Validators {
    /// Build validators from a map of event name -> JSON Schema. `register`
    /// and `ping` always get a permissive default schema if the caller
    /// didn't register one explicitly, since the dispatcher must always be
    /// able to handle them.
    pub fn new(
        event_schemas: HashMap<String, Value>,
        callback: Option<ValidationCallback>,
    ) -> Result<Self, DispatcherError> {
        let redis_metadata = jsonschema::validator_for(&redis_metadata_schema())
            .map_err(|e| DispatcherError::SchemaCompile(e.to_string()))?;

        let mut compiled = HashMap::new();
        for (name, schema) in event_schemas {
            let validator = jsonschema::validator_for(&schema)
                .map_err(|e| DispatcherError::SchemaCompile(format!("{name}: {e}")))?;
            compiled.insert(name, validator);
        }

        compiled
            .entry(reserved_events::REGISTER.to_string())
            .or_insert_with(|| jsonschema::validator_for(&permissive_schema()).unwrap());
        compiled
            .entry(reserved_events::PING.to_string())
            .or_insert_with(|| jsonschema::validator_for(&permissive_schema()).unwrap());
        compiled
            .entry(reserved_events::APPROVEMENT.to_string())
            .or_insert_with(|| jsonschema::validator_for(&permissive_schema()).unwrap());
        compiled
            .entry(reserved_events::OK.to_string())
            .or_insert_with(|| jsonschema::validator_for(&permissive_schema()).unwrap());

        Ok(Self {
            redis_metadata,
            event_schemas: compiled,
            callback,
        })
    }

    /// Validate `redisMetadata` against the mandatory schema.
    pub fn validate_metadata(&self, metadata: &Value) -> Result<(), DispatcherError> {
        if self.redis_metadata.is_valid(metadata) {
            Ok(())
        } else {
            Err(DispatcherError::MalformedMessage(
                "redisMetadata failed schema validation".to_string(),
            ))
        }
    }

    /// Validate an event body: a custom callback takes precedence for
    /// anything other than `register`/`ping`; otherwise fall back to the
    /// compiled per-event schema. An event with no registered schema at all
    /// is rejected as unknown, per spec.md §4.8 step 3.
    pub fn validate_event(&self, name: &str, data: &Value) -> Result<(), DispatcherError> {
        if name != reserved_events::REGISTER && name != reserved_events::PING {
            if let Some(callback) = &self.callback {
                return callback(name, data).map_err(DispatcherError::MalformedMessage);
            }
        }

        match self.event_schemas.get(name) {
            Some(validator) if validator.is_valid(data) => Ok(()),
            Some(_) => Err(DispatcherError::MalformedMessage(format!(
                "event {name} failed schema validation"
            ))),
            None => Err(DispatcherError::UnknownEvent(name.to_string())),
        }
    }
}

fn permissive_schema() -> Value {
    serde_json::json!(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_event_is_rejected() {
        let validators = Validators::new(HashMap::new(), None).unwrap();
        let err = validators
            .validate_event("somethingUnregistered", &serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, DispatcherError::UnknownEvent(_)));
    }

    #[test]
    fn register_and_ping_always_pass() {
        let validators = Validators::new(HashMap::new(), None).unwrap();
        assert!(validators.validate_event("register", &serde_json::json!({})).is_ok());
        assert!(validators.validate_event("ping", &serde_json::json!({})).is_ok());
    }

    #[test]
    fn registered_schema_is_enforced() {
        let mut schemas = HashMap::new();
        schemas.insert(
            "accountingFolder".to_string(),
            serde_json::json!({
                "type": "object",
                "required": ["operation"],
            }),
        );
        let validators = Validators::new(schemas, None).unwrap();
        assert!(validators
            .validate_event("accountingFolder", &serde_json::json!({"operation": "CREATE"}))
            .is_ok());
        assert!(validators
            .validate_event("accountingFolder", &serde_json::json!({}))
            .is_err());
    }

    #[test]
    fn custom_callback_takes_precedence_for_non_reserved_events() {
        let mut schemas = HashMap::new();
        schemas.insert("custom".to_string(), serde_json::json!(true));
        let callback: ValidationCallback = Box::new(|name, _data| {
            if name == "custom" {
                Err("always rejected by callback".to_string())
            } else {
                Ok(())
            }
        });
        let validators = Validators::new(schemas, Some(callback)).unwrap();
        assert!(validators.validate_event("custom", &serde_json::json!({})).is_err());
    }
}
