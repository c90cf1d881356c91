//! Component configuration schemas.
//!
//! Node configuration arrives as raw JSON. Before any component code runs it
//! is checked once against the component's [`ConfigSchema`]: required fields
//! must be present, present fields must have the declared kind, and declared
//! defaults are filled in. Components then read from the resulting
//! [`Configuration`] without re-validating.

use crate::error::ComponentError;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};

/// The JSON kind a configuration field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
    /// Anything, including null.
    Any,
}

impl FieldKind {
    fn accepts(&self, value: &JsonValue) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::String => "a string",
            Self::Number => "a number",
            Self::Boolean => "a boolean",
            Self::Object => "an object",
            Self::Array => "an array",
            Self::Any => "any value",
        }
    }
}

/// One field of a configuration schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigField {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    pub default: Option<JsonValue>,
}

impl ConfigField {
    /// A field that must be present.
    #[must_use]
    pub fn required(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            default: None,
        }
    }

    /// A field that may be omitted.
    #[must_use]
    pub fn optional(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default: None,
        }
    }

    /// Sets the value used when the field is omitted.
    #[must_use]
    pub fn with_default(mut self, default: JsonValue) -> Self {
        self.default = Some(default);
        self
    }
}

/// The configuration a component or trigger accepts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigSchema {
    fields: Vec<ConfigField>,
}

impl ConfigSchema {
    /// A schema with no fields.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field.
    #[must_use]
    pub fn field(mut self, field: ConfigField) -> Self {
        self.fields.push(field);
        self
    }

    /// Returns the declared fields.
    #[must_use]
    pub fn fields(&self) -> &[ConfigField] {
        &self.fields
    }

    /// Validates raw node configuration.
    ///
    /// `null` is treated as an empty object. Keys the schema does not declare
    /// are kept as they are.
    ///
    /// # Errors
    ///
    /// Returns `ComponentError::InvalidConfiguration` naming the first
    /// offending field.
    pub fn validate(&self, raw: &JsonValue) -> Result<Configuration, ComponentError> {
        let mut values = match raw {
            JsonValue::Object(map) => map.clone(),
            JsonValue::Null => Map::new(),
            other => {
                return Err(ComponentError::invalid_configuration(format!(
                    "expected an object, got {other}"
                )));
            }
        };

        for field in &self.fields {
            match values.get(&field.name) {
                Some(JsonValue::Null) | None => {
                    if let Some(default) = &field.default {
                        values.insert(field.name.clone(), default.clone());
                    } else if field.required {
                        return Err(ComponentError::invalid_configuration(format!(
                            "missing required field '{}'",
                            field.name
                        )));
                    }
                }
                Some(value) if !field.kind.accepts(value) => {
                    return Err(ComponentError::invalid_configuration(format!(
                        "field '{}' must be {}",
                        field.name,
                        field.kind.name()
                    )));
                }
                Some(_) => {}
            }
        }

        Ok(Configuration(values))
    }
}

/// Configuration that passed schema validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configuration(Map<String, JsonValue>);

impl Configuration {
    /// Returns a field's value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.0.get(name).filter(|v| !v.is_null())
    }

    /// Returns a string field.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(JsonValue::as_str)
    }

    /// Returns a boolean field.
    #[must_use]
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(JsonValue::as_bool)
    }

    /// Decodes the whole configuration into a typed struct.
    ///
    /// # Errors
    ///
    /// Returns `ComponentError::InvalidConfiguration` if decoding fails.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ComponentError> {
        serde_json::from_value(JsonValue::Object(self.0.clone()))
            .map_err(|e| ComponentError::invalid_configuration(e.to_string()))
    }

    /// Returns the configuration as a JSON object.
    #[must_use]
    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn schema() -> ConfigSchema {
        ConfigSchema::new()
            .field(ConfigField::required("project", FieldKind::String))
            .field(ConfigField::optional("timeout", FieldKind::Number).with_default(json!(30)))
            .field(ConfigField::optional("labels", FieldKind::Array))
    }

    #[test]
    fn fills_defaults() {
        let config = schema().validate(&json!({"project": "api"})).unwrap();
        assert_eq!(config.get_str("project"), Some("api"));
        assert_eq!(config.get("timeout"), Some(&json!(30)));
        assert!(config.get("labels").is_none());
    }

    #[test]
    fn missing_required_field() {
        let err = schema().validate(&json!({})).unwrap_err();
        assert_eq!(
            err,
            ComponentError::invalid_configuration("missing required field 'project'")
        );
    }

    #[test]
    fn wrong_kind() {
        let err = schema()
            .validate(&json!({"project": "api", "timeout": "soon"}))
            .unwrap_err();
        assert!(err.to_string().contains("field 'timeout' must be a number"));
    }

    #[test]
    fn null_means_empty() {
        let config = ConfigSchema::new().validate(&JsonValue::Null).unwrap();
        assert_eq!(config.to_json(), json!({}));
    }

    #[test]
    fn non_object_rejected() {
        assert!(ConfigSchema::new().validate(&json!([1])).is_err());
    }

    #[test]
    fn decode_into_struct() {
        #[derive(Deserialize)]
        struct Settings {
            project: String,
            timeout: u64,
        }

        let settings: Settings = schema()
            .validate(&json!({"project": "api"}))
            .unwrap()
            .decode()
            .unwrap();
        assert_eq!(settings.project, "api");
        assert_eq!(settings.timeout, 30);
    }
}
