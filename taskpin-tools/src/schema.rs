//! Declarative tool argument schemas.
//!
//! A tool describes its arguments as a list of [`FieldSpec`]s plus
//! cross-field [`Rule`]s. The registry validates every call against the
//! schema before the tool runs, and the same schema renders the JSON
//! Schema advertised to the model.

use serde_json::{Map, Value, json};
use taskpin_core::error::ToolError;

/// Extra per-field check run after the type check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validator {
    /// Must contain something besides whitespace.
    NonBlank,
}

/// One string-valued argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub required: bool,
    pub description: &'static str,
    pub validators: Vec<Validator>,
}

impl FieldSpec {
    pub fn required(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            required: true,
            description,
            validators: Vec::new(),
        }
    }

    pub fn optional(name: &'static str, description: &'static str) -> Self {
        Self {
            required: false,
            ..Self::required(name, description)
        }
    }

    pub fn with(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }
}

/// Constraints that span fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    /// Exactly one of these fields must be present.
    ExactlyOneOf(&'static [&'static str]),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgumentSchema {
    pub fields: Vec<FieldSpec>,
    pub rules: Vec<Rule>,
}

impl ArgumentSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// JSON Schema for the model's function-calling interface.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for field in &self.fields {
            properties.insert(
                field.name.to_string(),
                json!({
                    "type": "string",
                    "description": field.description,
                }),
            );
        }
        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name)
            .collect();

        let mut schema = json!({
            "type": "object",
            "properties": properties,
        });
        if !required.is_empty() {
            schema["required"] = json!(required);
        }
        schema
    }

    /// Check `args` against the schema. `null` values count as absent and
    /// string values are trimmed. Unknown fields are dropped.
    pub fn validate(&self, tool: &str, args: Value) -> Result<Arguments, ToolError> {
        let mut object = match args {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(ToolError::invalid(
                    tool,
                    "arguments",
                    format!("expected a JSON object, got {}", short(&other)),
                ));
            }
        };

        let mut values = Map::new();
        for field in &self.fields {
            let value = match object.remove(field.name) {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s.trim().to_string()),
                Some(other) => {
                    return Err(ToolError::invalid(
                        tool,
                        field.name,
                        format!("must be a string, got {}", short(&other)),
                    ));
                }
            };
            let Some(value) = value else {
                if field.required {
                    return Err(ToolError::invalid(tool, field.name, "is required"));
                }
                continue;
            };
            for validator in &field.validators {
                check(tool, field.name, validator, &value)?;
            }
            values.insert(field.name.to_string(), Value::String(value));
        }

        for rule in &self.rules {
            match rule {
                Rule::ExactlyOneOf(names) => {
                    let present = names.iter().filter(|n| values.contains_key(**n)).count();
                    if present != 1 {
                        return Err(ToolError::invalid(
                            tool,
                            names.join("|"),
                            if present == 0 {
                                "one of these is required"
                            } else {
                                "give only one of these"
                            },
                        ));
                    }
                }
            }
        }

        if !object.is_empty() {
            let extra: Vec<&String> = object.keys().collect();
            tracing::debug!(tool, ?extra, "Ignoring unknown arguments");
        }
        Ok(Arguments { values })
    }
}

fn check(tool: &str, field: &str, validator: &Validator, value: &str) -> Result<(), ToolError> {
    match validator {
        Validator::NonBlank => {
            if value.is_empty() {
                return Err(ToolError::invalid(tool, field, "must not be empty"));
            }
        }
    }
    Ok(())
}

fn short(value: &Value) -> &'static str {
    match value {
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Number(_) => "a number",
        Value::Bool(_) => "a boolean",
        Value::Null | Value::Object(_) => "something else",
    }
}

/// Arguments that passed validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    values: Map<String, Value>,
}

impl Arguments {
    pub fn str(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(Value::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn schema() -> ArgumentSchema {
        ArgumentSchema::new()
            .field(
                FieldSpec::required("title", "Task title")
                    .with(Validator::NonBlank),
            )
            .field(FieldSpec::optional("due", "Due date"))
            .field(FieldSpec::optional("priority", "Priority"))
    }

    #[test]
    fn test_json_schema_shape() {
        assert_eq!(
            schema().to_json_schema(),
            json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string", "description": "Task title"},
                    "due": {"type": "string", "description": "Due date"},
                    "priority": {"type": "string", "description": "Priority"}
                },
                "required": ["title"]
            })
        );
    }

    #[test]
    fn test_valid_arguments_are_trimmed() {
        let args = schema()
            .validate("create_task", json!({"title": "  Essay ", "due": null, "extra": 1}))
            .unwrap();
        assert_eq!(args.str("title"), Some("Essay"));
        assert!(!args.contains("due"));
        assert!(!args.contains("extra"));
    }

    #[test]
    fn test_missing_required_field_is_named() {
        let err = schema().validate("create_task", json!({})).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid arguments for tool 'create_task': title: is required"
        );
    }

    #[test]
    fn test_blank_title_rejected() {
        let err = schema()
            .validate("create_task", json!({"title": "   "}))
            .unwrap_err();
        assert!(err.to_string().contains("title: must not be empty"));
    }

    #[test]
    fn test_non_string_value_rejected() {
        let err = schema()
            .validate("create_task", json!({"title": 5}))
            .unwrap_err();
        assert!(err.to_string().contains("title: must be a string, got a number"));
    }

    #[test]
    fn test_priority_is_free_text() {
        let args = schema()
            .validate("create_task", json!({"title": "x", "priority": "wichtig"}))
            .unwrap();
        assert_eq!(args.str("priority"), Some("wichtig"));
    }

    #[test]
    fn test_exactly_one_of() {
        let s = ArgumentSchema::new()
            .field(FieldSpec::optional("title", "t"))
            .field(FieldSpec::optional("id", "i"))
            .rule(Rule::ExactlyOneOf(&["title", "id"]));

        assert!(s.validate("complete_task", json!({"id": "a"})).is_ok());
        let none = s.validate("complete_task", json!({})).unwrap_err();
        assert!(none.to_string().contains("title|id: one of these is required"));
        let both = s
            .validate("complete_task", json!({"id": "a", "title": "b"}))
            .unwrap_err();
        assert!(both.to_string().contains("give only one"));
    }

    #[test]
    fn test_non_object_arguments() {
        let err = schema()
            .validate("create_task", Value::String("{broken".into()))
            .unwrap_err();
        assert!(err.to_string().contains("arguments: expected a JSON object"));
        assert!(!err.class().is_transient());
    }
}
