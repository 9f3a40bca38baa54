//! Slot validators referenced by `collect` steps

use regex::Regex;
use serde_json::{Number, Value};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern is valid")
});

/// Checks (and possibly normalizes) a candidate slot value
pub trait SlotValidator: Send + Sync {
    /// Returns the value to store, or a user-facing rejection reason
    fn validate(&self, value: &Value) -> Result<Value, String>;
}

impl<F> SlotValidator for F
where
    F: Fn(&Value) -> Result<Value, String> + Send + Sync,
{
    fn validate(&self, value: &Value) -> Result<Value, String> {
        self(value)
    }
}

/// Named validators available to flows
#[derive(Clone)]
pub struct ValidatorRegistry {
    validators: HashMap<String, Arc<dyn SlotValidator>>,
}

impl ValidatorRegistry {
    /// Registry with the built-in validators
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register("not_empty", not_empty);
        registry.register("number", number);
        registry.register("integer", integer);
        registry.register("boolean", boolean);
        registry.register("email", email);
        registry
    }

    pub fn empty() -> Self {
        Self {
            validators: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, validator: impl SlotValidator + 'static) {
        self.validators.insert(name.into(), Arc::new(validator));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SlotValidator>> {
        self.validators.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.validators.contains_key(name)
    }
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn not_empty(value: &Value) -> Result<Value, String> {
    match value {
        Value::Null => Err("A value is required.".to_string()),
        Value::String(s) if s.trim().is_empty() => Err("A value is required.".to_string()),
        Value::String(s) => Ok(Value::String(s.trim().to_string())),
        other => Ok(other.clone()),
    }
}

fn number(value: &Value) -> Result<Value, String> {
    match value {
        Value::Number(_) => Ok(value.clone()),
        Value::String(s) => {
            let cleaned = s.trim().replace(',', "");
            if let Ok(i) = cleaned.parse::<i64>() {
                return Ok(Value::from(i));
            }
            cleaned
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("'{s}' is not a number."))
        }
        _ => Err("Please give a number.".to_string()),
    }
}

fn integer(value: &Value) -> Result<Value, String> {
    match number(value)? {
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(Value::Number(n)),
        _ => Err("Please give a whole number.".to_string()),
    }
}

fn boolean(value: &Value) -> Result<Value, String> {
    match value {
        Value::Bool(_) => Ok(value.clone()),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "yes" | "y" | "true" | "sure" | "ok" => Ok(Value::Bool(true)),
            "no" | "n" | "false" | "nope" => Ok(Value::Bool(false)),
            _ => Err("Please answer yes or no.".to_string()),
        },
        _ => Err("Please answer yes or no.".to_string()),
    }
}

fn email(value: &Value) -> Result<Value, String> {
    match value.as_str().map(str::trim) {
        Some(s) if EMAIL.is_match(s) => Ok(Value::String(s.to_string())),
        _ => Err("That doesn't look like an email address.".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(name: &str, value: Value) -> Result<Value, String> {
        ValidatorRegistry::new().get(name).unwrap().validate(&value)
    }

    #[test]
    fn test_number_normalizes_strings() {
        assert_eq!(run("number", json!("1,250")), Ok(json!(1250)));
        assert_eq!(run("number", json!(" 2.5 ")), Ok(json!(2.5)));
        assert!(run("number", json!("lots")).is_err());
    }

    #[test]
    fn test_integer_rejects_fractions() {
        assert_eq!(run("integer", json!("42")), Ok(json!(42)));
        assert!(run("integer", json!(4.5)).is_err());
    }

    #[test]
    fn test_boolean_and_email() {
        assert_eq!(run("boolean", json!("Yes")), Ok(json!(true)));
        assert!(run("boolean", json!("maybe")).is_err());
        assert_eq!(run("email", json!(" a@b.io ")), Ok(json!("a@b.io")));
        assert!(run("email", json!("nope")).is_err());
    }

    #[test]
    fn test_not_empty() {
        assert!(run("not_empty", json!("  ")).is_err());
        assert!(run("not_empty", Value::Null).is_err());
        assert_eq!(run("not_empty", json!(" Madrid ")), Ok(json!("Madrid")));
    }

    #[test]
    fn test_custom_closure_validator() {
        let mut registry = ValidatorRegistry::empty();
        registry.register("city", |v: &Value| match v.as_str() {
            Some("Atlantis") => Err("We don't fly there.".to_string()),
            _ => Ok(v.clone()),
        });
        assert!(registry.contains("city"));
        assert!(!registry.contains("number"));
        assert!(registry.get("city").unwrap().validate(&json!("Atlantis")).is_err());
    }
}
