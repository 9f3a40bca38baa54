//! `{placeholder}` substitution for prompts and messages

use crate::expr::Scope;
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\}")
        .expect("placeholder pattern is valid")
});

/// Replace `{name}` / `{session.var}` / `{parent.slot}` with scope values.
///
/// Unset values render as an empty string.
pub fn render(template: &str, scope: &dyn Scope) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            let path: Vec<String> = caps[1].split('.').map(String::from).collect();
            display(&scope.resolve(&path))
        })
        .into_owned()
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed;

    impl Scope for Fixed {
        fn resolve(&self, path: &[String]) -> Value {
            match path.join(".").as_str() {
                "destination" => json!("San Diego"),
                "session.tier" => json!("gold"),
                "amount" => json!(12.5),
                _ => Value::Null,
            }
        }
    }

    #[test]
    fn test_render_substitutes_paths() {
        assert_eq!(
            render("Fly to {destination} as a {session.tier} member for {amount}?", &Fixed),
            "Fly to San Diego as a gold member for 12.5?"
        );
    }

    #[test]
    fn test_unknown_placeholder_is_empty_and_braces_without_names_stay() {
        assert_eq!(render("[{missing}] {} {1x}", &Fixed), "[] {} {1x}");
    }
}
