//! `{{variable}}` substitution into step configs.
//!
//! Substitution happens on a per-run clone of the step's config value;
//! the workflow definition itself is never mutated. A string that is
//! exactly one placeholder is replaced by the variable's typed value
//! (so `"{{items}}"` can resolve to an array); placeholders embedded in
//! longer strings interpolate the value's string form. Missing
//! variables resolve to an empty string, never an error.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Dotted paths allowed: {{user.name}}
        Regex::new(r"\{\{\s*([A-Za-z_$][A-Za-z0-9_$]*(?:\.[A-Za-z0-9_$]+)*)\s*\}\}")
            .expect("placeholder regex is valid")
    })
}

/// Replace placeholders in every string found in `value`, recursively.
pub fn substitute_variables(value: &mut Value, variables: &Map<String, Value>) {
    match value {
        Value::String(s) => {
            if let Some(replacement) = substitute_string(s, variables) {
                *value = replacement;
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute_variables(item, variables);
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                substitute_variables(v, variables);
            }
        }
        _ => {}
    }
}

/// Returns the substituted value for a string, or `None` when the
/// string contains no placeholders.
fn substitute_string(input: &str, variables: &Map<String, Value>) -> Option<Value> {
    let re = placeholder_re();
    if !re.is_match(input) {
        return None;
    }

    // Whole-string placeholder keeps the variable's type.
    if let Some(captures) = re.captures(input) {
        if captures.get(0).map(|m| m.as_str()) == Some(input.trim()) {
            let resolved = resolve_path(&captures[1], variables)
                .cloned()
                .unwrap_or(Value::String(String::new()));
            return Some(resolved);
        }
    }

    let replaced = re.replace_all(input, |captures: &regex::Captures| {
        match resolve_path(&captures[1], variables) {
            Some(value) => stringify(value),
            None => String::new(),
        }
    });
    Some(Value::String(replaced.into_owned()))
}

fn resolve_path<'a>(path: &str, variables: &'a Map<String, Value>) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = variables.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

/// String form used for embedded interpolation: strings stay raw,
/// scalars use their JSON form, containers serialize compactly.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_embedded_interpolation() {
        let variables = vars(json!({"name": "Ada", "count": 3}));
        let mut value = json!({"message": "Hello {{name}}, you have {{count}} items"});
        substitute_variables(&mut value, &variables);
        assert_eq!(value["message"], "Hello Ada, you have 3 items");
    }

    #[test]
    fn test_whole_placeholder_keeps_type() {
        let variables = vars(json!({"items": [1, 2, 3], "flag": true}));
        let mut value = json!({"items": "{{items}}", "enabled": "{{flag}}"});
        substitute_variables(&mut value, &variables);
        assert_eq!(value["items"], json!([1, 2, 3]));
        assert_eq!(value["enabled"], json!(true));
    }

    #[test]
    fn test_missing_variable_becomes_empty() {
        let variables = Map::new();
        let mut value = json!({"url": "https://example.com/{{missing}}/page"});
        substitute_variables(&mut value, &variables);
        assert_eq!(value["url"], "https://example.com//page");

        let mut value = json!({"payload": "{{missing}}"});
        substitute_variables(&mut value, &variables);
        assert_eq!(value["payload"], "");
    }

    #[test]
    fn test_dotted_path() {
        let variables = vars(json!({"user": {"plan": "pro"}}));
        let mut value = json!({"plan": "{{user.plan}}"});
        substitute_variables(&mut value, &variables);
        assert_eq!(value["plan"], "pro");
    }

    #[test]
    fn test_nested_structures_and_non_strings_untouched() {
        let variables = vars(json!({"x": "y"}));
        let mut value = json!({
            "list": ["{{x}}", 7, {"deep": "{{x}}"}],
            "n": 42,
        });
        substitute_variables(&mut value, &variables);
        assert_eq!(value["list"][0], "y");
        assert_eq!(value["list"][1], 7);
        assert_eq!(value["list"][2]["deep"], "y");
        assert_eq!(value["n"], 42);
    }

    #[test]
    fn test_no_placeholder_is_untouched() {
        let variables = vars(json!({"x": "y"}));
        let mut value = json!({"s": "plain {text} no braces"});
        substitute_variables(&mut value, &variables);
        assert_eq!(value["s"], "plain {text} no braces");
    }
}
