//! `${{ key }}` property interpolation.

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::LazyLock;

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\{(.*?)\}\}").expect("token pattern is valid"));

/// Substitute `${{ key }}` and `${{ matrix.key }}` tokens from `properties`.
///
/// Tokens naming an unknown key are left intact. With `escape_json` the
/// substituted value is escaped as the body of a JSON string.
pub fn interpolate(text: &str, properties: &BTreeMap<String, String>, escape_json: bool) -> String {
    if !text.contains("${{") {
        return text.to_string();
    }

    TOKEN
        .replace_all(text, |caps: &Captures<'_>| {
            let key = caps[1].trim();
            let value = properties
                .get(key)
                .or_else(|| key.strip_prefix("matrix.").and_then(|k| properties.get(k)));
            match value {
                Some(v) if escape_json => json_escape(v),
                Some(v) => v.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Interpolate an optional property, passing `None` through.
pub fn interpolate_opt(
    text: Option<&str>,
    properties: &BTreeMap<String, String>,
    escape_json: bool,
) -> Option<String> {
    text.map(|t| interpolate(t, properties, escape_json))
}

fn json_escape(value: &str) -> String {
    let quoted = serde_json::Value::String(value.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}
