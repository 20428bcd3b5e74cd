//! Shape classification and small accessors over `serde_yaml` values.

use serde_yaml::{Mapping, Value};

/// A YAML node classified once, up front.
#[derive(Debug, Clone, Copy)]
pub enum Node<'a> {
    Null,
    Scalar(&'a Value),
    Sequence(&'a [Value]),
    Mapping(&'a Mapping),
}

impl<'a> Node<'a> {
    pub fn classify(value: &'a Value) -> Self {
        match value {
            Value::Null => Node::Null,
            Value::Bool(_) | Value::Number(_) | Value::String(_) => Node::Scalar(value),
            Value::Sequence(items) => Node::Sequence(items),
            Value::Mapping(mapping) => Node::Mapping(mapping),
            Value::Tagged(tagged) => Node::classify(&tagged.value),
        }
    }
}

/// Render a scalar value as text. Non-scalars yield `None`.
pub fn scalar_string(value: &Value) -> Option<String> {
    match Node::classify(value) {
        Node::Scalar(Value::String(s)) => Some(s.clone()),
        Node::Scalar(Value::Bool(b)) => Some(b.to_string()),
        Node::Scalar(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Look up `key` in `mapping` and render it as a scalar string.
pub fn get_scalar(mapping: &Mapping, key: &str) -> Option<String> {
    mapping.get(key).and_then(scalar_string)
}

/// Iterate a mapping's keys that are scalars, in document order.
pub fn scalar_keys(mapping: &Mapping) -> impl Iterator<Item = String> + '_ {
    mapping.keys().filter_map(scalar_string)
}

/// Compact JSON rendering of any YAML value.
pub fn to_json_string(value: &Value) -> String {
    match serde_json::to_string(value) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!("cannot render YAML value as JSON: {e}");
            String::new()
        }
    }
}

/// Finds the source line of mapping nodes.
///
/// `serde_yaml` values carry no positions, so nodes are located by scanning
/// the source for their first key. Lookups must happen in document order;
/// each hit advances the cursor so repeated keys resolve to successive lines.
/// Sequence items only match lines where the key follows a `-`, so a nested
/// `key:` inside an earlier item is skipped. A nested block sequence item
/// with the same first key can still be mistaken for the next item.
pub struct LineLocator<'s> {
    lines: Vec<&'s str>,
    cursor: usize,
}

impl<'s> LineLocator<'s> {
    pub fn new(source: &'s str) -> Self {
        Self {
            lines: source.lines().collect(),
            cursor: 0,
        }
    }

    /// 1-based line of the next occurrence of `key:` at or after the cursor.
    ///
    /// Returns the cursor line when the key cannot be found.
    pub fn locate(&mut self, key: &str) -> usize {
        self.find(|line| line_starts_key(line, key))
            .unwrap_or_else(|| self.cursor.max(1))
    }

    /// Locate the first key of `mapping`.
    pub fn locate_mapping(&mut self, mapping: &Mapping) -> usize {
        match scalar_keys(mapping).next() {
            Some(key) => self.locate(&key),
            None => self.cursor.max(1),
        }
    }

    /// Locate the first key of a sequence item, written as `- key:`.
    ///
    /// Items whose dash sits on a line of its own fall back to
    /// [`locate_mapping`](Self::locate_mapping).
    pub fn locate_item(&mut self, mapping: &Mapping) -> usize {
        let Some(key) = scalar_keys(mapping).next() else {
            return self.cursor.max(1);
        };
        match self.find(|line| line_starts_item(line, &key)) {
            Some(line) => line,
            None => self.locate(&key),
        }
    }

    fn find(&mut self, matches: impl Fn(&str) -> bool) -> Option<usize> {
        let offset = self.lines[self.cursor.min(self.lines.len())..]
            .iter()
            .position(|line| matches(line))?;
        let index = self.cursor + offset;
        self.cursor = index + 1;
        Some(index + 1)
    }
}

fn line_starts_item(line: &str, key: &str) -> bool {
    line.trim_start()
        .strip_prefix('-')
        .is_some_and(|rest| rest.starts_with(char::is_whitespace) && line_starts_key(rest, key))
}

fn line_starts_key(line: &str, key: &str) -> bool {
    let mut rest = line.trim_start();
    while let Some(stripped) = rest.strip_prefix('-') {
        rest = stripped.trim_start();
    }
    [key.to_string(), format!("\"{key}\""), format!("'{key}'")]
        .iter()
        .any(|candidate| {
            rest.strip_prefix(candidate.as_str())
                .is_some_and(|after| after.trim_start().starts_with(':'))
        })
}
