//! Matrix rows and foreach expansion.
//!
//! Matrix rows are fixed at parse time and turn one test into several
//! runnable items. Foreach values are expanded when an item runs, yielding
//! one result per combination.

use crate::model::{KeyValues, MatrixRow};
use crate::yaml::{self, Node};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_yaml::{Mapping, Value};
use std::hash::{DefaultHasher, Hash, Hasher};

/// One combination of foreach values, in key declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForeachItem(pub KeyValues);

impl ForeachItem {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.0
    }

    /// Compact JSON object text.
    pub fn to_json(&self) -> String {
        pairs_to_json(&self.0)
    }

    /// Blank values dropped and any `token` column masked as `***`.
    pub fn redacted(&self) -> ForeachItem {
        let pairs = self
            .0
            .iter()
            .filter(|(_, value)| !value.trim().is_empty())
            .map(|(key, value)| {
                let keys: Vec<String> = key.split('\t').map(str::to_lowercase).collect();
                let mut values: Vec<&str> = value.split('\t').collect();
                if let Some(index) = keys.iter().position(|k| k == "token")
                    && keys.len() == values.len()
                {
                    values[index] = "***";
                }
                (key.clone(), values.join("\t"))
            })
            .collect();
        ForeachItem(pairs)
    }

    /// Key/value pairs with composite keys split into their columns.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().flat_map(|(key, value)| {
            key.split('\t')
                .zip(value.split('\t').chain(std::iter::repeat("")))
        })
    }
}

/// Serializes ordered pairs as a JSON object without reordering keys.
struct OrderedPairs<'a>(&'a [(String, String)]);

impl Serialize for OrderedPairs<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Compact JSON object text for ordered pairs.
pub fn pairs_to_json(pairs: &[(String, String)]) -> String {
    serde_json::to_string(&OrderedPairs(pairs)).unwrap_or_default()
}

/// Iterator over the Cartesian product of a foreach spec.
///
/// Keys vary in declaration order, outer to inner: the first key changes
/// slowest. An empty spec yields a single empty item; a key with no
/// alternatives yields nothing.
pub struct ForeachExpansion {
    keys: Vec<(String, Vec<String>)>,
    cursor: Option<Vec<usize>>,
}

impl Iterator for ForeachExpansion {
    type Item = ForeachItem;

    fn next(&mut self) -> Option<ForeachItem> {
        let cursor = self.cursor.as_mut()?;
        let item = ForeachItem(
            self.keys
                .iter()
                .zip(cursor.iter())
                .map(|((key, alternatives), &i)| (key.clone(), alternatives[i].clone()))
                .collect(),
        );

        // Advance like an odometer, last key fastest.
        let mut exhausted = true;
        for position in (0..cursor.len()).rev() {
            cursor[position] += 1;
            if cursor[position] < self.keys[position].1.len() {
                exhausted = false;
                break;
            }
            cursor[position] = 0;
        }
        if exhausted {
            self.cursor = None;
        }

        Some(item)
    }
}

/// Expand a foreach spec whose values are newline-separated alternatives.
pub fn expand_foreach(spec: &KeyValues) -> ForeachExpansion {
    let keys: Vec<(String, Vec<String>)> = spec
        .iter()
        .map(|(key, value)| {
            let alternatives = value
                .split(['\r', '\n'])
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect();
            (key.clone(), alternatives)
        })
        .collect();
    let exhausted = keys.iter().any(|(_, alternatives)| alternatives.is_empty());
    let cursor = (!exhausted).then(|| vec![0; keys.len()]);
    ForeachExpansion { keys, cursor }
}

/// Fill `{key}` placeholders from `item`, or append the redacted item.
pub fn finalize_display_name(display_name: &str, item: &ForeachItem) -> String {
    if item.is_empty() {
        return display_name.to_string();
    }

    let mut name = display_name.to_string();
    for (key, value) in item.columns() {
        name = name.replace(&format!("{{{key}}}"), value);
    }
    if name != display_name {
        return name;
    }
    format!("{display_name}: {}", item.redacted().to_json())
}

/// The starting matrix: a single empty row.
pub fn new_matrix() -> Vec<MatrixRow> {
    vec![MatrixRow::new()]
}

/// Stable identity of a matrix row.
pub fn matrix_id(row: &MatrixRow) -> String {
    let mut hasher = DefaultHasher::new();
    row.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Multiply `rows` by a `matrix:` node.
///
/// A mapping sets scalar keys on every row and multiplies rows by sequence
/// values; its `foreach:` key, or a bare sequence node, multiplies rows by
/// each listed mapping. Malformed entries are logged and skipped.
pub fn update_matrix(rows: &[MatrixRow], node: &Value, location: &str) -> Vec<MatrixRow> {
    let mut rows = rows.to_vec();
    match Node::classify(node) {
        Node::Mapping(mapping) => {
            rows = update_with_mapping(rows, mapping, location);
            if let Some(Node::Sequence(items)) = mapping.get("foreach").map(Node::classify) {
                rows = update_with_sequence(rows, items, location);
            }
        }
        Node::Sequence(items) => rows = update_with_sequence(rows, items, location),
        _ => tracing::error!("expected mapping or sequence for matrix at {location}"),
    }
    rows
}

fn update_with_mapping(mut rows: Vec<MatrixRow>, mapping: &Mapping, location: &str) -> Vec<MatrixRow> {
    for (key, value) in mapping {
        let Some(key) = yaml::scalar_string(key) else {
            tracing::error!("expected scalar matrix key at {location}");
            continue;
        };
        if key == "foreach" {
            continue;
        }

        let alternatives: Vec<String> = match Node::classify(value) {
            Node::Scalar(v) => yaml::scalar_string(v).into_iter().collect(),
            Node::Sequence(items) => items
                .iter()
                .filter_map(|item| {
                    let scalar = yaml::scalar_string(item);
                    if scalar.is_none() {
                        tracing::error!("expected scalar value for matrix key '{key}' at {location}");
                    }
                    scalar
                })
                .collect(),
            _ => {
                tracing::error!("expected string or sequence for matrix key '{key}' at {location}");
                continue;
            }
        };

        rows = rows
            .iter()
            .flat_map(|row| {
                alternatives.iter().map(|alternative| {
                    let mut row = row.clone();
                    row.insert(key.clone(), alternative.clone());
                    row
                })
            })
            .collect();
    }
    rows
}

fn update_with_sequence(rows: Vec<MatrixRow>, items: &[Value], location: &str) -> Vec<MatrixRow> {
    let mut updated = Vec::new();
    for row in &rows {
        for item in items {
            let Some(mapping) = item.as_mapping() else {
                tracing::error!("expected mapping in matrix sequence at {location}");
                continue;
            };
            let mut row = row.clone();
            for (key, value) in mapping {
                match (yaml::scalar_string(key), yaml::scalar_string(value)) {
                    (Some(k), Some(v)) => {
                        row.insert(k, v);
                    }
                    _ => tracing::error!("expected scalar key and value in matrix at {location}"),
                }
            }
            updated.push(row);
        }
    }
    updated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(pairs: &[(&str, &str)]) -> KeyValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn item(pairs: &[(&str, &str)]) -> ForeachItem {
        ForeachItem(spec(pairs))
    }

    #[test]
    fn expansion_count_is_product_of_alternatives() {
        let s = spec(&[("a", "1\n2\n3"), ("b", "x\ny"), ("c", "only")]);
        assert_eq!(expand_foreach(&s).count(), 3 * 2 * 1);
    }

    #[test]
    fn expansion_order_first_key_slowest() {
        let s = spec(&[("a", "1\n2"), ("b", "x\ny")]);
        let items: Vec<String> = expand_foreach(&s).map(|i| i.to_json()).collect();
        assert_eq!(
            items,
            vec![
                r#"{"a":"1","b":"x"}"#,
                r#"{"a":"1","b":"y"}"#,
                r#"{"a":"2","b":"x"}"#,
                r#"{"a":"2","b":"y"}"#,
            ]
        );
    }

    #[test]
    fn expansion_of_empty_spec_is_one_empty_item() {
        let items: Vec<_> = expand_foreach(&KeyValues::new()).collect();
        assert_eq!(items, vec![ForeachItem::default()]);
    }

    #[test]
    fn expansion_skips_blank_lines_and_handles_crlf() {
        let s = spec(&[("a", "1\r\n\r\n2\n")]);
        assert_eq!(expand_foreach(&s).count(), 2);
    }

    #[test]
    fn key_without_alternatives_yields_nothing() {
        let s = spec(&[("a", "1"), ("b", "")]);
        assert_eq!(expand_foreach(&s).count(), 0);
    }

    #[test]
    fn display_name_placeholders() {
        let i = item(&[("lang", "en")]);
        assert_eq!(finalize_display_name("t-{lang}", &i), "t-en");
    }

    #[test]
    fn display_name_composite_placeholders() {
        let i = item(&[("lang\tvoice", "en\tjenny")]);
        assert_eq!(finalize_display_name("{lang}/{voice}", &i), "en/jenny");
    }

    #[test]
    fn display_name_suffix_when_no_placeholder() {
        let i = item(&[("lang", "fr"), ("token", "secret")]);
        assert_eq!(
            finalize_display_name("speak", &i),
            r#"speak: {"lang":"fr","token":"***"}"#
        );
        assert_eq!(finalize_display_name("speak", &ForeachItem::default()), "speak");
    }

    #[test]
    fn redaction_masks_token_columns() {
        let i = item(&[("user\tTOKEN", "me\tabc"), ("blank", "  ")]);
        assert_eq!(i.redacted(), item(&[("user\tTOKEN", "me\t***")]));
    }

    #[test]
    fn redaction_is_idempotent() {
        let i = item(&[("token", "abc"), ("x", "1"), ("e", "")]);
        assert_eq!(i.redacted().redacted(), i.redacted());
    }

    #[test]
    fn matrix_mapping_multiplies_rows() {
        let node: Value = serde_yaml::from_str("lang: [en, fr]\nvoice: [a, b, c]\nfixed: 1").unwrap();
        let rows = update_matrix(&new_matrix(), &node, "t.yaml(1)");
        assert_eq!(rows.len(), 6);
        assert!(rows.iter().all(|r| r["fixed"] == "1"));
        assert_eq!(rows[0]["lang"], "en");
        assert_eq!(rows[0]["voice"], "a");
        assert_eq!(rows[1]["voice"], "b");
    }

    #[test]
    fn matrix_sequence_of_mappings() {
        let node: Value = serde_yaml::from_str("- {a: 1, b: 2}\n- {a: 3}\n- nope").unwrap();
        let rows = update_matrix(&new_matrix(), &node, "t.yaml(1)");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["a"], "3");
    }

    #[test]
    fn matrix_mapping_with_foreach() {
        let node: Value =
            serde_yaml::from_str("env: prod\nforeach:\n- {region: east}\n- {region: west}").unwrap();
        let rows = update_matrix(&new_matrix(), &node, "t.yaml(1)");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["env"], "prod");
        assert_eq!(rows[1]["region"], "west");
    }

    #[test]
    fn matrix_ids_are_stable_and_distinct() {
        let mut a = MatrixRow::new();
        a.insert("k".into(), "1".into());
        let mut b = MatrixRow::new();
        b.insert("k".into(), "2".into());
        assert_eq!(matrix_id(&a), matrix_id(&a.clone()));
        assert_ne!(matrix_id(&a), matrix_id(&b));
    }
}
