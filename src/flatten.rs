//! Flattening of typed entity fields into sink-ready rows

use crate::model::{Field, FieldValue};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// One flattened row, column name to value
pub type Row = BTreeMap<String, Scalar>;

/// Storable column value
///
/// Arbitrary-precision numbers stay in `Text`; they are never narrowed to a
/// machine integer or float.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    UInt(u64),
    Bool(bool),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(v) => write!(f, "{}", v),
            Scalar::UInt(v) => write!(f, "{}", v),
            Scalar::Bool(v) => write!(f, "{}", v),
            Scalar::Text(v) => f.write_str(v),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

/// Flatten an ordered field list into a row
///
/// Fields are applied in input order, so on a name collision the last one
/// wins. A null value removes the column rather than writing an explicit null.
pub fn flatten(fields: &[Field]) -> Row {
    let mut row = Row::new();

    for field in fields {
        match flatten_value(&field.value) {
            Some(scalar) => {
                row.insert(field.name.clone(), scalar);
            }
            None => {
                row.remove(&field.name);
            }
        }
    }

    row
}

/// Flatten a single value; `None` for null
pub fn flatten_value(value: &FieldValue) -> Option<Scalar> {
    match value {
        FieldValue::Int32(v) => Some(Scalar::Int(i64::from(*v))),
        FieldValue::Bool(v) => Some(Scalar::Bool(*v)),
        FieldValue::Bigint(v)
        | FieldValue::Bigdecimal(v)
        | FieldValue::String(v)
        | FieldValue::Bytes(v) => Some(Scalar::Text(v.clone())),
        FieldValue::Array(items) => Some(Scalar::Text(render_array(items))),
        FieldValue::Null => None,
    }
}

// `[1, 2, [3, 4]]`; null elements are skipped
fn render_array(items: &[FieldValue]) -> String {
    let rendered: Vec<String> = items
        .iter()
        .filter_map(flatten_value)
        .map(|scalar| scalar.to_string())
        .collect();

    format!("[{}]", rendered.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Scalar {
        Scalar::Text(s.to_string())
    }

    #[test]
    fn test_flatten_mixed_fields() {
        let fields = vec![
            Field::new("a", FieldValue::String("x".to_string())),
            Field::new("b", FieldValue::Int32(1)),
            Field::new("c", FieldValue::Bigint("12345".to_string())),
            Field::new("d", FieldValue::Bool(true)),
            Field::new(
                "e",
                FieldValue::Array(vec![FieldValue::Int32(1), FieldValue::Int32(2)]),
            ),
            Field::new("f", FieldValue::Null),
        ];

        let row = flatten(&fields);

        assert_eq!(row.len(), 5);
        assert_eq!(row["a"], text("x"));
        assert_eq!(row["b"], Scalar::Int(1));
        assert_eq!(row["c"], text("12345"));
        assert_eq!(row["d"], Scalar::Bool(true));
        assert_eq!(row["e"], text("[1, 2]"));
        assert!(!row.contains_key("f"));
    }

    #[test]
    fn test_precision_is_preserved() {
        let fields = vec![
            Field::new(
                "supply",
                FieldValue::Bigint("340282366920938463463374607431768211455".to_string()),
            ),
            Field::new(
                "price",
                FieldValue::Bigdecimal("0.000000000000000001".to_string()),
            ),
            Field::new("hash", FieldValue::Bytes("00ff10".to_string())),
        ];

        let row = flatten(&fields);

        assert_eq!(row["supply"], text("340282366920938463463374607431768211455"));
        assert_eq!(row["price"], text("0.000000000000000001"));
        assert_eq!(row["hash"], text("00ff10"));
    }

    #[test]
    fn test_nested_arrays() {
        let value = FieldValue::Array(vec![
            FieldValue::Array(vec![FieldValue::Int32(1), FieldValue::Int32(2)]),
            FieldValue::Array(vec![]),
            FieldValue::Null,
            FieldValue::String("z".to_string()),
            FieldValue::Bool(false),
        ]);

        assert_eq!(flatten_value(&value), Some(text("[[1, 2], [], z, false]")));
    }

    #[test]
    fn test_last_write_wins() {
        let fields = vec![
            Field::new("amount", FieldValue::Int32(1)),
            Field::new("amount", FieldValue::Int32(2)),
            Field::new("memo", FieldValue::String("first".to_string())),
            Field::new("memo", FieldValue::Null),
        ];

        let row = flatten(&fields);

        assert_eq!(row["amount"], Scalar::Int(2));
        assert!(!row.contains_key("memo"));
    }

    #[test]
    fn test_scalar_json_shape() {
        let mut row = Row::new();
        row.insert("n".to_string(), Scalar::Int(-3));
        row.insert("u".to_string(), Scalar::UInt(7));
        row.insert("b".to_string(), Scalar::Bool(true));
        row.insert("t".to_string(), text("x"));

        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"{"b":true,"n":-3,"t":"x","u":7}"#);
    }
}
