//! Ordering over JSON values and model comparators.

use crate::{error::Result, Error, Model};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;

/// A total order over models.
pub type Comparator = Arc<dyn Fn(&Model, &Model) -> Ordering + Send + Sync>;

/// Total order over JSON values.
///
/// Values of different kinds order as null < bool < number < string < array <
/// object. Numbers compare as `f64` with NaN-free JSON semantics.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            match (x.as_i64(), y.as_i64()) {
                (Some(i), Some(j)) => i.cmp(&j),
                _ => {
                    let i = x.as_f64().unwrap_or(0.0);
                    let j = y.as_f64().unwrap_or(0.0);
                    i.partial_cmp(&j).unwrap_or(Ordering::Equal)
                }
            }
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (i, j) in x.iter().zip(y.iter()) {
                match compare_values(i, j) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            // serde_json maps iterate in key order, so this is deterministic
            let x: Vec<_> = x.iter().collect();
            let y: Vec<_> = y.iter().collect();
            for ((ka, va), (kb, vb)) in x.iter().zip(y.iter()) {
                match ka.cmp(kb).then_with(|| compare_values(va, vb)) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            x.len().cmp(&y.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

fn rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Compare two optional field values, sorting missing and null values last.
pub fn compare_nulls_last(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => compare_values(x, y),
    }
}

/// One term of a comparator expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortTerm {
    pub field: String,
    pub descending: bool,
}

/// Parse `"name"`, `"-created"` or `"-priority,name"` into sort terms.
pub fn parse_comparator(expression: &str) -> Result<Vec<SortTerm>> {
    let mut terms = Vec::new();
    for part in expression.split(',') {
        let part = part.trim();
        let (field, descending) = match part.strip_prefix('-') {
            Some(rest) => (rest.trim(), true),
            None => (part, false),
        };
        if field.is_empty() || field.starts_with('-') || field.starts_with('$') {
            return Err(Error::InvalidComparator(expression.to_string()));
        }
        terms.push(SortTerm {
            field: field.to_string(),
            descending,
        });
    }
    Ok(terms)
}

/// Build a comparator from a comparator expression.
pub fn comparator_from_expression(expression: &str) -> Result<Comparator> {
    let terms = parse_comparator(expression)?;
    Ok(Arc::new(move |a: &Model, b: &Model| {
        for term in &terms {
            let (x, y) = (a.get(&term.field), b.get(&term.field));
            let ordering = compare_nulls_last(x.as_ref(), y.as_ref());
            // missing values stay last in either direction
            let present = |v: &Option<Value>| v.as_ref().is_some_and(|v| !v.is_null());
            let ordering = if term.descending && present(&x) && present(&y) {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn mixed_kinds_order_by_rank() {
        assert_eq!(compare_values(&json!(null), &json!(false)), Ordering::Less);
        assert_eq!(compare_values(&json!(true), &json!(0)), Ordering::Less);
        assert_eq!(compare_values(&json!(5), &json!("5")), Ordering::Less);
    }

    #[test]
    fn numbers_compare_numerically() {
        assert_eq!(compare_values(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_values(&json!(2.5), &json!(2)), Ordering::Greater);
        assert_eq!(compare_values(&json!(-1), &json!(1.0)), Ordering::Less);
    }

    #[test]
    fn nulls_sort_last() {
        assert_eq!(compare_nulls_last(None, Some(&json!(1))), Ordering::Greater);
        assert_eq!(compare_nulls_last(Some(&json!(null)), None), Ordering::Equal);
        assert_eq!(compare_nulls_last(Some(&json!("a")), None), Ordering::Less);
    }

    #[test]
    fn parse_terms() {
        let terms = parse_comparator("-priority, name").unwrap();
        assert_eq!(
            terms,
            vec![
                SortTerm {
                    field: "priority".into(),
                    descending: true
                },
                SortTerm {
                    field: "name".into(),
                    descending: false
                },
            ]
        );
        assert!(parse_comparator("").is_err());
        assert!(parse_comparator("--x").is_err());
        assert!(parse_comparator("name,").is_err());
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-z]{0,6}".prop_map(Value::from),
        ];
        leaf.prop_recursive(2, 8, 3, |inner| {
            prop::collection::vec(inner, 0..3).prop_map(Value::from)
        })
    }

    proptest! {
        #[test]
        fn ordering_is_antisymmetric(a in arb_value(), b in arb_value()) {
            prop_assert_eq!(compare_values(&a, &b), compare_values(&b, &a).reverse());
        }

        #[test]
        fn ordering_is_reflexive(a in arb_value()) {
            prop_assert_eq!(compare_values(&a, &a), Ordering::Equal);
        }
    }
}
