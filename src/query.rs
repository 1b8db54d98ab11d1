use regex::Regex;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::value::SortKey;

// ---------------------------------------------------------------------------
// Query AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum QueryOp {
    Eq(Value),
    Ne(Value),
    Gt(SortKey),
    Gte(SortKey),
    Lt(SortKey),
    Lte(SortKey),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex(Regex),
}

#[derive(Debug, Clone)]
pub enum Query {
    Field { field: String, op: QueryOp },
    And(Vec<Query>),
    Or(Vec<Query>),
    All,
}

// ---------------------------------------------------------------------------
// Parsing: JSON → Query AST
// ---------------------------------------------------------------------------

pub fn parse_query(query: &Value) -> Result<Query> {
    let obj = query
        .as_object()
        .ok_or_else(|| Error::InvalidQuery("query must be a JSON object".into()))?;

    let mut conditions: Vec<Query> = Vec::new();

    for (key, value) in obj {
        match key.as_str() {
            "$and" | "$or" => {
                let arr = value
                    .as_array()
                    .ok_or_else(|| Error::InvalidQuery(format!("{key} must be an array")))?;
                let subs = arr.iter().map(parse_query).collect::<Result<Vec<_>>>()?;
                conditions.push(if key == "$and" {
                    Query::And(subs)
                } else {
                    Query::Or(subs)
                });
            }
            op if op.starts_with('$') => {
                return Err(Error::InvalidQuery(format!("unknown top-level operator: {op}")));
            }
            field => match value.as_object() {
                Some(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                    let options = ops.get("$options").and_then(Value::as_str).unwrap_or("");
                    for (op_key, op_val) in ops {
                        if op_key == "$options" {
                            continue;
                        }
                        conditions.push(Query::Field {
                            field: field.to_string(),
                            op: parse_op(op_key, op_val, options)?,
                        });
                    }
                }
                // Plain values and plain objects are equality shorthand.
                _ => conditions.push(Query::Field {
                    field: field.to_string(),
                    op: QueryOp::Eq(value.clone()),
                }),
            },
        }
    }

    Ok(match conditions.len() {
        0 => Query::All,
        1 => conditions.remove(0),
        _ => Query::And(conditions),
    })
}

fn parse_op(op_key: &str, op_val: &Value, regex_options: &str) -> Result<QueryOp> {
    let array = |name: &str| {
        op_val
            .as_array()
            .cloned()
            .ok_or_else(|| Error::InvalidQuery(format!("{name} must be an array")))
    };
    match op_key {
        "$eq" => Ok(QueryOp::Eq(op_val.clone())),
        "$ne" => Ok(QueryOp::Ne(op_val.clone())),
        "$gt" => Ok(QueryOp::Gt(SortKey::from_json(op_val))),
        "$gte" => Ok(QueryOp::Gte(SortKey::from_json(op_val))),
        "$lt" => Ok(QueryOp::Lt(SortKey::from_json(op_val))),
        "$lte" => Ok(QueryOp::Lte(SortKey::from_json(op_val))),
        "$in" => Ok(QueryOp::In(array("$in")?)),
        "$nin" => Ok(QueryOp::Nin(array("$nin")?)),
        "$exists" => {
            let b = op_val
                .as_bool()
                .ok_or_else(|| Error::InvalidQuery("$exists must be a boolean".into()))?;
            Ok(QueryOp::Exists(b))
        }
        "$regex" => {
            let pattern = op_val
                .as_str()
                .ok_or_else(|| Error::InvalidQuery("$regex must be a string".into()))?;
            let pattern = if regex_options.is_empty() {
                pattern.to_string()
            } else {
                format!("(?{regex_options}){pattern}")
            };
            let re = Regex::new(&pattern)
                .map_err(|e| Error::InvalidQuery(format!("invalid $regex: {e}")))?;
            Ok(QueryOp::Regex(re))
        }
        _ => Err(Error::InvalidQuery(format!("unknown operator: {op_key}"))),
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Resolve a dot-separated path. `None` means the field is missing.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => a == b,
        _ => SortKey::from_json(a) == SortKey::from_json(b),
    }
}

/// Equality against a field value; an array field matches if it equals the
/// operand or contains an element equal to it.
fn field_equals(field_val: Option<&Value>, operand: &Value) -> bool {
    match field_val {
        None => operand.is_null(),
        Some(v) => {
            values_equal(v, operand)
                || v.as_array()
                    .is_some_and(|items| items.iter().any(|item| values_equal(item, operand)))
        }
    }
}

/// Range comparisons only hold between values of the same type class.
fn compare_field(field_val: Option<&Value>, pred: impl Fn(&SortKey) -> bool, bound: &SortKey) -> bool {
    let same_class = |key: &SortKey| {
        std::mem::discriminant(key) == std::mem::discriminant(bound)
            || matches!(
                (key, bound),
                (SortKey::Integer(_) | SortKey::Float(_), SortKey::Integer(_) | SortKey::Float(_))
            )
    };
    let check = |v: &Value| {
        let key = SortKey::from_json(v);
        same_class(&key) && pred(&key)
    };
    match field_val {
        None => false,
        Some(Value::Array(items)) => items.iter().any(check),
        Some(v) => check(v),
    }
}

pub fn matches(query: &Query, doc: &Value) -> bool {
    match query {
        Query::All => true,
        Query::And(subs) => subs.iter().all(|s| matches(s, doc)),
        Query::Or(subs) => subs.iter().any(|s| matches(s, doc)),
        Query::Field { field, op } => {
            let field_val = get_path(doc, field);
            match op {
                QueryOp::Exists(expected) => field_val.is_some() == *expected,
                QueryOp::Eq(v) => field_equals(field_val, v),
                QueryOp::Ne(v) => !field_equals(field_val, v),
                QueryOp::In(vals) => vals.iter().any(|v| field_equals(field_val, v)),
                QueryOp::Nin(vals) => !vals.iter().any(|v| field_equals(field_val, v)),
                QueryOp::Gt(b) => compare_field(field_val, |k| k > b, b),
                QueryOp::Gte(b) => compare_field(field_val, |k| k >= b, b),
                QueryOp::Lt(b) => compare_field(field_val, |k| k < b, b),
                QueryOp::Lte(b) => compare_field(field_val, |k| k <= b, b),
                QueryOp::Regex(re) => match field_val {
                    Some(Value::String(s)) => re.is_match(s),
                    Some(Value::Array(items)) => items
                        .iter()
                        .any(|item| item.as_str().is_some_and(|s| re.is_match(s))),
                    _ => false,
                },
            }
        }
    }
}
