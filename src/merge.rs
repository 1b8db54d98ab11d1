use serde_json::{Map, Value};

/// How two adjacent `$match` bodies are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// Only top-level values are inspected: sequences on both sides are
    /// concatenated, everything else is overwritten by the incoming value.
    #[default]
    Shallow,
    /// Like `Shallow`, but mappings present on both sides are merged
    /// recursively with the same rule.
    Deep,
}

/// Outcome of a merge, including the field paths where a sequence met a
/// non-sequence and the incoming value silently replaced the existing one.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeReport {
    pub merged: Value,
    pub clobbered: Vec<String>,
}

// ---------------------------------------------------------------------------
// Value shape
// ---------------------------------------------------------------------------

enum Shape {
    Scalar(Value),
    Sequence(Vec<Value>),
    Mapping(Map<String, Value>),
}

impl From<Value> for Shape {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(items) => Shape::Sequence(items),
            Value::Object(map) => Shape::Mapping(map),
            other => Shape::Scalar(other),
        }
    }
}

impl Shape {
    fn into_value(self) -> Value {
        match self {
            Shape::Scalar(v) => v,
            Shape::Sequence(items) => Value::Array(items),
            Shape::Mapping(map) => Value::Object(map),
        }
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

pub fn merge_filters(existing: Value, incoming: Value, strategy: MergeStrategy) -> Value {
    merge_filters_report(existing, incoming, strategy).merged
}

/// Merge `incoming` into `existing`, keeping the existing key order and
/// appending new keys after it.
///
/// A `null` incoming body leaves the existing body untouched. If either
/// side is not a mapping the incoming body replaces the existing one.
pub fn merge_filters_report(existing: Value, incoming: Value, strategy: MergeStrategy) -> MergeReport {
    let mut clobbered = Vec::new();
    let merged = match (existing, incoming) {
        (existing, Value::Null) => existing,
        (Value::Object(base), Value::Object(incoming)) => {
            Value::Object(merge_maps(base, incoming, strategy, "", &mut clobbered))
        }
        (_, incoming) => incoming,
    };
    MergeReport { merged, clobbered }
}

fn merge_maps(
    mut base: Map<String, Value>,
    incoming: Map<String, Value>,
    strategy: MergeStrategy,
    prefix: &str,
    clobbered: &mut Vec<String>,
) -> Map<String, Value> {
    for (key, new_val) in incoming {
        let value = match base.get_mut(&key).map(std::mem::take) {
            None => new_val,
            Some(old) => {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                merge_field(old, new_val, strategy, &path, clobbered)
            }
        };
        // Inserting an existing key keeps its position.
        base.insert(key, value);
    }
    base
}

fn merge_field(
    old: Value,
    new: Value,
    strategy: MergeStrategy,
    path: &str,
    clobbered: &mut Vec<String>,
) -> Value {
    match (Shape::from(old), Shape::from(new)) {
        (Shape::Sequence(mut a), Shape::Sequence(b)) => {
            a.extend(b);
            Value::Array(a)
        }
        (Shape::Mapping(a), Shape::Mapping(b)) if strategy == MergeStrategy::Deep => {
            Value::Object(merge_maps(a, b, strategy, path, clobbered))
        }
        (Shape::Sequence(_), new) | (Shape::Scalar(_) | Shape::Mapping(_), new @ Shape::Sequence(_)) => {
            clobbered.push(path.to_string());
            new.into_value()
        }
        (Shape::Scalar(_) | Shape::Mapping(_), new) => new.into_value(),
    }
}
