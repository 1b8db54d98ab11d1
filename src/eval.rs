use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::query::{self, Query};
use crate::value;

// ---------------------------------------------------------------------------
// Expression
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone)]
enum Expression {
    Literal(Value),
    Root,
    FieldRef(String),
    Object(Vec<(String, Expression)>),
    Array(Vec<Expression>),
    Add(Vec<Expression>),
    Subtract(Box<Expression>, Box<Expression>),
    Multiply(Vec<Expression>),
    Divide(Box<Expression>, Box<Expression>),
    Ceil(Box<Expression>),
    ArrayElemAt(Box<Expression>, Box<Expression>),
    Compare(CmpOp, Box<Expression>, Box<Expression>),
    Cond {
        test: Box<Expression>,
        then: Box<Expression>,
        otherwise: Box<Expression>,
    },
}

// ---------------------------------------------------------------------------
// Group key / accumulators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Accumulator {
    Sum(Expression),
    Avg(Expression),
    Min(Expression),
    Max(Expression),
    Count,
    First(Expression),
    Last(Expression),
    Push(Expression),
    AddToSet(Expression),
}

enum AccumulatorState {
    Sum(f64),
    Avg { sum: f64, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    Count(u64),
    First(Option<Value>),
    Last(Option<Value>),
    Push(Vec<Value>),
}

#[derive(Debug, Clone)]
enum ProjectionField {
    Include,
    Exclude,
    Compute(Expression),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SortOrder {
    Asc,
    Desc,
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Step {
    Match(Query),
    Group {
        key: Expression,
        accumulators: Vec<(String, Accumulator)>,
    },
    Sort(Vec<(String, SortOrder)>),
    Skip(u64),
    Limit(u64),
    Project(Vec<(String, ProjectionField)>),
    Count(String),
    Unwind {
        path: String,
        preserve_null: bool,
    },
    AddFields(Vec<(String, Expression)>),
    Lookup {
        from: String,
        local_field: String,
        foreign_field: String,
        as_field: String,
    },
    Facet(Vec<(String, Plan)>),
    ReplaceRoot(Expression),
    UnionWith {
        coll: String,
        pipeline: Plan,
    },
}

/// A parsed, executable pipeline.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    steps: Vec<Step>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Resolve a field path the way expressions see it: a path that walks into
/// an array maps over its elements. `None` means missing.
fn resolve_path(doc: &Value, path: &str) -> Option<Value> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    match doc {
        Value::Object(map) => {
            let v = map.get(head)?;
            match rest {
                None => Some(v.clone()),
                Some(rest) => resolve_path(v, rest),
            }
        }
        Value::Array(items) => Some(Value::Array(
            items.iter().filter_map(|item| resolve_path(item, path)).collect(),
        )),
        _ => None,
    }
}

fn set_field(doc: &mut Value, path: &str, value: Value) {
    let mut parts = path.split('.').peekable();
    let mut current = doc;
    while let Some(part) = parts.next() {
        let Value::Object(map) = current else {
            return;
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        let entry = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry;
    }
}

fn number_to_value(n: f64) -> Value {
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn truthy(v: Option<&Value>) -> bool {
    match v {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::Number(n)) => n.as_f64() != Some(0.0),
        Some(_) => true,
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidPipeline(msg.into())
}

// ---------------------------------------------------------------------------
// Expression parsing & evaluation
// ---------------------------------------------------------------------------

fn operands<'a>(op: &str, arg: &'a Value, n: usize) -> Result<&'a [Value]> {
    match arg.as_array() {
        Some(arr) if arr.len() == n => Ok(arr),
        _ => Err(invalid(format!("{op} requires an array of {n} arguments"))),
    }
}

fn parse_binary(op: &str, arg: &Value) -> Result<(Box<Expression>, Box<Expression>)> {
    let arr = operands(op, arg, 2)?;
    Ok((
        Box::new(parse_expression(&arr[0])?),
        Box::new(parse_expression(&arr[1])?),
    ))
}

fn parse_list(op: &str, arg: &Value) -> Result<Vec<Expression>> {
    arg.as_array()
        .ok_or_else(|| invalid(format!("{op} requires an array")))?
        .iter()
        .map(parse_expression)
        .collect()
}

fn parse_operator(op: &str, arg: &Value) -> Result<Expression> {
    let cmp = |c: CmpOp| -> Result<Expression> {
        let (a, b) = parse_binary(op, arg)?;
        Ok(Expression::Compare(c, a, b))
    };
    match op {
        "$literal" => Ok(Expression::Literal(arg.clone())),
        "$add" => Ok(Expression::Add(parse_list(op, arg)?)),
        "$multiply" => Ok(Expression::Multiply(parse_list(op, arg)?)),
        "$subtract" => {
            let (a, b) = parse_binary(op, arg)?;
            Ok(Expression::Subtract(a, b))
        }
        "$divide" => {
            let (a, b) = parse_binary(op, arg)?;
            Ok(Expression::Divide(a, b))
        }
        "$ceil" => {
            let inner = match arg {
                Value::Array(arr) if arr.len() == 1 => &arr[0],
                other => other,
            };
            Ok(Expression::Ceil(Box::new(parse_expression(inner)?)))
        }
        "$arrayElemAt" => {
            let (a, b) = parse_binary(op, arg)?;
            Ok(Expression::ArrayElemAt(a, b))
        }
        "$eq" => cmp(CmpOp::Eq),
        "$ne" => cmp(CmpOp::Ne),
        "$gt" => cmp(CmpOp::Gt),
        "$gte" => cmp(CmpOp::Gte),
        "$lt" => cmp(CmpOp::Lt),
        "$lte" => cmp(CmpOp::Lte),
        "$cond" => {
            let (test, then, otherwise) = match arg {
                Value::Array(_) => {
                    let arr = operands(op, arg, 3)?;
                    (&arr[0], &arr[1], &arr[2])
                }
                Value::Object(obj) => {
                    let field = |k: &str| {
                        obj.get(k)
                            .ok_or_else(|| invalid(format!("$cond requires '{k}'")))
                    };
                    (field("if")?, field("then")?, field("else")?)
                }
                _ => return Err(invalid("$cond must be an array or object")),
            };
            Ok(Expression::Cond {
                test: Box::new(parse_expression(test)?),
                then: Box::new(parse_expression(then)?),
                otherwise: Box::new(parse_expression(otherwise)?),
            })
        }
        _ => Err(invalid(format!("unsupported expression operator: {op}"))),
    }
}

fn parse_expression(val: &Value) -> Result<Expression> {
    match val {
        Value::String(s) if s == "$$ROOT" => Ok(Expression::Root),
        Value::String(s) if s.starts_with("$$") => {
            Err(invalid(format!("unsupported variable: {s}")))
        }
        Value::String(s) if s.starts_with('$') => Ok(Expression::FieldRef(s[1..].to_string())),
        Value::Array(items) => Ok(Expression::Array(
            items.iter().map(parse_expression).collect::<Result<_>>()?,
        )),
        Value::Object(map) => {
            let mut operators = map.iter().filter(|(k, _)| k.starts_with('$'));
            match (operators.next(), map.len()) {
                (Some((op, arg)), 1) => parse_operator(op, arg),
                (Some(_), _) => Err(invalid(
                    "an expression object must hold exactly one operator",
                )),
                (None, _) => {
                    let fields = map
                        .iter()
                        .map(|(k, v)| Ok((k.clone(), parse_expression(v)?)))
                        .collect::<Result<Vec<_>>>()?;
                    Ok(Expression::Object(fields))
                }
            }
        }
        _ => Ok(Expression::Literal(val.clone())),
    }
}

impl Expression {
    /// `None` is a missing value, distinct from an explicit null.
    fn eval(&self, doc: &Value) -> Option<Value> {
        let num = |e: &Expression| e.eval(doc).as_ref().and_then(Value::as_f64);
        match self {
            Expression::Literal(v) => Some(v.clone()),
            Expression::Root => Some(doc.clone()),
            Expression::FieldRef(path) => resolve_path(doc, path),
            Expression::Object(fields) => {
                let mut map = Map::new();
                for (name, expr) in fields {
                    if let Some(v) = expr.eval(doc) {
                        map.insert(name.clone(), v);
                    }
                }
                Some(Value::Object(map))
            }
            Expression::Array(items) => Some(Value::Array(
                items
                    .iter()
                    .map(|e| e.eval(doc).unwrap_or(Value::Null))
                    .collect(),
            )),
            Expression::Add(exprs) => Some(
                exprs
                    .iter()
                    .try_fold(0.0, |acc, e| num(e).map(|n| acc + n))
                    .map_or(Value::Null, number_to_value),
            ),
            Expression::Multiply(exprs) => Some(
                exprs
                    .iter()
                    .try_fold(1.0, |acc, e| num(e).map(|n| acc * n))
                    .map_or(Value::Null, number_to_value),
            ),
            Expression::Subtract(a, b) => Some(match (num(a), num(b)) {
                (Some(a), Some(b)) => number_to_value(a - b),
                _ => Value::Null,
            }),
            Expression::Divide(a, b) => Some(match (num(a), num(b)) {
                (Some(a), Some(b)) if b != 0.0 => number_to_value(a / b),
                _ => Value::Null,
            }),
            Expression::Ceil(inner) => Some(num(inner).map_or(Value::Null, |n| number_to_value(n.ceil()))),
            Expression::ArrayElemAt(arr, idx) => {
                let items = match arr.eval(doc) {
                    Some(Value::Array(items)) => items,
                    _ => return Some(Value::Null),
                };
                let idx = idx.eval(doc).as_ref().and_then(Value::as_i64)?;
                let pos = if idx < 0 {
                    items.len().checked_sub(idx.unsigned_abs() as usize)?
                } else {
                    idx as usize
                };
                items.into_iter().nth(pos)
            }
            Expression::Compare(op, a, b) => {
                let a = a.eval(doc).unwrap_or(Value::Null);
                let b = b.eval(doc).unwrap_or(Value::Null);
                let ord = value::compare(&a, &b);
                Some(Value::Bool(match op {
                    CmpOp::Eq => ord == Ordering::Equal,
                    CmpOp::Ne => ord != Ordering::Equal,
                    CmpOp::Gt => ord == Ordering::Greater,
                    CmpOp::Gte => ord != Ordering::Less,
                    CmpOp::Lt => ord == Ordering::Less,
                    CmpOp::Lte => ord != Ordering::Greater,
                }))
            }
            Expression::Cond {
                test,
                then,
                otherwise,
            } => {
                if truthy(test.eval(doc).as_ref()) {
                    then.eval(doc)
                } else {
                    otherwise.eval(doc)
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Stage parsing helpers
// ---------------------------------------------------------------------------

fn parse_accumulator(val: &Value) -> Result<Accumulator> {
    let obj = val
        .as_object()
        .filter(|o| o.len() == 1)
        .ok_or_else(|| invalid("accumulator must be an object with exactly one operator"))?;
    let Some((op, arg)) = obj.iter().next() else {
        return Err(invalid("empty accumulator"));
    };
    match op.as_str() {
        "$sum" => Ok(Accumulator::Sum(parse_expression(arg)?)),
        "$avg" => Ok(Accumulator::Avg(parse_expression(arg)?)),
        "$min" => Ok(Accumulator::Min(parse_expression(arg)?)),
        "$max" => Ok(Accumulator::Max(parse_expression(arg)?)),
        "$count" => Ok(Accumulator::Count),
        "$first" => Ok(Accumulator::First(parse_expression(arg)?)),
        "$last" => Ok(Accumulator::Last(parse_expression(arg)?)),
        "$push" => Ok(Accumulator::Push(parse_expression(arg)?)),
        "$addToSet" => Ok(Accumulator::AddToSet(parse_expression(arg)?)),
        _ => Err(invalid(format!("unknown accumulator: {op}"))),
    }
}

fn parse_group(val: &Value) -> Result<Step> {
    let obj = val
        .as_object()
        .ok_or_else(|| invalid("$group must be an object"))?;
    let id = obj
        .get("_id")
        .ok_or_else(|| invalid("$group requires '_id' field"))?;

    let accumulators = obj
        .iter()
        .filter(|(name, _)| name.as_str() != "_id")
        .map(|(name, spec)| Ok((name.clone(), parse_accumulator(spec)?)))
        .collect::<Result<Vec<_>>>()?;

    Ok(Step::Group {
        key: parse_expression(id)?,
        accumulators,
    })
}

fn parse_sort(val: &Value) -> Result<Vec<(String, SortOrder)>> {
    let obj = val
        .as_object()
        .ok_or_else(|| invalid("$sort must be an object"))?;
    obj.iter()
        .map(|(field, dir)| match dir.as_i64() {
            Some(1) => Ok((field.clone(), SortOrder::Asc)),
            Some(-1) => Ok((field.clone(), SortOrder::Desc)),
            _ => Err(invalid("sort direction must be 1 or -1")),
        })
        .collect()
}

fn parse_project(val: &Value) -> Result<Vec<(String, ProjectionField)>> {
    let obj = val
        .as_object()
        .ok_or_else(|| invalid("$project must be an object"))?;
    obj.iter()
        .map(|(field, spec)| {
            let pf = match spec {
                Value::Number(n) if n.as_i64() == Some(1) => ProjectionField::Include,
                Value::Number(n) if n.as_i64() == Some(0) => ProjectionField::Exclude,
                Value::Bool(true) => ProjectionField::Include,
                Value::Bool(false) => ProjectionField::Exclude,
                _ => ProjectionField::Compute(parse_expression(spec)?),
            };
            Ok((field.clone(), pf))
        })
        .collect()
}

fn field_path(s: &str, stage: &str) -> Result<String> {
    s.strip_prefix('$')
        .map(str::to_string)
        .ok_or_else(|| invalid(format!("{stage} path must start with $")))
}

fn parse_unwind(val: &Value) -> Result<Step> {
    match val {
        Value::String(s) => Ok(Step::Unwind {
            path: field_path(s, "$unwind")?,
            preserve_null: false,
        }),
        Value::Object(obj) => {
            let path = obj
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("$unwind requires 'path' string"))?;
            Ok(Step::Unwind {
                path: field_path(path, "$unwind")?,
                preserve_null: obj
                    .get("preserveNullAndEmptyArrays")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
        }
        _ => Err(invalid("$unwind must be a string or object")),
    }
}

fn parse_fields(val: &Value, stage: &str) -> Result<Vec<(String, Expression)>> {
    val.as_object()
        .ok_or_else(|| invalid(format!("{stage} must be an object")))?
        .iter()
        .map(|(k, v)| Ok((k.clone(), parse_expression(v)?)))
        .collect()
}

fn parse_lookup(val: &Value) -> Result<Step> {
    let obj = val
        .as_object()
        .ok_or_else(|| invalid("$lookup must be an object"))?;
    let field = |k: &str| -> Result<String> {
        obj.get(k)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| invalid(format!("$lookup requires '{k}' string")))
    };
    Ok(Step::Lookup {
        from: field("from")?,
        local_field: field("localField")?,
        foreign_field: field("foreignField")?,
        as_field: field("as")?,
    })
}

fn parse_facet(val: &Value) -> Result<Step> {
    let obj = val
        .as_object()
        .ok_or_else(|| invalid("$facet must be an object"))?;
    let branches = obj
        .iter()
        .map(|(name, stages)| Ok((name.clone(), Plan::parse(stages)?)))
        .collect::<Result<Vec<_>>>()?;
    Ok(Step::Facet(branches))
}

fn parse_union_with(val: &Value) -> Result<Step> {
    match val {
        Value::String(coll) => Ok(Step::UnionWith {
            coll: coll.clone(),
            pipeline: Plan::default(),
        }),
        Value::Object(obj) => {
            let coll = obj
                .get("coll")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("$unionWith requires 'coll' string"))?;
            let pipeline = match obj.get("pipeline") {
                Some(p) => Plan::parse(p)?,
                None => Plan::default(),
            };
            Ok(Step::UnionWith {
                coll: coll.to_string(),
                pipeline,
            })
        }
        _ => Err(invalid("$unionWith must be a string or object")),
    }
}

fn parse_step(name: &str, body: &Value) -> Result<Step> {
    Ok(match name {
        "$match" => Step::Match(query::parse_query(body)?),
        "$group" => parse_group(body)?,
        "$sort" => Step::Sort(parse_sort(body)?),
        "$skip" => Step::Skip(
            body.as_u64()
                .ok_or_else(|| invalid("$skip must be a non-negative integer"))?,
        ),
        "$limit" => Step::Limit(
            body.as_u64()
                .ok_or_else(|| invalid("$limit must be a non-negative integer"))?,
        ),
        "$project" => Step::Project(parse_project(body)?),
        "$count" => Step::Count(
            body.as_str()
                .filter(|s| !s.is_empty() && !s.starts_with('$'))
                .ok_or_else(|| invalid("$count must be a non-empty field name"))?
                .to_string(),
        ),
        "$unwind" => parse_unwind(body)?,
        "$addFields" | "$set" => Step::AddFields(parse_fields(body, name)?),
        "$lookup" => parse_lookup(body)?,
        "$facet" => parse_facet(body)?,
        "$replaceRoot" => {
            let new_root = body
                .get("newRoot")
                .ok_or_else(|| invalid("$replaceRoot requires 'newRoot'"))?;
            Step::ReplaceRoot(parse_expression(new_root)?)
        }
        "$unionWith" => parse_union_with(body)?,
        _ => return Err(invalid(format!("unsupported stage: {name}"))),
    })
}

// ---------------------------------------------------------------------------
// Stage execution
// ---------------------------------------------------------------------------

/// Hash key for `$group`. Integral floats render as integers so `1` and
/// `1.0` share a group.
fn group_key(key: &Value) -> String {
    fn normalize(v: &Value) -> Value {
        match v {
            Value::Number(n) if n.is_f64() => n.as_f64().map_or(Value::Null, number_to_value),
            Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
            Value::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), normalize(v))).collect()),
            other => other.clone(),
        }
    }
    normalize(key).to_string()
}

fn exec_group(docs: Vec<Value>, key: &Expression, accumulators: &[(String, Accumulator)]) -> Vec<Value> {
    let mut groups: HashMap<String, (Value, Vec<AccumulatorState>)> = HashMap::new();
    let mut insertion_order: Vec<String> = Vec::new();

    for doc in &docs {
        let key_val = key.eval(doc).unwrap_or(Value::Null);
        let key_str = group_key(&key_val);

        let (_, states) = groups.entry(key_str.clone()).or_insert_with(|| {
            insertion_order.push(key_str);
            let initial = accumulators
                .iter()
                .map(|(_, acc)| match acc {
                    Accumulator::Sum(_) => AccumulatorState::Sum(0.0),
                    Accumulator::Avg(_) => AccumulatorState::Avg { sum: 0.0, count: 0 },
                    Accumulator::Min(_) => AccumulatorState::Min(None),
                    Accumulator::Max(_) => AccumulatorState::Max(None),
                    Accumulator::Count => AccumulatorState::Count(0),
                    Accumulator::First(_) => AccumulatorState::First(None),
                    Accumulator::Last(_) => AccumulatorState::Last(None),
                    Accumulator::Push(_) | Accumulator::AddToSet(_) => AccumulatorState::Push(Vec::new()),
                })
                .collect();
            (key_val, initial)
        });

        for ((_, acc), state) in accumulators.iter().zip(states.iter_mut()) {
            match (acc, state) {
                (Accumulator::Sum(expr), AccumulatorState::Sum(s)) => {
                    if let Some(n) = expr.eval(doc).as_ref().and_then(Value::as_f64) {
                        *s += n;
                    }
                }
                (Accumulator::Avg(expr), AccumulatorState::Avg { sum, count }) => {
                    if let Some(n) = expr.eval(doc).as_ref().and_then(Value::as_f64) {
                        *sum += n;
                        *count += 1;
                    }
                }
                (Accumulator::Min(expr), AccumulatorState::Min(current)) => {
                    if let Some(val) = expr.eval(doc).filter(|v| !v.is_null()) {
                        if current
                            .as_ref()
                            .is_none_or(|cur| value::compare(&val, cur) == Ordering::Less)
                        {
                            *current = Some(val);
                        }
                    }
                }
                (Accumulator::Max(expr), AccumulatorState::Max(current)) => {
                    if let Some(val) = expr.eval(doc).filter(|v| !v.is_null()) {
                        if current
                            .as_ref()
                            .is_none_or(|cur| value::compare(&val, cur) == Ordering::Greater)
                        {
                            *current = Some(val);
                        }
                    }
                }
                (Accumulator::Count, AccumulatorState::Count(c)) => *c += 1,
                (Accumulator::First(expr), AccumulatorState::First(current)) => {
                    if current.is_none() {
                        *current = Some(expr.eval(doc).unwrap_or(Value::Null));
                    }
                }
                (Accumulator::Last(expr), AccumulatorState::Last(current)) => {
                    *current = Some(expr.eval(doc).unwrap_or(Value::Null));
                }
                (Accumulator::Push(expr), AccumulatorState::Push(items)) => {
                    items.push(expr.eval(doc).unwrap_or(Value::Null));
                }
                (Accumulator::AddToSet(expr), AccumulatorState::Push(items)) => {
                    let val = expr.eval(doc).unwrap_or(Value::Null);
                    if !items.contains(&val) {
                        items.push(val);
                    }
                }
                _ => {}
            }
        }
    }

    insertion_order
        .iter()
        .filter_map(|key_str| groups.remove(key_str))
        .map(|(key_val, states)| {
            let mut out = Map::new();
            out.insert("_id".to_string(), key_val);
            for ((name, _), state) in accumulators.iter().zip(states) {
                let val = match state {
                    AccumulatorState::Sum(s) => number_to_value(s),
                    AccumulatorState::Avg { sum, count } => {
                        if count == 0 {
                            Value::Null
                        } else {
                            number_to_value(sum / count as f64)
                        }
                    }
                    AccumulatorState::Count(c) => Value::Number(c.into()),
                    AccumulatorState::Min(v)
                    | AccumulatorState::Max(v)
                    | AccumulatorState::First(v)
                    | AccumulatorState::Last(v) => v.unwrap_or(Value::Null),
                    AccumulatorState::Push(items) => Value::Array(items),
                };
                out.insert(name.clone(), val);
            }
            Value::Object(out)
        })
        .collect()
}

fn exec_sort(mut docs: Vec<Value>, fields: &[(String, SortOrder)]) -> Vec<Value> {
    // `sort_by` is stable, so equal keys keep their input order.
    docs.sort_by(|a, b| {
        for (field, order) in fields {
            let av = query::get_path(a, field).unwrap_or(&Value::Null);
            let bv = query::get_path(b, field).unwrap_or(&Value::Null);
            let cmp = match order {
                SortOrder::Asc => value::compare(av, bv),
                SortOrder::Desc => value::compare(av, bv).reverse(),
            };
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        Ordering::Equal
    });
    docs
}

fn exec_project(docs: Vec<Value>, fields: &[(String, ProjectionField)]) -> Vec<Value> {
    let inclusion_mode = fields.iter().any(|(name, pf)| match pf {
        ProjectionField::Include => name != "_id",
        ProjectionField::Compute(_) => true,
        ProjectionField::Exclude => false,
    });
    let excluded = |name: &str| {
        fields
            .iter()
            .any(|(n, pf)| n == name && matches!(pf, ProjectionField::Exclude))
    };

    docs.into_iter()
        .map(|doc| {
            if !inclusion_mode {
                return match doc {
                    Value::Object(src) => {
                        Value::Object(src.into_iter().filter(|(k, _)| !excluded(k)).collect())
                    }
                    other => other,
                };
            }

            let mut result = Value::Object(Map::new());
            if !excluded("_id") {
                if let Some(id) = doc.get("_id") {
                    set_field(&mut result, "_id", id.clone());
                }
            }
            for (name, pf) in fields {
                let val = match pf {
                    ProjectionField::Include => query::get_path(&doc, name).cloned(),
                    ProjectionField::Compute(expr) => expr.eval(&doc),
                    ProjectionField::Exclude => None,
                };
                if let Some(val) = val {
                    set_field(&mut result, name, val);
                }
            }
            result
        })
        .collect()
}

fn exec_unwind(docs: Vec<Value>, path: &str, preserve_null: bool) -> Vec<Value> {
    let mut result = Vec::new();
    for doc in docs {
        match query::get_path(&doc, path).cloned() {
            Some(Value::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut new_doc = doc.clone();
                    set_field(&mut new_doc, path, item);
                    result.push(new_doc);
                }
            }
            Some(Value::Array(_)) | Some(Value::Null) | None => {
                if preserve_null {
                    result.push(doc);
                }
            }
            // Non-array, non-null: pass through unchanged
            Some(_) => result.push(doc),
        }
    }
    result
}

fn exec_add_fields(docs: Vec<Value>, fields: &[(String, Expression)]) -> Vec<Value> {
    docs.into_iter()
        .map(|mut doc| {
            for (name, expr) in fields {
                // Missing results leave the document untouched.
                if let Some(val) = expr.eval(&doc) {
                    set_field(&mut doc, name, val);
                }
            }
            doc
        })
        .collect()
}

fn exec_lookup<F>(
    docs: Vec<Value>,
    from: &str,
    local_field: &str,
    foreign_field: &str,
    as_field: &str,
    lookup_fn: &F,
) -> Result<Vec<Value>>
where
    F: Fn(&str, &Value) -> Result<Vec<Value>>,
{
    docs.into_iter()
        .map(|mut doc| {
            let query = match query::get_path(&doc, local_field) {
                Some(Value::Array(items)) => json!({ foreign_field: {"$in": items} }),
                Some(v) => json!({ foreign_field: v }),
                None => json!({ foreign_field: null }),
            };
            let foreign = lookup_fn(from, &query)?;
            set_field(&mut doc, as_field, Value::Array(foreign));
            Ok(doc)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Plan parsing & execution
// ---------------------------------------------------------------------------

impl Plan {
    /// Parse a JSON array of single-key stage objects.
    pub fn parse(pipeline: &Value) -> Result<Self> {
        let arr = pipeline
            .as_array()
            .ok_or_else(|| invalid("pipeline must be an array"))?;

        let steps = arr
            .iter()
            .map(|stage| {
                let obj = stage
                    .as_object()
                    .ok_or_else(|| invalid("each pipeline stage must be an object"))?;
                if obj.len() != 1 {
                    return Err(invalid("each pipeline stage must have exactly one key"));
                }
                let Some((name, body)) = obj.iter().next() else {
                    return Err(invalid("empty pipeline stage"));
                };
                parse_step(name, body)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Plan { steps })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run the plan over `docs`. `lookup_fn(collection, query)` answers
    /// `$lookup` and `$unionWith` reads against other collections.
    pub fn execute<F>(&self, docs: Vec<Value>, lookup_fn: &F) -> Result<Vec<Value>>
    where
        F: Fn(&str, &Value) -> Result<Vec<Value>>,
    {
        let mut current = docs;
        for step in &self.steps {
            current = match step {
                Step::Match(q) => current.into_iter().filter(|d| query::matches(q, d)).collect(),
                Step::Group { key, accumulators } => exec_group(current, key, accumulators),
                Step::Sort(fields) => exec_sort(current, fields),
                Step::Skip(n) => current.into_iter().skip(*n as usize).collect(),
                Step::Limit(n) => current.into_iter().take(*n as usize).collect(),
                Step::Project(fields) => exec_project(current, fields),
                // No document at all for an empty input.
                Step::Count(field) => match current.len() {
                    0 => Vec::new(),
                    n => vec![json!({ field.as_str(): n })],
                },
                Step::Unwind {
                    path,
                    preserve_null,
                } => exec_unwind(current, path, *preserve_null),
                Step::AddFields(fields) => exec_add_fields(current, fields),
                Step::Lookup {
                    from,
                    local_field,
                    foreign_field,
                    as_field,
                } => exec_lookup(current, from, local_field, foreign_field, as_field, lookup_fn)?,
                Step::Facet(branches) => {
                    let mut out = Map::new();
                    for (name, plan) in branches {
                        let docs = plan.execute(current.clone(), lookup_fn)?;
                        out.insert(name.clone(), Value::Array(docs));
                    }
                    vec![Value::Object(out)]
                }
                Step::ReplaceRoot(expr) => current
                    .iter()
                    .map(|doc| match expr.eval(doc) {
                        Some(root @ Value::Object(_)) => Ok(root),
                        _ => Err(invalid("$replaceRoot 'newRoot' must resolve to an object")),
                    })
                    .collect::<Result<Vec<_>>>()?,
                Step::UnionWith { coll, pipeline } => {
                    let other = pipeline.execute(lookup_fn(coll, &json!({}))?, lookup_fn)?;
                    current.into_iter().chain(other).collect()
                }
            };
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn no_lookup(_col: &str, _q: &Value) -> Result<Vec<Value>> {
        Ok(vec![])
    }

    fn run(pipeline: Value, docs: Vec<Value>) -> Vec<Value> {
        Plan::parse(&pipeline).unwrap().execute(docs, &no_lookup).unwrap()
    }

    fn eval(expr: Value, doc: &Value) -> Option<Value> {
        parse_expression(&expr).unwrap().eval(doc)
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    #[test]
    fn field_refs_and_missing() {
        let doc = json!({"user": {"city": "NYC"}, "n": null});
        assert_eq!(eval(json!("$user.city"), &doc), Some(json!("NYC")));
        assert_eq!(eval(json!("$n"), &doc), Some(Value::Null));
        assert_eq!(eval(json!("$missing"), &doc), None);
    }

    #[test]
    fn path_through_array_maps_elements() {
        let doc = json!({"meta": [{"totalDocs": 25}]});
        assert_eq!(eval(json!("$meta.totalDocs"), &doc), Some(json!([25])));
        let empty = json!({"meta": []});
        assert_eq!(eval(json!("$meta.totalDocs"), &empty), Some(json!([])));
    }

    #[test]
    fn arithmetic() {
        let doc = json!({"a": 10, "b": 4});
        assert_eq!(eval(json!({"$add": ["$a", "$b", 1]}), &doc), Some(json!(15)));
        assert_eq!(eval(json!({"$subtract": ["$a", "$b"]}), &doc), Some(json!(6)));
        assert_eq!(eval(json!({"$multiply": ["$a", "$b"]}), &doc), Some(json!(40)));
        assert_eq!(eval(json!({"$divide": ["$a", "$b"]}), &doc), Some(json!(2.5)));
        assert_eq!(eval(json!({"$divide": ["$a", 0]}), &doc), Some(Value::Null));
        assert_eq!(eval(json!({"$add": ["$a", "$nope"]}), &doc), Some(Value::Null));
    }

    #[test]
    fn ceil_of_division() {
        let doc = json!({"total": 25});
        assert_eq!(eval(json!({"$ceil": {"$divide": ["$total", 10]}}), &doc), Some(json!(3)));
        assert_eq!(eval(json!({"$ceil": {"$divide": ["$none", 10]}}), &doc), Some(Value::Null));
    }

    #[test]
    fn array_elem_at() {
        let doc = json!({"xs": [1, 2, 3]});
        assert_eq!(eval(json!({"$arrayElemAt": ["$xs", 0]}), &doc), Some(json!(1)));
        assert_eq!(eval(json!({"$arrayElemAt": ["$xs", -1]}), &doc), Some(json!(3)));
        assert_eq!(eval(json!({"$arrayElemAt": ["$xs", 5]}), &doc), None);
        assert_eq!(eval(json!({"$arrayElemAt": ["$nope", 0]}), &doc), Some(Value::Null));
    }

    #[test]
    fn comparisons_treat_missing_as_lowest() {
        let doc = json!({"n": 25});
        assert_eq!(eval(json!({"$gt": ["$n", 20]}), &doc), Some(json!(true)));
        assert_eq!(eval(json!({"$gt": ["$missing", 20]}), &doc), Some(json!(false)));
        assert_eq!(eval(json!({"$gt": [1, 1]}), &doc), Some(json!(false)));
        assert_eq!(eval(json!({"$lte": [1, 1]}), &doc), Some(json!(true)));
    }

    #[test]
    fn cond_forms() {
        let doc = json!({"age": 30});
        let arr = json!({"$cond": [{"$gte": ["$age", 18]}, "adult", "minor"]});
        let obj = json!({"$cond": {"if": {"$lt": ["$age", 18]}, "then": "minor", "else": "adult"}});
        assert_eq!(eval(arr, &doc), Some(json!("adult")));
        assert_eq!(eval(obj, &doc), Some(json!("adult")));
    }

    #[test]
    fn literal_is_not_interpreted() {
        assert_eq!(eval(json!({"$literal": "$notAField"}), &json!({})), Some(json!("$notAField")));
    }

    #[test]
    fn bad_expressions() {
        assert!(parse_expression(&json!({"$add": 1})).is_err());
        assert!(parse_expression(&json!({"$divide": [1]})).is_err());
        assert!(parse_expression(&json!({"$mystery": []})).is_err());
        assert!(parse_expression(&json!({"$add": [1], "x": 2})).is_err());
        assert!(parse_expression(&json!("$$NOW")).is_err());
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    #[test]
    fn match_group_sort_limit() {
        let docs = vec![
            json!({"status": "completed", "category": "A", "amount": 100}),
            json!({"status": "pending", "category": "A", "amount": 50}),
            json!({"status": "completed", "category": "B", "amount": 200}),
            json!({"status": "completed", "category": "A", "amount": 150}),
            json!({"status": "completed", "category": "C", "amount": 50}),
        ];
        let result = run(
            json!([
                {"$match": {"status": "completed"}},
                {"$group": {"_id": "$category", "total": {"$sum": "$amount"}}},
                {"$sort": {"total": -1}},
                {"$limit": 2}
            ]),
            docs,
        );
        assert_eq!(
            result,
            vec![json!({"_id": "A", "total": 250}), json!({"_id": "B", "total": 200})]
        );
    }

    #[test]
    fn group_accumulators() {
        let docs = vec![
            json!({"g": "x", "v": 5}),
            json!({"g": "x", "v": 1}),
            json!({"g": "x", "v": 5}),
        ];
        let result = run(
            json!([{"$group": {
                "_id": "$g",
                "n": {"$count": {}},
                "avg": {"$avg": "$v"},
                "min": {"$min": "$v"},
                "max": {"$max": "$v"},
                "first": {"$first": "$v"},
                "last": {"$last": "$v"},
                "all": {"$push": "$v"},
                "set": {"$addToSet": "$v"}
            }}]),
            docs,
        );
        assert_eq!(
            result,
            vec![json!({
                "_id": "x", "n": 3, "avg": 3.6666666666666665, "min": 1, "max": 5,
                "first": 5, "last": 5, "all": [5, 1, 5], "set": [5, 1]
            })]
        );
    }

    #[test]
    fn group_numeric_keys_compare_by_value() {
        let out = run(
            json!([{"$group": {"_id": "$a", "n": {"$sum": 1}}}]),
            vec![json!({"a": 1}), json!({"a": 1.0}), json!({"a": {"x": 2.0}}), json!({"a": {"x": 2}})],
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["_id"], json!(1));
        assert_eq!(out[0]["n"], json!(2));
        assert_eq!(out[1]["n"], json!(2));
    }

    #[test]
    fn group_compound_key() {
        let docs = vec![
            json!({"y": 2024, "m": 1, "s": 10}),
            json!({"y": 2024, "m": 1, "s": 20}),
            json!({"y": 2024, "m": 2, "s": 30}),
        ];
        let result = run(
            json!([{"$group": {"_id": {"y": "$y", "m": "$m"}, "total": {"$sum": "$s"}}}]),
            docs,
        );
        assert_eq!(result.len(), 2);
        assert_eq!(result[0], json!({"_id": {"y": 2024, "m": 1}, "total": 30}));
    }

    #[test]
    fn sort_is_stable_and_multi_key() {
        let docs = vec![
            json!({"k": 1, "n": "b"}),
            json!({"k": 2, "n": "a"}),
            json!({"k": 1, "n": "a"}),
        ];
        let result = run(json!([{"$sort": {"k": -1, "n": 1}}]), docs);
        assert_eq!(
            result,
            vec![
                json!({"k": 2, "n": "a"}),
                json!({"k": 1, "n": "a"}),
                json!({"k": 1, "n": "b"}),
            ]
        );
    }

    #[test]
    fn project_modes() {
        let doc = json!({"_id": 1, "name": "Alice", "age": 30, "email": "a@b.com"});
        assert_eq!(
            run(json!([{"$project": {"name": 1, "age": 1}}]), vec![doc.clone()]),
            vec![json!({"_id": 1, "name": "Alice", "age": 30})]
        );
        assert_eq!(
            run(json!([{"$project": {"email": 0}}]), vec![doc.clone()]),
            vec![json!({"_id": 1, "name": "Alice", "age": 30})]
        );
        assert_eq!(
            run(json!([{"$project": {"_id": 0, "who": "$name", "meta": {"years": "$age", "gone": "$nope"}}}]), vec![doc]),
            vec![json!({"who": "Alice", "meta": {"years": 30}})]
        );
    }

    #[test]
    fn count_on_empty_emits_nothing() {
        assert!(run(json!([{"$count": "total"}]), vec![]).is_empty());
        assert_eq!(
            run(json!([{"$count": "total"}]), vec![json!({}), json!({})]),
            vec![json!({"total": 2})]
        );
    }

    #[test]
    fn unwind_with_and_without_preserve() {
        let docs = vec![
            json!({"name": "A", "tags": ["x", "y"]}),
            json!({"name": "B", "tags": []}),
            json!({"name": "C"}),
            json!({"name": "D", "tags": "solo"}),
        ];
        assert_eq!(run(json!([{"$unwind": "$tags"}]), docs.clone()).len(), 3);
        let preserved = run(
            json!([{"$unwind": {"path": "$tags", "preserveNullAndEmptyArrays": true}}]),
            docs,
        );
        assert_eq!(preserved.len(), 5);
        assert_eq!(preserved[1]["tags"], json!("y"));
    }

    #[test]
    fn add_fields_skips_missing_results() {
        let result = run(
            json!([{"$set": {"copy": "$nope", "sum": {"$add": ["$a", 1]}}}]),
            vec![json!({"a": 1})],
        );
        assert_eq!(result, vec![json!({"a": 1, "sum": 2})]);
    }

    #[test]
    fn facet_runs_branches_over_same_input() {
        let docs: Vec<Value> = (0..5).map(|i| json!({"n": i})).collect();
        let result = run(
            json!([{"$facet": {
                "head": [{"$limit": 2}],
                "meta": [{"$count": "total"}]
            }}]),
            docs,
        );
        assert_eq!(
            result,
            vec![json!({"head": [{"n": 0}, {"n": 1}], "meta": [{"total": 5}]})]
        );
    }

    #[test]
    fn replace_root() {
        let result = run(
            json!([{"$replaceRoot": {"newRoot": "$profile"}}]),
            vec![json!({"profile": {"name": "Alice"}})],
        );
        assert_eq!(result, vec![json!({"name": "Alice"})]);

        let plan = Plan::parse(&json!([{"$replaceRoot": {"newRoot": "$nope"}}])).unwrap();
        assert!(plan.execute(vec![json!({})], &no_lookup).is_err());
    }

    #[test]
    fn lookup_and_union_use_the_lookup_fn() {
        let inventory = vec![
            json!({"sku": "abc", "qty": 100}),
            json!({"sku": "xyz", "qty": 50}),
        ];
        let lookup = |col: &str, q: &Value| -> Result<Vec<Value>> {
            assert_eq!(col, "inventory");
            let q = query::parse_query(q)?;
            Ok(inventory.iter().filter(|d| query::matches(&q, d)).cloned().collect())
        };

        let plan = Plan::parse(&json!([
            {"$lookup": {"from": "inventory", "localField": "item", "foreignField": "sku", "as": "stock"}}
        ]))
        .unwrap();
        let result = plan
            .execute(vec![json!({"item": "abc"}), json!({"item": ["abc", "xyz"]})], &lookup)
            .unwrap();
        assert_eq!(result[0]["stock"].as_array().unwrap().len(), 1);
        assert_eq!(result[1]["stock"].as_array().unwrap().len(), 2);

        let plan = Plan::parse(&json!([
            {"$unionWith": {"coll": "inventory", "pipeline": [{"$match": {"qty": {"$lt": 60}}}]}}
        ]))
        .unwrap();
        let result = plan.execute(vec![json!({"sku": "local"})], &lookup).unwrap();
        assert_eq!(result, vec![json!({"sku": "local"}), json!({"sku": "xyz", "qty": 50})]);
    }

    #[test]
    fn parse_errors() {
        assert!(Plan::parse(&json!({"$match": {}})).is_err());
        assert!(Plan::parse(&json!(["not an object"])).is_err());
        assert!(Plan::parse(&json!([{"$match": {}, "$sort": {"a": 1}}])).is_err());
        assert!(Plan::parse(&json!([{"$merge": {"into": "out"}}])).is_err());
        assert!(Plan::parse(&json!([{"$group": {"total": {"$sum": 1}}}])).is_err());
        assert!(Plan::parse(&json!([{"$sort": {"a": 2}}])).is_err());
        assert!(Plan::parse(&json!([{"$unwind": "tags"}])).is_err());
        assert!(Plan::parse(&json!([{"$limit": -1}])).is_err());
    }
}
