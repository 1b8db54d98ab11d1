//! Key-value accumulators for the stage bodies that are awkward to write
//! by hand. Each converts into the body `Value`, so it can be handed
//! straight to the matching [`Pipeline`](crate::Pipeline) method.

use serde_json::{Map, Value};

use crate::stage::Stage;

fn stages_value(stages: Vec<Stage>) -> Value {
    Value::Array(stages.into_iter().map(Stage::into_value).collect())
}

macro_rules! into_value {
    ($($builder:ty),*) => {
        $(impl From<$builder> for Value {
            fn from(builder: $builder) -> Value {
                builder.build()
            }
        })*
    };
}

into_value!(
    ProjectBuilder,
    GroupBuilder,
    LookupBuilder,
    UnwindBuilder,
    FacetBuilder,
    UnionWithBuilder,
    SortBuilder
);

// ---------------------------------------------------------------------------
// $project
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ProjectBuilder {
    fields: Map<String, Value>,
}

impl ProjectBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn include(self, field: impl Into<String>) -> Self {
        self.add(field, 1)
    }

    pub fn exclude(self, field: impl Into<String>) -> Self {
        self.add(field, 0)
    }

    pub fn build(self) -> Value {
        Value::Object(self.fields)
    }
}

// ---------------------------------------------------------------------------
// $group
// ---------------------------------------------------------------------------

/// `_id` always comes first; `Value::Null` groups everything together.
#[derive(Debug, Clone)]
pub struct GroupBuilder {
    fields: Map<String, Value>,
}

impl GroupBuilder {
    pub fn new(id: impl Into<Value>) -> Self {
        let mut fields = Map::new();
        fields.insert("_id".to_string(), id.into());
        Self { fields }
    }

    pub fn add(mut self, field: impl Into<String>, expr: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), expr.into());
        self
    }

    pub fn build(self) -> Value {
        Value::Object(self.fields)
    }
}

impl Default for GroupBuilder {
    fn default() -> Self {
        Self::new(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// $lookup
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct LookupBuilder {
    fields: Map<String, Value>,
}

impl LookupBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn with(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn from(self, collection: impl Into<String>) -> Self {
        self.with("from", Value::String(collection.into()))
    }

    pub fn local_field(self, field: impl Into<String>) -> Self {
        self.with("localField", Value::String(field.into()))
    }

    pub fn foreign_field(self, field: impl Into<String>) -> Self {
        self.with("foreignField", Value::String(field.into()))
    }

    pub fn as_field(self, alias: impl Into<String>) -> Self {
        self.with("as", Value::String(alias.into()))
    }

    pub fn let_vars(self, vars: Map<String, Value>) -> Self {
        self.with("let", Value::Object(vars))
    }

    pub fn pipeline(self, stages: Vec<Stage>) -> Self {
        self.with("pipeline", stages_value(stages))
    }

    pub fn build(self) -> Value {
        Value::Object(self.fields)
    }
}

// ---------------------------------------------------------------------------
// $unwind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct UnwindBuilder {
    fields: Map<String, Value>,
}

impl UnwindBuilder {
    pub fn new(path: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("path".to_string(), Value::String(path.into()));
        Self { fields }
    }

    pub fn preserve_null_and_empty_arrays(mut self, preserve: bool) -> Self {
        self.fields
            .insert("preserveNullAndEmptyArrays".to_string(), Value::Bool(preserve));
        self
    }

    pub fn build(self) -> Value {
        Value::Object(self.fields)
    }
}

// ---------------------------------------------------------------------------
// $facet
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct FacetBuilder {
    facets: Map<String, Value>,
}

impl FacetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named sub-pipeline. Reusing a name replaces the earlier one.
    pub fn add(mut self, name: impl Into<String>, stages: Vec<Stage>) -> Self {
        self.facets.insert(name.into(), stages_value(stages));
        self
    }

    pub fn build(self) -> Value {
        Value::Object(self.facets)
    }
}

// ---------------------------------------------------------------------------
// $unionWith
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct UnionWithBuilder {
    coll: String,
    pipeline: Option<Vec<Stage>>,
}

impl UnionWithBuilder {
    pub fn new(coll: impl Into<String>) -> Self {
        Self {
            coll: coll.into(),
            pipeline: None,
        }
    }

    pub fn pipeline(mut self, stages: Vec<Stage>) -> Self {
        self.pipeline = Some(stages);
        self
    }

    pub fn build(self) -> Value {
        let mut body = Map::new();
        body.insert("coll".to_string(), Value::String(self.coll));
        if let Some(stages) = self.pipeline {
            body.insert("pipeline".to_string(), stages_value(stages));
        }
        Value::Object(body)
    }
}

// ---------------------------------------------------------------------------
// $sort
// ---------------------------------------------------------------------------

/// Sort keys in the order they were added.
#[derive(Debug, Clone, Default)]
pub struct SortBuilder {
    keys: Map<String, Value>,
}

impl SortBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asc(mut self, field: impl Into<String>) -> Self {
        self.keys.insert(field.into(), Value::from(1));
        self
    }

    pub fn desc(mut self, field: impl Into<String>) -> Self {
        self.keys.insert(field.into(), Value::from(-1));
        self
    }

    pub fn build(self) -> Value {
        Value::Object(self.keys)
    }
}
