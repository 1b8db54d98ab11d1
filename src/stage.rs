use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};

// ---------------------------------------------------------------------------
// Stage descriptor
// ---------------------------------------------------------------------------

/// One pipeline step. Each variant pairs a stage tag with an opaque body;
/// the serialized form is a single-key object such as `{"$match": {...}}`.
///
/// `Raw` holds a caller-supplied stage verbatim and serializes as given.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Value),
    Sort(Value),
    Project(Value),
    Group(Value),
    Lookup(Value),
    Unwind(Value),
    Limit(u64),
    Skip(u64),
    Set(Value),
    AddFields(Value),
    ReplaceRoot(Value),
    Facet(Value),
    Merge(Value),
    UnionWith(Value),
    Raw(Value),
}

impl Stage {
    /// The `$`-prefixed tag this stage serializes under, or `None` for raw stages.
    pub fn tag(&self) -> Option<&'static str> {
        Some(match self {
            Stage::Match(_) => "$match",
            Stage::Sort(_) => "$sort",
            Stage::Project(_) => "$project",
            Stage::Group(_) => "$group",
            Stage::Lookup(_) => "$lookup",
            Stage::Unwind(_) => "$unwind",
            Stage::Limit(_) => "$limit",
            Stage::Skip(_) => "$skip",
            Stage::Set(_) => "$set",
            Stage::AddFields(_) => "$addFields",
            Stage::ReplaceRoot(_) => "$replaceRoot",
            Stage::Facet(_) => "$facet",
            Stage::Merge(_) => "$merge",
            Stage::UnionWith(_) => "$unionWith",
            Stage::Raw(_) => return None,
        })
    }

    pub fn is_match(&self) -> bool {
        matches!(self, Stage::Match(_))
    }

    /// Borrow the body of a filter stage.
    pub fn match_body(&self) -> Option<&Value> {
        match self {
            Stage::Match(body) => Some(body),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        self.clone().into_value()
    }

    pub fn into_value(self) -> Value {
        let tag = self.tag();
        let body = match self {
            Stage::Limit(n) | Stage::Skip(n) => json!(n),
            Stage::Raw(v) => return v,
            Stage::Match(v)
            | Stage::Sort(v)
            | Stage::Project(v)
            | Stage::Group(v)
            | Stage::Lookup(v)
            | Stage::Unwind(v)
            | Stage::Set(v)
            | Stage::AddFields(v)
            | Stage::ReplaceRoot(v)
            | Stage::Facet(v)
            | Stage::Merge(v)
            | Stage::UnionWith(v) => v,
        };
        let mut map = Map::new();
        if let Some(tag) = tag {
            map.insert(tag.to_string(), body);
        }
        Value::Object(map)
    }

    /// Classify a JSON stage object into its typed variant.
    ///
    /// Only single-key objects with a known tag are classified; anything
    /// else (including `$limit` with a non-integer body) stays `Raw`.
    pub fn from_value(value: Value) -> Stage {
        let map = match value {
            Value::Object(map) if map.len() == 1 => map,
            other => return Stage::Raw(other),
        };
        let Some((tag, body)) = map.into_iter().next() else {
            return Stage::Raw(Value::Object(Map::new()));
        };
        match classify(&tag, body) {
            Ok(stage) => stage,
            Err(body) => {
                let mut map = Map::new();
                map.insert(tag, body);
                Stage::Raw(Value::Object(map))
            }
        }
    }
}

fn classify(tag: &str, body: Value) -> std::result::Result<Stage, Value> {
    Ok(match tag {
        "$match" => Stage::Match(body),
        "$sort" => Stage::Sort(body),
        "$project" => Stage::Project(body),
        "$group" => Stage::Group(body),
        "$lookup" => Stage::Lookup(body),
        "$unwind" => Stage::Unwind(body),
        "$limit" => Stage::Limit(body.as_u64().ok_or(body)?),
        "$skip" => Stage::Skip(body.as_u64().ok_or(body)?),
        "$set" => Stage::Set(body),
        "$addFields" => Stage::AddFields(body),
        "$replaceRoot" => Stage::ReplaceRoot(body),
        "$facet" => Stage::Facet(body),
        "$merge" => Stage::Merge(body),
        "$unionWith" => Stage::UnionWith(body),
        _ => return Err(body),
    })
}

impl From<Value> for Stage {
    fn from(value: Value) -> Self {
        Stage::from_value(value)
    }
}

impl From<Stage> for Value {
    fn from(stage: Stage) -> Self {
        stage.into_value()
    }
}

impl Serialize for Stage {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Stage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Stage::from_value)
    }
}

/// Serialize a stage list into the JSON array handed to an engine.
pub fn stages_to_value(stages: &[Stage]) -> Value {
    Value::Array(stages.iter().map(Stage::to_value).collect())
}
