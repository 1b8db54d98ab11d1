//! Builders for the aggregation expression operators that take a keyed
//! argument object rather than an array.

use serde_json::{Map, Value, json};

macro_rules! into_value {
    ($($op:ty),*) => {
        $(impl From<$op> for Value {
            fn from(op: $op) -> Value {
                op.build()
            }
        })*
    };
}

into_value!(Cond, MapExpr, FilterExpr, Switch, Reduce);

/// `{"$cond": {"if", "then", "else"}}`. Unset branches are `null`.
#[derive(Debug, Clone, Default)]
pub struct Cond {
    condition: Value,
    then: Value,
    otherwise: Value,
}

impl Cond {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, condition: impl Into<Value>) -> Self {
        self.condition = condition.into();
        self
    }

    pub fn then(mut self, value: impl Into<Value>) -> Self {
        self.then = value.into();
        self
    }

    pub fn otherwise(mut self, value: impl Into<Value>) -> Self {
        self.otherwise = value.into();
        self
    }

    pub fn build(self) -> Value {
        json!({"$cond": {"if": self.condition, "then": self.then, "else": self.otherwise}})
    }
}

/// `{"$map": {"input", "as", "in"}}`
#[derive(Debug, Clone, Default)]
pub struct MapExpr {
    args: Map<String, Value>,
}

impl MapExpr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, expr: impl Into<Value>) -> Self {
        self.args.insert("input".into(), expr.into());
        self
    }

    pub fn as_var(mut self, name: impl Into<String>) -> Self {
        self.args.insert("as".into(), Value::String(name.into()));
        self
    }

    pub fn apply(mut self, expr: impl Into<Value>) -> Self {
        self.args.insert("in".into(), expr.into());
        self
    }

    pub fn build(self) -> Value {
        json!({"$map": self.args})
    }
}

/// `{"$filter": {"input", "as", "cond"}}`
#[derive(Debug, Clone, Default)]
pub struct FilterExpr {
    args: Map<String, Value>,
}

impl FilterExpr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, expr: impl Into<Value>) -> Self {
        self.args.insert("input".into(), expr.into());
        self
    }

    pub fn as_var(mut self, name: impl Into<String>) -> Self {
        self.args.insert("as".into(), Value::String(name.into()));
        self
    }

    pub fn cond(mut self, condition: impl Into<Value>) -> Self {
        self.args.insert("cond".into(), condition.into());
        self
    }

    pub fn build(self) -> Value {
        json!({"$filter": self.args})
    }
}

/// `{"$switch": {"branches": [{"case", "then"}], "default"}}`
#[derive(Debug, Clone)]
pub struct Switch {
    branches: Vec<Value>,
    default: Value,
}

impl Switch {
    pub fn new() -> Self {
        Self {
            branches: Vec::new(),
            default: Value::Null,
        }
    }

    pub fn branch(mut self, case: impl Into<Value>, then: impl Into<Value>) -> Self {
        self.branches.push(json!({"case": case.into(), "then": then.into()}));
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = value.into();
        self
    }

    pub fn build(self) -> Value {
        json!({"$switch": {"branches": self.branches, "default": self.default}})
    }
}

/// `{"$reduce": {"input", "initialValue", "in"}}`
#[derive(Debug, Clone, Default)]
pub struct Reduce {
    args: Map<String, Value>,
}

impl Reduce {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, expr: impl Into<Value>) -> Self {
        self.args.insert("input".into(), expr.into());
        self
    }

    pub fn initial_value(mut self, value: impl Into<Value>) -> Self {
        self.args.insert("initialValue".into(), value.into());
        self
    }

    pub fn apply(mut self, expr: impl Into<Value>) -> Self {
        self.args.insert("in".into(), expr.into());
        self
    }

    pub fn build(self) -> Value {
        json!({"$reduce": self.args})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cond_defaults_to_null_branches() {
        assert_eq!(
            Cond::new().when(json!({"$gt": ["$qty", 100]})).then("bulk").build(),
            json!({"$cond": {"if": {"$gt": ["$qty", 100]}, "then": "bulk", "else": null}})
        );
    }

    #[test]
    fn map_and_filter() {
        assert_eq!(
            MapExpr::new()
                .input("$items")
                .as_var("item")
                .apply(json!({"$multiply": ["$$item.price", 2]}))
                .build(),
            json!({"$map": {"input": "$items", "as": "item", "in": {"$multiply": ["$$item.price", 2]}}})
        );
        assert_eq!(
            FilterExpr::new()
                .input("$items")
                .as_var("item")
                .cond(json!({"$gte": ["$$item.qty", 1]}))
                .build(),
            json!({"$filter": {"input": "$items", "as": "item", "cond": {"$gte": ["$$item.qty", 1]}}})
        );
    }

    #[test]
    fn switch_branches_in_order() {
        let expr = Switch::new()
            .branch(json!({"$lt": ["$age", 18]}), "minor")
            .branch(json!({"$lt": ["$age", 65]}), "adult")
            .default("senior")
            .build();
        assert_eq!(
            expr,
            json!({"$switch": {
                "branches": [
                    {"case": {"$lt": ["$age", 18]}, "then": "minor"},
                    {"case": {"$lt": ["$age", 65]}, "then": "adult"}
                ],
                "default": "senior"
            }})
        );
        assert_eq!(
            Switch::new().build(),
            json!({"$switch": {"branches": [], "default": null}})
        );
    }

    #[test]
    fn reduce() {
        assert_eq!(
            Reduce::new()
                .input("$scores")
                .initial_value(0)
                .apply(json!({"$add": ["$$value", "$$this"]}))
                .build(),
            json!({"$reduce": {"input": "$scores", "initialValue": 0, "in": {"$add": ["$$value", "$$this"]}}})
        );
    }

    #[test]
    fn operators_nest_inside_builders() {
        let body = crate::builders::ProjectBuilder::new()
            .add("band", Switch::new().branch(true, "all"))
            .build();
        assert_eq!(body["band"]["$switch"]["branches"][0]["then"], json!("all"));
    }
}
