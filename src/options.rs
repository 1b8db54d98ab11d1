use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Execution options handed to the engine untouched.
///
/// The named fields cover the common aggregate options; anything else the
/// engine understands goes through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_disk_use: Option<bool>,
    #[serde(default, rename = "maxTimeMS", skip_serializing_if = "Option::is_none")]
    pub max_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collation: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<Value>,
    #[serde(default, rename = "let", skip_serializing_if = "Option::is_none")]
    pub let_vars: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AggregateOptions {
    pub fn from_json(value: &Value) -> Result<Self> {
        Ok(Self::deserialize(value)?)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn allow_disk_use(mut self, allow: bool) -> Self {
        self.allow_disk_use = Some(allow);
        self
    }

    pub fn max_time_ms(mut self, ms: u64) -> Self {
        self.max_time_ms = Some(ms);
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_known_and_extra_keys() {
        let opts = AggregateOptions::from_json(&json!({
            "allowDiskUse": true,
            "maxTimeMS": 500,
            "let": {"minAge": 18},
            "readConcern": {"level": "majority"}
        }))
        .unwrap();

        assert_eq!(opts.allow_disk_use, Some(true));
        assert_eq!(opts.max_time_ms, Some(500));
        assert_eq!(opts.let_vars.unwrap()["minAge"], json!(18));
        assert_eq!(opts.extra["readConcern"], json!({"level": "majority"}));
    }

    #[test]
    fn serializes_only_what_is_set() {
        let opts = AggregateOptions::default().max_time_ms(100).comment("report");
        assert_eq!(opts.to_json(), json!({"maxTimeMS": 100, "comment": "report"}));
        assert_eq!(AggregateOptions::default().to_json(), json!({}));
    }

    #[test]
    fn rejects_wrong_types() {
        assert!(AggregateOptions::from_json(&json!({"allowDiskUse": "yes"})).is_err());
    }
}
