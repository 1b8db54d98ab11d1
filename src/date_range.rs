use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::value::parse_datetime;

fn default_inclusive() -> bool {
    true
}

/// Accepts every form [`parse_datetime`] does; `null` and `""` are absent.
fn deserialize_bound<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => parse_datetime(s.trim())
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid date: {s}"))),
    }
}

/// A `$match` constraint bounding one date field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub field: String,
    #[serde(default, deserialize_with = "deserialize_bound")]
    pub from: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_bound")]
    pub to: Option<DateTime<Utc>>,
    #[serde(default = "default_inclusive")]
    pub inclusive: bool,
}

impl DateRange {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            from: None,
            to: None,
            inclusive: true,
        }
    }

    /// Build a range from textual bounds. Empty strings count as absent.
    pub fn parse(field: impl Into<String>, from: Option<&str>, to: Option<&str>) -> Result<Self> {
        let bound = |s: Option<&str>| -> Result<Option<DateTime<Utc>>> {
            match s.map(str::trim) {
                None | Some("") => Ok(None),
                Some(s) => parse_datetime(s)
                    .map(Some)
                    .ok_or_else(|| Error::InvalidDate(s.to_string())),
            }
        };
        Ok(Self {
            from: bound(from)?,
            to: bound(to)?,
            ..Self::new(field)
        })
    }

    pub fn with_from(mut self, from: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self
    }

    pub fn with_to(mut self, to: DateTime<Utc>) -> Self {
        self.to = Some(to);
        self
    }

    pub fn inclusive(mut self, inclusive: bool) -> Self {
        self.inclusive = inclusive;
        self
    }

    /// The `{field: {$gte/$gt: from, $lte/$lt: to}}` body, or `None` when
    /// neither bound is set.
    pub fn to_filter(&self) -> Option<Value> {
        let mut range = Map::new();
        if let Some(from) = self.from {
            let op = if self.inclusive { "$gte" } else { "$gt" };
            range.insert(op.to_string(), Value::String(format_datetime(from)));
        }
        if let Some(to) = self.to {
            let op = if self.inclusive { "$lte" } else { "$lt" };
            range.insert(op.to_string(), Value::String(format_datetime(to)));
        }
        if range.is_empty() {
            return None;
        }
        let mut filter = Map::new();
        filter.insert(self.field.clone(), Value::Object(range));
        Some(Value::Object(filter))
    }
}

/// RFC 3339 with millisecond precision and a `Z` suffix.
pub fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}
