use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

/// Parse the date forms the engine and the date-range builder understand:
/// RFC 3339, `YYYY-MM-DDTHH:MM:SS`, `YYYY-MM-DD HH:MM:SS` and `YYYY-MM-DD`.
/// Naive forms are read as UTC.
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    // Valid date strings start with YYYY-MM.
    let b = s.as_bytes();
    if b.len() < 10 || !b[..4].iter().all(u8::is_ascii_digit) || b[4] != b'-' {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Comparison key with type-aware ordering:
/// null < bool < number < date < string < composite.
///
/// Date-looking strings become `DateTime` so ISO bounds compare
/// chronologically rather than lexically.
#[derive(Debug, Clone)]
pub enum SortKey {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    DateTime(i64),
    String(String),
    Composite(String),
}

impl SortKey {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => SortKey::Null,
            Value::Bool(b) => SortKey::Boolean(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    SortKey::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    SortKey::Float(f)
                } else {
                    SortKey::Null
                }
            }
            Value::String(s) => match parse_datetime(s) {
                Some(dt) => SortKey::DateTime(dt.timestamp_millis()),
                None => SortKey::String(s.clone()),
            },
            // Arrays and objects compare by their serialized form.
            other => SortKey::Composite(other.to_string()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SortKey::Null => 0,
            SortKey::Boolean(_) => 1,
            SortKey::Integer(_) | SortKey::Float(_) => 2,
            SortKey::DateTime(_) => 3,
            SortKey::String(_) => 4,
            SortKey::Composite(_) => 5,
        }
    }
}

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortKey {}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        use SortKey::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Boolean(a), Boolean(b)) => a.cmp(b),
            (Integer(a), Integer(b)) => a.cmp(b),
            (Integer(a), Float(b)) => (*a as f64).total_cmp(b),
            (Float(a), Integer(b)) => a.total_cmp(&(*b as f64)),
            (Float(a), Float(b)) => a.total_cmp(b),
            (DateTime(a), DateTime(b)) => a.cmp(b),
            (String(a), String(b)) | (Composite(a), Composite(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// Compare two JSON values with [`SortKey`] ordering.
pub fn compare(a: &Value, b: &Value) -> Ordering {
    SortKey::from_json(a).cmp(&SortKey::from_json(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn date_forms() {
        let expected = parse_datetime("2024-01-15T00:00:00Z").unwrap();
        assert_eq!(parse_datetime("2024-01-15"), Some(expected));
        assert_eq!(parse_datetime("2024-01-15T00:00:00"), Some(expected));
        assert_eq!(parse_datetime("2024-01-15 00:00:00"), Some(expected));
        assert_eq!(parse_datetime("2024-01-15T00:00:00.000Z"), Some(expected));
    }

    #[test]
    fn non_dates() {
        assert_eq!(parse_datetime("hello world"), None);
        assert_eq!(parse_datetime("2024"), None);
        assert_eq!(parse_datetime("2024-13-45"), None);
    }

    #[test]
    fn dates_compare_chronologically() {
        // Lexically "2024-01-01T..." < "2024-01-01", chronologically equal.
        assert_eq!(
            compare(&json!("2024-01-01T00:00:00.000Z"), &json!("2024-01-01")),
            Ordering::Equal
        );
        assert_eq!(
            compare(&json!("2024-02-01"), &json!("2024-10-01T00:00:00Z")),
            Ordering::Less
        );
    }

    #[test]
    fn type_ordering() {
        let mut keys = vec![
            SortKey::from_json(&json!("text")),
            SortKey::from_json(&json!("2024-01-01")),
            SortKey::from_json(&json!(3.5)),
            SortKey::from_json(&json!(true)),
            SortKey::from_json(&Value::Null),
            SortKey::from_json(&json!([1])),
        ];
        keys.sort();
        assert_eq!(keys[0], SortKey::Null);
        assert_eq!(keys[1], SortKey::Boolean(true));
        assert_eq!(keys[2], SortKey::Float(3.5));
        assert!(matches!(keys[3], SortKey::DateTime(_)));
        assert_eq!(keys[4], SortKey::String("text".into()));
        assert!(matches!(keys[5], SortKey::Composite(_)));
    }

    #[test]
    fn integer_float_cross_compare() {
        assert_eq!(compare(&json!(2), &json!(2.0)), Ordering::Equal);
        assert_eq!(compare(&json!(2), &json!(2.5)), Ordering::Less);
        assert_eq!(compare(&json!(-5), &json!(3)), Ordering::Less);
    }
}
