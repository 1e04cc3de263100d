//! Cell values as they move between drivers, the edit engine and the wire.

use serde_json::Value;
use thiserror::Error;

/// A single database value. Drivers decode into this and bind from it.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// Column type family, derived from a declared type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Integer,
    Real,
    Numeric,
    Boolean,
    Text,
    Blob,
}

impl Affinity {
    /// Classify a declared type the way SQLite does, with BOOL split out.
    pub fn of(data_type: &str) -> Affinity {
        let t = data_type.to_ascii_uppercase();
        if t.contains("BOOL") {
            Affinity::Boolean
        } else if t.contains("INT") || t.contains("SERIAL") {
            Affinity::Integer
        } else if t.contains("CHAR") || t.contains("CLOB") || t.contains("TEXT") {
            Affinity::Text
        } else if t.contains("BLOB") || t.contains("BYTEA") || t.contains("BINARY") || t.is_empty() {
            Affinity::Blob
        } else if t.contains("REAL") || t.contains("FLOA") || t.contains("DOUB") {
            Affinity::Real
        } else {
            Affinity::Numeric
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("cannot convert '{input}' to {data_type}")]
pub struct ValueError {
    pub input: String,
    pub data_type: String,
}

impl DbValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DbValue::Null)
    }

    /// Text shown in grids. NULL renders as `NULL`, blobs as `0x..` hex.
    pub fn display(&self) -> String {
        match self {
            DbValue::Null => "NULL".to_string(),
            DbValue::Bool(b) => b.to_string(),
            DbValue::Integer(i) => i.to_string(),
            DbValue::Real(f) => f.to_string(),
            DbValue::Text(s) => s.clone(),
            DbValue::Blob(bytes) => {
                let mut out = String::with_capacity(2 + bytes.len() * 2);
                out.push_str("0x");
                for b in bytes {
                    out.push_str(&format!("{:02X}", b));
                }
                out
            }
        }
    }

    /// Name of the value's storage class, used when a driver reports no
    /// declared type for a result column.
    pub fn type_name(&self) -> &'static str {
        match self {
            DbValue::Null => "NULL",
            DbValue::Bool(_) => "BOOLEAN",
            DbValue::Integer(_) => "INTEGER",
            DbValue::Real(_) => "REAL",
            DbValue::Text(_) => "TEXT",
            DbValue::Blob(_) => "BLOB",
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            DbValue::Null => Value::Null,
            DbValue::Bool(b) => Value::Bool(*b),
            DbValue::Integer(i) => Value::from(*i),
            DbValue::Real(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            DbValue::Text(s) => Value::String(s.clone()),
            DbValue::Blob(_) => Value::String(self.display()),
        }
    }

    /// Convert client input for a column of `data_type`.
    ///
    /// JSON `null` is SQL NULL. Strings are parsed according to the column
    /// affinity; JSON numbers and booleans are taken as-is.
    pub fn coerce(input: &Value, data_type: &str) -> Result<DbValue, ValueError> {
        let fail = || ValueError {
            input: match input {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            data_type: data_type.to_string(),
        };

        match input {
            Value::Null => Ok(DbValue::Null),
            Value::Bool(b) => Ok(DbValue::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(DbValue::Integer(i))
                } else {
                    n.as_f64().map(DbValue::Real).ok_or_else(fail)
                }
            }
            Value::String(s) => match Affinity::of(data_type) {
                Affinity::Text | Affinity::Blob => Ok(DbValue::Text(s.clone())),
                Affinity::Integer => s.trim().parse::<i64>().map(DbValue::Integer).map_err(|_| fail()),
                Affinity::Real => s.trim().parse::<f64>().map(DbValue::Real).map_err(|_| fail()),
                Affinity::Boolean => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "t" | "yes" => Ok(DbValue::Bool(true)),
                    "false" | "0" | "f" | "no" => Ok(DbValue::Bool(false)),
                    _ => Err(fail()),
                },
                Affinity::Numeric => {
                    let t = s.trim();
                    if let Ok(i) = t.parse::<i64>() {
                        Ok(DbValue::Integer(i))
                    } else if let Ok(f) = t.parse::<f64>() {
                        Ok(DbValue::Real(f))
                    } else {
                        Ok(DbValue::Text(s.clone()))
                    }
                }
            },
            Value::Array(_) | Value::Object(_) => Ok(DbValue::Text(input.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_affinity_classification() {
        assert_eq!(Affinity::of("INTEGER"), Affinity::Integer);
        assert_eq!(Affinity::of("bigint"), Affinity::Integer);
        assert_eq!(Affinity::of("VARCHAR(20)"), Affinity::Text);
        assert_eq!(Affinity::of("double precision"), Affinity::Real);
        assert_eq!(Affinity::of("boolean"), Affinity::Boolean);
        assert_eq!(Affinity::of(""), Affinity::Blob);
        assert_eq!(Affinity::of("DECIMAL(10,2)"), Affinity::Numeric);
    }

    #[test]
    fn test_coerce_by_column_type() {
        assert_eq!(DbValue::coerce(&json!("42"), "INTEGER").unwrap(), DbValue::Integer(42));
        assert_eq!(DbValue::coerce(&json!("4.5"), "REAL").unwrap(), DbValue::Real(4.5));
        assert_eq!(DbValue::coerce(&json!("42"), "TEXT").unwrap(), DbValue::Text("42".into()));
        assert_eq!(DbValue::coerce(&json!(null), "TEXT").unwrap(), DbValue::Null);
        assert_eq!(DbValue::coerce(&json!("yes"), "BOOLEAN").unwrap(), DbValue::Bool(true));
        assert_eq!(DbValue::coerce(&json!("abc"), "NUMERIC").unwrap(), DbValue::Text("abc".into()));
    }

    #[test]
    fn test_coerce_rejects_bad_integer() {
        let err = DbValue::coerce(&json!("forty"), "INTEGER").unwrap_err();
        assert_eq!(err.input, "forty");
        assert_eq!(err.data_type, "INTEGER");
    }

    #[test]
    fn test_display() {
        assert_eq!(DbValue::Null.display(), "NULL");
        assert_eq!(DbValue::Blob(vec![0xde, 0xad]).display(), "0xDEAD");
        assert_eq!(DbValue::Real(1.5).display(), "1.5");
    }
}
