use crate::{Error, Result};
use rusqlite::types::{ToSqlOutput, Value as SqlValue};
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The value disciplines a feature definition may declare. `Ref` values are
/// unit ids; their targets are not constrained to any particular unit type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Int,
    Bool,
    Str,
    Ref,
}

impl ValueType {
    pub fn parse(name: &str) -> Result<ValueType> {
        match name {
            "int" => Ok(ValueType::Int),
            "bool" => Ok(ValueType::Bool),
            "str" => Ok(ValueType::Str),
            "ref" => Ok(ValueType::Ref),
            other => Err(Error::UnknownValueType(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Int => "int",
            ValueType::Bool => "bool",
            ValueType::Str => "str",
            ValueType::Ref => "ref",
        }
    }

    /// Reject values whose runtime shape disagrees with this discipline.
    pub fn check(&self, feature: &str, value: &Value) -> Result<()> {
        let ok = matches!(
            (self, value),
            (ValueType::Str, Value::Str(_))
                | (ValueType::Bool, Value::Bool(_))
                | (ValueType::Int, Value::Int(_))
                | (ValueType::Ref, Value::Int(_))
        );
        if ok {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                feature: feature.to_string(),
                expected: *self,
            })
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A feature value. `Ref` features carry their target unit id as `Int`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The persisted encoding: ints and refs as native integers, booleans as
    /// the single-byte tokens `'1'`/`'0'`, strings as UTF-8 text.
    pub fn to_sql_value(&self) -> SqlValue {
        match self {
            Value::Int(i) => SqlValue::Integer(*i),
            Value::Bool(b) => SqlValue::Text(if *b { "1" } else { "0" }.to_string()),
            Value::Str(s) => SqlValue::Text(s.clone()),
        }
    }

    /// Decode a persisted value under a feature's declared type. Tolerates
    /// both native typed columns and the textual encodings.
    pub fn decode(raw: SqlValue, feature: &str, valuetype: ValueType) -> Result<Option<Value>> {
        let fail = || Error::UndecodableValue {
            feature: feature.to_string(),
            valuetype,
        };
        let text = match raw {
            SqlValue::Null => return Ok(None),
            SqlValue::Integer(i) => {
                return Ok(Some(match valuetype {
                    ValueType::Int | ValueType::Ref => Value::Int(i),
                    ValueType::Bool => Value::Bool(i != 0),
                    ValueType::Str => Value::Str(i.to_string()),
                }))
            }
            SqlValue::Real(r) => {
                return Ok(Some(match valuetype {
                    ValueType::Int | ValueType::Ref => Value::Int(r as i64),
                    ValueType::Bool => Value::Bool(r != 0.0),
                    ValueType::Str => Value::Str(r.to_string()),
                }))
            }
            SqlValue::Text(s) => s,
            SqlValue::Blob(b) => String::from_utf8(b).map_err(|_| fail())?,
        };
        Ok(Some(match valuetype {
            ValueType::Str => Value::Str(text),
            ValueType::Bool => Value::Bool(text != "0"),
            ValueType::Int | ValueType::Ref => {
                Value::Int(text.trim().parse().map_err(|_| fail())?)
            }
        }))
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Int(i) => ToSqlOutput::from(*i),
            Value::Bool(b) => ToSqlOutput::from(if *b { "1" } else { "0" }),
            Value::Str(s) => ToSqlOutput::from(s.as_str()),
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Value {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::Str(s)
    }
}

/// Split a public `tier:feature` name into its stored segments. Exactly one
/// colon is permitted.
pub fn split_feature(name: &str) -> Result<(&str, &str)> {
    match name.split_once(':') {
        Some((tier, feature))
            if !tier.is_empty() && !feature.is_empty() && !feature.contains(':') =>
        {
            Ok((tier, feature))
        }
        _ => Err(Error::InvalidFeature(name.to_string())),
    }
}

pub fn join_feature(tier: &str, feature: &str) -> String {
    format!("{}:{}", tier, feature)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn feature_names_have_exactly_two_segments() {
        assert_eq!(split_feature("UD:upos").unwrap(), ("UD", "upos"));
        assert_eq!(split_feature("UD/FEATS:Number").unwrap(), ("UD/FEATS", "Number"));
        assert!(split_feature("upos").is_err());
        assert!(split_feature("a:b:c").is_err());
        assert!(split_feature(":b").is_err());
    }

    #[test]
    fn booleans_round_trip_through_byte_tokens() {
        let raw = Value::Bool(true).to_sql_value();
        assert_eq!(raw, SqlValue::Text("1".to_string()));
        let back = Value::decode(raw, "meta:active", ValueType::Bool).unwrap();
        assert_eq!(back, Some(Value::Bool(true)));
        let zero = Value::decode(
            SqlValue::Text("0".to_string()),
            "meta:active",
            ValueType::Bool,
        )
        .unwrap();
        assert_eq!(zero, Some(Value::Bool(false)));
    }

    #[test]
    fn integers_decode_from_text_or_native_columns() {
        for raw in [SqlValue::Integer(14), SqlValue::Text("14".to_string())] {
            let v = Value::decode(raw, "meta:index", ValueType::Int).unwrap();
            assert_eq!(v, Some(Value::Int(14)));
        }
    }

    #[test]
    fn type_discipline_rejects_mismatches() {
        assert!(ValueType::Str.check("x:y", &Value::Str("ok".into())).is_ok());
        assert!(ValueType::Str.check("x:y", &Value::Int(1)).is_err());
        assert!(ValueType::Bool.check("x:y", &Value::Int(1)).is_err());
        assert!(ValueType::Ref.check("x:y", &Value::Int(7)).is_ok());
    }
}
