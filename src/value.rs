//! Typed field values and the canonical string codec.
//!
//! Every column value has exactly one canonical string form — the form the
//! engine binds into SQL statements, stores in `dbData` snapshots and hashes
//! into search keys. Dirty detection therefore reduces to string equality:
//! encoding is deterministic, and decoding a stored value and re-encoding it
//! yields the identical string.
//!
//! NULL handling follows the column tags: nullable columns collapse their
//! type zero to SQL NULL (`None`), required columns keep an explicit empty
//! form. The table of forms lives next to each `match` arm below.

use chrono::{NaiveDate, NaiveDateTime};
use indexmap::IndexMap;
use serde_json::Value as Json;

use crate::error::{EngineError, Result};

/// Logical column type. Drives both the MySQL column shape and the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnKind {
    /// Unsigned integer; `bits` one of 8, 16, 24 (mediumint), 32, 64.
    Uint { bits: u8 },
    /// Signed integer; `bits` one of 8, 16, 24, 32, 64.
    Int { bits: u8 },
    /// MySQL `year(4)`; zero encodes as `0000`.
    Year,
    Bool,
    /// `varchar(length)`, or `mediumtext` when `length` is `None` (max).
    String { length: Option<u16> },
    /// Enum column backed by a registered enumeration.
    Enum { enum_id: String },
    /// Set column backed by a registered enumeration; value is a string list.
    Set { enum_id: String },
    /// Comma-joined `varchar` list.
    StringList,
    /// `blob`; empty collapses to NULL.
    Bytes,
    /// `float`/`double`, or `decimal(p,s)` when `decimal` is set.
    Float { double: bool, decimal: Option<(u8, u8)>, unsigned: bool },
    Date,
    DateTime,
    /// JSON-encoded opaque payload stored as `mediumtext`.
    Json,
    /// Foreign ID referencing another registered entity; 0 is NULL.
    Ref { target: String },
}

/// A reference column value.
///
/// References between entity instances are by ID. `Unsaved(i)` names the
/// entity at position `i` of the current flush batch; the flush planner
/// persists that entity first and patches the reference to `Id` before
/// binding, so `Unsaved` never reaches SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefValue {
    Null,
    Id(u64),
    Unsaved(usize),
}

impl RefValue {
    pub fn id(self) -> u64 {
        match self {
            RefValue::Id(id) => id,
            _ => 0,
        }
    }
}

/// Runtime value of a single entity field.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Uint(u64),
    Int(i64),
    Bool(bool),
    Float(f64),
    String(String),
    StringList(Vec<String>),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Json(Json),
    Ref(RefValue),
}

/// The engine's zero instant: year 1, January 1st.
pub fn zero_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1, 1, 1).expect("static date")
}

pub fn zero_datetime() -> NaiveDateTime {
    zero_date().and_hms_opt(0, 0, 0).expect("static datetime")
}

impl Value {
    /// The zero value for a column kind, used for fresh entities and for
    /// decoding NULL.
    pub fn zero(kind: &ColumnKind) -> Value {
        match kind {
            ColumnKind::Uint { .. } | ColumnKind::Year => Value::Uint(0),
            ColumnKind::Int { .. } => Value::Int(0),
            ColumnKind::Bool => Value::Bool(false),
            ColumnKind::Float { .. } => Value::Float(0.0),
            ColumnKind::String { .. } | ColumnKind::Enum { .. } => Value::String(String::new()),
            ColumnKind::Set { .. } | ColumnKind::StringList => Value::StringList(Vec::new()),
            ColumnKind::Bytes => Value::Bytes(Vec::new()),
            ColumnKind::Date => Value::Date(zero_date()),
            ColumnKind::DateTime => Value::DateTime(zero_datetime()),
            ColumnKind::Json => Value::Json(Json::Null),
            ColumnKind::Ref { .. } => Value::Ref(RefValue::Null),
        }
    }

    /// Canonical string form for a SQL parameter outside of any column
    /// context (search arguments, `Where` parameters).
    pub fn to_sql_param(&self) -> Option<String> {
        match self {
            Value::Uint(v) => Some(v.to_string()),
            Value::Int(v) => Some(v.to_string()),
            Value::Bool(v) => Some(if *v { "1" } else { "0" }.to_string()),
            Value::Float(v) => Some(format_float(*v, false)),
            Value::String(v) => Some(v.clone()),
            Value::StringList(v) => Some(v.join(",")),
            Value::Bytes(v) => Some(String::from_utf8_lossy(v).into_owned()),
            Value::Date(v) => Some(v.format("%Y-%m-%d").to_string()),
            Value::DateTime(v) => Some(v.format("%Y-%m-%d %H:%M:%S").to_string()),
            Value::Json(v) => Some(if v.is_null() { String::new() } else { v.to_string() }),
            Value::Ref(r) => match r.id() {
                0 => None,
                id => Some(id.to_string()),
            },
        }
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

/// A single column descriptor: name, logical type and raw tags.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    pub tags: IndexMap<String, String>,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self { name: name.into(), kind, tags: IndexMap::new() }
    }

    /// Attach a `key=value` tag. Valueless tags (`required`, `ignore`,
    /// `cascade`, ...) use `"true"`.
    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn required(self) -> Self {
        self.tag("required", "true")
    }

    pub fn is_required(&self) -> bool {
        self.tags.get("required").map(String::as_str) == Some("true")
    }

    pub fn is_ignored(&self) -> bool {
        self.tags.contains_key("ignore")
    }

    /// Dirty-queue sinks this column fans out to (`dirty=a,b` tag).
    pub fn dirty_sinks(&self) -> Vec<&str> {
        match self.tags.get("dirty") {
            Some(v) => v.split(',').filter(|s| !s.is_empty()).collect(),
            None => Vec::new(),
        }
    }
}

/// Shortest round-trip float form; `f32` values are narrowed first so the
/// encoder and the dirty comparator agree on the same digits.
fn format_float(v: f64, single: bool) -> String {
    if single {
        format!("{}", v as f32)
    } else {
        format!("{}", v)
    }
}

/// Encode a field into its canonical column form.
///
/// `row_id` is only consulted for the synthetic `FakeDelete` column, whose
/// truthy form is the row ID (so unique indexes including `FakeDelete` keep
/// excluding soft-deleted rows from uniqueness).
pub fn encode(column: &Column, value: &Value, row_id: u64) -> Result<Option<String>> {
    let required = column.is_required();
    let encoded = match (&column.kind, value) {
        (ColumnKind::Year, Value::Uint(v)) => {
            if *v == 0 && !required {
                None
            } else {
                Some(format!("{:04}", v))
            }
        }
        (ColumnKind::Uint { .. }, Value::Uint(v)) => Some(v.to_string()),
        (ColumnKind::Int { .. }, Value::Int(v)) => Some(v.to_string()),
        (ColumnKind::Bool, Value::Bool(v)) => {
            if column.name == "FakeDelete" {
                Some(if *v { row_id.to_string() } else { "0".to_string() })
            } else {
                Some(if *v { "1" } else { "0" }.to_string())
            }
        }
        (ColumnKind::Float { double, decimal, .. }, Value::Float(v)) => match decimal {
            Some((_, scale)) => Some(format!("{:.*}", *scale as usize, v)),
            None => Some(format_float(*v, !double)),
        },
        (ColumnKind::String { .. } | ColumnKind::Enum { .. }, Value::String(v)) => {
            if v.is_empty() {
                if required {
                    Some(String::new())
                } else {
                    None
                }
            } else {
                Some(v.clone())
            }
        }
        (ColumnKind::StringList | ColumnKind::Set { .. }, Value::StringList(v)) => {
            Some(v.join(","))
        }
        (ColumnKind::Bytes, Value::Bytes(v)) => {
            if v.is_empty() {
                None
            } else {
                Some(String::from_utf8_lossy(v).into_owned())
            }
        }
        (ColumnKind::Date, Value::Date(v)) => {
            if *v == zero_date() && !required {
                None
            } else {
                Some(v.format("%Y-%m-%d").to_string())
            }
        }
        (ColumnKind::DateTime, Value::DateTime(v)) => {
            if *v == zero_datetime() && !required {
                None
            } else {
                Some(v.format("%Y-%m-%d %H:%M:%S").to_string())
            }
        }
        (ColumnKind::Json, Value::Json(v)) => Some(if v.is_null() {
            String::new()
        } else {
            serde_json::to_string(v)?
        }),
        (ColumnKind::Ref { .. }, Value::Ref(r)) => match r.id() {
            0 => None,
            id => Some(id.to_string()),
        },
        (kind, value) => {
            return Err(EngineError::NotSupported(format!(
                "value {:?} does not match column '{}' of kind {:?}",
                value, column.name, kind
            )))
        }
    };
    Ok(encoded)
}

/// Decode a raw column string back into a typed value. NULL and the empty
/// string decode to the type zero.
pub fn decode(column: &Column, raw: Option<&str>) -> Result<Value> {
    let raw = match raw {
        None | Some("") => return Ok(Value::zero(&column.kind)),
        Some(r) => r,
    };
    let value = match &column.kind {
        ColumnKind::Uint { .. } | ColumnKind::Year => {
            Value::Uint(raw.parse().unwrap_or_default())
        }
        ColumnKind::Int { .. } => Value::Int(raw.parse().unwrap_or_default()),
        ColumnKind::Bool => {
            if column.name == "FakeDelete" {
                Value::Bool(raw != "0")
            } else {
                Value::Bool(raw == "1")
            }
        }
        ColumnKind::Float { .. } => Value::Float(raw.parse().unwrap_or_default()),
        ColumnKind::String { .. } | ColumnKind::Enum { .. } => Value::String(raw.to_string()),
        ColumnKind::StringList | ColumnKind::Set { .. } => {
            Value::StringList(raw.split(',').map(str::to_string).collect())
        }
        ColumnKind::Bytes => Value::Bytes(raw.as_bytes().to_vec()),
        ColumnKind::Date => Value::Date(
            NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap_or_else(|_| zero_date()),
        ),
        ColumnKind::DateTime => Value::DateTime(
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .unwrap_or_else(|_| zero_datetime()),
        ),
        ColumnKind::Json => Value::Json(serde_json::from_str(raw)?),
        ColumnKind::Ref { .. } => match raw.parse::<u64>().unwrap_or_default() {
            0 => Value::Ref(RefValue::Null),
            id => Value::Ref(RefValue::Id(id)),
        },
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn col(kind: ColumnKind) -> Column {
        Column::new("Field", kind)
    }

    fn roundtrip(column: &Column, value: Value) {
        let encoded = encode(column, &value, 0).unwrap();
        let decoded = decode(column, encoded.as_deref()).unwrap();
        assert_eq!(decoded, value, "roundtrip failed for {:?}", column.kind);
    }

    #[test]
    fn test_integer_roundtrips() {
        roundtrip(&col(ColumnKind::Uint { bits: 64 }), Value::Uint(18_446_744_073_709_551_615));
        roundtrip(&col(ColumnKind::Uint { bits: 8 }), Value::Uint(255));
        roundtrip(&col(ColumnKind::Int { bits: 32 }), Value::Int(-2_147_483_648));
        roundtrip(&col(ColumnKind::Int { bits: 64 }), Value::Int(42));
    }

    #[test]
    fn test_bool_forms() {
        let c = col(ColumnKind::Bool);
        assert_eq!(encode(&c, &Value::Bool(true), 0).unwrap().as_deref(), Some("1"));
        assert_eq!(encode(&c, &Value::Bool(false), 0).unwrap().as_deref(), Some("0"));
    }

    #[test]
    fn test_fake_delete_encodes_row_id() {
        let c = Column::new("FakeDelete", ColumnKind::Bool);
        assert_eq!(encode(&c, &Value::Bool(true), 7).unwrap().as_deref(), Some("7"));
        assert_eq!(encode(&c, &Value::Bool(false), 7).unwrap().as_deref(), Some("0"));
        assert_eq!(decode(&c, Some("7")).unwrap(), Value::Bool(true));
        assert_eq!(decode(&c, Some("0")).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_string_null_collapse() {
        let nullable = col(ColumnKind::String { length: Some(255) });
        assert_eq!(encode(&nullable, &Value::String(String::new()), 0).unwrap(), None);
        let required = nullable.clone().required();
        assert_eq!(
            encode(&required, &Value::String(String::new()), 0).unwrap().as_deref(),
            Some("")
        );
        roundtrip(&nullable, Value::String("hello".to_string()));
    }

    #[test]
    fn test_year_forms() {
        let c = col(ColumnKind::Year);
        assert_eq!(encode(&c, &Value::Uint(1982), 0).unwrap().as_deref(), Some("1982"));
        assert_eq!(encode(&c, &Value::Uint(0), 0).unwrap(), None);
        let required = c.required();
        assert_eq!(encode(&required, &Value::Uint(0), 0).unwrap().as_deref(), Some("0000"));
        assert_eq!(decode(&required, Some("0000")).unwrap(), Value::Uint(0));
    }

    #[test]
    fn test_date_and_datetime() {
        let date = NaiveDate::from_ymd_opt(1982, 4, 6).unwrap();
        roundtrip(&col(ColumnKind::Date), Value::Date(date));
        let dt = date.and_hms_opt(12, 34, 11).unwrap();
        roundtrip(&col(ColumnKind::DateTime), Value::DateTime(dt));

        // zero instant on a nullable column is NULL-equivalent
        assert_eq!(encode(&col(ColumnKind::Date), &Value::Date(zero_date()), 0).unwrap(), None);
        assert_eq!(
            encode(&col(ColumnKind::Date).required(), &Value::Date(zero_date()), 0)
                .unwrap()
                .as_deref(),
            Some("0001-01-01")
        );
    }

    #[test]
    fn test_float_forms() {
        let single = col(ColumnKind::Float { double: false, decimal: None, unsigned: true });
        assert_eq!(encode(&single, &Value::Float(1.11), 0).unwrap().as_deref(), Some("1.11"));

        let decimal = col(ColumnKind::Float { double: true, decimal: Some((8, 2)), unsigned: true });
        assert_eq!(encode(&decimal, &Value::Float(123.1), 0).unwrap().as_deref(), Some("123.10"));

        // the comparator and the encoder share one formatter: re-encoding a
        // decoded value yields the same string
        let raw = encode(&single, &Value::Float(7.002), 0).unwrap();
        let decoded = decode(&single, raw.as_deref()).unwrap();
        assert_eq!(encode(&single, &decoded, 0).unwrap(), raw);
    }

    #[test]
    fn test_reference_zero_is_null() {
        let c = col(ColumnKind::Ref { target: "Other".to_string() });
        assert_eq!(encode(&c, &Value::Ref(RefValue::Null), 0).unwrap(), None);
        assert_eq!(encode(&c, &Value::Ref(RefValue::Id(0)), 0).unwrap(), None);
        assert_eq!(encode(&c, &Value::Ref(RefValue::Id(12)), 0).unwrap().as_deref(), Some("12"));
        assert_eq!(decode(&c, Some("12")).unwrap(), Value::Ref(RefValue::Id(12)));
        assert_eq!(decode(&c, None).unwrap(), Value::Ref(RefValue::Null));
    }

    #[test]
    fn test_json_and_lists() {
        let j = col(ColumnKind::Json);
        assert_eq!(encode(&j, &Value::Json(Json::Null), 0).unwrap().as_deref(), Some(""));
        roundtrip(&j, Value::Json(json!({"name": "John"})));

        let list = col(ColumnKind::StringList);
        assert_eq!(
            encode(&list, &Value::StringList(vec!["a".into(), "b".into()]), 0)
                .unwrap()
                .as_deref(),
            Some("a,b")
        );
        roundtrip(&list, Value::StringList(vec!["x".into(), "y".into()]));
    }

    #[test]
    fn test_bytes_empty_is_null() {
        let c = col(ColumnKind::Bytes);
        assert_eq!(encode(&c, &Value::Bytes(Vec::new()), 0).unwrap(), None);
        roundtrip(&c, Value::Bytes(b"blob".to_vec()));
    }

    #[test]
    fn test_decode_null_is_type_zero() {
        assert_eq!(decode(&col(ColumnKind::Uint { bits: 32 }), None).unwrap(), Value::Uint(0));
        assert_eq!(
            decode(&col(ColumnKind::String { length: None }), None).unwrap(),
            Value::String(String::new())
        );
        assert_eq!(decode(&col(ColumnKind::Date), None).unwrap(), Value::Date(zero_date()));
    }

    #[test]
    fn test_kind_mismatch_is_an_error() {
        let c = col(ColumnKind::Uint { bits: 32 });
        assert!(encode(&c, &Value::String("x".into()), 0).is_err());
    }
}
