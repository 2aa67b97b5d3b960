use std::collections::BTreeMap;
use std::fmt::Display;

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PsPrimitiveValue {
    Nil,
    Str(String),
    Bool(bool),
    I32(i32),
    I64(i64),
    Guid(Uuid),
}

impl Display for PsPrimitiveValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nil => write!(f, "$null"),
            Self::Str(s) => write!(f, "{s}"),
            Self::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            Self::I32(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::Guid(g) => write!(f, "{g}"),
        }
    }
}

impl From<String> for PsPrimitiveValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&str> for PsPrimitiveValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<bool> for PsPrimitiveValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for PsPrimitiveValue {
    fn from(value: i32) -> Self {
        Self::I32(value)
    }
}

impl From<i64> for PsPrimitiveValue {
    fn from(value: i64) -> Self {
        Self::I64(value)
    }
}

impl From<Uuid> for PsPrimitiveValue {
    fn from(value: Uuid) -> Self {
        Self::Guid(value)
    }
}

/// A property bag returned by the engine (PSObject/hashtable shaped)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PsObject {
    pub type_names: Vec<String>,
    pub to_string: Option<String>,
    pub properties: BTreeMap<String, PsValue>,
}

impl PsObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<PsValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Property lookup, case-insensitive like the engine's member resolution.
    pub fn property(&self, name: &str) -> Option<&PsValue> {
        self.properties.get(name).or_else(|| {
            self.properties
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        })
    }
}

impl Display for PsObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(to_string) = &self.to_string {
            return write!(f, "{to_string}");
        }
        match self.type_names.first() {
            Some(type_name) => write!(f, "{type_name}"),
            None => write!(f, "System.Management.Automation.PSCustomObject"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PsValue {
    Primitive(PsPrimitiveValue),
    Object(PsObject),
}

impl<IntoPrimitive> From<IntoPrimitive> for PsValue
where
    IntoPrimitive: Into<PsPrimitiveValue>,
{
    fn from(p: IntoPrimitive) -> Self {
        Self::Primitive(p.into())
    }
}

impl From<PsObject> for PsValue {
    fn from(value: PsObject) -> Self {
        Self::Object(value)
    }
}

impl Display for PsValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primitive(p) => p.fmt(f),
            Self::Object(o) => o.fmt(f),
        }
    }
}

impl PsValue {
    pub const NULL: Self = Self::Primitive(PsPrimitiveValue::Nil);

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Primitive(PsPrimitiveValue::Nil))
    }

    pub fn as_object(&self) -> Option<&PsObject> {
        if let Self::Object(obj) = self {
            Some(obj)
        } else {
            None
        }
    }

    /// Extract i32 value, narrowing an i64 that fits
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Primitive(PsPrimitiveValue::I32(val)) => Some(*val),
            Self::Primitive(PsPrimitiveValue::I64(val)) => i32::try_from(*val).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Primitive(PsPrimitiveValue::I64(val)) => Some(*val),
            Self::Primitive(PsPrimitiveValue::I32(val)) => Some(i64::from(*val)),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Primitive(PsPrimitiveValue::Bool(val)) => Some(*val),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Primitive(PsPrimitiveValue::Str(val)) => Some(val),
            _ => None,
        }
    }

    pub fn as_guid(&self) -> Option<Uuid> {
        match self {
            Self::Primitive(PsPrimitiveValue::Guid(val)) => Some(*val),
            Self::Primitive(PsPrimitiveValue::Str(val)) => Uuid::parse_str(val).ok(),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("cannot convert {value} to {target}")]
pub struct ConversionError {
    pub value: String,
    pub target: &'static str,
}

impl ConversionError {
    pub fn new(value: &PsValue, target: &'static str) -> Self {
        Self {
            value: value.to_string(),
            target,
        }
    }
}

/// Typed conversion of pipeline output
pub trait FromPsValue: Sized {
    fn from_ps_value(value: PsValue) -> Result<Self, ConversionError>;
}

impl FromPsValue for PsValue {
    fn from_ps_value(value: PsValue) -> Result<Self, ConversionError> {
        Ok(value)
    }
}

impl FromPsValue for String {
    fn from_ps_value(value: PsValue) -> Result<Self, ConversionError> {
        match value {
            PsValue::Primitive(PsPrimitiveValue::Str(s)) => Ok(s),
            PsValue::Primitive(PsPrimitiveValue::Nil) => Err(ConversionError::new(&value, "String")),
            other => Ok(other.to_string()),
        }
    }
}

impl FromPsValue for i32 {
    fn from_ps_value(value: PsValue) -> Result<Self, ConversionError> {
        value.as_i32().ok_or_else(|| ConversionError::new(&value, "Int32"))
    }
}

impl FromPsValue for i64 {
    fn from_ps_value(value: PsValue) -> Result<Self, ConversionError> {
        value.as_i64().ok_or_else(|| ConversionError::new(&value, "Int64"))
    }
}

impl FromPsValue for bool {
    fn from_ps_value(value: PsValue) -> Result<Self, ConversionError> {
        value.as_bool().ok_or_else(|| ConversionError::new(&value, "Boolean"))
    }
}
