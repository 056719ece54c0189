use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Field name -> value mapping carried by a row.
pub type Payload = Map<String, Value>;

/// System property names that never live inside a payload.
pub const SYSTEM_PROPERTIES: [&str; 4] = ["id", "version", "updatedAt", "deleted"];

/// Opaque optimistic-concurrency token issued by the server.
///
/// Only ever compared for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One record of a synchronized table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    #[serde(flatten)]
    pub fields: Payload,
}

impl Row {
    pub fn new(id: impl Into<String>, fields: Payload) -> Self {
        Self {
            id: id.into(),
            version: None,
            fields,
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// True once the server has confirmed this row at least once.
    pub fn is_synced(&self) -> bool {
        self.version.is_some()
    }

    /// Wire representation sent to the remote service: payload plus `id`.
    pub fn to_wire(&self) -> Value {
        let mut object = self.fields.clone();
        object.insert("id".to_string(), Value::String(self.id.clone()));
        Value::Object(object)
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let version = self.version.as_ref().map(Version::as_str).unwrap_or("-");
        write!(
            f,
            "[id={}, version={}, fields={}]",
            self.id,
            version,
            Value::Object(self.fields.clone())
        )
    }
}

/// A row as the remote service reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRow {
    pub row: Row,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted: bool,
}

impl RemoteRow {
    pub fn new(row: Row, updated_at: DateTime<Utc>) -> Self {
        Self {
            row,
            updated_at: Some(updated_at),
            deleted: false,
        }
    }

    /// Splits the system properties out of a wire object.
    pub fn from_wire(value: Value) -> Result<Self, WireError> {
        let Value::Object(mut object) = value else {
            return Err(WireError::NotAnObject);
        };

        let id = match object.remove("id") {
            Some(Value::String(id)) if !id.is_empty() => id,
            _ => return Err(WireError::MissingId),
        };
        let version = match object.remove("version") {
            Some(Value::String(token)) => Some(Version::new(token)),
            Some(Value::Null) | None => None,
            Some(_) => return Err(WireError::InvalidProperty("version")),
        };
        let updated_at = match object.remove("updatedAt") {
            Some(Value::String(ts)) => Some(
                DateTime::parse_from_rfc3339(&ts)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|_| WireError::InvalidProperty("updatedAt"))?,
            ),
            Some(Value::Null) | None => None,
            Some(_) => return Err(WireError::InvalidProperty("updatedAt")),
        };
        let deleted = match object.remove("deleted") {
            Some(Value::Bool(flag)) => flag,
            Some(Value::Null) | None => false,
            Some(_) => return Err(WireError::InvalidProperty("deleted")),
        };

        Ok(Self {
            row: Row {
                id,
                version,
                fields: object,
            },
            updated_at,
            deleted,
        })
    }

    /// Full wire object including system properties.
    pub fn to_wire(&self) -> Value {
        let mut object = self.row.fields.clone();
        object.insert("id".to_string(), Value::String(self.row.id.clone()));
        if let Some(version) = &self.row.version {
            object.insert("version".to_string(), Value::String(version.to_string()));
        }
        if let Some(updated_at) = &self.updated_at {
            object.insert("updatedAt".to_string(), Value::String(updated_at.to_rfc3339()));
        }
        object.insert("deleted".to_string(), Value::Bool(self.deleted));
        Value::Object(object)
    }
}

/// Errors decoding a row from its wire form.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WireError {
    #[error("row is not a JSON object")]
    NotAnObject,
    #[error("row has no string id")]
    MissingId,
    #[error("row has an invalid '{0}' property")]
    InvalidProperty(&'static str),
}

/// Removes system properties from a user supplied payload.
pub fn strip_system_properties(fields: &mut Payload) {
    for name in SYSTEM_PROPERTIES {
        fields.remove(name);
    }
}
