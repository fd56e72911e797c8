//! Versioned payload documents.
//!
//! The payload column holds a free-form JSON object. Business attributes
//! nest inside it, so the only structure the store imposes is a reserved
//! `"_v"` key carrying the schema version. Typed views go through
//! [`PayloadSchema`], which migrates and defaults on read instead of
//! probing for property presence at every call site.

use crate::StorageError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved key holding the schema version inside the stored JSON.
pub const VERSION_KEY: &str = "_v";

/// The payload column of a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Schema version; legacy blobs without `"_v"` read as 0.
    pub schema_version: u32,
    /// All attributes except the version key.
    pub attributes: Map<String, Value>,
}

/// A strongly typed view over a payload.
///
/// `Default` supplies values for attributes missing from older documents.
pub trait PayloadSchema: Serialize + DeserializeOwned + Default {
    /// Current schema version written by [`Payload::set_typed`].
    const VERSION: u32;

    /// Upgrade raw attributes written under `from_version`.
    fn migrate(
        _from_version: u32,
        attributes: Map<String, Value>,
    ) -> Result<Map<String, Value>, StorageError> {
        Ok(attributes)
    }
}

impl Payload {
    pub fn new(schema_version: u32, attributes: Map<String, Value>) -> Self {
        Self {
            schema_version,
            attributes,
        }
    }

    /// Build a payload from a typed schema value.
    pub fn from_typed<T: PayloadSchema>(value: &T) -> Result<Self, StorageError> {
        let mut payload = Self::default();
        payload.set_typed(value)?;
        Ok(payload)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if key != VERSION_KEY {
            self.attributes.insert(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.attributes.remove(key)
    }

    /// Read a typed view, migrating older documents and defaulting
    /// missing attributes.
    pub fn typed<T: PayloadSchema>(&self) -> Result<T, StorageError> {
        if self.schema_version > T::VERSION {
            return Err(StorageError::Payload {
                reason: format!(
                    "payload version {} is newer than supported version {}",
                    self.schema_version,
                    T::VERSION
                ),
            });
        }

        let attributes = if self.schema_version < T::VERSION {
            T::migrate(self.schema_version, self.attributes.clone())?
        } else {
            self.attributes.clone()
        };

        let mut merged = match serde_json::to_value(T::default()) {
            Ok(Value::Object(map)) => map,
            Ok(_) => Map::new(),
            Err(e) => return Err(payload_error(e)),
        };
        merged.extend(attributes);
        serde_json::from_value(Value::Object(merged)).map_err(payload_error)
    }

    /// Write a typed view. Attributes the schema does not know about are
    /// preserved.
    pub fn set_typed<T: PayloadSchema>(&mut self, value: &T) -> Result<(), StorageError> {
        match serde_json::to_value(value).map_err(payload_error)? {
            Value::Object(map) => {
                for (k, v) in map {
                    self.set(k, v);
                }
                self.schema_version = T::VERSION;
                Ok(())
            }
            other => Err(StorageError::Payload {
                reason: format!("schema must serialize to an object, got {}", other),
            }),
        }
    }

    /// Encode for the payload cell.
    pub fn to_json_string(&self) -> String {
        let mut map = self.attributes.clone();
        map.insert(VERSION_KEY.to_string(), Value::from(self.schema_version));
        Value::Object(map).to_string()
    }

    /// Decode the payload cell. Empty cells read as an empty version-0
    /// payload.
    pub fn from_cell(value: &Value) -> Result<Self, StorageError> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::String(s) if s.trim().is_empty() => Ok(Self::default()),
            Value::String(s) => {
                let parsed: Value = serde_json::from_str(s).map_err(payload_error)?;
                Self::from_object(parsed)
            }
            Value::Object(_) => Self::from_object(value.clone()),
            other => Err(StorageError::Payload {
                reason: format!("expected a JSON object, got {}", other),
            }),
        }
    }

    fn from_object(value: Value) -> Result<Self, StorageError> {
        let Value::Object(mut map) = value else {
            return Err(StorageError::Payload {
                reason: "payload is not a JSON object".to_string(),
            });
        };
        let schema_version = match map.remove(VERSION_KEY) {
            None => 0,
            Some(v) => v
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| StorageError::Payload {
                    reason: format!("invalid schema version {}", v),
                })?,
        };
        Ok(Self {
            schema_version,
            attributes: map,
        })
    }
}

fn payload_error(e: serde_json::Error) -> StorageError {
    StorageError::Payload {
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Profile {
        display_name: String,
        score: i64,
        highlighted: bool,
    }

    impl PayloadSchema for Profile {
        const VERSION: u32 = 2;

        fn migrate(
            from_version: u32,
            mut attributes: Map<String, Value>,
        ) -> Result<Map<String, Value>, StorageError> {
            // v0/v1 stored the name under "name".
            if from_version < 2 {
                if let Some(name) = attributes.remove("name") {
                    attributes.insert("display_name".to_string(), name);
                }
            }
            Ok(attributes)
        }
    }

    #[test]
    fn test_legacy_blob_reads_as_version_zero() {
        let payload = Payload::from_cell(&json!(r#"{"name":"Ada"}"#)).unwrap();
        assert_eq!(payload.schema_version, 0);

        let profile: Profile = payload.typed().unwrap();
        assert_eq!(profile.display_name, "Ada");
        assert_eq!(profile.score, 0);
        assert!(!profile.highlighted);
    }

    #[test]
    fn test_set_typed_preserves_unknown_attributes() {
        let mut payload = Payload::from_cell(&json!(r#"{"legacy_flag":true}"#)).unwrap();
        payload
            .set_typed(&Profile {
                display_name: "Ada".to_string(),
                score: 3,
                highlighted: true,
            })
            .unwrap();

        assert_eq!(payload.schema_version, 2);
        assert_eq!(payload.get("legacy_flag"), Some(&json!(true)));

        let reread = Payload::from_cell(&json!(payload.to_json_string())).unwrap();
        assert_eq!(reread, payload);
    }

    #[test]
    fn test_newer_version_is_rejected() {
        let payload = Payload::from_cell(&json!(r#"{"_v":7}"#)).unwrap();
        assert!(payload.typed::<Profile>().is_err());
    }

    #[test]
    fn test_version_key_cannot_be_set_directly() {
        let mut payload = Payload::default();
        payload.set(VERSION_KEY, json!(99));
        assert!(payload.get(VERSION_KEY).is_none());
        assert_eq!(payload.schema_version, 0);
    }

    #[test]
    fn test_non_object_cell_fails() {
        assert!(Payload::from_cell(&json!("[1,2]")).is_err());
        assert!(Payload::from_cell(&json!(5)).is_err());
        assert_eq!(Payload::from_cell(&json!("")).unwrap(), Payload::default());
    }
}
