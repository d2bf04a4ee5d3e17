// Records and Record Serialization
//
// The kernel never looks inside a record. It needs a stable identifier
// and a serializer that turns a record into a self-contained textual
// fragment and back.

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier for a record.
///
/// The nil UUID stands for "no record" and is rejected by every
/// repository operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepositoryId(pub Uuid);

impl RepositoryId {
    /// Allocate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for RepositoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An application entity stored in a repository.
pub trait Record: Clone {
    fn id(&self) -> RepositoryId;

    /// Build the default-content record handed out by `create`.
    fn with_id(id: RepositoryId) -> Self;
}

/// Failure to encode or decode a single record fragment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct CodecError(pub String);

/// Converts records to and from record fragments.
///
/// A fragment must describe exactly one record and must be decodable on
/// its own; the kernel stores it verbatim inside canonical and increment
/// documents.
pub trait RecordSerializer<R> {
    fn serialize(&self, record: &R) -> Result<String, CodecError>;

    fn deserialize(&self, fragment: &str) -> Result<R, CodecError>;

    /// Structural check used to explain a failed `deserialize`.
    ///
    /// Returns a diagnostic when the fragment is structurally invalid.
    /// `Ok` means the structure is fine and the decode failure was about
    /// content, in which case the original error is reported.
    fn validate_structure(&self, _fragment: &str) -> Result<(), String> {
        Ok(())
    }
}

/// `serde_json` backed serializer for any serde record type.
pub struct JsonSerializer<R> {
    _record: PhantomData<fn() -> R>,
}

impl<R> JsonSerializer<R> {
    pub fn new() -> Self {
        Self {
            _record: PhantomData,
        }
    }
}

impl<R> Default for JsonSerializer<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> RecordSerializer<R> for JsonSerializer<R>
where
    R: Serialize + DeserializeOwned,
{
    fn serialize(&self, record: &R) -> Result<String, CodecError> {
        serde_json::to_string(record).map_err(|e| CodecError(e.to_string()))
    }

    fn deserialize(&self, fragment: &str) -> Result<R, CodecError> {
        serde_json::from_str(fragment).map_err(|e| CodecError(e.to_string()))
    }

    fn validate_structure(&self, fragment: &str) -> Result<(), String> {
        match serde_json::from_str::<serde_json::Value>(fragment) {
            Ok(serde_json::Value::Object(_)) => Ok(()),
            Ok(other) => Err(format!("expected a JSON object, found {}", kind_of(&other))),
            Err(e) => Err(format!(
                "not well-formed JSON at line {} column {}: {e}",
                e.line(),
                e.column()
            )),
        }
    }
}

fn kind_of(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal dictionary-entry record shared by the kernel's tests.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Entry {
        pub id: RepositoryId,
        #[serde(default)]
        pub lexeme: String,
    }

    impl Record for Entry {
        fn id(&self) -> RepositoryId {
            self.id
        }

        fn with_id(id: RepositoryId) -> Self {
            Self {
                id,
                lexeme: String::new(),
            }
        }
    }

    #[test]
    fn ids_are_unique_and_ordered_consistently() {
        let a = RepositoryId::new();
        let b = RepositoryId::new();

        assert_ne!(a, b);
        assert_eq!(a.cmp(&b) == std::cmp::Ordering::Equal, a == b);
        assert!(RepositoryId::nil().is_nil());
        assert!(!a.is_nil());
    }

    #[test]
    fn json_serializer_round_trips_entry() {
        let serializer = JsonSerializer::<Entry>::new();
        let entry = Entry {
            id: RepositoryId::new(),
            lexeme: "kuna".into(),
        };

        let fragment = serializer.serialize(&entry).unwrap();
        assert_eq!(serializer.deserialize(&fragment).unwrap(), entry);
    }

    #[test]
    fn structure_check_separates_syntax_from_content() {
        let serializer = JsonSerializer::<Entry>::new();

        // Well-formed but missing the id: structure is fine, content is not.
        assert!(serializer.deserialize(r#"{"lexeme":"x"}"#).is_err());
        assert!(serializer.validate_structure(r#"{"lexeme":"x"}"#).is_ok());

        let diagnostic = serializer.validate_structure("{\"lexeme\":").unwrap_err();
        assert!(diagnostic.contains("not well-formed"), "{diagnostic}");

        let diagnostic = serializer.validate_structure("[1, 2]").unwrap_err();
        assert!(diagnostic.contains("an array"), "{diagnostic}");
    }
}
