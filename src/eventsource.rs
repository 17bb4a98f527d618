//! Event source identity, validation verdicts and resource files

use std::collections::BTreeMap;
use std::path::Path;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// One configured instance of a signal-producing variant
///
/// `value` is the opaque configuration blob; only the listener registered for
/// `source_type` interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSource {
    /// Stable identifier (hash of the name for resource files)
    pub id: String,
    /// Human-readable name, attached to every emitted event
    pub name: String,
    /// Declared listener type, e.g. `file` or `slack`
    #[serde(rename = "type")]
    pub source_type: String,
    /// Resource version the source was declared with
    #[serde(default)]
    pub version: String,
    /// Opaque configuration (base64 on the wire)
    #[serde(with = "base64_bytes")]
    pub value: Bytes,
}

impl EventSource {
    /// Create a source whose id is derived from its name
    pub fn new(
        name: impl Into<String>,
        source_type: impl Into<String>,
        value: impl Into<Bytes>,
    ) -> Self {
        let name = name.into();
        Self {
            id: hash_name(&name),
            name,
            source_type: source_type.into(),
            version: String::new(),
            value: value.into(),
        }
    }

    /// Set the declared version
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

/// Result of validating an event source configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidEventSource {
    /// Whether the configuration is usable
    pub is_valid: bool,
    /// Why it is not (empty when valid)
    #[serde(default)]
    pub reason: String,
}

impl ValidEventSource {
    /// A passing verdict
    #[must_use]
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            reason: String::new(),
        }
    }

    /// A failing verdict with a reason
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            reason: reason.into(),
        }
    }
}

/// Stable id for an event source name (hex SHA-256)
#[must_use]
pub fn hash_name(name: &str) -> String {
    hex::encode(Sha256::digest(name.as_bytes()))
}

/// Event source resource file
///
/// ```yaml
/// metadata:
///   name: webhooks
/// spec:
///   version: v1
///   type: webhook
///   sources:
///     example:
///       webhook: { endpoint: /example, port: 12000, method: POST }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventSourceResource {
    /// Resource metadata
    #[serde(default)]
    pub metadata: ResourceMetadata,
    /// Resource specification
    #[serde(default)]
    pub spec: Option<EventSourceSpec>,
}

/// Resource metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceMetadata {
    /// Resource name
    #[serde(default)]
    pub name: String,
}

/// Resource specification: a set of named sources of one type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventSourceSpec {
    /// Resource version
    #[serde(default)]
    pub version: String,
    /// Listener type shared by every entry
    #[serde(rename = "type")]
    pub source_type: String,
    /// Named entries; each value is that source's configuration
    #[serde(default)]
    pub sources: BTreeMap<String, serde_yaml::Value>,
}

impl EventSourceResource {
    /// Read and parse a resource file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a resource from YAML (or JSON) text
    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Structural checks on the resource itself
    pub fn validate(&self) -> Result<()> {
        let Some(spec) = &self.spec else {
            return Err(Error::InvalidEventSource(
                "event source specification can't be nil".to_string(),
            ));
        };
        if spec.version.is_empty() {
            return Err(Error::InvalidEventSource(
                "event source version can't be empty".to_string(),
            ));
        }
        if spec.source_type.is_empty() {
            return Err(Error::InvalidEventSource(
                "event source type can't be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Split the resource into one [`EventSource`] per entry
    pub fn event_sources(&self) -> Result<Vec<EventSource>> {
        self.validate()?;
        let Some(spec) = &self.spec else {
            return Ok(Vec::new());
        };

        spec.sources
            .iter()
            .map(|(name, value)| {
                let body = serde_yaml::to_string(value)?;
                Ok(EventSource::new(name.clone(), spec.source_type.clone(), body)
                    .with_version(spec.version.clone()))
            })
            .collect()
    }
}

/// Serde adapter that carries raw bytes as standard base64 text
pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize bytes as base64
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    /// Deserialize base64 into bytes
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the text is not valid base64.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(s.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const RESOURCE: &str = r#"
metadata:
  name: files
spec:
  version: v1
  type: file
  sources:
    example:
      directory: /tmp/watch
      path: x.txt
      eventType: CREATE
    logs:
      directory: /var/log
      pathRegexp: '.*\.log$'
      eventType: WRITE
"#;

    #[test]
    fn test_hash_name_is_stable() {
        assert_eq!(hash_name("example"), hash_name("example"));
        assert_ne!(hash_name("example"), hash_name("other"));
        assert_eq!(hash_name("example").len(), 64);
    }

    #[test]
    fn test_resource_split() {
        let resource = EventSourceResource::parse(RESOURCE).unwrap();
        let sources = resource.event_sources().unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].name, "example");
        assert_eq!(sources[0].source_type, "file");
        assert_eq!(sources[0].version, "v1");
        assert_eq!(sources[0].id, hash_name("example"));

        let value: serde_yaml::Value = serde_yaml::from_slice(&sources[0].value).unwrap();
        assert_eq!(value["eventType"], serde_yaml::Value::from("CREATE"));
    }

    #[test]
    fn test_resource_missing_spec() {
        let resource = EventSourceResource::parse("metadata:\n  name: x\n").unwrap();
        let err = resource.validate().unwrap_err();
        assert!(err.to_string().contains("specification can't be nil"));
    }

    #[test]
    fn test_resource_empty_version() {
        let resource =
            EventSourceResource::parse("spec:\n  type: file\n  sources: {}\n").unwrap();
        let err = resource.validate().unwrap_err();
        assert!(err.to_string().contains("version can't be empty"));
    }

    #[test]
    fn test_event_source_wire_format() {
        let source = EventSource::new("hook", "webhook", "endpoint: /x");
        let json = serde_json::to_value(&source).unwrap();
        assert_eq!(json["type"], "webhook");
        assert_eq!(json["value"], "ZW5kcG9pbnQ6IC94");

        let back: EventSource = serde_json::from_value(json).unwrap();
        assert_eq!(back, source);
    }

    #[test]
    fn test_valid_event_source_serialization() {
        let verdict = ValidEventSource::invalid("directory can't be empty");
        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["isValid"], false);
        assert_eq!(json["reason"], "directory can't be empty");
    }
}
