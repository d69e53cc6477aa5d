//! Message schema registry.
//!
//! Maps message names to numeric ids and back. A numeric id combines the
//! protocol unit's id with the message's position in that unit:
//!
//! ```text
//! numeric_id = (protocol_id << 8) | offset
//! ```
//!
//! where `offset` counts the unit's top-level declarations after the leading
//! `Protocol` enum, starting at 0.
//!
//! # Example
//!
//! ```
//! use core_gateway::schema::SchemaRegistry;
//!
//! let registry = SchemaRegistry::builder()
//!     .load("anon.proto", r#"
//!         package SDMS.Anon;
//!         enum Protocol { ID = 1; }
//!         message AckReply {}
//!         message NackReply { required uint32 err_code = 1; optional string err_msg = 2; }
//!     "#)
//!     .unwrap()
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(registry.by_name("NackReply").unwrap().numeric_id(), 0x0101);
//! assert_eq!(registry.by_id(0x0100).unwrap().name(), "AckReply");
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use prost_reflect::{Cardinality, MessageDescriptor};
use serde_json::Value;

use super::payload;
use super::source::{self, SourceSet, TopLevel};
use super::version::SchemaVersion;
use crate::config::SchemaConfig;
use crate::error::{GatewayError, Result};

/// Name of the enum that identifies a protocol unit.
pub const PROTOCOL_ENUM: &str = "Protocol";

/// Value of [`PROTOCOL_ENUM`] that carries the protocol id.
pub const PROTOCOL_ID_VALUE: &str = "ID";

/// A registered message type.
pub struct MessageType {
    name: String,
    protocol_id: u8,
    offset: u8,
    descriptor: MessageDescriptor,
}

impl MessageType {
    /// Simple (unqualified) name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Package-qualified name.
    #[inline]
    pub fn full_name(&self) -> &str {
        self.descriptor.full_name()
    }

    #[inline]
    pub fn protocol_id(&self) -> u8 {
        self.protocol_id
    }

    #[inline]
    pub fn offset(&self) -> u8 {
        self.offset
    }

    /// Combined 16-bit id carried in frame headers.
    #[inline]
    pub fn numeric_id(&self) -> u16 {
        (u16::from(self.protocol_id) << 8) | u16::from(self.offset)
    }

    #[inline]
    pub fn descriptor(&self) -> &MessageDescriptor {
        &self.descriptor
    }

    /// Whether an empty payload is a valid instance of this type.
    pub fn permits_empty(&self) -> bool {
        !self
            .descriptor
            .fields()
            .any(|f| f.cardinality() == Cardinality::Required)
    }

    /// Encode message data to payload bytes.
    pub fn encode(&self, data: &Value) -> Result<Vec<u8>> {
        payload::encode(&self.descriptor, data)
            .map_err(|reason| GatewayError::encode(&self.name, reason))
    }

    /// Decode payload bytes to message data.
    pub fn decode(&self, bytes: &[u8]) -> Result<Value> {
        payload::decode(&self.descriptor, bytes)
            .map_err(|reason| GatewayError::decode(&self.name, reason))
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageType")
            .field("name", &self.full_name())
            .field("numeric_id", &format_args!("{:#06x}", self.numeric_id()))
            .finish()
    }
}

/// A loaded protocol unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolUnit {
    pub package: String,
    pub protocol_id: u8,
}

/// Read-only registry of message types.
///
/// Built once at startup and shared behind an `Arc`; lookups never block.
pub struct SchemaRegistry {
    by_name: HashMap<String, Arc<MessageType>>,
    by_id: BTreeMap<u16, Arc<MessageType>>,
    protocols: Vec<ProtocolUnit>,
    version: Option<SchemaVersion>,
}

impl SchemaRegistry {
    /// Start building a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Load every schema file named in the configuration.
    ///
    /// Files are registered under their file name, which is what `import`
    /// statements in the other files refer to.
    pub fn from_config(config: &SchemaConfig) -> Result<Self> {
        let mut builder = Self::builder();
        if let Some(path) = &config.version_file {
            let (name, source) = read_source(path)?;
            builder = builder.load_version(&name, &source)?;
        }
        for path in &config.type_files {
            let (name, source) = read_source(path)?;
            builder = builder.load_types(&name, &source)?;
        }
        for path in &config.protocol_files {
            let (name, source) = read_source(path)?;
            builder = builder.load(&name, &source)?;
        }
        builder.build()
    }

    /// Look up a message type by simple name.
    pub fn by_name(&self, name: &str) -> Option<&Arc<MessageType>> {
        self.by_name.get(name)
    }

    /// Look up a message type by numeric id.
    pub fn by_id(&self, id: u16) -> Option<&Arc<MessageType>> {
        self.by_id.get(&id)
    }

    /// Encode data for the named message type.
    pub fn encode(&self, name: &str, data: &Value) -> Result<Vec<u8>> {
        self.by_name(name)
            .ok_or_else(|| GatewayError::UnknownMessageType(name.to_string()))?
            .encode(data)
    }

    /// Decode payload bytes for a numeric message id.
    pub fn decode(&self, id: u16, bytes: &[u8]) -> Result<Value> {
        self.by_id(id)
            .ok_or(GatewayError::UnknownMessageId(id))?
            .decode(bytes)
    }

    /// Loaded protocol units in load order.
    pub fn protocols(&self) -> &[ProtocolUnit] {
        &self.protocols
    }

    /// Version declared by the version source, if one was loaded.
    pub fn version(&self) -> Option<&SchemaVersion> {
        self.version.as_ref()
    }

    /// All message types ordered by numeric id.
    pub fn message_types(&self) -> impl Iterator<Item = &Arc<MessageType>> {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("protocols", &self.protocols)
            .field("message_types", &self.by_id.len())
            .field("version", &self.version)
            .finish()
    }
}

fn read_source(path: &Path) -> Result<(String, String)> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| GatewayError::Schema(format!("{}: {}", path.display(), e)))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| GatewayError::Schema(format!("{}: not a file", path.display())))?;
    Ok((name, source))
}

fn qualify(package: &str, name: &str) -> String {
    if package.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", package, name)
    }
}

#[derive(Debug)]
struct PendingUnit {
    package: String,
    protocol_id: u8,
    declarations: Vec<TopLevel>,
}

/// Collects definition sources, then resolves them into a [`SchemaRegistry`].
///
/// Each source is named by the file name other sources `import` it as.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    sources: SourceSet,
    units: Vec<PendingUnit>,
    version: Option<SchemaVersion>,
}

impl RegistryBuilder {
    /// Load a protocol unit.
    ///
    /// The unit must open with a `Protocol` enum whose `ID` value is the
    /// protocol id. Its messages are registered under that id.
    pub fn load(mut self, name: &str, source: &str) -> Result<Self> {
        let file = source::parse(name, source)?;
        let unit = if file.package().is_empty() {
            name
        } else {
            file.package()
        };

        let id = file
            .enum_type
            .iter()
            .find(|e| e.name() == PROTOCOL_ENUM)
            .and_then(|e| e.value.iter().find(|v| v.name() == PROTOCOL_ID_VALUE))
            .map(|v| v.number())
            .ok_or_else(|| {
                GatewayError::Schema(format!(
                    "Protocol unit {} has no {} enum with an {} value",
                    unit, PROTOCOL_ENUM, PROTOCOL_ID_VALUE
                ))
            })?;
        let declarations = source::declaration_order(&file)?;
        if declarations.first() != Some(&TopLevel::Enum(PROTOCOL_ENUM.to_string())) {
            return Err(GatewayError::Schema(format!(
                "Protocol unit {} must declare {} first",
                unit, PROTOCOL_ENUM
            )));
        }
        let protocol_id = u8::try_from(id).map_err(|_| {
            GatewayError::Schema(format!("Protocol id {} of unit {} exceeds 255", id, unit))
        })?;
        if self.units.iter().any(|u| u.protocol_id == protocol_id) {
            return Err(GatewayError::Schema(format!(
                "Protocol id {} is loaded twice",
                protocol_id
            )));
        }

        self.sources.insert(name, source)?;
        self.units.push(PendingUnit {
            package: file.package().to_string(),
            protocol_id,
            declarations,
        });
        Ok(self)
    }

    /// Load a source that only contributes shared types (enums, messages).
    pub fn load_types(mut self, name: &str, source: &str) -> Result<Self> {
        source::parse(name, source)?;
        self.sources.insert(name, source)?;
        Ok(self)
    }

    /// Load the version source. Its types are also available to other units.
    pub fn load_version(mut self, name: &str, source: &str) -> Result<Self> {
        let file = source::parse(name, source)?;
        self.version = Some(SchemaVersion::from_file(&file)?);
        self.sources.insert(name, source)?;
        Ok(self)
    }

    /// Resolve all loaded sources and assign numeric ids.
    pub fn build(self) -> Result<SchemaRegistry> {
        let pool = self.sources.compile()?;
        let mut by_name: HashMap<String, Arc<MessageType>> = HashMap::new();
        let mut by_id = BTreeMap::new();
        let mut protocols = Vec::with_capacity(self.units.len());

        for unit in &self.units {
            let protocol_id = unit.protocol_id;
            protocols.push(ProtocolUnit {
                package: unit.package.clone(),
                protocol_id,
            });

            for (position, declaration) in unit.declarations.iter().enumerate().skip(1) {
                let TopLevel::Message(name) = declaration else {
                    continue;
                };
                let offset = u8::try_from(position - 1).map_err(|_| {
                    GatewayError::Schema(format!(
                        "Protocol {} declares more than 256 messages",
                        protocol_id
                    ))
                })?;
                let full_name = qualify(&unit.package, name);
                let descriptor = pool.get_message_by_name(&full_name).ok_or_else(|| {
                    GatewayError::Schema(format!("Message {} was not resolved", full_name))
                })?;

                let message_type = Arc::new(MessageType {
                    name: name.clone(),
                    protocol_id,
                    offset,
                    descriptor,
                });

                if let Some(existing) = by_name.get(message_type.name()) {
                    return Err(GatewayError::Schema(format!(
                        "Message name {} is declared by both {} and {}",
                        message_type.name(),
                        existing.full_name(),
                        message_type.full_name()
                    )));
                }
                by_name.insert(name.clone(), Arc::clone(&message_type));
                by_id.insert(message_type.numeric_id(), message_type);
            }
        }

        tracing::debug!(
            protocols = protocols.len(),
            message_types = by_id.len(),
            "schema registry built"
        );

        Ok(SchemaRegistry {
            by_name,
            by_id,
            protocols,
            version: self.version,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const COMMON: &str = r#"
        package SDMS;
        enum ErrorCode { ID_OK = 0; ID_BAD_REQUEST = 1; ID_SERVICE_ERROR = 3; }
    "#;

    const ANON: &str = r#"
        import "common.proto";
        package SDMS.Anon;
        enum Protocol { ID = 1; }
        message AckReply {}
        message NackReply {
            required SDMS.ErrorCode err_code = 1;
            optional string err_msg = 2;
        }
        message VersionRequest {}
    "#;

    const AUTH: &str = r#"
        package SDMS.Auth;
        enum Protocol { ID = 2; }
        message UserViewRequest { required string uid = 1; optional bool details = 2; }
        enum SortOrder { ASC = 0; DESC = 1; }
        message UserDataReply { repeated string user = 1; }
    "#;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::builder()
            .load_types("common.proto", COMMON)
            .unwrap()
            .load("anon.proto", ANON)
            .unwrap()
            .load("auth.proto", AUTH)
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn test_numeric_ids_follow_declaration_order() {
        let registry = registry();

        assert_eq!(registry.by_name("AckReply").unwrap().numeric_id(), 0x0100);
        assert_eq!(registry.by_name("NackReply").unwrap().numeric_id(), 0x0101);
        assert_eq!(registry.by_name("VersionRequest").unwrap().numeric_id(), 0x0102);
        assert_eq!(registry.by_name("UserViewRequest").unwrap().numeric_id(), 0x0200);
        // the SortOrder enum occupies offset 1
        assert_eq!(registry.by_name("UserDataReply").unwrap().numeric_id(), 0x0202);
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn test_bidirectional_lookup() {
        let registry = registry();
        for message_type in registry.message_types() {
            let back = registry.by_id(message_type.numeric_id()).unwrap();
            assert_eq!(back.name(), message_type.name());
            assert!(Arc::ptr_eq(back, registry.by_name(message_type.name()).unwrap()));
        }
        assert!(registry.by_id(0x0103).is_none());
        assert!(registry.by_name("SortOrder").is_none());
    }

    #[test]
    fn test_encode_decode_through_registry() {
        let registry = registry();
        let data = json!({"uid": "u/jdoe", "details": true});

        let bytes = registry.encode("UserViewRequest", &data).unwrap();
        assert_eq!(registry.decode(0x0200, &bytes).unwrap(), data);
    }

    #[test]
    fn test_cross_unit_enum_reference() {
        let registry = registry();
        let bytes = registry
            .encode("NackReply", &json!({"err_code": "ID_SERVICE_ERROR", "err_msg": "boom"}))
            .unwrap();
        let decoded = registry.decode(0x0101, &bytes).unwrap();
        assert_eq!(decoded, json!({"err_code": 3, "err_msg": "boom"}));
    }

    #[test]
    fn test_unknown_names_and_ids() {
        let registry = registry();
        assert!(matches!(
            registry.encode("Nope", &json!({})),
            Err(GatewayError::UnknownMessageType(name)) if name == "Nope"
        ));
        assert!(matches!(
            registry.decode(0x0999, &[]),
            Err(GatewayError::UnknownMessageId(0x0999))
        ));
    }

    #[test]
    fn test_empty_payload_rules() {
        let registry = registry();
        assert!(registry.by_name("AckReply").unwrap().permits_empty());
        assert_eq!(registry.decode(0x0100, &[]).unwrap(), json!({}));

        assert!(!registry.by_name("UserViewRequest").unwrap().permits_empty());
        assert!(matches!(
            registry.decode(0x0200, &[]),
            Err(GatewayError::DecodeFailure { .. })
        ));
    }

    #[test]
    fn test_missing_protocol_enum_is_fatal() {
        let result = SchemaRegistry::builder().load("x.proto", "package X; message A {}");
        assert!(result.unwrap_err().to_string().contains("has no Protocol enum"));

        let result =
            SchemaRegistry::builder().load("x.proto", "package X; enum Protocol { OTHER = 1; }");
        assert!(result.is_err());
    }

    #[test]
    fn test_protocol_enum_must_come_first() {
        let result = SchemaRegistry::builder()
            .load("x.proto", "package X; message A {} enum Protocol { ID = 4; }");
        assert!(result.unwrap_err().to_string().contains("must declare Protocol first"));
    }

    #[test]
    fn test_duplicate_protocol_id() {
        let result = SchemaRegistry::builder()
            .load("a.proto", "package A; enum Protocol { ID = 1; }")
            .unwrap()
            .load("b.proto", "package B; enum Protocol { ID = 1; }");
        assert!(result.unwrap_err().to_string().contains("loaded twice"));
    }

    #[test]
    fn test_duplicate_message_name() {
        let result = SchemaRegistry::builder()
            .load("a.proto", "package A; enum Protocol { ID = 1; } message Ping {}")
            .unwrap()
            .load("b.proto", "package B; enum Protocol { ID = 2; } message Ping {}")
            .unwrap()
            .build();
        assert!(result.unwrap_err().to_string().contains("Message name Ping"));
    }

    #[test]
    fn test_protocol_id_range() {
        let result =
            SchemaRegistry::builder().load("a.proto", "package A; enum Protocol { ID = 256; }");
        assert!(result.unwrap_err().to_string().contains("exceeds 255"));
    }

    #[test]
    fn test_unresolved_import_fails_build() {
        let result = SchemaRegistry::builder()
            .load(
                "a.proto",
                r#"import "missing.proto"; package A; enum Protocol { ID = 1; } message Ping {}"#,
            )
            .unwrap()
            .build();
        assert!(matches!(result, Err(GatewayError::Schema(_))));
    }

    #[test]
    fn test_nested_declarations_do_not_take_offsets() {
        let registry = SchemaRegistry::builder()
            .load(
                "a.proto",
                r#"
                package A;
                enum Protocol { ID = 3; }
                message Outer {
                    message Inner { optional uint32 v = 1; }
                    enum Mode { OFF = 0; }
                    optional Inner inner = 1;
                }
                message Next {}
                "#,
            )
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(registry.by_name("Outer").unwrap().numeric_id(), 0x0300);
        assert_eq!(registry.by_name("Next").unwrap().numeric_id(), 0x0301);
        assert!(registry.by_name("Inner").is_none());

        let bytes = registry.encode("Outer", &json!({"inner": {"v": 9}})).unwrap();
        assert_eq!(registry.decode(0x0300, &bytes).unwrap(), json!({"inner": {"v": 9}}));
    }

    #[test]
    fn test_from_config_names_sources_by_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("common.proto"), COMMON).unwrap();
        std::fs::write(dir.path().join("anon.proto"), ANON).unwrap();

        let config = SchemaConfig {
            version_file: None,
            type_files: vec![dir.path().join("common.proto")],
            protocol_files: vec![dir.path().join("anon.proto")],
        };
        let registry = SchemaRegistry::from_config(&config).unwrap();
        assert_eq!(registry.by_name("NackReply").unwrap().numeric_id(), 0x0101);
        assert_eq!(registry.protocols()[0].package, "SDMS.Anon");
    }
}
