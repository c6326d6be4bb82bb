//! Foundational value types shared by every OMS crate
//!
//! These are the nouns the rest of the system is built from: the
//! content-addressed [`CommitHash`], the resource-chain coordinates
//! ([`ResourceType`], [`ResourceId`], [`BranchName`], [`Version`]), the
//! cache validators ([`ETag`], [`ContentHash`]), and the small closed
//! enums the merge engine pattern-matches on ([`Cardinality`],
//! [`PropertyType`], [`ChangeType`]).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// One of the six schema entities the ontology versions.
///
/// Matches the resource kinds named in the data model: object types,
/// link types, properties, struct types, semantic types, action types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// An object type definition.
    ObjectType,
    /// A link type definition.
    LinkType,
    /// A property definition.
    Property,
    /// A struct type definition.
    StructType,
    /// A semantic type definition.
    SemanticType,
    /// An action type definition.
    ActionType,
}

impl ResourceType {
    /// Stable lowercase identifier, used in event payloads and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::ObjectType => "object_type",
            ResourceType::LinkType => "link_type",
            ResourceType::Property => "property",
            ResourceType::StructType => "struct_type",
            ResourceType::SemanticType => "semantic_type",
            ResourceType::ActionType => "action_type",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identifier of a resource within its [`ResourceType`], unique per branch.
///
/// Validated non-empty on construction; downstream code may assume a
/// `ResourceId` is never the empty string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(String);

impl ResourceId {
    /// Build a `ResourceId`, rejecting an empty string.
    pub fn new(id: impl Into<String>) -> Result<Self, crate::error::Error> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::error::Error::Validation {
                message: "resource id must not be empty".to_string(),
            });
        }
        Ok(ResourceId(id))
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a branch — a mutable pointer into the commit DAG.
///
/// `main` is conventionally the trunk but carries no special status in
/// the type itself; trunk-ness is a property of branch protection flags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchName(String);

impl BranchName {
    /// Build a `BranchName`, rejecting an empty string.
    pub fn new(name: impl Into<String>) -> Result<Self, crate::error::Error> {
        let name = name.into();
        if name.is_empty() {
            return Err(crate::error::Error::Validation {
                message: "branch name must not be empty".to_string(),
            });
        }
        Ok(BranchName(name))
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 1-based position of a [`crate::contract::ResourceVersion`] in its chain.
///
/// Version 0 never occurs: the first version written for a resource is
/// always `Version(1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// The first version in any chain.
    pub const FIRST: Version = Version(1);

    /// Wrap a raw version number.
    pub const fn new(v: u64) -> Self {
        Version(v)
    }

    /// Raw version number.
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// The version that follows this one.
    pub const fn next(&self) -> Version {
        Version(self.0 + 1)
    }

    /// The version that precedes this one, if any (version 1 has no parent).
    pub fn previous(&self) -> Option<Version> {
        self.0.checked_sub(1).filter(|v| *v > 0).map(Version)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content-addressed hash of a commit's serialized form.
///
/// `CommitHash::compute` implements the invariant
/// `hash = H(parents ∥ author ∥ time ∥ tree-root)` with SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitHash(String);

impl CommitHash {
    /// Hash arbitrary canonical commit bytes into a `CommitHash`.
    pub fn compute(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        CommitHash(hex::encode(digest))
    }

    /// Wrap an already-computed hex digest (used when reading persisted data).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        CommitHash(hex.into())
    }

    /// Full lowercase hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, used as the hash component of an [`ETag`].
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for CommitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SHA-256 hex digest of a resource's canonical content.
///
/// Two resources with an identical `ContentHash` need not share an
/// [`ETag`] — they may belong to different version chains.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash a resource's canonical (sorted-key) JSON content.
    pub fn compute(content: &serde_json::Value) -> Self {
        let canonical = canonicalize(content);
        let digest = Sha256::digest(canonical.as_bytes());
        ContentHash(hex::encode(digest))
    }

    /// Full lowercase hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Serialize a JSON value with sorted object keys so identical content
/// always hashes the same way regardless of field insertion order.
fn canonicalize(value: &serde_json::Value) -> String {
    fn sort(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut sorted: std::collections::BTreeMap<String, serde_json::Value> =
                    std::collections::BTreeMap::new();
                for (k, v) in map {
                    sorted.insert(k.clone(), sort(v));
                }
                serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sort).collect())
            }
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

/// Weak validator identifying a specific `(resource, version)`.
///
/// Wire format: `W/"<first-12-of-commit>-<version>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ETag(String);

impl ETag {
    /// Build the ETag for a given commit and version.
    pub fn new(commit_hash: &CommitHash, version: Version) -> Self {
        ETag(format!("W/\"{}-{}\"", commit_hash.short(), version.value()))
    }

    /// The raw wire-format string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse `(commit_hash_prefix, version)` back out of an ETag string.
    ///
    /// Returns `None` if `raw` doesn't match the `W/"<hex12>-<n>"` shape.
    pub fn parse(raw: &str) -> Option<(String, u64)> {
        let inner = raw.strip_prefix("W/\"")?.strip_suffix('"')?;
        let (hash, version) = inner.rsplit_once('-')?;
        let version: u64 = version.parse().ok()?;
        Some((hash.to_string(), version))
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of change a [`crate::contract::ResourceVersion`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// The resource was created.
    Create,
    /// The resource was modified.
    Update,
    /// The resource was deleted.
    Delete,
}

/// Link cardinality, used by the merge engine's cardinality matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Cardinality {
    /// One-to-one.
    OneToOne,
    /// One-to-many.
    OneToMany,
    /// Many-to-many.
    ManyToMany,
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Cardinality::OneToOne => "ONE_TO_ONE",
            Cardinality::OneToMany => "ONE_TO_MANY",
            Cardinality::ManyToMany => "MANY_TO_MANY",
        };
        write!(f, "{}", s)
    }
}

/// Property type, used by the merge engine's property-type matrix.
///
/// Extensible by registration; `Other` carries any type name not given
/// a dedicated variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    /// Short string.
    String,
    /// Long text.
    Text,
    /// 32-bit integer.
    Integer,
    /// 64-bit integer.
    Long,
    /// Single-precision float.
    Float,
    /// Double-precision float.
    Double,
    /// Arbitrary JSON.
    Json,
    /// Boolean.
    Boolean,
    /// Calendar date.
    Date,
    /// A type name not covered above.
    Other(String),
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyType::String => write!(f, "string"),
            PropertyType::Text => write!(f, "text"),
            PropertyType::Integer => write!(f, "integer"),
            PropertyType::Long => write!(f, "long"),
            PropertyType::Float => write!(f, "float"),
            PropertyType::Double => write!(f, "double"),
            PropertyType::Json => write!(f, "json"),
            PropertyType::Boolean => write!(f, "boolean"),
            PropertyType::Date => write!(f, "date"),
            PropertyType::Other(name) => write!(f, "{}", name),
        }
    }
}

/// Microsecond-precision point in time, convertible to/from RFC 3339.
///
/// Backed by [`chrono`] (rather than a raw `u64`) because the outbox
/// pipeline must emit CloudEvents `time` fields as RFC 3339 strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(chrono::DateTime<chrono::Utc>);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        Timestamp(chrono::Utc::now())
    }

    /// Build from a `chrono::DateTime<Utc>`.
    pub fn from_datetime(dt: chrono::DateTime<chrono::Utc>) -> Self {
        Timestamp(dt)
    }

    /// Build from microseconds since the Unix epoch.
    pub fn from_micros(micros: u64) -> Self {
        let secs = (micros / 1_000_000) as i64;
        let nanos = ((micros % 1_000_000) * 1_000) as u32;
        Timestamp(
            chrono::DateTime::from_timestamp(secs, nanos).unwrap_or_else(|| {
                chrono::DateTime::from(SystemTime::UNIX_EPOCH)
            }),
        )
    }

    /// View as a `chrono::DateTime<Utc>`.
    pub fn as_datetime(&self) -> chrono::DateTime<chrono::Utc> {
        self.0
    }

    /// RFC 3339 representation, as required by the CloudEvents `time` field.
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }

    /// `self` happened strictly before `other`.
    pub fn is_before(&self, other: Timestamp) -> bool {
        self.0 < other.0
    }

    /// Duration elapsed since `earlier`, or `None` if `earlier` is in the future.
    pub fn duration_since(&self, earlier: Timestamp) -> Option<Duration> {
        (self.0 - earlier.0).to_std().ok()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

impl From<SystemTime> for Timestamp {
    fn from(t: SystemTime) -> Self {
        let micros = t
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        Timestamp::from_micros(micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_next_and_previous() {
        let v1 = Version::FIRST;
        assert_eq!(v1.value(), 1);
        assert!(v1.previous().is_none());
        let v2 = v1.next();
        assert_eq!(v2.value(), 2);
        assert_eq!(v2.previous(), Some(v1));
    }

    #[test]
    fn commit_hash_is_deterministic() {
        let a = CommitHash::compute(b"hello");
        let b = CommitHash::compute(b"hello");
        let c = CommitHash::compute(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.short().len(), 12);
    }

    #[test]
    fn content_hash_ignores_key_order() {
        let a = serde_json::json!({"name": "p", "desc": "d"});
        let b = serde_json::json!({"desc": "d", "name": "p"});
        assert_eq!(ContentHash::compute(&a), ContentHash::compute(&b));
    }

    #[test]
    fn content_hash_distinguishes_values() {
        let a = serde_json::json!({"name": "p"});
        let b = serde_json::json!({"name": "q"});
        assert_ne!(ContentHash::compute(&a), ContentHash::compute(&b));
    }

    #[test]
    fn etag_round_trips() {
        let hash = CommitHash::compute(b"some tree");
        let etag = ETag::new(&hash, Version::new(3));
        let (prefix, version) = ETag::parse(etag.as_str()).unwrap();
        assert_eq!(prefix, hash.short());
        assert_eq!(version, 3);
    }

    #[test]
    fn etag_rejects_malformed_input() {
        assert!(ETag::parse("not-an-etag").is_none());
        assert!(ETag::parse("W/\"abc\"").is_none());
    }

    #[test]
    fn resource_id_rejects_empty() {
        assert!(ResourceId::new("").is_err());
        assert!(ResourceId::new("Product").is_ok());
    }

    #[test]
    fn branch_name_rejects_empty() {
        assert!(BranchName::new("").is_err());
        assert!(BranchName::new("main").is_ok());
    }

    #[test]
    fn timestamp_ordering_and_rfc3339() {
        let t1 = Timestamp::from_micros(1_000_000);
        let t2 = Timestamp::from_micros(2_000_000);
        assert!(t1.is_before(t2));
        assert_eq!(t2.duration_since(t1), Some(Duration::from_secs(1)));
        assert!(t1.to_rfc3339().contains('T'));
    }
}
