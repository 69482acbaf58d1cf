use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use uuid::Uuid;

use crate::Error;

/// The length of the textual form of a [NodeId].
const NODE_ID_STR_LEN: usize = 36;

/// Identity of a node, assigned by the backend on creation.
///
/// Its textual form is the lowercase, hyphenated UUID. Parsing it requires no
/// store state, and it can be used as URL path segment unescaped.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, SerializeDisplay, DeserializeFromStr,
)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generates a new, random id.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_hyphenated())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0.as_hyphenated())
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != NODE_ID_STR_LEN {
            return Err(Error::InvalidRequest(format!("invalid node id: {:?}", s)));
        }

        Uuid::try_parse(s)
            .map(Self)
            .map_err(|e| Error::InvalidRequest(format!("invalid node id {:?}: {}", s, e)))
    }
}

/// The scalar type of an attribute. Once an attribute is stored with a type,
/// it keeps it until removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    String,
    Double,
    Integer,
    Boolean,
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AttributeType::String => "string",
            AttributeType::Double => "double",
            AttributeType::Integer => "integer",
            AttributeType::Boolean => "boolean",
        })
    }
}

impl FromStr for AttributeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(AttributeType::String),
            "double" => Ok(AttributeType::Double),
            "integer" => Ok(AttributeType::Integer),
            "boolean" => Ok(AttributeType::Boolean),
            _ => Err(Error::InvalidRequest(format!(
                "unknown attribute type: {:?}",
                s
            ))),
        }
    }
}

/// A typed attribute value.
///
/// Serialized as self-describing envelope, e.g. `{"type":"integer","value":3}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum AttributeValue {
    String(String),
    Double(f64),
    Integer(i64),
    Boolean(bool),
}

impl AttributeValue {
    pub fn attribute_type(&self) -> AttributeType {
        match self {
            AttributeValue::String(_) => AttributeType::String,
            AttributeValue::Double(_) => AttributeType::Double,
            AttributeValue::Integer(_) => AttributeType::Integer,
            AttributeValue::Boolean(_) => AttributeType::Boolean,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Doubles need to be finite, NaN and infinities have no JSON encoding.
    pub fn validate(&self) -> Result<(), Error> {
        match self {
            AttributeValue::Double(d) if !d.is_finite() => Err(Error::InvalidRequest(format!(
                "double attribute values must be finite, got {}",
                d
            ))),
            _ => Ok(()),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Double(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Integer(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Boolean(value)
    }
}

/// A snapshot of a node, as returned by the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub id: NodeId,
    /// None only for the root node of a store.
    #[serde(default)]
    pub parent_id: Option<NodeId>,
    pub name: String,
    pub pseudo_class: String,
    #[serde(default)]
    pub description: String,
    pub version: u64,
    /// Milliseconds since the Unix epoch.
    pub creation_time: u64,
    /// Milliseconds since the Unix epoch, moves with every version bump.
    pub modification_time: u64,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl NodeInfo {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Result of [crate::backend::StoreBackend::get_root_node].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RootNode {
    pub info: NodeInfo,
    /// Whether the call created the root.
    pub created: bool,
}

/// A named, outgoing edge to another node.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDependency {
    pub name: String,
    pub target_id: NodeId,
}

/// A named, incoming edge from another node.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackwardDependency {
    pub name: String,
    pub source_id: NodeId,
}

/// Checks a node, attribute, data source or dependency name.
/// Names must not be empty, must not be `.` or `..`, and must not contain
/// `/` or NUL. This keeps every name usable as a single path segment.
pub fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::InvalidRequest("name must not be empty".to_string()));
    }
    if name == "." || name == ".." {
        return Err(Error::InvalidRequest(format!("name {:?} is reserved", name)));
    }
    if name.contains(['/', '\0']) {
        return Err(Error::InvalidRequest(format!(
            "name {:?} contains a forbidden character",
            name
        )));
    }
    Ok(())
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn node_id_string_round_trip() {
        let id = NodeId::new();
        let s = id.to_string();

        assert_eq!(NODE_ID_STR_LEN, s.len());
        assert_eq!(s, s.to_lowercase());
        assert_eq!(id, s.parse::<NodeId>().expect("must parse"));
    }

    #[test]
    fn node_id_bytes_round_trip() {
        let id = NodeId::new();
        assert_eq!(id, NodeId::from_bytes(*id.as_bytes()));
    }

    #[rstest]
    #[case::empty("")]
    #[case::simple("67e5504410b1426f9247bb680e5fe0c8")]
    #[case::braced("{67e55044-10b1-426f-9247-bb680e5fe0c8}")]
    #[case::garbage("this-is-not-a-uuid-at-all-no-no-no-no")]
    fn node_id_parse_fail(#[case] input: &str) {
        input.parse::<NodeId>().expect_err("must fail");
    }

    #[test]
    fn node_id_serde() {
        let id = NodeId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(format!("\"{}\"", id), json);
        assert_eq!(id, serde_json::from_str::<NodeId>(&json).unwrap());
    }

    #[rstest]
    #[case::string(AttributeValue::from("abc"), serde_json::json!({"type": "string", "value": "abc"}))]
    #[case::double(AttributeValue::from(1.5), serde_json::json!({"type": "double", "value": 1.5}))]
    #[case::integer(AttributeValue::from(-3i64), serde_json::json!({"type": "integer", "value": -3}))]
    #[case::boolean(AttributeValue::from(true), serde_json::json!({"type": "boolean", "value": true}))]
    fn attribute_envelope(#[case] value: AttributeValue, #[case] json: serde_json::Value) {
        assert_eq!(json, serde_json::to_value(&value).unwrap());
        assert_eq!(value, serde_json::from_value(json).unwrap());
    }

    #[test]
    fn non_finite_double_rejected() {
        assert!(AttributeValue::Double(f64::NAN).validate().is_err());
        assert!(AttributeValue::Double(f64::INFINITY).validate().is_err());
        assert!(AttributeValue::Double(0.5).validate().is_ok());
    }

    #[rstest]
    #[case::empty("", false)]
    #[case::slash("a/b", false)]
    #[case::nul("a\0b", false)]
    #[case::dot(".", false)]
    #[case::dot_dot("..", false)]
    #[case::dots("...", true)]
    #[case::hidden(".profile", true)]
    #[case::colon("a:b", true)]
    #[case::plain("caseA", true)]
    fn names(#[case] name: &str, #[case] valid: bool) {
        assert_eq!(valid, validate_name(name).is_ok());
    }

    #[test]
    fn node_info_json_is_camel_case() {
        let info = NodeInfo {
            id: NodeId::new(),
            parent_id: None,
            name: "root".to_string(),
            pseudo_class: "folder".to_string(),
            description: String::new(),
            version: 0,
            creation_time: 1,
            modification_time: 1,
            attributes: BTreeMap::new(),
        };
        let v = serde_json::to_value(&info).unwrap();
        assert!(v.get("pseudoClass").is_some());
        assert!(v.get("modificationTime").is_some());
        assert_eq!(info, serde_json::from_value(v).unwrap());
    }
}
