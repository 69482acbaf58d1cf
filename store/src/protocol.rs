//! Request bodies and query parameters shared by the remote server and the
//! remote client. Responses are the plain JSON encoding of the contract's
//! return values, failures the JSON encoding of [crate::Error].

use serde::{Deserialize, Serialize};

use crate::node::{AttributeType, NodeId};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNodeRequest {
    pub name: String,
    pub pseudo_class: String,
    #[serde(default)]
    pub description: String,
    /// Inconsistent nodes stay hidden from listings until marked consistent.
    #[serde(default = "default_consistent")]
    pub consistent: bool,
}

fn default_consistent() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetParentRequest {
    pub parent_id: NodeId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DescriptionRequest {
    pub description: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AttributeQuery {
    #[serde(rename = "type")]
    pub attr_type: AttributeType,
}
