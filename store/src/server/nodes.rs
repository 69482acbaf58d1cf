use axum::{
    extract::{Path, RawQuery, State},
    Json,
};
use bytes::Bytes;
use serde::Deserialize;
use tracing::instrument;

use super::{decode, AppState};
use crate::{
    backend::StoreBackend,
    node::{AttributeValue, BackwardDependency, NodeDependency, NodeId, NodeInfo},
    protocol::{
        AttributeQuery, CreateNodeRequest, DescriptionRequest, RenameRequest, SetParentRequest,
    },
    Error,
};

#[derive(Debug, Deserialize)]
pub struct NodePath {
    pub(super) drive: String,
    pub(super) id: String,
}

/// A node, and the name of a child, attribute or dependency.
#[derive(Debug, Deserialize)]
pub struct NamedPath {
    pub(super) drive: String,
    pub(super) id: String,
    pub(super) name: String,
}

#[derive(Debug, Deserialize)]
pub struct DependencyPath {
    drive: String,
    id: String,
    name: String,
    target: String,
}

#[instrument(skip(state))]
pub async fn info(
    Path(NodePath { drive, id }): Path<NodePath>,
    State(state): State<AppState>,
) -> Result<Json<NodeInfo>, Error> {
    let (store, id) = state.node(&drive, &id)?;
    Ok(Json(store.get_node_info(&id).await?))
}

#[instrument(skip(state))]
pub async fn delete(
    Path(NodePath { drive, id }): Path<NodePath>,
    State(state): State<AppState>,
) -> Result<Json<NodeId>, Error> {
    let (store, id) = state.node(&drive, &id)?;
    Ok(Json(store.delete_node(&id).await?))
}

#[instrument(skip(state))]
pub async fn children(
    Path(NodePath { drive, id }): Path<NodePath>,
    State(state): State<AppState>,
) -> Result<Json<Vec<NodeInfo>>, Error> {
    let (store, id) = state.node(&drive, &id)?;
    Ok(Json(store.get_child_nodes(&id).await?))
}

#[instrument(skip(state, body))]
pub async fn create(
    Path(NodePath { drive, id }): Path<NodePath>,
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<NodeInfo>, Error> {
    let (store, id) = state.node(&drive, &id)?;
    let req: CreateNodeRequest = decode(&body)?;
    let info = if req.consistent {
        store
            .create_node(&id, &req.name, &req.pseudo_class, &req.description)
            .await?
    } else {
        store
            .create_inconsistent_node(&id, &req.name, &req.pseudo_class, &req.description)
            .await?
    };
    Ok(Json(info))
}

#[instrument(skip(state))]
pub async fn is_consistent(
    Path(NodePath { drive, id }): Path<NodePath>,
    State(state): State<AppState>,
) -> Result<Json<bool>, Error> {
    let (store, id) = state.node(&drive, &id)?;
    Ok(Json(store.is_consistent(&id).await?))
}

#[instrument(skip(state))]
pub async fn set_consistent(
    Path(NodePath { drive, id }): Path<NodePath>,
    State(state): State<AppState>,
) -> Result<Json<bool>, Error> {
    let (store, id) = state.node(&drive, &id)?;
    Ok(Json(store.set_consistent(&id).await?))
}

#[instrument(skip(state))]
pub async fn is_writable(
    Path(NodePath { drive, id }): Path<NodePath>,
    State(state): State<AppState>,
) -> Result<Json<bool>, Error> {
    let (store, id) = state.node(&drive, &id)?;
    Ok(Json(store.is_writable(&id).await?))
}

#[instrument(skip(state))]
pub async fn child(
    Path(NamedPath { drive, id, name }): Path<NamedPath>,
    State(state): State<AppState>,
) -> Result<Json<Option<NodeInfo>>, Error> {
    let (store, id) = state.node(&drive, &id)?;
    Ok(Json(store.get_child_node(&id, &name).await?))
}

#[instrument(skip(state))]
pub async fn parent(
    Path(NodePath { drive, id }): Path<NodePath>,
    State(state): State<AppState>,
) -> Result<Json<Option<NodeInfo>>, Error> {
    let (store, id) = state.node(&drive, &id)?;
    Ok(Json(store.get_parent_node(&id).await?))
}

#[instrument(skip(state, body))]
pub async fn set_parent(
    Path(NodePath { drive, id }): Path<NodePath>,
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<NodeId>, Error> {
    let (store, id) = state.node(&drive, &id)?;
    let req: SetParentRequest = decode(&body)?;
    Ok(Json(store.set_parent_node(&id, &req.parent_id).await?))
}

#[instrument(skip(state, body))]
pub async fn rename(
    Path(NodePath { drive, id }): Path<NodePath>,
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<()>, Error> {
    let (store, id) = state.node(&drive, &id)?;
    let req: RenameRequest = decode(&body)?;
    store.rename_node(&id, &req.name).await?;
    Ok(Json(()))
}

#[instrument(skip(state, body))]
pub async fn set_description(
    Path(NodePath { drive, id }): Path<NodePath>,
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<()>, Error> {
    let (store, id) = state.node(&drive, &id)?;
    let req: DescriptionRequest = decode(&body)?;
    store.set_description(&id, &req.description).await?;
    Ok(Json(()))
}

#[instrument(skip(state))]
pub async fn get_attribute(
    Path(NamedPath { drive, id, name }): Path<NamedPath>,
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> Result<Json<Option<AttributeValue>>, Error> {
    let (store, id) = state.node(&drive, &id)?;
    let query: AttributeQuery = serde_qs::from_str(query.as_deref().unwrap_or_default())
        .map_err(|e| Error::InvalidRequest(format!("invalid query: {}", e)))?;
    Ok(Json(store.get_attribute(&id, &name, query.attr_type).await?))
}

#[instrument(skip(state, body))]
pub async fn set_attribute(
    Path(NamedPath { drive, id, name }): Path<NamedPath>,
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<()>, Error> {
    let (store, id) = state.node(&drive, &id)?;
    let value: AttributeValue = decode(&body)?;
    store.set_attribute(&id, &name, value).await?;
    Ok(Json(()))
}

#[instrument(skip(state))]
pub async fn remove_attribute(
    Path(NamedPath { drive, id, name }): Path<NamedPath>,
    State(state): State<AppState>,
) -> Result<Json<bool>, Error> {
    let (store, id) = state.node(&drive, &id)?;
    Ok(Json(store.remove_attribute(&id, &name).await?))
}

#[instrument(skip(state))]
pub async fn all_dependencies(
    Path(NodePath { drive, id }): Path<NodePath>,
    State(state): State<AppState>,
) -> Result<Json<Vec<NodeDependency>>, Error> {
    let (store, id) = state.node(&drive, &id)?;
    Ok(Json(store.get_all_dependencies(&id).await?))
}

#[instrument(skip(state))]
pub async fn dependencies(
    Path(NamedPath { drive, id, name }): Path<NamedPath>,
    State(state): State<AppState>,
) -> Result<Json<Vec<NodeId>>, Error> {
    let (store, id) = state.node(&drive, &id)?;
    Ok(Json(store.get_dependencies(&id, &name).await?))
}

#[instrument(skip(state))]
pub async fn add_dependency(
    Path(DependencyPath {
        drive,
        id,
        name,
        target,
    }): Path<DependencyPath>,
    State(state): State<AppState>,
) -> Result<Json<()>, Error> {
    let (store, id) = state.node(&drive, &id)?;
    let target: NodeId = target.parse()?;
    store.add_dependency(&id, &name, &target).await?;
    Ok(Json(()))
}

#[instrument(skip(state))]
pub async fn remove_dependency(
    Path(DependencyPath {
        drive,
        id,
        name,
        target,
    }): Path<DependencyPath>,
    State(state): State<AppState>,
) -> Result<Json<bool>, Error> {
    let (store, id) = state.node(&drive, &id)?;
    let target: NodeId = target.parse()?;
    Ok(Json(store.remove_dependency(&id, &name, &target).await?))
}

#[instrument(skip(state))]
pub async fn backward_dependencies(
    Path(NodePath { drive, id }): Path<NodePath>,
    State(state): State<AppState>,
) -> Result<Json<Vec<BackwardDependency>>, Error> {
    let (store, id) = state.node(&drive, &id)?;
    Ok(Json(store.get_backward_dependencies(&id).await?))
}
