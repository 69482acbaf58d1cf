//! Exposes drives over HTTP, for [crate::backend::RemoteStore] to connect
//! to.
//!
//! Every contract call maps to one route below `/drives/:drive`. Responses
//! are the JSON encoding of the call's return value, failures the JSON
//! encoding of [Error] with a matching status code.

use std::{collections::BTreeMap, sync::Arc};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::{backend::StoreBackend, listenable::ListenableStore, node::NodeId, Error};

mod data_sources;
mod events;
mod nodes;

#[derive(Clone)]
pub struct AppState {
    drives: Arc<BTreeMap<String, Arc<ListenableStore>>>,
}

impl AppState {
    pub fn new(drives: impl IntoIterator<Item = (String, Arc<ListenableStore>)>) -> Self {
        Self {
            drives: Arc::new(drives.into_iter().collect()),
        }
    }

    fn drive(&self, name: &str) -> Result<&Arc<ListenableStore>, Error> {
        self.drives
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("drive {}", name)))
    }

    /// Looks up the drive, and parses the node id from its string form.
    fn node(&self, drive: &str, id: &str) -> Result<(&Arc<ListenableStore>, NodeId), Error> {
        Ok((self.drive(drive)?, id.parse()?))
    }
}

pub fn gen_router() -> Router<AppState> {
    Router::new()
        .route("/drives", get(list_drives))
        .route("/drives/:drive/root", get(root))
        .route("/drives/:drive/flush", post(flush))
        .route("/drives/:drive/events", get(events::get))
        .route("/drives/:drive/inconsistent", get(inconsistent))
        .route(
            "/drives/:drive/nodes/:id",
            get(nodes::info).delete(nodes::delete),
        )
        .route(
            "/drives/:drive/nodes/:id/children",
            get(nodes::children).post(nodes::create),
        )
        .route("/drives/:drive/nodes/:id/children/:name", get(nodes::child))
        .route(
            "/drives/:drive/nodes/:id/parent",
            get(nodes::parent).put(nodes::set_parent),
        )
        .route("/drives/:drive/nodes/:id/name", put(nodes::rename))
        .route(
            "/drives/:drive/nodes/:id/consistent",
            get(nodes::is_consistent).put(nodes::set_consistent),
        )
        .route("/drives/:drive/nodes/:id/writable", get(nodes::is_writable))
        .route(
            "/drives/:drive/nodes/:id/description",
            put(nodes::set_description),
        )
        .route(
            "/drives/:drive/nodes/:id/attrs/:name",
            get(nodes::get_attribute)
                .put(nodes::set_attribute)
                .delete(nodes::remove_attribute),
        )
        .route("/drives/:drive/nodes/:id/deps", get(nodes::all_dependencies))
        .route(
            "/drives/:drive/nodes/:id/deps/:name",
            get(nodes::dependencies),
        )
        .route(
            "/drives/:drive/nodes/:id/deps/:name/:target",
            post(nodes::add_dependency).delete(nodes::remove_dependency),
        )
        .route(
            "/drives/:drive/nodes/:id/backward-deps",
            get(nodes::backward_dependencies),
        )
        .route(
            "/drives/:drive/nodes/:id/datasources",
            get(data_sources::names),
        )
        .route(
            "/drives/:drive/nodes/:id/attrs/:name/files",
            get(data_sources::list),
        )
        .route(
            "/drives/:drive/nodes/:id/attrs/:name/files/:file",
            get(data_sources::read)
                .put(data_sources::write)
                .delete(data_sources::remove),
        )
        .route(
            "/drives/:drive/nodes/:id/attrs/:name/files/:file/exists",
            get(data_sources::exists),
        )
}

async fn list_drives(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<Vec<String>> {
    Json(state.drives.keys().cloned().collect())
}

async fn root(
    axum::extract::Path(drive): axum::extract::Path<String>,
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<Json<crate::node::RootNode>, Error> {
    Ok(Json(state.drive(&drive)?.get_root_node(&drive).await?))
}

async fn inconsistent(
    axum::extract::Path(drive): axum::extract::Path<String>,
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<Json<Vec<crate::node::NodeInfo>>, Error> {
    Ok(Json(state.drive(&drive)?.get_inconsistent_nodes().await?))
}

async fn flush(
    axum::extract::Path(drive): axum::extract::Path<String>,
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<Json<()>, Error> {
    state.drive(&drive)?.flush().await?;
    Ok(Json(()))
}

/// Decodes a JSON request body.
fn decode<T: DeserializeOwned>(body: &Bytes) -> Result<T, Error> {
    serde_json::from_slice(body).map_err(|e| Error::InvalidRequest(format!("invalid body: {}", e)))
}

impl Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::DuplicateChild { .. } | Error::IllegalState(_) => StatusCode::CONFLICT,
            Error::TypeMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::StorageError(_) | Error::ConfigurationError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Error::NetworkError(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!(err=%self, "request failed");
        } else {
            debug!(err=%self, "request rejected");
        }
        (status, Json(self)).into_response()
    }
}
