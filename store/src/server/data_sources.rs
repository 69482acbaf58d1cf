use std::io;

use axum::{
    body::Body,
    extract::{Path, Request, State},
    response::Response,
    Json,
};
use futures::TryStreamExt;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{instrument, warn};

use super::{
    nodes::{NamedPath, NodePath},
    AppState,
};
use crate::{backend::StoreBackend, Error};

#[derive(Debug, serde::Deserialize)]
pub struct FilePath {
    drive: String,
    id: String,
    name: String,
    file: String,
}

#[instrument(skip(state))]
pub async fn names(
    Path(NodePath { drive, id }): Path<NodePath>,
    State(state): State<AppState>,
) -> Result<Json<Vec<String>>, Error> {
    let (store, id) = state.node(&drive, &id)?;
    Ok(Json(store.get_data_source_names(&id).await?))
}

#[instrument(skip(state))]
pub async fn list(
    Path(NamedPath { drive, id, name }): Path<NamedPath>,
    State(state): State<AppState>,
) -> Result<Json<Vec<String>>, Error> {
    let (store, id) = state.node(&drive, &id)?;
    Ok(Json(store.list_data_source_files(&id, &name).await?))
}

#[instrument(skip(state))]
pub async fn exists(
    Path(FilePath {
        drive,
        id,
        name,
        file,
    }): Path<FilePath>,
    State(state): State<AppState>,
) -> Result<Json<bool>, Error> {
    let (store, id) = state.node(&drive, &id)?;
    Ok(Json(store.data_source_file_exists(&id, &name, &file).await?))
}

#[instrument(skip(state))]
pub async fn read(
    Path(FilePath {
        drive,
        id,
        name,
        file,
    }): Path<FilePath>,
    State(state): State<AppState>,
) -> Result<Response, Error> {
    let (store, id) = state.node(&drive, &id)?;
    let reader = store.open_data_source_read(&id, &name, &file).await?;

    Ok(Response::new(Body::from_stream(ReaderStream::new(reader))))
}

/// Streams the request body into the data source. It's only committed if
/// the body was received completely.
#[instrument(skip(state, request))]
pub async fn write(
    Path(FilePath {
        drive,
        id,
        name,
        file,
    }): Path<FilePath>,
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<()>, Error> {
    let (store, id) = state.node(&drive, &id)?;
    let mut writer = store.open_data_source_write(&id, &name, &file).await?;

    let mut r = StreamReader::new(request.into_body().into_data_stream().map_err(|e| {
        warn!(err=%e, "failed to read request body");
        io::Error::new(io::ErrorKind::BrokenPipe, e.to_string())
    }));

    tokio::io::copy(&mut r, &mut writer).await?;
    writer.close().await?;

    Ok(Json(()))
}

#[instrument(skip(state))]
pub async fn remove(
    Path(FilePath {
        drive,
        id,
        name,
        file,
    }): Path<FilePath>,
    State(state): State<AppState>,
) -> Result<Json<bool>, Error> {
    let (store, id) = state.node(&drive, &id)?;
    Ok(Json(store.remove_data_source_file(&id, &name, &file).await?))
}
