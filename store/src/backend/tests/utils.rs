use std::sync::Arc;

use futures::StreamExt;
use lazy_static::lazy_static;
use tempfile::TempDir;
use url::Url;

use crate::{
    backend::{from_addr, EmbeddedStore, RemoteStore, RemoteStoreConfig},
    listenable::ListenableStore,
    server::{gen_router, AppState},
};

lazy_static! {
    static ref TMPDIR: TempDir = TempDir::new().unwrap();
}

/// Name of the drive the contract tests operate on.
pub const DRIVE: &str = "test";

/// Constructs an [EmbeddedStore] persisting into a fresh directory below a
/// shared temporary directory.
pub async fn make_redb_store() -> EmbeddedStore {
    let path = TMPDIR.path().join(uuid::Uuid::new_v4().to_string());
    EmbeddedStore::new(path).await.unwrap()
}

/// Serves `app` on a loopback port, and returns its base url.
pub async fn serve(app: axum::Router) -> Url {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });

    Url::parse(&format!("http://{}/", addr)).unwrap()
}

/// An event stream which sends its leading empty line, and nothing after.
pub async fn idle_event_stream() -> axum::body::Body {
    let lines = futures::stream::once(async {
        Ok::<_, std::io::Error>(bytes::Bytes::from_static(b"\n"))
    })
    .chain(futures::stream::pending());
    axum::body::Body::from_stream(lines)
}

/// Spins up a server on a loopback port, hosting a single in-memory drive,
/// and returns a [RemoteStore] connected to it.
pub async fn make_remote_store() -> RemoteStore {
    let store = Arc::new(ListenableStore::new(from_addr("memory://").await.unwrap()));
    let app = gen_router().with_state(AppState::new([(DRIVE.to_string(), store)]));

    RemoteStore::connect(serve(app).await, DRIVE, RemoteStoreConfig::default())
        .await
        .unwrap()
}
