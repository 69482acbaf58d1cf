use std::{
    collections::HashMap,
    io::{self, Cursor},
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use data_encoding::HEXLOWER;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::DataSourceReader;
use crate::{node::NodeId, Error};

type MemoryBlobs = HashMap<NodeId, HashMap<(String, String, String), Bytes>>;

/// Where the embedded store keeps data source contents.
///
/// The filesystem variant stages all writes in a `tmp` directory, and moves
/// them into `data/NODE_ID/HEX(attr)/HEX(file)/GENERATION` when placing them.
/// Attribute and file names are hex-encoded, so arbitrary names map to valid
/// file names.
///
/// Every write lands in a fresh generation, it never replaces the content of
/// another one. The node record names the generation currently visible, so
/// content only changes once the record pointing at it committed. Whatever
/// generation lost the race (the previous one after a commit, or the new one
/// after an aborted commit) is removed by the caller afterwards.
#[derive(Clone)]
pub(super) enum BlobArea {
    Filesystem { root: PathBuf },
    Memory { blobs: Arc<RwLock<MemoryBlobs>> },
}

/// Returns a name for a new generation.
pub(super) fn new_generation() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl BlobArea {
    /// Opens the blob area below `root`. Leftovers in `tmp` stem from writers
    /// that were never committed and are removed.
    pub(super) async fn open_filesystem(root: PathBuf) -> io::Result<Self> {
        let tmp = root.join("tmp");
        match tokio::fs::remove_dir_all(&tmp).await {
            Ok(()) => debug!(path=%tmp.display(), "removed stale tmp dir"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        tokio::fs::create_dir_all(&tmp).await?;
        tokio::fs::create_dir_all(root.join("data")).await?;

        Ok(Self::Filesystem { root })
    }

    pub(super) fn memory() -> Self {
        Self::Memory {
            blobs: Default::default(),
        }
    }

    /// Returns a fresh staging area for one data source file.
    pub(super) async fn stage(&self) -> Result<Staged, Error> {
        match self {
            BlobArea::Filesystem { root } => {
                let file = async_tempfile::TempFile::new_in(root.join("tmp"))
                    .await
                    .map_err(|e| match e {
                        async_tempfile::Error::Io(io_error) => Error::from(io_error),
                        async_tempfile::Error::InvalidFile => {
                            Error::StorageError("invalid or missing file specified".to_string())
                        }
                        async_tempfile::Error::InvalidDirectory => Error::StorageError(
                            "invalid or missing directory specified".to_string(),
                        ),
                    })?;
                Ok(Staged::File(file))
            }
            BlobArea::Memory { .. } => Ok(Staged::Buffer(Vec::new())),
        }
    }

    /// Moves staged content into the given generation. Blocking.
    /// Nothing reads the generation before a committed record names it.
    pub(super) fn place(
        &self,
        id: &NodeId,
        attr_name: &str,
        file_name: &str,
        generation: &str,
        staged: Staged,
    ) -> Result<(), Error> {
        match (self, staged) {
            (BlobArea::Filesystem { root }, Staged::File(file)) => {
                let dst_path = derive_path(root, id, attr_name, file_name, generation);
                if let Some(parent) = dst_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::rename(file.file_path(), &dst_path)?;
                Ok(())
            }
            (BlobArea::Memory { blobs }, Staged::Buffer(buf)) => {
                blobs.write().entry(*id).or_default().insert(
                    (
                        attr_name.to_string(),
                        file_name.to_string(),
                        generation.to_string(),
                    ),
                    buf.into(),
                );
                Ok(())
            }
            _ => Err(Error::StorageError(
                "staged content doesn't belong to this blob area".to_string(),
            )),
        }
    }

    pub(super) async fn open_read(
        &self,
        id: &NodeId,
        attr_name: &str,
        file_name: &str,
        generation: &str,
    ) -> Result<Box<dyn DataSourceReader>, Error> {
        let not_found = || {
            Error::NotFound(format!(
                "data source {}/{} of node {}",
                attr_name, file_name, id
            ))
        };

        match self {
            BlobArea::Filesystem { root } => {
                let path = derive_path(root, id, attr_name, file_name, generation);
                match tokio::fs::File::open(path).await {
                    Ok(file) => {
                        let reader: Box<dyn DataSourceReader> = Box::new(file);
                        Ok(reader)
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Err(not_found()),
                    Err(e) => Err(e.into()),
                }
            }
            BlobArea::Memory { blobs } => {
                let blobs = blobs.read();
                let key = (
                    attr_name.to_string(),
                    file_name.to_string(),
                    generation.to_string(),
                );
                match blobs.get(id).and_then(|files| files.get(&key)) {
                    Some(data) => {
                        let reader: Box<dyn DataSourceReader> = Box::new(Cursor::new(data.clone()));
                        Ok(reader)
                    }
                    None => Err(not_found()),
                }
            }
        }
    }

    /// Removes a single generation. Blocking.
    pub(super) fn remove_file(
        &self,
        id: &NodeId,
        attr_name: &str,
        file_name: &str,
        generation: &str,
    ) -> Result<(), Error> {
        match self {
            BlobArea::Filesystem { root } => {
                let path = derive_path(root, id, attr_name, file_name, generation);
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                // drop the per-file directory once its last generation is gone.
                if let Some(parent) = path.parent() {
                    let _ = std::fs::remove_dir(parent);
                }
                Ok(())
            }
            BlobArea::Memory { blobs } => {
                if let Some(files) = blobs.write().get_mut(id) {
                    files.remove(&(
                        attr_name.to_string(),
                        file_name.to_string(),
                        generation.to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Same as [BlobArea::remove_file], but off the async runtime, and
    /// failures are only logged. Used for generations nothing points to
    /// anymore.
    pub(super) async fn discard(
        &self,
        id: NodeId,
        attr_name: String,
        file_name: String,
        generation: String,
    ) {
        let this = self.clone();
        let res = tokio::task::spawn_blocking(move || {
            this.remove_file(&id, &attr_name, &file_name, &generation)
        })
        .await;

        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(err=%e, node.id=%id, "failed to remove unused data source"),
            Err(e) => warn!(err=%e, node.id=%id, "failed to remove unused data source"),
        }
    }

    /// Removes everything stored for the given nodes. Blocking.
    /// Failures are logged only, the nodes are gone from the metadata already.
    pub(super) fn remove_nodes(&self, ids: &[NodeId]) {
        match self {
            BlobArea::Filesystem { root } => {
                for id in ids {
                    let path = root.join("data").join(id.to_string());
                    match std::fs::remove_dir_all(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => {
                            warn!(err=%e, path=%path.display(), "failed to remove data sources")
                        }
                    }
                }
            }
            BlobArea::Memory { blobs } => {
                let mut blobs = blobs.write();
                for id in ids {
                    blobs.remove(id);
                }
            }
        }
    }
}

fn derive_path(
    root: &Path,
    id: &NodeId,
    attr_name: &str,
    file_name: &str,
    generation: &str,
) -> PathBuf {
    root.join("data")
        .join(id.to_string())
        .join(HEXLOWER.encode(attr_name.as_bytes()))
        .join(HEXLOWER.encode(file_name.as_bytes()))
        .join(generation)
}

/// Content written, but not committed yet.
pub(super) enum Staged {
    File(async_tempfile::TempFile),
    Buffer(Vec<u8>),
}

impl Staged {
    /// Makes sure everything written reached the staging area.
    pub(super) async fn finish(&mut self) -> io::Result<()> {
        match self {
            Staged::File(file) => {
                file.flush().await?;
                file.sync_all().await?;
                Ok(())
            }
            Staged::Buffer(_) => Ok(()),
        }
    }
}

impl tokio::io::AsyncWrite for Staged {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.get_mut() {
            Staged::File(file) => Pin::new(file).poll_write(cx, buf),
            Staged::Buffer(b) => {
                b.extend_from_slice(buf);
                Poll::Ready(Ok(buf.len()))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            Staged::File(file) => Pin::new(file).poll_flush(cx),
            Staged::Buffer(_) => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            Staged::File(file) => Pin::new(file).poll_shutdown(cx),
            Staged::Buffer(_) => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn stale_tmp_is_cleaned() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("tmp")).unwrap();
        std::fs::write(dir.path().join("tmp").join("leftover"), b"half").unwrap();

        BlobArea::open_filesystem(dir.path().to_path_buf())
            .await
            .expect("must open");

        assert!(!dir.path().join("tmp").join("leftover").exists());
        assert!(dir.path().join("data").is_dir());
    }

    async fn read_all(
        area: &BlobArea,
        id: &NodeId,
        attr_name: &str,
        file_name: &str,
        generation: &str,
    ) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        area.open_read(id, attr_name, file_name, generation)
            .await?
            .read_to_end(&mut buf)
            .await?;
        Ok(buf)
    }

    async fn staged_with(area: &BlobArea, data: &[u8]) -> Staged {
        let mut staged = area.stage().await.unwrap();
        staged.write_all(data).await.unwrap();
        staged.finish().await.unwrap();
        staged
    }

    #[tokio::test]
    async fn filesystem_place_and_read() {
        let dir = tempfile::TempDir::new().unwrap();
        let area = BlobArea::open_filesystem(dir.path().to_path_buf())
            .await
            .unwrap();
        let id = NodeId::new();
        let generation = new_generation();

        let staged = staged_with(&area, b"hello").await;
        area.place(&id, "script", "main.groovy", &generation, staged)
            .unwrap();

        assert!(derive_path(dir.path(), &id, "script", "main.groovy", &generation).exists());
        assert_eq!(0, std::fs::read_dir(dir.path().join("tmp")).unwrap().count());
        assert_eq!(
            b"hello".to_vec(),
            read_all(&area, &id, "script", "main.groovy", &generation)
                .await
                .unwrap()
        );

        area.remove_nodes(&[id]);
        assert!(!dir.path().join("data").join(id.to_string()).exists());
    }

    /// Placing a new generation never touches the previous one, so dropping
    /// the new generation (as done when its commit fails) leaves the previous
    /// content readable.
    #[rstest::rstest]
    #[case::filesystem(true)]
    #[case::memory(false)]
    #[tokio::test]
    async fn discarded_generation_keeps_previous(#[case] on_disk: bool) {
        let dir = tempfile::TempDir::new().unwrap();
        let area = if on_disk {
            BlobArea::open_filesystem(dir.path().to_path_buf())
                .await
                .unwrap()
        } else {
            BlobArea::memory()
        };
        let id = NodeId::new();

        let first = new_generation();
        let staged = staged_with(&area, b"v1").await;
        area.place(&id, "data", "f", &first, staged).unwrap();

        let second = new_generation();
        let staged = staged_with(&area, b"v2").await;
        area.place(&id, "data", "f", &second, staged).unwrap();
        assert_eq!(b"v1".to_vec(), read_all(&area, &id, "data", "f", &first).await.unwrap());

        area.discard(id, "data".into(), "f".into(), second.clone())
            .await;
        assert_eq!(b"v1".to_vec(), read_all(&area, &id, "data", "f", &first).await.unwrap());
        assert!(matches!(
            read_all(&area, &id, "data", "f", &second).await,
            Err(Error::NotFound(_))
        ));
    }
}
