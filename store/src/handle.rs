use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    appdata::AfsPath,
    archive,
    backend::StoreBackend,
    listenable::ListenableStore,
    node::{AttributeType, AttributeValue, NodeId, NodeInfo},
    Error,
};

/// A node of a mounted drive, as exposed to calling code.
///
/// It carries a snapshot of the node's [NodeInfo], taken when the handle was
/// obtained. [NodeHandle::refresh] re-reads it.
#[derive(Clone)]
pub struct NodeHandle {
    drive: Arc<str>,
    store: Arc<ListenableStore>,
    info: NodeInfo,
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle")
            .field("drive", &self.drive)
            .field("info", &self.info)
            .finish()
    }
}

impl NodeHandle {
    pub fn new(drive: Arc<str>, store: Arc<ListenableStore>, info: NodeInfo) -> Self {
        Self { drive, store, info }
    }

    fn wrap(&self, info: NodeInfo) -> Self {
        Self::new(self.drive.clone(), self.store.clone(), info)
    }

    pub fn id(&self) -> NodeId {
        self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn pseudo_class(&self) -> &str {
        &self.info.pseudo_class
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn drive(&self) -> &str {
        &self.drive
    }

    pub fn store(&self) -> &Arc<ListenableStore> {
        &self.store
    }

    /// Re-reads the node from the store.
    pub async fn refresh(&self) -> Result<Self, Error> {
        Ok(self.wrap(self.store.get_node_info(&self.info.id).await?))
    }

    /// Returns the path of the node, by walking up to the root.
    pub async fn path(&self) -> Result<AfsPath, Error> {
        let mut components = Vec::new();
        let mut current = self.info.clone();
        while !current.is_root() {
            let parent = self
                .store
                .get_parent_node(&current.id)
                .await?
                .ok_or_else(|| Error::IllegalState(format!("{} lost its parent", current.id)))?;
            components.push(std::mem::replace(&mut current, parent).name);
        }
        components.reverse();

        Ok(AfsPath::new(self.drive.to_string(), components))
    }

    pub async fn parent(&self) -> Result<Option<Self>, Error> {
        Ok(self
            .store
            .get_parent_node(&self.info.id)
            .await?
            .map(|info| self.wrap(info)))
    }

    pub async fn children(&self) -> Result<Vec<Self>, Error> {
        Ok(self
            .store
            .get_child_nodes(&self.info.id)
            .await?
            .into_iter()
            .map(|info| self.wrap(info))
            .collect())
    }

    pub async fn child(&self, name: &str) -> Result<Option<Self>, Error> {
        Ok(self
            .store
            .get_child_node(&self.info.id, name)
            .await?
            .map(|info| self.wrap(info)))
    }

    pub async fn create_child(
        &self,
        name: &str,
        pseudo_class: &str,
        description: &str,
    ) -> Result<Self, Error> {
        let info = self
            .store
            .create_node(&self.info.id, name, pseudo_class, description)
            .await?;
        Ok(self.wrap(info))
    }

    /// Resolves another node of the same drive by id.
    pub async fn resolve(&self, id: &NodeId) -> Result<Self, Error> {
        Ok(self.wrap(self.store.get_node_info(id).await?))
    }

    pub async fn get_attribute(
        &self,
        name: &str,
        attr_type: AttributeType,
    ) -> Result<Option<AttributeValue>, Error> {
        self.store
            .get_attribute(&self.info.id, name, attr_type)
            .await
    }

    pub async fn get_string(&self, name: &str) -> Result<Option<String>, Error> {
        Ok(self
            .get_attribute(name, AttributeType::String)
            .await?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    pub async fn set_attribute(&self, name: &str, value: AttributeValue) -> Result<(), Error> {
        self.store.set_attribute(&self.info.id, name, value).await
    }

    /// Replaces a data source file with `data`.
    pub async fn write_data_source(
        &self,
        attr_name: &str,
        file_name: &str,
        data: &[u8],
    ) -> Result<(), Error> {
        let mut writer = self
            .store
            .open_data_source_write(&self.info.id, attr_name, file_name)
            .await?;
        writer.write_all(data).await?;
        writer.close().await
    }

    pub async fn read_data_source(&self, attr_name: &str, file_name: &str) -> Result<Vec<u8>, Error> {
        let mut reader = self
            .store
            .open_data_source_read(&self.info.id, attr_name, file_name)
            .await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    /// Archives the node with its subtree below `dir`, see [crate::archive].
    pub async fn archive(&self, dir: &Path) -> Result<PathBuf, Error> {
        archive::archive(self.store.as_ref(), &self.info.id, dir).await
    }

    /// Restores an archived node as a new child of this one.
    pub async fn unarchive(&self, node_dir: &Path) -> Result<Self, Error> {
        let info = archive::unarchive(self.store.as_ref(), &self.info.id, node_dir).await?;
        Ok(self.wrap(info))
    }

    /// Deletes the node with its subtree.
    pub async fn delete(self) -> Result<(), Error> {
        self.store.delete_node(&self.info.id).await.map(|_| ())
    }
}
