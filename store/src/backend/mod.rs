use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::events::NodeEvent;
use crate::node::{
    AttributeType, AttributeValue, BackwardDependency, NodeDependency, NodeId, NodeInfo, RootNode,
};
use crate::Error;

mod blob_area;
mod embedded;
mod from_addr;
mod remote;

#[cfg(test)]
pub(crate) mod tests;

pub use self::embedded::EmbeddedStore;
pub use self::from_addr::from_addr;
pub use self::remote::{list_remote_drives, RemoteStore, RemoteStoreConfig};

/// The contract every storage engine implements.
///
/// It provides navigation of the containment tree, typed attributes, binary
/// data sources attached to attribute names, named dependency edges between
/// nodes and lifecycle control.
/// All mutating calls are committed when they return successfully.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Returns the root node of the store, creating it (named after the drive)
    /// if it doesn't exist yet. Idempotent.
    async fn get_root_node(&self, drive_name: &str) -> Result<RootNode, Error>;

    async fn get_node_info(&self, id: &NodeId) -> Result<NodeInfo, Error>;

    /// Creates a child of `parent`. Fails with [Error::DuplicateChild] if a
    /// child with the same name exists already.
    async fn create_node(
        &self,
        parent: &NodeId,
        name: &str,
        pseudo_class: &str,
        description: &str,
    ) -> Result<NodeInfo, Error>;

    /// Creates a child of `parent` which stays hidden from
    /// [StoreBackend::get_child_nodes] and [StoreBackend::get_child_node]
    /// until [StoreBackend::set_consistent] was called on it. It's reachable
    /// by id meanwhile, and holds its name among its siblings.
    async fn create_inconsistent_node(
        &self,
        parent: &NodeId,
        name: &str,
        pseudo_class: &str,
        description: &str,
    ) -> Result<NodeInfo, Error>;

    /// Returns all consistent children, sorted by name.
    async fn get_child_nodes(&self, parent: &NodeId) -> Result<Vec<NodeInfo>, Error>;

    async fn get_child_node(&self, parent: &NodeId, name: &str)
        -> Result<Option<NodeInfo>, Error>;

    /// Returns the parent, or None for the root.
    async fn get_parent_node(&self, id: &NodeId) -> Result<Option<NodeInfo>, Error>;

    /// Moves a node below another parent, keeping its name. Returns the id
    /// of the former parent.
    async fn set_parent_node(&self, id: &NodeId, new_parent: &NodeId)
        -> Result<NodeId, Error>;

    async fn rename_node(&self, id: &NodeId, name: &str) -> Result<(), Error>;

    async fn set_description(&self, id: &NodeId, description: &str) -> Result<(), Error>;

    /// Sets an attribute. Fails with [Error::TypeMismatch] if the attribute
    /// exists with another type.
    async fn set_attribute(
        &self,
        id: &NodeId,
        name: &str,
        value: AttributeValue,
    ) -> Result<(), Error>;

    /// Returns the attribute, if set. Fails with [Error::TypeMismatch] if it
    /// is stored with another type than requested.
    async fn get_attribute(
        &self,
        id: &NodeId,
        name: &str,
        attr_type: AttributeType,
    ) -> Result<Option<AttributeValue>, Error>;

    /// Removes an attribute, returns whether it existed.
    async fn remove_attribute(&self, id: &NodeId, name: &str) -> Result<bool, Error>;

    /// Opens a writer for a data source file. The content becomes visible
    /// atomically once [DataSourceWriter::close] returned successfully,
    /// replacing any previous content.
    async fn open_data_source_write(
        &self,
        id: &NodeId,
        attr_name: &str,
        file_name: &str,
    ) -> Result<Box<dyn DataSourceWriter>, Error>;

    /// Opens a reader for a data source file. Fails with [Error::NotFound]
    /// if it doesn't exist.
    async fn open_data_source_read(
        &self,
        id: &NodeId,
        attr_name: &str,
        file_name: &str,
    ) -> Result<Box<dyn DataSourceReader>, Error>;

    async fn data_source_file_exists(
        &self,
        id: &NodeId,
        attr_name: &str,
        file_name: &str,
    ) -> Result<bool, Error>;

    /// Returns the file names below a data source attribute, sorted.
    async fn list_data_source_files(
        &self,
        id: &NodeId,
        attr_name: &str,
    ) -> Result<Vec<String>, Error>;

    /// Returns the names of all attributes carrying data source files, sorted.
    async fn get_data_source_names(&self, id: &NodeId) -> Result<Vec<String>, Error>;

    /// Removes a data source file, returns whether it existed.
    async fn remove_data_source_file(
        &self,
        id: &NodeId,
        attr_name: &str,
        file_name: &str,
    ) -> Result<bool, Error>;

    /// Adds a named edge to `target`. Adding an existing edge again doesn't
    /// change anything.
    async fn add_dependency(&self, id: &NodeId, name: &str, target: &NodeId)
        -> Result<(), Error>;

    /// Returns the targets of all edges with the given name. These might
    /// point to nodes which were deleted since.
    async fn get_dependencies(&self, id: &NodeId, name: &str) -> Result<Vec<NodeId>, Error>;

    async fn get_all_dependencies(&self, id: &NodeId) -> Result<Vec<NodeDependency>, Error>;

    /// Returns the edges pointing at this node.
    async fn get_backward_dependencies(
        &self,
        id: &NodeId,
    ) -> Result<Vec<BackwardDependency>, Error>;

    /// Removes an edge, returns whether it existed.
    async fn remove_dependency(
        &self,
        id: &NodeId,
        name: &str,
        target: &NodeId,
    ) -> Result<bool, Error>;

    /// Marks a node as consistent. Returns whether it was inconsistent before.
    async fn set_consistent(&self, id: &NodeId) -> Result<bool, Error>;

    async fn is_consistent(&self, id: &NodeId) -> Result<bool, Error>;

    /// Returns the topmost inconsistent nodes, found by walking the tree from
    /// the root through consistent nodes only.
    async fn get_inconsistent_nodes(&self) -> Result<Vec<NodeInfo>, Error>;

    /// Whether the node accepts mutations.
    async fn is_writable(&self, id: &NodeId) -> Result<bool, Error>;

    /// Deletes a node with all its descendants and their data sources.
    /// Returns the id of the former parent. The root can't be deleted.
    async fn delete_node(&self, id: &NodeId) -> Result<NodeId, Error>;

    /// Makes all previous mutations durable.
    async fn flush(&self) -> Result<(), Error>;

    /// Releases all resources. Calling it again is a no-op, every other call
    /// afterwards fails with [Error::IllegalState].
    async fn close(&self) -> Result<(), Error>;

    /// Backends observing mutations done elsewhere (like a remote store,
    /// mutated through a server) provide their feed of events here, once.
    /// Returns None for backends only mutated through their own calls.
    fn take_event_feed(&self) -> Option<mpsc::Receiver<NodeEvent>> {
        None
    }
}

#[async_trait]
impl<A> StoreBackend for A
where
    A: AsRef<dyn StoreBackend> + Send + Sync,
{
    async fn get_root_node(&self, drive_name: &str) -> Result<RootNode, Error> {
        self.as_ref().get_root_node(drive_name).await
    }

    async fn get_node_info(&self, id: &NodeId) -> Result<NodeInfo, Error> {
        self.as_ref().get_node_info(id).await
    }

    async fn create_node(
        &self,
        parent: &NodeId,
        name: &str,
        pseudo_class: &str,
        description: &str,
    ) -> Result<NodeInfo, Error> {
        self.as_ref()
            .create_node(parent, name, pseudo_class, description)
            .await
    }

    async fn create_inconsistent_node(
        &self,
        parent: &NodeId,
        name: &str,
        pseudo_class: &str,
        description: &str,
    ) -> Result<NodeInfo, Error> {
        self.as_ref()
            .create_inconsistent_node(parent, name, pseudo_class, description)
            .await
    }

    async fn get_child_nodes(&self, parent: &NodeId) -> Result<Vec<NodeInfo>, Error> {
        self.as_ref().get_child_nodes(parent).await
    }

    async fn get_child_node(
        &self,
        parent: &NodeId,
        name: &str,
    ) -> Result<Option<NodeInfo>, Error> {
        self.as_ref().get_child_node(parent, name).await
    }

    async fn get_parent_node(&self, id: &NodeId) -> Result<Option<NodeInfo>, Error> {
        self.as_ref().get_parent_node(id).await
    }

    async fn set_parent_node(
        &self,
        id: &NodeId,
        new_parent: &NodeId,
    ) -> Result<NodeId, Error> {
        self.as_ref().set_parent_node(id, new_parent).await
    }

    async fn rename_node(&self, id: &NodeId, name: &str) -> Result<(), Error> {
        self.as_ref().rename_node(id, name).await
    }

    async fn set_description(&self, id: &NodeId, description: &str) -> Result<(), Error> {
        self.as_ref().set_description(id, description).await
    }

    async fn set_attribute(
        &self,
        id: &NodeId,
        name: &str,
        value: AttributeValue,
    ) -> Result<(), Error> {
        self.as_ref().set_attribute(id, name, value).await
    }

    async fn get_attribute(
        &self,
        id: &NodeId,
        name: &str,
        attr_type: AttributeType,
    ) -> Result<Option<AttributeValue>, Error> {
        self.as_ref().get_attribute(id, name, attr_type).await
    }

    async fn remove_attribute(&self, id: &NodeId, name: &str) -> Result<bool, Error> {
        self.as_ref().remove_attribute(id, name).await
    }

    async fn open_data_source_write(
        &self,
        id: &NodeId,
        attr_name: &str,
        file_name: &str,
    ) -> Result<Box<dyn DataSourceWriter>, Error> {
        self.as_ref()
            .open_data_source_write(id, attr_name, file_name)
            .await
    }

    async fn open_data_source_read(
        &self,
        id: &NodeId,
        attr_name: &str,
        file_name: &str,
    ) -> Result<Box<dyn DataSourceReader>, Error> {
        self.as_ref()
            .open_data_source_read(id, attr_name, file_name)
            .await
    }

    async fn data_source_file_exists(
        &self,
        id: &NodeId,
        attr_name: &str,
        file_name: &str,
    ) -> Result<bool, Error> {
        self.as_ref()
            .data_source_file_exists(id, attr_name, file_name)
            .await
    }

    async fn list_data_source_files(
        &self,
        id: &NodeId,
        attr_name: &str,
    ) -> Result<Vec<String>, Error> {
        self.as_ref().list_data_source_files(id, attr_name).await
    }

    async fn get_data_source_names(&self, id: &NodeId) -> Result<Vec<String>, Error> {
        self.as_ref().get_data_source_names(id).await
    }

    async fn remove_data_source_file(
        &self,
        id: &NodeId,
        attr_name: &str,
        file_name: &str,
    ) -> Result<bool, Error> {
        self.as_ref()
            .remove_data_source_file(id, attr_name, file_name)
            .await
    }

    async fn add_dependency(
        &self,
        id: &NodeId,
        name: &str,
        target: &NodeId,
    ) -> Result<(), Error> {
        self.as_ref().add_dependency(id, name, target).await
    }

    async fn get_dependencies(&self, id: &NodeId, name: &str) -> Result<Vec<NodeId>, Error> {
        self.as_ref().get_dependencies(id, name).await
    }

    async fn get_all_dependencies(&self, id: &NodeId) -> Result<Vec<NodeDependency>, Error> {
        self.as_ref().get_all_dependencies(id).await
    }

    async fn get_backward_dependencies(
        &self,
        id: &NodeId,
    ) -> Result<Vec<BackwardDependency>, Error> {
        self.as_ref().get_backward_dependencies(id).await
    }

    async fn remove_dependency(
        &self,
        id: &NodeId,
        name: &str,
        target: &NodeId,
    ) -> Result<bool, Error> {
        self.as_ref().remove_dependency(id, name, target).await
    }

    async fn set_consistent(&self, id: &NodeId) -> Result<bool, Error> {
        self.as_ref().set_consistent(id).await
    }

    async fn is_consistent(&self, id: &NodeId) -> Result<bool, Error> {
        self.as_ref().is_consistent(id).await
    }

    async fn get_inconsistent_nodes(&self) -> Result<Vec<NodeInfo>, Error> {
        self.as_ref().get_inconsistent_nodes().await
    }

    async fn is_writable(&self, id: &NodeId) -> Result<bool, Error> {
        self.as_ref().is_writable(id).await
    }

    async fn delete_node(&self, id: &NodeId) -> Result<NodeId, Error> {
        self.as_ref().delete_node(id).await
    }

    async fn flush(&self) -> Result<(), Error> {
        self.as_ref().flush().await
    }

    async fn close(&self) -> Result<(), Error> {
        self.as_ref().close().await
    }

    fn take_event_feed(&self) -> Option<mpsc::Receiver<NodeEvent>> {
        self.as_ref().take_event_feed()
    }
}

/// A writer for a data source file, returned by
/// [StoreBackend::open_data_source_write].
///
/// Dropping it without calling [DataSourceWriter::close] discards everything
/// written.
#[async_trait]
pub trait DataSourceWriter: tokio::io::AsyncWrite + Send + Unpin {
    /// Commits the written content. Calling it again after a successful
    /// close is a no-op.
    async fn close(&mut self) -> Result<(), Error>;
}

/// A reader for a data source file.
pub trait DataSourceReader: tokio::io::AsyncRead + Send + Unpin + 'static {}

impl<T> DataSourceReader for T where T: tokio::io::AsyncRead + Send + Unpin + 'static {}
