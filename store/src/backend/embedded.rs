use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    path::PathBuf,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use async_trait::async_trait;
use parking_lot::RwLock;
use redb::{Database, ReadTransaction, ReadableTable, Table, TableDefinition, WriteTransaction};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{
    blob_area::{new_generation, BlobArea, Staged},
    DataSourceReader, DataSourceWriter, StoreBackend,
};
use crate::{
    node::{
        now_millis, validate_name, AttributeType, AttributeValue, BackwardDependency,
        NodeDependency, NodeId, NodeInfo, RootNode,
    },
    Error,
};

/// Node id -> JSON encoded [NodeRecord].
const NODES: TableDefinition<[u8; 16], Vec<u8>> = TableDefinition::new("nodes");
/// Parent id -> JSON encoded map of child name to child id.
const CHILDREN: TableDefinition<[u8; 16], Vec<u8>> = TableDefinition::new("children");
/// Target id -> JSON encoded set of [BackwardDependency].
const BACKWARD: TableDefinition<[u8; 16], Vec<u8>> = TableDefinition::new("backward");
const META: TableDefinition<&str, [u8; 16]> = TableDefinition::new("meta");

const META_ROOT: &str = "root";
const ROOT_PSEUDO_CLASS: &str = "folder";

type ChildMap = BTreeMap<String, NodeId>;
type BackwardSet = BTreeSet<BackwardDependency>;

/// Everything stored about a single node.
#[derive(Serialize, Deserialize)]
struct NodeRecord {
    info: NodeInfo,
    /// Inconsistent nodes are hidden from their parent's children.
    #[serde(default = "consistent_by_default")]
    consistent: bool,
    #[serde(default)]
    dependencies: BTreeMap<String, BTreeSet<NodeId>>,
    /// Attribute name -> file name -> the blob generation holding its content.
    #[serde(default)]
    data_sources: BTreeMap<String, BTreeMap<String, String>>,
}

fn consistent_by_default() -> bool {
    true
}

impl NodeRecord {
    fn new(parent_id: Option<NodeId>, name: &str, pseudo_class: &str, description: &str) -> Self {
        let now = now_millis();
        Self {
            consistent: true,
            info: NodeInfo {
                id: NodeId::new(),
                parent_id,
                name: name.to_string(),
                pseudo_class: pseudo_class.to_string(),
                description: description.to_string(),
                version: 0,
                creation_time: now,
                modification_time: now,
                attributes: BTreeMap::new(),
            },
            dependencies: BTreeMap::new(),
            data_sources: BTreeMap::new(),
        }
    }

    /// Bumps the version after a change of the node's own state.
    fn touch(&mut self) {
        self.info.version += 1;
        self.info.modification_time = now_millis().max(self.info.modification_time);
    }

    fn data_source_generation(&self, attr_name: &str, file_name: &str) -> Option<&String> {
        self.data_sources
            .get(attr_name)
            .and_then(|files| files.get(file_name))
    }
}

/// The in-process store.
///
/// Node metadata lives in a [redb] database, data source contents in a
/// [BlobArea] next to it. redb admits a single write transaction at a time,
/// and every mutation reads what it checks inside its own write transaction,
/// so mutations are linearizable. Reads use their own MVCC snapshot and never
/// block.
#[derive(Clone)]
pub struct EmbeddedStore {
    inner: Arc<Inner>,
}

struct Inner {
    // We wrap the db in an Arc to be able to move it into spawn_blocking,
    // as discussed in https://github.com/cberner/redb/issues/789
    // None once closed.
    db: RwLock<Option<Arc<Database>>>,
    blobs: BlobArea,
}

impl EmbeddedStore {
    /// Opens (or creates) a store in the given directory. It holds the
    /// database in `nodes.redb`, data sources in `data/` and staged writes in
    /// `tmp/`.
    pub async fn new(path: PathBuf) -> Result<Self, Error> {
        if path == PathBuf::from("/") {
            return Err(Error::ConfigurationError(
                "cowardly refusing to open / as embedded store".to_string(),
            ));
        }

        tokio::fs::create_dir_all(&path).await?;
        let blobs = BlobArea::open_filesystem(path.clone()).await?;

        let db = tokio::task::spawn_blocking(move || -> Result<_, Error> {
            let db = redb::Database::create(path.join("nodes.redb"))?;
            create_schema(&db)?;
            Ok(db)
        })
        .await??;

        Ok(Self::from_parts(db, blobs))
    }

    /// Constructs a new instance keeping everything in memory.
    pub fn new_temporary() -> Result<Self, Error> {
        let db =
            redb::Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        create_schema(&db)?;

        Ok(Self::from_parts(db, BlobArea::memory()))
    }

    fn from_parts(db: Database, blobs: BlobArea) -> Self {
        Self {
            inner: Arc::new(Inner {
                db: RwLock::new(Some(Arc::new(db))),
                blobs,
            }),
        }
    }
}

/// Ensures all tables are present.
fn create_schema(db: &redb::Database) -> Result<(), redb::Error> {
    let txn = db.begin_write()?;
    txn.open_table(NODES)?;
    txn.open_table(CHILDREN)?;
    txn.open_table(BACKWARD)?;
    txn.open_table(META)?;
    txn.commit()?;

    Ok(())
}

impl Inner {
    fn db(&self) -> Result<Arc<Database>, Error> {
        self.db.read().clone().ok_or_else(Error::closed)
    }

    /// Runs `f` with a read transaction on the blocking pool.
    async fn read<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&ReadTransaction) -> Result<T, Error> + Send + 'static,
    {
        let db = self.db()?;
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_read()?;
            f(&txn)
        })
        .await?
    }

    /// Runs `f` with a write transaction on the blocking pool, and commits if
    /// it succeeded. On error, the transaction is aborted.
    async fn write<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&WriteTransaction) -> Result<T, Error> + Send + 'static,
    {
        let db = self.db()?;
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_write()?;
            let res = f(&txn)?;
            txn.commit()?;
            Ok(res)
        })
        .await?
    }
}

fn get_json<T, R>(table: &R, id: &NodeId) -> Result<Option<T>, Error>
where
    T: DeserializeOwned,
    R: ReadableTable<[u8; 16], Vec<u8>>,
{
    match table.get(id.as_bytes())? {
        None => Ok(None),
        Some(data) => serde_json::from_slice(&data.value()).map(Some).map_err(|e| {
            warn!(err=%e, node.id=%id, "failed to decode record");
            Error::StorageError(format!("failed to decode record of {}", id))
        }),
    }
}

fn put_json<T: Serialize>(
    table: &mut Table<'_, [u8; 16], Vec<u8>>,
    id: &NodeId,
    value: &T,
) -> Result<(), Error> {
    let data = serde_json::to_vec(value)
        .map_err(|e| Error::StorageError(format!("failed to encode record: {}", e)))?;
    table.insert(id.as_bytes(), data)?;
    Ok(())
}

fn must_get_record<R>(nodes: &R, id: &NodeId) -> Result<NodeRecord, Error>
where
    R: ReadableTable<[u8; 16], Vec<u8>>,
{
    get_json(nodes, id)?.ok_or_else(|| Error::node_not_found(id))
}

fn get_children<R>(children: &R, id: &NodeId) -> Result<ChildMap, Error>
where
    R: ReadableTable<[u8; 16], Vec<u8>>,
{
    Ok(get_json(children, id)?.unwrap_or_default())
}

fn put_children(
    children: &mut Table<'_, [u8; 16], Vec<u8>>,
    id: &NodeId,
    map: &ChildMap,
) -> Result<(), Error> {
    if map.is_empty() {
        children.remove(id.as_bytes())?;
        Ok(())
    } else {
        put_json(children, id, map)
    }
}

fn update_backward(
    backward: &mut Table<'_, [u8; 16], Vec<u8>>,
    target: &NodeId,
    f: impl FnOnce(&mut BackwardSet),
) -> Result<(), Error> {
    let mut set: BackwardSet = get_json(&*backward, target)?.unwrap_or_default();
    f(&mut set);
    if set.is_empty() {
        backward.remove(target.as_bytes())?;
        Ok(())
    } else {
        put_json(backward, target, &set)
    }
}

/// Loads a node, applies `f` to it and stores it again.
fn modify_record<T>(
    txn: &WriteTransaction,
    id: &NodeId,
    f: impl FnOnce(&mut NodeRecord) -> Result<T, Error>,
) -> Result<T, Error> {
    let mut nodes = txn.open_table(NODES)?;
    let mut record = must_get_record(&nodes, id)?;
    let res = f(&mut record)?;
    put_json(&mut nodes, id, &record)?;
    Ok(res)
}

impl EmbeddedStore {
    /// Links a new record below `parent`, which must exist and must not have
    /// a child of the same name, consistent or not.
    async fn insert_child(&self, parent: NodeId, record: NodeRecord) -> Result<NodeInfo, Error> {
        validate_name(&record.info.name)?;

        self.inner
            .write(move |txn| {
                let mut nodes = txn.open_table(NODES)?;
                let mut children = txn.open_table(CHILDREN)?;

                must_get_record(&nodes, &parent)?;
                let mut siblings = get_children(&children, &parent)?;
                if siblings.contains_key(&record.info.name) {
                    return Err(Error::DuplicateChild {
                        parent,
                        name: record.info.name,
                    });
                }

                siblings.insert(record.info.name.clone(), record.info.id);
                put_children(&mut children, &parent, &siblings)?;
                put_json(&mut nodes, &record.info.id, &record)?;

                Ok(record.info)
            })
            .await
    }

    /// Returns the blob generation currently holding a data source file.
    async fn data_source_generation(
        &self,
        id: &NodeId,
        attr_name: &str,
        file_name: &str,
    ) -> Result<Option<String>, Error> {
        validate_name(attr_name)?;
        validate_name(file_name)?;

        let id = *id;
        let (attr_name, file_name) = (attr_name.to_string(), file_name.to_string());
        self.inner
            .read(move |txn| {
                let nodes = txn.open_table(NODES)?;
                Ok(must_get_record(&nodes, &id)?
                    .data_source_generation(&attr_name, &file_name)
                    .cloned())
            })
            .await
    }
}

#[async_trait]
impl StoreBackend for EmbeddedStore {
    #[instrument(skip(self))]
    async fn get_root_node(&self, drive_name: &str) -> Result<RootNode, Error> {
        validate_name(drive_name)?;

        let existing = self
            .inner
            .read(|txn| {
                let meta = txn.open_table(META)?;
                let root_id = match meta.get(META_ROOT)? {
                    None => return Ok(None),
                    Some(id) => NodeId::from_bytes(id.value()),
                };
                let nodes = txn.open_table(NODES)?;
                Ok(Some(must_get_record(&nodes, &root_id)?.info))
            })
            .await?;
        if let Some(info) = existing {
            return Ok(RootNode {
                info,
                created: false,
            });
        }

        let drive_name = drive_name.to_string();
        self.inner
            .write(move |txn| {
                let mut meta = txn.open_table(META)?;
                let mut nodes = txn.open_table(NODES)?;

                // somebody else might have been faster.
                let existing = meta.get(META_ROOT)?.map(|id| NodeId::from_bytes(id.value()));
                if let Some(root_id) = existing {
                    return Ok(RootNode {
                        info: must_get_record(&nodes, &root_id)?.info,
                        created: false,
                    });
                }

                let record = NodeRecord::new(None, &drive_name, ROOT_PSEUDO_CLASS, "");
                put_json(&mut nodes, &record.info.id, &record)?;
                meta.insert(META_ROOT, record.info.id.as_bytes())?;
                debug!(node.id=%record.info.id, "created root node");

                Ok(RootNode {
                    info: record.info,
                    created: true,
                })
            })
            .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn get_node_info(&self, id: &NodeId) -> Result<NodeInfo, Error> {
        let id = *id;
        self.inner
            .read(move |txn| {
                let nodes = txn.open_table(NODES)?;
                Ok(must_get_record(&nodes, &id)?.info)
            })
            .await
    }

    #[instrument(skip(self, description), fields(node.parent_id = %parent))]
    async fn create_node(
        &self,
        parent: &NodeId,
        name: &str,
        pseudo_class: &str,
        description: &str,
    ) -> Result<NodeInfo, Error> {
        let record = NodeRecord::new(Some(*parent), name, pseudo_class, description);
        self.insert_child(*parent, record).await
    }

    #[instrument(skip(self, description), fields(node.parent_id = %parent))]
    async fn create_inconsistent_node(
        &self,
        parent: &NodeId,
        name: &str,
        pseudo_class: &str,
        description: &str,
    ) -> Result<NodeInfo, Error> {
        let mut record = NodeRecord::new(Some(*parent), name, pseudo_class, description);
        record.consistent = false;
        self.insert_child(*parent, record).await
    }

    #[instrument(skip(self), fields(node.id = %parent))]
    async fn get_child_nodes(&self, parent: &NodeId) -> Result<Vec<NodeInfo>, Error> {
        let parent = *parent;
        self.inner
            .read(move |txn| {
                let nodes = txn.open_table(NODES)?;
                let children = txn.open_table(CHILDREN)?;

                must_get_record(&nodes, &parent)?;
                let mut infos = Vec::new();
                for child in get_children(&children, &parent)?.values() {
                    let record = must_get_record(&nodes, child)?;
                    if record.consistent {
                        infos.push(record.info);
                    }
                }
                Ok(infos)
            })
            .await
    }

    #[instrument(skip(self), fields(node.id = %parent))]
    async fn get_child_node(
        &self,
        parent: &NodeId,
        name: &str,
    ) -> Result<Option<NodeInfo>, Error> {
        validate_name(name)?;

        let parent = *parent;
        let name = name.to_string();
        self.inner
            .read(move |txn| {
                let nodes = txn.open_table(NODES)?;
                let children = txn.open_table(CHILDREN)?;

                must_get_record(&nodes, &parent)?;
                match get_children(&children, &parent)?.get(&name) {
                    None => Ok(None),
                    Some(child) => {
                        let record = must_get_record(&nodes, child)?;
                        Ok(record.consistent.then_some(record.info))
                    }
                }
            })
            .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn get_parent_node(&self, id: &NodeId) -> Result<Option<NodeInfo>, Error> {
        let id = *id;
        self.inner
            .read(move |txn| {
                let nodes = txn.open_table(NODES)?;
                match must_get_record(&nodes, &id)?.info.parent_id {
                    None => Ok(None),
                    Some(parent) => Ok(Some(must_get_record(&nodes, &parent)?.info)),
                }
            })
            .await
    }

    #[instrument(skip(self), fields(node.id = %id, node.new_parent_id = %new_parent))]
    async fn set_parent_node(&self, id: &NodeId, new_parent: &NodeId) -> Result<NodeId, Error> {
        let (id, new_parent) = (*id, *new_parent);
        self.inner
            .write(move |txn| {
                let mut nodes = txn.open_table(NODES)?;
                let mut children = txn.open_table(CHILDREN)?;

                let mut record = must_get_record(&nodes, &id)?;
                let old_parent = record
                    .info
                    .parent_id
                    .ok_or_else(|| Error::IllegalState("the root can't be moved".to_string()))?;

                // walk up from the new parent, we must not meet the node itself.
                let mut cursor = Some(new_parent);
                while let Some(ancestor) = cursor {
                    if ancestor == id {
                        return Err(Error::IllegalState(format!(
                            "can't move {} below its own subtree",
                            id
                        )));
                    }
                    cursor = must_get_record(&nodes, &ancestor)?.info.parent_id;
                }

                if old_parent != new_parent {
                    let mut siblings = get_children(&children, &new_parent)?;
                    if siblings.contains_key(&record.info.name) {
                        return Err(Error::DuplicateChild {
                            parent: new_parent,
                            name: record.info.name,
                        });
                    }
                    siblings.insert(record.info.name.clone(), id);
                    put_children(&mut children, &new_parent, &siblings)?;

                    let mut old_siblings = get_children(&children, &old_parent)?;
                    old_siblings.remove(&record.info.name);
                    put_children(&mut children, &old_parent, &old_siblings)?;
                }

                record.info.parent_id = Some(new_parent);
                record.touch();
                put_json(&mut nodes, &id, &record)?;

                Ok(old_parent)
            })
            .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn rename_node(&self, id: &NodeId, name: &str) -> Result<(), Error> {
        validate_name(name)?;

        let id = *id;
        let name = name.to_string();
        self.inner
            .write(move |txn| {
                let mut nodes = txn.open_table(NODES)?;
                let mut children = txn.open_table(CHILDREN)?;

                let mut record = must_get_record(&nodes, &id)?;
                let parent = record
                    .info
                    .parent_id
                    .ok_or_else(|| Error::IllegalState("the root can't be renamed".to_string()))?;

                if record.info.name != name {
                    let mut siblings = get_children(&children, &parent)?;
                    if siblings.contains_key(&name) {
                        return Err(Error::DuplicateChild { parent, name });
                    }
                    siblings.remove(&record.info.name);
                    siblings.insert(name.clone(), id);
                    put_children(&mut children, &parent, &siblings)?;
                }

                record.info.name = name;
                record.touch();
                put_json(&mut nodes, &id, &record)
            })
            .await
    }

    #[instrument(skip(self, description), fields(node.id = %id))]
    async fn set_description(&self, id: &NodeId, description: &str) -> Result<(), Error> {
        let id = *id;
        let description = description.to_string();
        self.inner
            .write(move |txn| {
                modify_record(txn, &id, |record| {
                    record.info.description = description;
                    record.touch();
                    Ok(())
                })
            })
            .await
    }

    #[instrument(skip(self, value), fields(node.id = %id))]
    async fn set_attribute(
        &self,
        id: &NodeId,
        name: &str,
        value: AttributeValue,
    ) -> Result<(), Error> {
        validate_name(name)?;
        value.validate()?;

        let id = *id;
        let name = name.to_string();
        self.inner
            .write(move |txn| {
                modify_record(txn, &id, |record| {
                    if let Some(existing) = record.info.attributes.get(&name) {
                        if existing.attribute_type() != value.attribute_type() {
                            return Err(Error::TypeMismatch {
                                node: id,
                                stored: existing.attribute_type(),
                                requested: value.attribute_type(),
                                name,
                            });
                        }
                    }
                    record.info.attributes.insert(name, value);
                    record.touch();
                    Ok(())
                })
            })
            .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn get_attribute(
        &self,
        id: &NodeId,
        name: &str,
        attr_type: AttributeType,
    ) -> Result<Option<AttributeValue>, Error> {
        validate_name(name)?;

        let id = *id;
        let name = name.to_string();
        self.inner
            .read(move |txn| {
                let nodes = txn.open_table(NODES)?;
                let mut record = must_get_record(&nodes, &id)?;
                match record.info.attributes.remove(&name) {
                    None => Ok(None),
                    Some(value) if value.attribute_type() != attr_type => {
                        Err(Error::TypeMismatch {
                            node: id,
                            name,
                            stored: value.attribute_type(),
                            requested: attr_type,
                        })
                    }
                    Some(value) => Ok(Some(value)),
                }
            })
            .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn remove_attribute(&self, id: &NodeId, name: &str) -> Result<bool, Error> {
        validate_name(name)?;

        let id = *id;
        let name = name.to_string();
        self.inner
            .write(move |txn| {
                modify_record(txn, &id, |record| {
                    let removed = record.info.attributes.remove(&name).is_some();
                    if removed {
                        record.touch();
                    }
                    Ok(removed)
                })
            })
            .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn open_data_source_write(
        &self,
        id: &NodeId,
        attr_name: &str,
        file_name: &str,
    ) -> Result<Box<dyn DataSourceWriter>, Error> {
        validate_name(attr_name)?;
        validate_name(file_name)?;

        // fail early if the node doesn't exist, commit checks again.
        self.get_node_info(id).await?;
        let staged = self.inner.blobs.stage().await?;

        Ok(Box::new(EmbeddedDataSourceWriter {
            inner: self.inner.clone(),
            id: *id,
            attr_name: attr_name.to_string(),
            file_name: file_name.to_string(),
            staged: Some(staged),
            committed: false,
        }))
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn open_data_source_read(
        &self,
        id: &NodeId,
        attr_name: &str,
        file_name: &str,
    ) -> Result<Box<dyn DataSourceReader>, Error> {
        let mut generation = self.data_source_generation(id, attr_name, file_name).await?;
        loop {
            let Some(current) = generation else {
                return Err(Error::NotFound(format!(
                    "data source {}/{} of node {}",
                    attr_name, file_name, id
                )));
            };

            match self
                .inner
                .blobs
                .open_read(id, attr_name, file_name, &current)
                .await
            {
                // a concurrent write replaced (and removed) the generation we
                // looked up, look again.
                Err(Error::NotFound(_)) => {
                    generation = self.data_source_generation(id, attr_name, file_name).await?;
                    if generation.as_ref() == Some(&current) {
                        return Err(Error::StorageError(format!(
                            "content of data source {}/{} of node {} is missing",
                            attr_name, file_name, id
                        )));
                    }
                }
                res => return res,
            }
        }
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn data_source_file_exists(
        &self,
        id: &NodeId,
        attr_name: &str,
        file_name: &str,
    ) -> Result<bool, Error> {
        Ok(self
            .data_source_generation(id, attr_name, file_name)
            .await?
            .is_some())
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn list_data_source_files(
        &self,
        id: &NodeId,
        attr_name: &str,
    ) -> Result<Vec<String>, Error> {
        validate_name(attr_name)?;

        let id = *id;
        let attr_name = attr_name.to_string();
        self.inner
            .read(move |txn| {
                let nodes = txn.open_table(NODES)?;
                Ok(must_get_record(&nodes, &id)?
                    .data_sources
                    .remove(&attr_name)
                    .map(|files| files.into_keys().collect())
                    .unwrap_or_default())
            })
            .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn get_data_source_names(&self, id: &NodeId) -> Result<Vec<String>, Error> {
        let id = *id;
        self.inner
            .read(move |txn| {
                let nodes = txn.open_table(NODES)?;
                Ok(must_get_record(&nodes, &id)?
                    .data_sources
                    .into_keys()
                    .collect())
            })
            .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn remove_data_source_file(
        &self,
        id: &NodeId,
        attr_name: &str,
        file_name: &str,
    ) -> Result<bool, Error> {
        validate_name(attr_name)?;
        validate_name(file_name)?;

        let id = *id;
        let (attr_name, file_name) = (attr_name.to_string(), file_name.to_string());
        let (attr, file) = (attr_name.clone(), file_name.clone());
        let removed = self
            .inner
            .write(move |txn| {
                modify_record(txn, &id, |record| {
                    let Some(files) = record.data_sources.get_mut(&attr) else {
                        return Ok(None);
                    };
                    let Some(generation) = files.remove(&file) else {
                        return Ok(None);
                    };
                    if files.is_empty() {
                        record.data_sources.remove(&attr);
                    }

                    record.touch();
                    Ok(Some(generation))
                })
            })
            .await?;

        // the content goes only once the record doesn't point to it anymore.
        match removed {
            None => Ok(false),
            Some(generation) => {
                self.inner
                    .blobs
                    .discard(id, attr_name, file_name, generation)
                    .await;
                Ok(true)
            }
        }
    }

    #[instrument(skip(self), fields(node.id = %id, node.target_id = %target))]
    async fn add_dependency(&self, id: &NodeId, name: &str, target: &NodeId) -> Result<(), Error> {
        validate_name(name)?;

        let (id, target) = (*id, *target);
        let name = name.to_string();
        self.inner
            .write(move |txn| {
                let mut nodes = txn.open_table(NODES)?;
                let mut backward = txn.open_table(BACKWARD)?;

                let mut record = must_get_record(&nodes, &id)?;
                must_get_record(&nodes, &target)?;

                if record
                    .dependencies
                    .entry(name.clone())
                    .or_default()
                    .insert(target)
                {
                    record.touch();
                    put_json(&mut nodes, &id, &record)?;
                    update_backward(&mut backward, &target, |set| {
                        set.insert(BackwardDependency {
                            name,
                            source_id: id,
                        });
                    })?;
                }

                Ok(())
            })
            .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn get_dependencies(&self, id: &NodeId, name: &str) -> Result<Vec<NodeId>, Error> {
        validate_name(name)?;

        let id = *id;
        let name = name.to_string();
        self.inner
            .read(move |txn| {
                let nodes = txn.open_table(NODES)?;
                Ok(must_get_record(&nodes, &id)?
                    .dependencies
                    .remove(&name)
                    .map(|targets| targets.into_iter().collect())
                    .unwrap_or_default())
            })
            .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn get_all_dependencies(&self, id: &NodeId) -> Result<Vec<NodeDependency>, Error> {
        let id = *id;
        self.inner
            .read(move |txn| {
                let nodes = txn.open_table(NODES)?;
                Ok(must_get_record(&nodes, &id)?
                    .dependencies
                    .into_iter()
                    .flat_map(|(name, targets)| {
                        targets.into_iter().map(move |target_id| NodeDependency {
                            name: name.clone(),
                            target_id,
                        })
                    })
                    .collect())
            })
            .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn get_backward_dependencies(
        &self,
        id: &NodeId,
    ) -> Result<Vec<BackwardDependency>, Error> {
        let id = *id;
        self.inner
            .read(move |txn| {
                let nodes = txn.open_table(NODES)?;
                let backward = txn.open_table(BACKWARD)?;

                must_get_record(&nodes, &id)?;
                let set: BackwardSet = get_json(&backward, &id)?.unwrap_or_default();
                Ok(set.into_iter().collect())
            })
            .await
    }

    #[instrument(skip(self), fields(node.id = %id, node.target_id = %target))]
    async fn remove_dependency(
        &self,
        id: &NodeId,
        name: &str,
        target: &NodeId,
    ) -> Result<bool, Error> {
        validate_name(name)?;

        let (id, target) = (*id, *target);
        let name = name.to_string();
        self.inner
            .write(move |txn| {
                let mut nodes = txn.open_table(NODES)?;
                let mut backward = txn.open_table(BACKWARD)?;

                let mut record = must_get_record(&nodes, &id)?;
                let Some(targets) = record.dependencies.get_mut(&name) else {
                    return Ok(false);
                };
                if !targets.remove(&target) {
                    return Ok(false);
                }
                if targets.is_empty() {
                    record.dependencies.remove(&name);
                }

                record.touch();
                put_json(&mut nodes, &id, &record)?;
                update_backward(&mut backward, &target, |set| {
                    set.remove(&BackwardDependency {
                        name,
                        source_id: id,
                    });
                })?;

                Ok(true)
            })
            .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn set_consistent(&self, id: &NodeId) -> Result<bool, Error> {
        let id = *id;
        self.inner
            .write(move |txn| {
                modify_record(txn, &id, |record| {
                    let changed = !record.consistent;
                    record.consistent = true;
                    Ok(changed)
                })
            })
            .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn is_consistent(&self, id: &NodeId) -> Result<bool, Error> {
        let id = *id;
        self.inner
            .read(move |txn| {
                let nodes = txn.open_table(NODES)?;
                Ok(must_get_record(&nodes, &id)?.consistent)
            })
            .await
    }

    #[instrument(skip(self))]
    async fn get_inconsistent_nodes(&self) -> Result<Vec<NodeInfo>, Error> {
        self.inner
            .read(|txn| {
                let meta = txn.open_table(META)?;
                let Some(root_id) = meta.get(META_ROOT)?.map(|id| NodeId::from_bytes(id.value()))
                else {
                    return Ok(Vec::new());
                };
                let nodes = txn.open_table(NODES)?;
                let children = txn.open_table(CHILDREN)?;

                // inconsistent subtrees are reported by their top node only.
                let mut found = Vec::new();
                let mut queue = VecDeque::from([root_id]);
                while let Some(current) = queue.pop_front() {
                    for child in get_children(&children, &current)?.into_values() {
                        let record = must_get_record(&nodes, &child)?;
                        if record.consistent {
                            queue.push_back(child);
                        } else {
                            found.push(record.info);
                        }
                    }
                }
                Ok(found)
            })
            .await
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn is_writable(&self, id: &NodeId) -> Result<bool, Error> {
        self.get_node_info(id).await.map(|_| true)
    }

    #[instrument(skip(self), fields(node.id = %id))]
    async fn delete_node(&self, id: &NodeId) -> Result<NodeId, Error> {
        let id = *id;
        let (parent, removed) = self
            .inner
            .write(move |txn| {
                let mut nodes = txn.open_table(NODES)?;
                let mut children = txn.open_table(CHILDREN)?;
                let mut backward = txn.open_table(BACKWARD)?;

                let record = must_get_record(&nodes, &id)?;
                let parent = record
                    .info
                    .parent_id
                    .ok_or_else(|| Error::IllegalState("the root can't be deleted".to_string()))?;

                // collect the whole subtree, breadth first.
                let mut removed = Vec::new();
                let mut queue = VecDeque::from([id]);
                while let Some(current) = queue.pop_front() {
                    queue.extend(get_children(&children, &current)?.into_values());
                    removed.push(current);
                }
                let removed_set: BTreeSet<NodeId> = removed.iter().copied().collect();

                for node in &removed {
                    let record = must_get_record(&nodes, node)?;

                    // edges leaving the subtree disappear from their targets.
                    // Edges pointing into the subtree stay where they are.
                    for (name, targets) in &record.dependencies {
                        for target in targets.iter().filter(|t| !removed_set.contains(*t)) {
                            update_backward(&mut backward, target, |set| {
                                set.remove(&BackwardDependency {
                                    name: name.clone(),
                                    source_id: *node,
                                });
                            })?;
                        }
                    }

                    nodes.remove(node.as_bytes())?;
                    children.remove(node.as_bytes())?;
                    backward.remove(node.as_bytes())?;
                }

                let mut siblings = get_children(&children, &parent)?;
                siblings.remove(&record.info.name);
                put_children(&mut children, &parent, &siblings)?;

                Ok((parent, removed))
            })
            .await?;

        debug!(removed = removed.len(), "deleted subtree");

        let blobs = self.inner.blobs.clone();
        tokio::task::spawn_blocking(move || blobs.remove_nodes(&removed)).await?;

        Ok(parent)
    }

    async fn flush(&self) -> Result<(), Error> {
        // every mutation commits with immediate durability, there's nothing
        // left to do besides checking we're still open.
        self.inner.db().map(|_| ())
    }

    #[instrument(skip(self))]
    async fn close(&self) -> Result<(), Error> {
        if self.inner.db.write().take().is_some() {
            debug!("closed embedded store");
        }
        Ok(())
    }
}

/// Writes into the blob area's staging space. On [DataSourceWriter::close],
/// the content moves into a new blob generation, and the write transaction
/// switches the node's record over to it. The previous content stays
/// readable until that transaction committed.
pub struct EmbeddedDataSourceWriter {
    inner: Arc<Inner>,
    id: NodeId,
    attr_name: String,
    file_name: String,

    /// The staged content, or None if already closed.
    staged: Option<Staged>,
    committed: bool,
}

impl EmbeddedDataSourceWriter {
    fn staged(&mut self) -> Result<&mut Staged, std::io::Error> {
        self.staged.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "already closed")
        })
    }
}

impl tokio::io::AsyncWrite for EmbeddedDataSourceWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut().staged() {
            Ok(staged) => Pin::new(staged).poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut().staged() {
            Ok(staged) => Pin::new(staged).poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        // nothing becomes visible before close.
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl DataSourceWriter for EmbeddedDataSourceWriter {
    #[instrument(skip_all, fields(node.id = %self.id))]
    async fn close(&mut self) -> Result<(), Error> {
        let Some(mut staged) = self.staged.take() else {
            return if self.committed {
                Ok(())
            } else {
                Err(Error::IllegalState(
                    "previously closed with error".to_string(),
                ))
            };
        };

        staged.finish().await?;

        let id = self.id;
        let (attr_name, file_name) = (self.attr_name.clone(), self.file_name.clone());
        let generation = new_generation();
        let blobs = self.inner.blobs.clone();
        let res = {
            let (attr_name, file_name, generation) =
                (attr_name.clone(), file_name.clone(), generation.clone());
            self.inner
                .write(move |txn| {
                    modify_record(txn, &id, |record| {
                        blobs.place(&id, &attr_name, &file_name, &generation, staged)?;
                        let previous = record
                            .data_sources
                            .entry(attr_name)
                            .or_default()
                            .insert(file_name, generation);
                        record.touch();
                        Ok(previous)
                    })
                })
                .await
        };

        // whichever generation isn't referenced after the transaction goes.
        let unused = match res {
            Ok(previous) => {
                self.committed = true;
                previous
            }
            Err(e) => {
                self.inner
                    .blobs
                    .discard(id, attr_name, file_name, generation)
                    .await;
                return Err(e);
            }
        };
        if let Some(previous) = unused {
            self.inner
                .blobs
                .discard(id, attr_name, file_name, previous)
                .await;
        }
        Ok(())
    }
}
