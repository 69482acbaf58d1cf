//! Exports node subtrees into a plain directory tree, and imports them again.
//!
//! A node archived below `DIR` lands in `DIR/NODE_ID/`:
//!
//! - `info.json`: its [NodeInfo], pretty-printed.
//! - `dependencies.json`: its outgoing [NodeDependency] edges, if it has any.
//! - `data/HEX(attr)/HEX(file).gz`: its data source files, gzip compressed.
//! - `children/`: the archives of its (consistent) children, same layout.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use async_compression::tokio::{bufread::GzipDecoder, write::GzipEncoder};
use data_encoding::HEXLOWER;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::{debug, instrument, warn};

use crate::{
    backend::StoreBackend,
    node::{NodeDependency, NodeId, NodeInfo},
    Error,
};

const INFO_FILE: &str = "info.json";
const DEPENDENCIES_FILE: &str = "dependencies.json";
const DATA_DIR: &str = "data";
const CHILDREN_DIR: &str = "children";
const GZ_SUFFIX: &str = ".gz";

/// Writes the subtree of `id` below `dir`. Returns the directory of the
/// archived node.
#[instrument(skip(store), fields(node.id = %id))]
pub async fn archive<S>(store: &S, id: &NodeId, dir: &Path) -> Result<PathBuf, Error>
where
    S: StoreBackend + ?Sized,
{
    let top = dir.join(id.to_string());

    let mut stack = vec![(*id, dir.to_path_buf())];
    while let Some((id, parent_dir)) = stack.pop() {
        let info = store.get_node_info(&id).await?;
        let node_dir = parent_dir.join(id.to_string());
        tokio::fs::create_dir_all(&node_dir).await?;

        write_json(&node_dir.join(INFO_FILE), &info).await?;

        let dependencies = store.get_all_dependencies(&id).await?;
        if !dependencies.is_empty() {
            write_json(&node_dir.join(DEPENDENCIES_FILE), &dependencies).await?;
        }

        for attr_name in store.get_data_source_names(&id).await? {
            let attr_dir = node_dir
                .join(DATA_DIR)
                .join(HEXLOWER.encode(attr_name.as_bytes()));
            tokio::fs::create_dir_all(&attr_dir).await?;

            for file_name in store.list_data_source_files(&id, &attr_name).await? {
                let path = attr_dir.join(format!(
                    "{}{}",
                    HEXLOWER.encode(file_name.as_bytes()),
                    GZ_SUFFIX
                ));
                let mut reader = store
                    .open_data_source_read(&id, &attr_name, &file_name)
                    .await?;
                let mut encoder = GzipEncoder::new(tokio::fs::File::create(&path).await?);
                tokio::io::copy(&mut reader, &mut encoder).await?;
                encoder.shutdown().await?;
            }
        }

        let children_dir = node_dir.join(CHILDREN_DIR);
        for child in store.get_child_nodes(&id).await? {
            stack.push((child.id, children_dir.clone()));
        }

        debug!(node.id=%id, path=%node_dir.display(), "archived node");
    }

    Ok(top)
}

/// Restores the archive in `node_dir` (as written by [archive]) as a new
/// child of `parent`, and returns it.
///
/// Every restored node gets a new id. Each one stays inconsistent until its
/// attributes and data sources are in place, so a failed import leaves
/// nothing visible behind, only entries in
/// [StoreBackend::get_inconsistent_nodes]. Dependencies are restored last:
/// edges between archived nodes point to their new ids, edges leaving the
/// archive keep their target, and are dropped if that target doesn't exist in
/// this store.
#[instrument(skip(store), fields(node.parent_id = %parent))]
pub async fn unarchive<S>(store: &S, parent: &NodeId, node_dir: &Path) -> Result<NodeInfo, Error>
where
    S: StoreBackend + ?Sized,
{
    let mut new_ids: HashMap<NodeId, NodeId> = HashMap::new();
    let mut pending_dependencies: Vec<(NodeId, Vec<NodeDependency>)> = Vec::new();
    let mut top = None;

    let mut stack = vec![(*parent, node_dir.to_path_buf())];
    while let Some((parent, dir)) = stack.pop() {
        let info: NodeInfo = read_json(&dir.join(INFO_FILE)).await?;
        let node = store
            .create_inconsistent_node(&parent, &info.name, &info.pseudo_class, &info.description)
            .await?;
        new_ids.insert(info.id, node.id);
        top.get_or_insert(node.id);

        for (name, value) in info.attributes {
            store.set_attribute(&node.id, &name, value).await?;
        }

        for attr_dir in sorted_entries(&dir.join(DATA_DIR)).await? {
            let attr_name = decode_name(&attr_dir, "")?;
            for file_path in sorted_entries(&attr_dir).await? {
                let file_name = decode_name(&file_path, GZ_SUFFIX)?;
                let mut decoder =
                    GzipDecoder::new(BufReader::new(tokio::fs::File::open(&file_path).await?));
                let mut writer = store
                    .open_data_source_write(&node.id, &attr_name, &file_name)
                    .await?;
                tokio::io::copy(&mut decoder, &mut writer).await?;
                writer.close().await?;
            }
        }

        let dependencies_path = dir.join(DEPENDENCIES_FILE);
        if tokio::fs::try_exists(&dependencies_path).await? {
            pending_dependencies.push((node.id, read_json(&dependencies_path).await?));
        }

        store.set_consistent(&node.id).await?;
        debug!(node.id=%node.id, archived.id=%info.id, "restored node");

        // popped in reverse, so children are restored in name order.
        let mut children = sorted_entries(&dir.join(CHILDREN_DIR)).await?;
        children.reverse();
        stack.extend(children.into_iter().map(|child_dir| (node.id, child_dir)));
    }

    for (source, dependencies) in pending_dependencies {
        for dependency in dependencies {
            let target = new_ids
                .get(&dependency.target_id)
                .copied()
                .unwrap_or(dependency.target_id);
            match store.add_dependency(&source, &dependency.name, &target).await {
                Ok(()) => {}
                Err(Error::NotFound(_)) => {
                    warn!(node.id=%source, node.target_id=%target, dep=%dependency.name, "dropping dependency to missing node")
                }
                Err(e) => return Err(e),
            }
        }
    }

    store.flush().await?;

    let top = top.ok_or_else(|| Error::InvalidRequest("empty archive".to_string()))?;
    store.get_node_info(&top).await
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| Error::StorageError(format!("failed to encode {}: {}", path.display(), e)))?;
    tokio::fs::write(path, data).await?;
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, Error> {
    let data = tokio::fs::read(path).await?;
    serde_json::from_slice(&data)
        .map_err(|e| Error::InvalidRequest(format!("malformed {}: {}", path.display(), e)))
}

/// Returns the entries of `dir`, sorted. A missing directory has none.
async fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

/// Decodes a hex-encoded name from the last component of `path`.
fn decode_name(path: &Path, suffix: &str) -> Result<String, Error> {
    let malformed = || Error::InvalidRequest(format!("malformed archive entry {}", path.display()));

    let encoded = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_suffix(suffix))
        .ok_or_else(malformed)?;
    let decoded = HEXLOWER
        .decode(encoded.as_bytes())
        .map_err(|_| malformed())?;
    String::from_utf8(decoded).map_err(|_| malformed())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::{backend::from_addr, node::AttributeValue};

    async fn write_data(
        store: &dyn StoreBackend,
        id: &NodeId,
        attr_name: &str,
        file_name: &str,
        data: &[u8],
    ) {
        let mut w = store
            .open_data_source_write(id, attr_name, file_name)
            .await
            .unwrap();
        w.write_all(data).await.unwrap();
        w.close().await.unwrap();
    }

    async fn read_data(
        store: &dyn StoreBackend,
        id: &NodeId,
        attr_name: &str,
        file_name: &str,
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        store
            .open_data_source_read(id, attr_name, file_name)
            .await
            .unwrap()
            .read_to_end(&mut buf)
            .await
            .unwrap();
        buf
    }

    /// Archives a project with a case, a runner depending on it and a
    /// dependency leaving the archive, and restores it elsewhere.
    #[tokio::test]
    async fn archive_and_restore() {
        let dir = TempDir::new().unwrap();
        let store = from_addr("memory://").await.unwrap();
        let root = store.get_root_node("d").await.unwrap().info;

        let shared = store.create_node(&root.id, "shared", "folder", "").await.unwrap();
        let project = store
            .create_node(&root.id, "study", "project", "a study")
            .await
            .unwrap();
        let case = store.create_node(&project.id, "caseA", "case", "").await.unwrap();
        store
            .set_attribute(&case.id, "format", AttributeValue::from("XIIDM"))
            .await
            .unwrap();
        write_data(store.as_ref(), &case.id, "case", "network.xiidm", b"<network/>").await;
        let runner = store
            .create_node(&project.id, "runner", "analysis-runner", "")
            .await
            .unwrap();
        store.add_dependency(&runner.id, "case", &case.id).await.unwrap();
        store.add_dependency(&runner.id, "parameters", &shared.id).await.unwrap();

        let archived = archive(store.as_ref(), &project.id, dir.path()).await.unwrap();
        assert_eq!(dir.path().join(project.id.to_string()), archived);
        assert!(archived.join(INFO_FILE).is_file());

        let target = store.create_node(&root.id, "restored", "folder", "").await.unwrap();
        let restored = unarchive(store.as_ref(), &target.id, &archived).await.unwrap();
        assert_ne!(project.id, restored.id);
        assert_eq!("study", restored.name);
        assert_eq!("project", restored.pseudo_class);
        assert_eq!("a study", restored.description);

        let new_case = store
            .get_child_node(&restored.id, "caseA")
            .await
            .unwrap()
            .expect("case must be restored");
        assert_ne!(case.id, new_case.id);
        assert_eq!(
            Some(&AttributeValue::from("XIIDM")),
            new_case.attributes.get("format")
        );
        assert_eq!(
            b"<network/>".to_vec(),
            read_data(store.as_ref(), &new_case.id, "case", "network.xiidm").await
        );

        let new_runner = store
            .get_child_node(&restored.id, "runner")
            .await
            .unwrap()
            .expect("runner must be restored");
        assert_eq!(
            vec![new_case.id],
            store.get_dependencies(&new_runner.id, "case").await.unwrap()
        );
        assert_eq!(
            vec![shared.id],
            store.get_dependencies(&new_runner.id, "parameters").await.unwrap()
        );

        assert!(store.get_inconsistent_nodes().await.unwrap().is_empty());
    }

    /// An import failing halfway leaves its node inconsistent, so it doesn't
    /// show up below the parent.
    #[tokio::test]
    async fn failed_restore_stays_hidden() {
        let dir = TempDir::new().unwrap();
        let store = from_addr("memory://").await.unwrap();
        let root = store.get_root_node("d").await.unwrap().info;
        let case = store.create_node(&root.id, "caseA", "case", "").await.unwrap();
        write_data(store.as_ref(), &case.id, "case", "network.xiidm", b"<network/>").await;

        let archived = archive(store.as_ref(), &case.id, dir.path()).await.unwrap();
        let data_file = archived
            .join(DATA_DIR)
            .join(HEXLOWER.encode(b"case"))
            .join(format!("{}{}", HEXLOWER.encode(b"network.xiidm"), GZ_SUFFIX));
        tokio::fs::write(&data_file, b"not gzip").await.unwrap();

        let target = store.create_node(&root.id, "restored", "folder", "").await.unwrap();
        unarchive(store.as_ref(), &target.id, &archived)
            .await
            .expect_err("corrupt data must fail");

        assert!(store.get_child_nodes(&target.id).await.unwrap().is_empty());
        let inconsistent = store.get_inconsistent_nodes().await.unwrap();
        assert_eq!(1, inconsistent.len());
        assert_eq!("caseA", inconsistent[0].name);
        assert_eq!(Some(target.id), inconsistent[0].parent_id);
    }

    #[tokio::test]
    async fn missing_info_fails() {
        let dir = TempDir::new().unwrap();
        let store = from_addr("memory://").await.unwrap();
        let root = store.get_root_node("d").await.unwrap().info;

        assert!(matches!(
            unarchive(store.as_ref(), &root.id, dir.path()).await,
            Err(Error::NotFound(_))
        ));
    }
}
