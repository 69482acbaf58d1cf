//! This contains test scenarios that a given [StoreBackend] needs to pass.
//! We use [rstest] and [rstest_reuse] to provide all backends we want to test
//! against, and then apply this template to all test functions.

use rstest::*;
use rstest_reuse::{self, *};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::StoreBackend;
use crate::backend;
use crate::events::NodeEvent;
use crate::node::{AttributeType, AttributeValue, BackwardDependency, NodeDependency, NodeId};
use crate::Error;

pub(crate) mod utils;
use self::utils::{make_redb_store, make_remote_store, DRIVE};

/// This produces a template, which will be applied to all individual test functions.
/// See https://github.com/la10736/rstest/issues/130#issuecomment-968864832
#[template]
#[rstest]
#[case::memory(backend::from_addr("memory://").await.unwrap())]
#[case::redb(make_redb_store().await)]
#[case::remote(make_remote_store().await)]
pub fn stores(#[case] store: impl StoreBackend) {}

/// Produces `len` bytes of some pattern that isn't trivially repetitive.
fn fixture_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 251) as u8).collect()
}

async fn write_file(store: &impl StoreBackend, id: &NodeId, attr: &str, file: &str, data: &[u8]) {
    let mut w = store
        .open_data_source_write(id, attr, file)
        .await
        .expect("must open");
    w.write_all(data).await.expect("must write");
    w.close().await.expect("must close");
}

async fn read_file(store: &impl StoreBackend, id: &NodeId, attr: &str, file: &str) -> Vec<u8> {
    let mut r = store
        .open_data_source_read(id, attr, file)
        .await
        .expect("must open");
    let mut buf = Vec::new();
    r.read_to_end(&mut buf).await.expect("must read");
    buf
}

/// The root is created on first access, and returned as is afterwards.
#[apply(stores)]
#[tokio::test]
async fn root_is_idempotent(store: impl StoreBackend) {
    let first = store.get_root_node(DRIVE).await.expect("must succeed");
    assert!(first.created);
    assert_eq!(DRIVE, first.info.name);
    assert_eq!(None, first.info.parent_id);
    assert!(first.info.is_root());

    let second = store.get_root_node(DRIVE).await.expect("must succeed");
    assert!(!second.created);
    assert_eq!(first.info.id, second.info.id);

    assert_eq!(
        None,
        store.get_parent_node(&first.info.id).await.expect("must succeed")
    );
}

/// Creating the same child twice fails, the first one stays retrievable.
#[apply(stores)]
#[tokio::test]
async fn duplicate_child(store: impl StoreBackend) {
    let root = store.get_root_node(DRIVE).await.unwrap().info;

    let x = store
        .create_node(&root.id, "x", "folder", "first")
        .await
        .expect("must succeed");

    let err = store
        .create_node(&root.id, "x", "case", "second")
        .await
        .expect_err("must fail");
    assert_eq!(
        Error::DuplicateChild {
            parent: root.id,
            name: "x".to_string()
        },
        err
    );

    let found = store
        .get_child_node(&root.id, "x")
        .await
        .expect("must succeed")
        .expect("must exist");
    assert_eq!(x, found);
    assert_eq!("first", found.description);
    assert_eq!("folder", found.pseudo_class);
}

/// Two racing creations of the same name yield exactly one success.
#[apply(stores)]
#[tokio::test]
async fn concurrent_duplicate_child(store: impl StoreBackend) {
    let root = store.get_root_node(DRIVE).await.unwrap().info;

    let (a, b) = futures::join!(
        store.create_node(&root.id, "race", "folder", ""),
        store.create_node(&root.id, "race", "folder", ""),
    );

    assert_eq!(1, [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count());
    assert!(matches!(
        a.err().or(b.err()),
        Some(Error::DuplicateChild { .. })
    ));
    assert_eq!(1, store.get_child_nodes(&root.id).await.unwrap().len());
}

#[apply(stores)]
#[tokio::test]
async fn missing_parent(store: impl StoreBackend) {
    store.get_root_node(DRIVE).await.unwrap();

    assert!(matches!(
        store.create_node(&NodeId::new(), "x", "folder", "").await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        store.get_node_info(&NodeId::new()).await,
        Err(Error::NotFound(_))
    ));
}

fn rejected<T>(res: Result<T, Error>) -> bool {
    matches!(res, Err(Error::InvalidRequest(_)))
}

/// Names every backend refuses, in every call taking a name. `.` and `..`
/// are included, they'd address another resource once in a url path.
#[apply(stores)]
#[tokio::test]
async fn invalid_names(store: impl StoreBackend) {
    let root = store.get_root_node(DRIVE).await.unwrap().info;
    let child = store.create_node(&root.id, "child", "folder", "").await.unwrap();

    for name in ["", ".", "..", "a/b", "nul\0"] {
        let id = &root.id;
        let checks = [
            ("create_node", rejected(store.create_node(id, name, "folder", "").await)),
            ("get_child_node", rejected(store.get_child_node(id, name).await)),
            ("rename_node", rejected(store.rename_node(&child.id, name).await)),
            (
                "set_attribute",
                rejected(store.set_attribute(id, name, AttributeValue::from(1i64)).await),
            ),
            (
                "get_attribute",
                rejected(store.get_attribute(id, name, AttributeType::Integer).await),
            ),
            ("remove_attribute", rejected(store.remove_attribute(id, name).await)),
            (
                "open_data_source_write attr",
                rejected(store.open_data_source_write(id, name, "f").await),
            ),
            (
                "open_data_source_write file",
                rejected(store.open_data_source_write(id, "data", name).await),
            ),
            (
                "open_data_source_read",
                rejected(store.open_data_source_read(id, "data", name).await),
            ),
            (
                "data_source_file_exists",
                rejected(store.data_source_file_exists(id, "data", name).await),
            ),
            (
                "list_data_source_files",
                rejected(store.list_data_source_files(id, name).await),
            ),
            (
                "remove_data_source_file",
                rejected(store.remove_data_source_file(id, "data", name).await),
            ),
            (
                "add_dependency",
                rejected(store.add_dependency(id, name, &child.id).await),
            ),
            ("get_dependencies", rejected(store.get_dependencies(id, name).await)),
            (
                "remove_dependency",
                rejected(store.remove_dependency(id, name, &child.id).await),
            ),
        ];

        for (call, ok) in checks {
            assert!(ok, "{} must reject {:?}", call, name);
        }
    }

    // nothing was created or renamed on the way.
    let children = store.get_child_nodes(&root.id).await.unwrap();
    assert_eq!(
        vec!["child".to_string()],
        children.into_iter().map(|c| c.name).collect::<Vec<_>>()
    );
}

/// Children are listed sorted by name, and point back to their parent.
#[apply(stores)]
#[tokio::test]
async fn children_and_parent(store: impl StoreBackend) {
    let root = store.get_root_node(DRIVE).await.unwrap().info;

    for name in ["b", "c", "a"] {
        store
            .create_node(&root.id, name, "folder", "")
            .await
            .expect("must succeed");
    }

    let children = store.get_child_nodes(&root.id).await.expect("must succeed");
    assert_eq!(
        vec!["a", "b", "c"],
        children.iter().map(|c| c.name.as_str()).collect::<Vec<_>>()
    );

    for child in &children {
        assert_eq!(Some(root.id), child.parent_id);
        let parent = store
            .get_parent_node(&child.id)
            .await
            .expect("must succeed")
            .expect("must have a parent");
        assert_eq!(root.id, parent.id);

        // the string form of an id resolves to the same node again.
        let id: NodeId = child.id.to_string().parse().expect("must parse");
        assert_eq!(child.id, id);
        assert_eq!(child.name, store.get_node_info(&id).await.unwrap().name);
    }

    assert_eq!(
        None,
        store
            .get_child_node(&root.id, "d")
            .await
            .expect("must succeed")
    );
}

#[apply(stores)]
#[tokio::test]
async fn attributes(store: impl StoreBackend) {
    let root = store.get_root_node(DRIVE).await.unwrap().info;
    let node = store
        .create_node(&root.id, "caseA", "case", "")
        .await
        .unwrap();
    assert_eq!(0, node.version);

    let values = [
        ("format", AttributeValue::from("XIIDM")),
        ("ratio", AttributeValue::from(0.5)),
        ("count", AttributeValue::from(42i64)),
        ("valid", AttributeValue::from(true)),
    ];

    for (name, value) in &values {
        store
            .set_attribute(&node.id, name, value.clone())
            .await
            .expect("must succeed");
    }

    for (name, value) in &values {
        assert_eq!(
            Some(value.clone()),
            store
                .get_attribute(&node.id, name, value.attribute_type())
                .await
                .expect("must succeed")
        );
    }

    let info = store.get_node_info(&node.id).await.unwrap();
    assert_eq!(4, info.version);
    assert_eq!(4, info.attributes.len());

    assert_eq!(
        None,
        store
            .get_attribute(&node.id, "missing", AttributeType::String)
            .await
            .expect("must succeed")
    );
}

/// An attribute keeps its type until it's removed explicitly.
#[apply(stores)]
#[tokio::test]
async fn attribute_type_mismatch(store: impl StoreBackend) {
    let root = store.get_root_node(DRIVE).await.unwrap().info;

    store
        .set_attribute(&root.id, "format", "XIIDM".into())
        .await
        .unwrap();

    let err = store
        .get_attribute(&root.id, "format", AttributeType::Integer)
        .await
        .expect_err("must fail");
    assert_eq!(
        Error::TypeMismatch {
            node: root.id,
            name: "format".to_string(),
            stored: AttributeType::String,
            requested: AttributeType::Integer,
        },
        err
    );

    assert!(matches!(
        store.set_attribute(&root.id, "format", 1i64.into()).await,
        Err(Error::TypeMismatch { .. })
    ));

    // overwriting with the same type is fine.
    store
        .set_attribute(&root.id, "format", "UCTE".into())
        .await
        .expect("must succeed");

    assert!(store.remove_attribute(&root.id, "format").await.unwrap());
    assert!(!store.remove_attribute(&root.id, "format").await.unwrap());

    store
        .set_attribute(&root.id, "format", 1i64.into())
        .await
        .expect("must succeed after removal");
    assert_eq!(
        Some(AttributeValue::Integer(1)),
        store
            .get_attribute(&root.id, "format", AttributeType::Integer)
            .await
            .unwrap()
    );
}

#[apply(stores)]
#[tokio::test]
async fn non_finite_double_rejected(store: impl StoreBackend) {
    let root = store.get_root_node(DRIVE).await.unwrap().info;

    assert!(matches!(
        store
            .set_attribute(&root.id, "ratio", f64::NAN.into())
            .await,
        Err(Error::InvalidRequest(_))
    ));
}

/// Data source contents round trip byte by byte, including empty files.
#[apply(stores)]
#[tokio::test]
async fn data_source_round_trip(store: impl StoreBackend) {
    let root = store.get_root_node(DRIVE).await.unwrap().info;

    for len in [0, 1, 70_000] {
        let file = format!("file-{}", len);
        let data = fixture_bytes(len);

        write_file(&store, &root.id, "blobs", &file, &data).await;
        assert_eq!(data, read_file(&store, &root.id, "blobs", &file).await);
    }

    // overwriting replaces the content.
    write_file(&store, &root.id, "blobs", "file-1", b"replaced").await;
    assert_eq!(
        b"replaced".to_vec(),
        read_file(&store, &root.id, "blobs", "file-1").await
    );
}

#[apply(stores)]
#[tokio::test]
async fn data_source_listing(store: impl StoreBackend) {
    let root = store.get_root_node(DRIVE).await.unwrap().info;

    assert!(!store
        .data_source_file_exists(&root.id, "case", "network.xiidm")
        .await
        .unwrap());
    assert!(matches!(
        store
            .open_data_source_read(&root.id, "case", "network.xiidm")
            .await,
        Err(Error::NotFound(_))
    ));

    write_file(&store, &root.id, "case", "network.xiidm", b"<network/>").await;
    write_file(&store, &root.id, "case", "attachment.txt", b"notes").await;
    write_file(&store, &root.id, "script", "main.groovy", b"println 1").await;

    assert!(store
        .data_source_file_exists(&root.id, "case", "network.xiidm")
        .await
        .unwrap());
    assert_eq!(
        vec!["attachment.txt", "network.xiidm"],
        store.list_data_source_files(&root.id, "case").await.unwrap()
    );
    assert_eq!(
        vec!["case", "script"],
        store.get_data_source_names(&root.id).await.unwrap()
    );

    assert!(store
        .remove_data_source_file(&root.id, "script", "main.groovy")
        .await
        .unwrap());
    assert!(!store
        .remove_data_source_file(&root.id, "script", "main.groovy")
        .await
        .unwrap());
    assert_eq!(
        vec!["case"],
        store.get_data_source_names(&root.id).await.unwrap()
    );
    assert!(matches!(
        store
            .open_data_source_read(&root.id, "script", "main.groovy")
            .await,
        Err(Error::NotFound(_))
    ));
}

#[apply(stores)]
#[tokio::test]
async fn dependencies(store: impl StoreBackend) {
    let root = store.get_root_node(DRIVE).await.unwrap().info;
    let case = store
        .create_node(&root.id, "case", "case", "")
        .await
        .unwrap();
    let runner = store
        .create_node(&root.id, "runner", "analysis-runner", "")
        .await
        .unwrap();

    store
        .add_dependency(&runner.id, "case", &case.id)
        .await
        .expect("must succeed");
    // adding it again doesn't duplicate it.
    store
        .add_dependency(&runner.id, "case", &case.id)
        .await
        .expect("must succeed");
    // cycles are fine.
    store
        .add_dependency(&case.id, "used-by", &runner.id)
        .await
        .expect("must succeed");

    assert_eq!(
        vec![case.id],
        store.get_dependencies(&runner.id, "case").await.unwrap()
    );
    assert_eq!(
        vec![NodeDependency {
            name: "case".to_string(),
            target_id: case.id
        }],
        store.get_all_dependencies(&runner.id).await.unwrap()
    );
    assert_eq!(
        vec![BackwardDependency {
            name: "case".to_string(),
            source_id: runner.id
        }],
        store.get_backward_dependencies(&case.id).await.unwrap()
    );
    assert!(store
        .get_dependencies(&runner.id, "other")
        .await
        .unwrap()
        .is_empty());

    assert!(matches!(
        store.add_dependency(&runner.id, "case", &NodeId::new()).await,
        Err(Error::NotFound(_))
    ));

    assert!(store
        .remove_dependency(&runner.id, "case", &case.id)
        .await
        .unwrap());
    assert!(!store
        .remove_dependency(&runner.id, "case", &case.id)
        .await
        .unwrap());
    assert!(store
        .get_backward_dependencies(&case.id)
        .await
        .unwrap()
        .is_empty());
}

/// Deleting a dependency target leaves the edges pointing at it in place.
#[apply(stores)]
#[tokio::test]
async fn dangling_dependency(store: impl StoreBackend) {
    let root = store.get_root_node(DRIVE).await.unwrap().info;
    let case = store
        .create_node(&root.id, "case", "case", "")
        .await
        .unwrap();
    let runner = store
        .create_node(&root.id, "runner", "analysis-runner", "")
        .await
        .unwrap();
    store
        .add_dependency(&runner.id, "case", &case.id)
        .await
        .unwrap();

    store.delete_node(&case.id).await.expect("must succeed");

    assert_eq!(
        vec![case.id],
        store.get_dependencies(&runner.id, "case").await.unwrap()
    );
    assert!(matches!(
        store.get_node_info(&case.id).await,
        Err(Error::NotFound(_))
    ));

    // deleting the source removes its edges from the targets.
    store
        .add_dependency(&runner.id, "root", &root.id)
        .await
        .unwrap();
    assert_eq!(
        1,
        store.get_backward_dependencies(&root.id).await.unwrap().len()
    );
    store.delete_node(&runner.id).await.unwrap();
    assert!(store
        .get_backward_dependencies(&root.id)
        .await
        .unwrap()
        .is_empty());
}

/// Deleting a folder removes the whole subtree below it, including data
/// sources.
#[apply(stores)]
#[tokio::test]
async fn delete_subtree(store: impl StoreBackend) {
    let root = store.get_root_node(DRIVE).await.unwrap().info;
    let a = store
        .create_node(&root.id, "a", "folder", "")
        .await
        .unwrap();
    let b = store.create_node(&a.id, "b", "folder", "").await.unwrap();
    let c = store.create_node(&b.id, "c", "case", "").await.unwrap();
    let sibling = store
        .create_node(&root.id, "sibling", "folder", "")
        .await
        .unwrap();
    write_file(&store, &c.id, "case", "network.xiidm", b"<network/>").await;

    assert_eq!(root.id, store.delete_node(&a.id).await.expect("must succeed"));

    assert_eq!(
        vec![sibling],
        store.get_child_nodes(&root.id).await.unwrap()
    );
    assert_eq!(None, store.get_child_node(&root.id, "a").await.unwrap());
    for id in [&a.id, &b.id, &c.id] {
        assert!(matches!(
            store.get_node_info(id).await,
            Err(Error::NotFound(_))
        ));
    }
    assert!(matches!(
        store
            .open_data_source_read(&c.id, "case", "network.xiidm")
            .await,
        Err(Error::NotFound(_))
    ));

    // the name is free again.
    store
        .create_node(&root.id, "a", "folder", "")
        .await
        .expect("must succeed");

    assert!(matches!(
        store.delete_node(&a.id).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        store.delete_node(&root.id).await,
        Err(Error::IllegalState(_))
    ));
}

#[apply(stores)]
#[tokio::test]
async fn rename_move_describe(store: impl StoreBackend) {
    let root = store.get_root_node(DRIVE).await.unwrap().info;
    let projects = store
        .create_node(&root.id, "projects", "folder", "")
        .await
        .unwrap();
    let archive = store
        .create_node(&root.id, "archive", "folder", "")
        .await
        .unwrap();
    let case = store
        .create_node(&projects.id, "caseA", "case", "")
        .await
        .unwrap();

    // rename
    store
        .rename_node(&case.id, "caseB")
        .await
        .expect("must succeed");
    assert_eq!(None, store.get_child_node(&projects.id, "caseA").await.unwrap());
    assert_eq!(
        case.id,
        store
            .get_child_node(&projects.id, "caseB")
            .await
            .unwrap()
            .expect("must exist")
            .id
    );
    assert!(matches!(
        store.rename_node(&archive.id, "projects").await,
        Err(Error::DuplicateChild { .. })
    ));
    assert!(matches!(
        store.rename_node(&root.id, "other").await,
        Err(Error::IllegalState(_))
    ));

    // move
    assert_eq!(
        projects.id,
        store
            .set_parent_node(&case.id, &archive.id)
            .await
            .expect("must succeed")
    );
    assert!(store.get_child_nodes(&projects.id).await.unwrap().is_empty());
    assert_eq!(
        Some(archive.id),
        store.get_node_info(&case.id).await.unwrap().parent_id
    );
    assert!(matches!(
        store.set_parent_node(&archive.id, &case.id).await,
        Err(Error::IllegalState(_))
    ));
    assert!(matches!(
        store.set_parent_node(&root.id, &archive.id).await,
        Err(Error::IllegalState(_))
    ));

    // description
    store
        .set_description(&case.id, "imported yesterday")
        .await
        .expect("must succeed");
    let info = store.get_node_info(&case.id).await.unwrap();
    assert_eq!("imported yesterday", info.description);
    assert_eq!(3, info.version);
    assert!(info.modification_time >= info.creation_time);
}

/// A writer dropped without close leaves nothing visible behind, and
/// doesn't touch content committed before.
#[apply(stores)]
#[tokio::test]
async fn uncommitted_write_invisible(store: impl StoreBackend) {
    let root = store.get_root_node(DRIVE).await.unwrap().info;

    let mut w = store
        .open_data_source_write(&root.id, "data", "f")
        .await
        .unwrap();
    w.write_all(b"partial").await.unwrap();
    drop(w);

    assert!(!store
        .data_source_file_exists(&root.id, "data", "f")
        .await
        .unwrap());
    assert!(matches!(
        store.open_data_source_read(&root.id, "data", "f").await,
        Err(Error::NotFound(_))
    ));

    write_file(&store, &root.id, "data", "f", b"committed").await;
    let mut w = store
        .open_data_source_write(&root.id, "data", "f")
        .await
        .unwrap();
    w.write_all(b"partial").await.unwrap();
    drop(w);

    assert_eq!(b"committed".to_vec(), read_file(&store, &root.id, "data", "f").await);
}

/// Inconsistent nodes are only reachable by id, until marked consistent.
#[apply(stores)]
#[tokio::test]
async fn consistency(store: impl StoreBackend) {
    let root = store.get_root_node(DRIVE).await.unwrap().info;
    assert!(store.is_consistent(&root.id).await.unwrap());
    assert!(store.get_inconsistent_nodes().await.unwrap().is_empty());

    let folder = store.create_node(&root.id, "folder", "folder", "").await.unwrap();
    assert!(store.is_consistent(&folder.id).await.unwrap());

    let import = store
        .create_inconsistent_node(&folder.id, "import", "project", "")
        .await
        .expect("must succeed");
    assert_eq!(Some(folder.id), import.parent_id);
    assert!(!store.is_consistent(&import.id).await.unwrap());

    // hidden from listings, but reachable by id, and holding its name.
    assert!(store.get_child_nodes(&folder.id).await.unwrap().is_empty());
    assert_eq!(None, store.get_child_node(&folder.id, "import").await.unwrap());
    assert_eq!(import, store.get_node_info(&import.id).await.unwrap());
    assert!(matches!(
        store.create_node(&folder.id, "import", "folder", "").await,
        Err(Error::DuplicateChild { .. })
    ));

    // only the topmost inconsistent node is reported.
    let nested = store
        .create_inconsistent_node(&import.id, "nested", "case", "")
        .await
        .unwrap();
    assert_eq!(
        vec![import.id],
        store
            .get_inconsistent_nodes()
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect::<Vec<_>>()
    );

    assert!(store.set_consistent(&import.id).await.unwrap());
    assert!(!store.set_consistent(&import.id).await.unwrap());
    assert!(store.is_consistent(&import.id).await.unwrap());
    assert_eq!(
        Some(import.id),
        store
            .get_child_node(&folder.id, "import")
            .await
            .unwrap()
            .map(|n| n.id)
    );
    assert_eq!(
        vec![nested.id],
        store
            .get_inconsistent_nodes()
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect::<Vec<_>>()
    );

    assert!(store.is_writable(&import.id).await.unwrap());
    assert!(store.is_writable(&nested.id).await.unwrap());

    let missing = NodeId::new();
    assert!(matches!(store.set_consistent(&missing).await, Err(Error::NotFound(_))));
    assert!(matches!(store.is_consistent(&missing).await, Err(Error::NotFound(_))));
    assert!(matches!(store.is_writable(&missing).await, Err(Error::NotFound(_))));
}

/// After closing, calls fail. Closing again is fine.
#[apply(stores)]
#[tokio::test]
async fn close(store: impl StoreBackend) {
    let root = store.get_root_node(DRIVE).await.unwrap().info;

    store.flush().await.expect("must succeed");
    store.close().await.expect("must succeed");
    store.close().await.expect("closing again must succeed");

    assert!(matches!(
        store.get_node_info(&root.id).await,
        Err(Error::IllegalState(_))
    ));
    assert!(matches!(store.flush().await, Err(Error::IllegalState(_))));
}

/// A request outliving the configured timeout fails with a network error.
#[tokio::test]
async fn remote_request_timeout() {
    let app = axum::Router::new()
        .route("/drives/test/events", axum::routing::get(utils::idle_event_stream))
        .route(
            "/drives/test/root",
            axum::routing::get(|| async {
                tokio::time::sleep(std::time::Duration::from_secs(10)).await;
                "{}"
            }),
        );
    let base_url = utils::serve(app).await;

    let store = backend::RemoteStore::connect(
        base_url,
        DRIVE,
        backend::RemoteStoreConfig {
            timeout: 1,
            ..Default::default()
        },
    )
    .await
    .expect("must connect");

    let started = std::time::Instant::now();
    assert!(matches!(
        store.get_root_node(DRIVE).await,
        Err(Error::NetworkError(_))
    ));
    assert!(started.elapsed() < std::time::Duration::from_secs(10));
}

/// A broken event stream is re-established, and delivers again.
#[tokio::test]
async fn remote_event_stream_reconnects() {
    let connections = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let node_id = NodeId::new();

    // every connection sends a single event, then ends.
    let app = axum::Router::new().route(
        "/drives/test/events",
        axum::routing::get({
            let connections = connections.clone();
            move || {
                let n = connections.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                let event = NodeEvent::NodeRenamed {
                    node_id,
                    name: format!("conn-{}", n),
                };
                async move {
                    let mut line = serde_json::to_vec(&event).unwrap();
                    line.push(b'\n');
                    line
                }
            }
        }),
    );
    let base_url = utils::serve(app).await;

    let store = backend::RemoteStore::connect(
        base_url,
        DRIVE,
        backend::RemoteStoreConfig {
            reconnect_delay: 10,
            ..Default::default()
        },
    )
    .await
    .expect("must connect");
    let mut feed = store.take_event_feed().expect("must have a feed");
    assert!(store.take_event_feed().is_none(), "handed out once");

    for n in 1..=2 {
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), feed.recv())
            .await
            .expect("must not time out");
        assert_eq!(
            Some(NodeEvent::NodeRenamed {
                node_id,
                name: format!("conn-{}", n),
            }),
            event
        );
    }
    assert!(connections.load(std::sync::atomic::Ordering::SeqCst) >= 2);

    store.close().await.unwrap();
}
