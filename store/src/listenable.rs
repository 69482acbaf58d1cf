use std::{
    future::Future,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use async_trait::async_trait;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, instrument};

use crate::{
    backend::{DataSourceReader, DataSourceWriter, StoreBackend},
    events::{EventBus, EventSubscription, NodeEvent, DEFAULT_QUEUE_CAPACITY},
    node::{
        AttributeType, AttributeValue, BackwardDependency, NodeDependency, NodeId, NodeInfo,
        RootNode,
    },
    Error,
};

/// Decorates a [StoreBackend] with an [EventBus].
///
/// Every successful mutation first commits on the backend, then enqueues one
/// [NodeEvent] to all subscribers. An ordering lock spans both steps, so
/// subscribers observe events in commit order. Enqueueing never waits, a
/// subscriber that can't keep up is dropped.
///
/// Backends providing their own event feed (see
/// [StoreBackend::take_event_feed]) observe mutations done by anyone,
/// including ourselves. For those, no events are synthesized, the feed is
/// forwarded to the bus instead.
pub struct ListenableStore {
    backend: Box<dyn StoreBackend>,
    bus: Arc<EventBus>,
    ordering: Arc<Mutex<()>>,
    emit_local: bool,
    forwarder: Option<JoinHandle<()>>,
}

impl ListenableStore {
    pub fn new(backend: Box<dyn StoreBackend>) -> Self {
        Self::with_capacity(backend, DEFAULT_QUEUE_CAPACITY)
    }

    /// Uses the given capacity for subscriber queues. If the backend
    /// provides an event feed, a task forwarding it is spawned, so this needs
    /// to be called from within a tokio runtime.
    pub fn with_capacity(backend: Box<dyn StoreBackend>, capacity: usize) -> Self {
        let bus = Arc::new(EventBus::new(capacity));

        let forwarder = backend.take_event_feed().map(|mut feed| {
            let bus = bus.clone();
            tokio::spawn(async move {
                while let Some(event) = feed.recv().await {
                    bus.publish(event);
                }
                debug!("event feed ended");
            })
        });

        Self {
            backend,
            bus,
            ordering: Arc::new(Mutex::new(())),
            emit_local: forwarder.is_none(),
            forwarder,
        }
    }

    /// Registers a subscriber, which receives the events of all mutations
    /// committed after this call.
    pub fn subscribe(&self) -> EventSubscription {
        self.bus.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.bus.subscriber_count()
    }

    /// Runs a mutation, and publishes the event derived from its result.
    async fn emit<T, F>(
        &self,
        op: F,
        event: impl FnOnce(&T) -> Option<NodeEvent> + Send,
    ) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>> + Send,
        T: Send,
    {
        if !self.emit_local {
            return op.await;
        }

        let _ordering = self.ordering.lock().await;
        let res = op.await?;
        if let Some(event) = event(&res) {
            self.bus.publish(event);
        }
        Ok(res)
    }
}

impl Drop for ListenableStore {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

#[async_trait]
impl StoreBackend for ListenableStore {
    async fn get_root_node(&self, drive_name: &str) -> Result<RootNode, Error> {
        self.emit(self.backend.get_root_node(drive_name), |root| {
            root.created.then(|| NodeEvent::NodeCreated {
                node_id: root.info.id,
                parent_id: None,
            })
        })
        .await
    }

    async fn get_node_info(&self, id: &NodeId) -> Result<NodeInfo, Error> {
        self.backend.get_node_info(id).await
    }

    async fn create_node(
        &self,
        parent: &NodeId,
        name: &str,
        pseudo_class: &str,
        description: &str,
    ) -> Result<NodeInfo, Error> {
        self.emit(
            self.backend
                .create_node(parent, name, pseudo_class, description),
            |info| {
                Some(NodeEvent::NodeCreated {
                    node_id: info.id,
                    parent_id: Some(*parent),
                })
            },
        )
        .await
    }

    async fn create_inconsistent_node(
        &self,
        parent: &NodeId,
        name: &str,
        pseudo_class: &str,
        description: &str,
    ) -> Result<NodeInfo, Error> {
        self.emit(
            self.backend
                .create_inconsistent_node(parent, name, pseudo_class, description),
            |info| {
                Some(NodeEvent::NodeCreated {
                    node_id: info.id,
                    parent_id: Some(*parent),
                })
            },
        )
        .await
    }

    async fn get_child_nodes(&self, parent: &NodeId) -> Result<Vec<NodeInfo>, Error> {
        self.backend.get_child_nodes(parent).await
    }

    async fn get_child_node(
        &self,
        parent: &NodeId,
        name: &str,
    ) -> Result<Option<NodeInfo>, Error> {
        self.backend.get_child_node(parent, name).await
    }

    async fn get_parent_node(&self, id: &NodeId) -> Result<Option<NodeInfo>, Error> {
        self.backend.get_parent_node(id).await
    }

    async fn set_parent_node(&self, id: &NodeId, new_parent: &NodeId) -> Result<NodeId, Error> {
        self.emit(self.backend.set_parent_node(id, new_parent), |old| {
            Some(NodeEvent::ParentChanged {
                node_id: *id,
                old_parent_id: *old,
                new_parent_id: *new_parent,
            })
        })
        .await
    }

    async fn rename_node(&self, id: &NodeId, name: &str) -> Result<(), Error> {
        self.emit(self.backend.rename_node(id, name), |_| {
            Some(NodeEvent::NodeRenamed {
                node_id: *id,
                name: name.to_string(),
            })
        })
        .await
    }

    async fn set_description(&self, id: &NodeId, description: &str) -> Result<(), Error> {
        self.emit(self.backend.set_description(id, description), |_| {
            Some(NodeEvent::DescriptionUpdated { node_id: *id })
        })
        .await
    }

    async fn set_attribute(
        &self,
        id: &NodeId,
        name: &str,
        value: AttributeValue,
    ) -> Result<(), Error> {
        self.emit(self.backend.set_attribute(id, name, value), |_| {
            Some(NodeEvent::AttributeUpdated {
                node_id: *id,
                attr_name: name.to_string(),
            })
        })
        .await
    }

    async fn get_attribute(
        &self,
        id: &NodeId,
        name: &str,
        attr_type: AttributeType,
    ) -> Result<Option<AttributeValue>, Error> {
        self.backend.get_attribute(id, name, attr_type).await
    }

    async fn remove_attribute(&self, id: &NodeId, name: &str) -> Result<bool, Error> {
        self.emit(self.backend.remove_attribute(id, name), |removed| {
            removed.then(|| NodeEvent::AttributeRemoved {
                node_id: *id,
                attr_name: name.to_string(),
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
        let inner = self
            .backend
            .open_data_source_write(id, attr_name, file_name)
            .await?;

        Ok(Box::new(ListenableDataSourceWriter {
            inner,
            bus: self.bus.clone(),
            ordering: self.ordering.clone(),
            event: self.emit_local.then(|| NodeEvent::DataSourceUpdated {
                node_id: *id,
                attr_name: attr_name.to_string(),
                file_name: file_name.to_string(),
            }),
        }))
    }

    async fn open_data_source_read(
        &self,
        id: &NodeId,
        attr_name: &str,
        file_name: &str,
    ) -> Result<Box<dyn DataSourceReader>, Error> {
        self.backend
            .open_data_source_read(id, attr_name, file_name)
            .await
    }

    async fn data_source_file_exists(
        &self,
        id: &NodeId,
        attr_name: &str,
        file_name: &str,
    ) -> Result<bool, Error> {
        self.backend
            .data_source_file_exists(id, attr_name, file_name)
            .await
    }

    async fn list_data_source_files(
        &self,
        id: &NodeId,
        attr_name: &str,
    ) -> Result<Vec<String>, Error> {
        self.backend.list_data_source_files(id, attr_name).await
    }

    async fn get_data_source_names(&self, id: &NodeId) -> Result<Vec<String>, Error> {
        self.backend.get_data_source_names(id).await
    }

    async fn remove_data_source_file(
        &self,
        id: &NodeId,
        attr_name: &str,
        file_name: &str,
    ) -> Result<bool, Error> {
        self.emit(
            self.backend
                .remove_data_source_file(id, attr_name, file_name),
            |removed| {
                removed.then(|| NodeEvent::DataSourceRemoved {
                    node_id: *id,
                    attr_name: attr_name.to_string(),
                    file_name: file_name.to_string(),
                })
            },
        )
        .await
    }

    async fn add_dependency(&self, id: &NodeId, name: &str, target: &NodeId) -> Result<(), Error> {
        self.emit(self.backend.add_dependency(id, name, target), |_| {
            Some(NodeEvent::DependencyAdded {
                node_id: *id,
                dep_name: name.to_string(),
                target_id: *target,
            })
        })
        .await
    }

    async fn get_dependencies(&self, id: &NodeId, name: &str) -> Result<Vec<NodeId>, Error> {
        self.backend.get_dependencies(id, name).await
    }

    async fn get_all_dependencies(&self, id: &NodeId) -> Result<Vec<NodeDependency>, Error> {
        self.backend.get_all_dependencies(id).await
    }

    async fn get_backward_dependencies(
        &self,
        id: &NodeId,
    ) -> Result<Vec<BackwardDependency>, Error> {
        self.backend.get_backward_dependencies(id).await
    }

    async fn remove_dependency(
        &self,
        id: &NodeId,
        name: &str,
        target: &NodeId,
    ) -> Result<bool, Error> {
        self.emit(self.backend.remove_dependency(id, name, target), |removed| {
            removed.then(|| NodeEvent::DependencyRemoved {
                node_id: *id,
                dep_name: name.to_string(),
                target_id: *target,
            })
        })
        .await
    }

    async fn set_consistent(&self, id: &NodeId) -> Result<bool, Error> {
        self.emit(self.backend.set_consistent(id), |changed| {
            changed.then(|| NodeEvent::NodeConsistent { node_id: *id })
        })
        .await
    }

    async fn is_consistent(&self, id: &NodeId) -> Result<bool, Error> {
        self.backend.is_consistent(id).await
    }

    async fn get_inconsistent_nodes(&self) -> Result<Vec<NodeInfo>, Error> {
        self.backend.get_inconsistent_nodes().await
    }

    async fn is_writable(&self, id: &NodeId) -> Result<bool, Error> {
        self.backend.is_writable(id).await
    }

    async fn delete_node(&self, id: &NodeId) -> Result<NodeId, Error> {
        self.emit(self.backend.delete_node(id), |parent_id| {
            Some(NodeEvent::NodeRemoved {
                node_id: *id,
                parent_id: *parent_id,
            })
        })
        .await
    }

    async fn flush(&self) -> Result<(), Error> {
        self.backend.flush().await
    }

    /// Closes the backend, and ends all subscriptions.
    async fn close(&self) -> Result<(), Error> {
        let res = self.backend.close().await;
        self.bus.clear();
        res
    }
}

/// Publishes [NodeEvent::DataSourceUpdated] once the inner writer committed.
struct ListenableDataSourceWriter {
    inner: Box<dyn DataSourceWriter>,
    bus: Arc<EventBus>,
    ordering: Arc<Mutex<()>>,
    /// Taken on the first successful close.
    event: Option<NodeEvent>,
}

#[async_trait]
impl DataSourceWriter for ListenableDataSourceWriter {
    async fn close(&mut self) -> Result<(), Error> {
        let _ordering = self.ordering.lock().await;
        self.inner.close().await?;
        if let Some(event) = self.event.take() {
            self.bus.publish(event);
        }
        Ok(())
    }
}

impl tokio::io::AsyncWrite for ListenableDataSourceWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::backend::from_addr;

    async fn make_store() -> ListenableStore {
        ListenableStore::new(from_addr("memory://").await.expect("must succeed"))
    }

    #[tokio::test]
    async fn one_event_per_mutation_in_order() {
        let store = make_store().await;
        let mut sub = store.subscribe();

        let root = store.get_root_node("mem").await.unwrap().info;
        let folder = store
            .create_node(&root.id, "projects", "folder", "")
            .await
            .unwrap();
        store
            .set_attribute(&folder.id, "format", "XIIDM".into())
            .await
            .unwrap();
        store
            .add_dependency(&folder.id, "uses", &root.id)
            .await
            .unwrap();
        store
            .remove_dependency(&folder.id, "uses", &root.id)
            .await
            .unwrap();
        store.delete_node(&folder.id).await.unwrap();

        let expected = vec![
            NodeEvent::NodeCreated {
                node_id: root.id,
                parent_id: None,
            },
            NodeEvent::NodeCreated {
                node_id: folder.id,
                parent_id: Some(root.id),
            },
            NodeEvent::AttributeUpdated {
                node_id: folder.id,
                attr_name: "format".to_string(),
            },
            NodeEvent::DependencyAdded {
                node_id: folder.id,
                dep_name: "uses".to_string(),
                target_id: root.id,
            },
            NodeEvent::DependencyRemoved {
                node_id: folder.id,
                dep_name: "uses".to_string(),
                target_id: root.id,
            },
            NodeEvent::NodeRemoved {
                node_id: folder.id,
                parent_id: root.id,
            },
        ];

        for event in expected {
            assert_eq!(Some(event), sub.recv().await);
        }
        assert_eq!(None, sub.try_recv());
    }

    #[tokio::test]
    async fn no_events_without_change() {
        let store = make_store().await;
        let root = store.get_root_node("mem").await.unwrap().info;

        let mut sub = store.subscribe();

        // root exists already, nothing to remove, and failing calls.
        store.get_root_node("mem").await.unwrap();
        assert!(!store.remove_attribute(&root.id, "nope").await.unwrap());
        assert!(!store
            .remove_dependency(&root.id, "uses", &NodeId::new())
            .await
            .unwrap());
        store.create_node(&root.id, "a", "folder", "").await.unwrap();
        store
            .create_node(&root.id, "a", "folder", "")
            .await
            .expect_err("must fail");
        store.delete_node(&root.id).await.expect_err("must fail");

        assert!(matches!(
            sub.recv().await,
            Some(NodeEvent::NodeCreated { .. })
        ));
        assert_eq!(None, sub.try_recv());
    }

    /// Setting an inconsistent node consistent emits once, later calls are
    /// no-ops.
    #[tokio::test]
    async fn node_consistent_event() {
        let store = make_store().await;
        let root = store.get_root_node("mem").await.unwrap().info;

        let mut sub = store.subscribe();
        let node = store
            .create_inconsistent_node(&root.id, "import", "folder", "")
            .await
            .unwrap();
        assert!(store.set_consistent(&node.id).await.unwrap());
        assert!(!store.set_consistent(&node.id).await.unwrap());

        assert_eq!(
            Some(NodeEvent::NodeCreated {
                node_id: node.id,
                parent_id: Some(root.id),
            }),
            sub.recv().await
        );
        assert_eq!(
            Some(NodeEvent::NodeConsistent { node_id: node.id }),
            sub.recv().await
        );
        assert_eq!(None, sub.try_recv());
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let store = make_store().await;
        let root = store.get_root_node("mem").await.unwrap().info;
        store.create_node(&root.id, "a", "folder", "").await.unwrap();

        let mut sub = store.subscribe();
        let b = store.create_node(&root.id, "b", "folder", "").await.unwrap();

        assert_eq!(
            Some(NodeEvent::NodeCreated {
                node_id: b.id,
                parent_id: Some(root.id),
            }),
            sub.recv().await
        );
        assert_eq!(None, sub.try_recv());
    }

    #[tokio::test]
    async fn data_source_event_on_close() {
        let store = make_store().await;
        let root = store.get_root_node("mem").await.unwrap().info;
        let mut sub = store.subscribe();

        let mut w = store
            .open_data_source_write(&root.id, "case", "network.xiidm")
            .await
            .unwrap();
        w.write_all(b"<network/>").await.unwrap();
        assert_eq!(None, sub.try_recv());

        w.close().await.unwrap();
        // closing again is a no-op, and doesn't publish again.
        w.close().await.unwrap();

        assert_eq!(
            Some(NodeEvent::DataSourceUpdated {
                node_id: root.id,
                attr_name: "case".to_string(),
                file_name: "network.xiidm".to_string(),
            }),
            sub.recv().await
        );
        assert_eq!(None, sub.try_recv());
    }

    /// A subscriber that never reads is dropped, the writer doesn't notice.
    #[tokio::test]
    async fn slow_subscriber_is_dropped() {
        let store = ListenableStore::with_capacity(from_addr("memory://").await.unwrap(), 2);
        let root = store.get_root_node("mem").await.unwrap().info;

        let _slow = store.subscribe();
        assert_eq!(1, store.subscriber_count());

        for i in 0..3 {
            tokio::time::timeout(
                Duration::from_secs(5),
                store.set_attribute(&root.id, "counter", AttributeValue::Integer(i)),
            )
            .await
            .expect("must not block")
            .expect("must succeed");
        }

        assert_eq!(0, store.subscriber_count());
    }

    #[tokio::test]
    async fn close_ends_subscriptions() {
        let store = make_store().await;
        let mut sub = store.subscribe();

        store.close().await.unwrap();
        assert_eq!(None, sub.recv().await);
    }

    /// Events of a remote drive arrive through the server's event stream.
    /// A subscriber only sees what was committed after it subscribed.
    #[tokio::test]
    async fn remote_subscriber_sees_no_replay() {
        let remote = crate::backend::tests::utils::make_remote_store().await;
        let store = ListenableStore::new(Box::new(remote));
        let mut first = store.subscribe();
        let root = store.get_root_node("test").await.unwrap().info;
        assert_eq!(
            Some(NodeEvent::NodeCreated {
                node_id: root.id,
                parent_id: None,
            }),
            tokio::time::timeout(Duration::from_secs(5), first.recv())
                .await
                .expect("must arrive")
        );

        store
            .set_attribute(&root.id, "a", "1".into())
            .await
            .unwrap();
        assert_eq!(
            Some(NodeEvent::AttributeUpdated {
                node_id: root.id,
                attr_name: "a".to_string(),
            }),
            tokio::time::timeout(Duration::from_secs(5), first.recv())
                .await
                .expect("must arrive")
        );

        let mut second = store.subscribe();
        store
            .set_attribute(&root.id, "b", "2".into())
            .await
            .unwrap();

        let expected = Some(NodeEvent::AttributeUpdated {
            node_id: root.id,
            attr_name: "b".to_string(),
        });
        for sub in [&mut first, &mut second] {
            assert_eq!(
                expected,
                tokio::time::timeout(Duration::from_secs(5), sub.recv())
                    .await
                    .expect("must arrive")
            );
        }
        assert_eq!(None, second.try_recv());
    }
}
