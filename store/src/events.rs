use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::node::NodeId;

/// Default capacity of a subscriber queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// A change that was committed to a store.
///
/// Serialized with a `type` tag and camelCase fields, e.g.
/// `{"type":"AttributeUpdated","nodeId":"…","attrName":"format"}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum NodeEvent {
    NodeCreated {
        node_id: NodeId,
        parent_id: Option<NodeId>,
    },
    NodeRemoved {
        node_id: NodeId,
        parent_id: NodeId,
    },
    AttributeUpdated {
        node_id: NodeId,
        attr_name: String,
    },
    AttributeRemoved {
        node_id: NodeId,
        attr_name: String,
    },
    DependencyAdded {
        node_id: NodeId,
        dep_name: String,
        target_id: NodeId,
    },
    DependencyRemoved {
        node_id: NodeId,
        dep_name: String,
        target_id: NodeId,
    },
    DataSourceUpdated {
        node_id: NodeId,
        attr_name: String,
        file_name: String,
    },
    DataSourceRemoved {
        node_id: NodeId,
        attr_name: String,
        file_name: String,
    },
    DescriptionUpdated {
        node_id: NodeId,
    },
    NodeRenamed {
        node_id: NodeId,
        name: String,
    },
    ParentChanged {
        node_id: NodeId,
        old_parent_id: NodeId,
        new_parent_id: NodeId,
    },
    /// An inconsistent node became visible below its parent.
    NodeConsistent {
        node_id: NodeId,
    },
}

impl NodeEvent {
    /// The node the event is about.
    pub fn node_id(&self) -> NodeId {
        match self {
            NodeEvent::NodeCreated { node_id, .. }
            | NodeEvent::NodeRemoved { node_id, .. }
            | NodeEvent::AttributeUpdated { node_id, .. }
            | NodeEvent::AttributeRemoved { node_id, .. }
            | NodeEvent::DependencyAdded { node_id, .. }
            | NodeEvent::DependencyRemoved { node_id, .. }
            | NodeEvent::DataSourceUpdated { node_id, .. }
            | NodeEvent::DataSourceRemoved { node_id, .. }
            | NodeEvent::DescriptionUpdated { node_id }
            | NodeEvent::NodeRenamed { node_id, .. }
            | NodeEvent::ParentChanged { node_id, .. }
            | NodeEvent::NodeConsistent { node_id } => *node_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NodeEvent::NodeCreated { .. } => "NodeCreated",
            NodeEvent::NodeRemoved { .. } => "NodeRemoved",
            NodeEvent::AttributeUpdated { .. } => "AttributeUpdated",
            NodeEvent::AttributeRemoved { .. } => "AttributeRemoved",
            NodeEvent::DependencyAdded { .. } => "DependencyAdded",
            NodeEvent::DependencyRemoved { .. } => "DependencyRemoved",
            NodeEvent::DataSourceUpdated { .. } => "DataSourceUpdated",
            NodeEvent::DataSourceRemoved { .. } => "DataSourceRemoved",
            NodeEvent::DescriptionUpdated { .. } => "DescriptionUpdated",
            NodeEvent::NodeRenamed { .. } => "NodeRenamed",
            NodeEvent::ParentChanged { .. } => "ParentChanged",
            NodeEvent::NodeConsistent { .. } => "NodeConsistent",
        }
    }
}

/// Fans out events to a dynamic set of subscribers.
///
/// Every subscriber owns a bounded queue. Publishing never waits: a
/// subscriber whose queue is full is dropped, its [EventSubscription] ends
/// after the already queued events were received.
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<NodeEvent>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Registers a new subscriber. It receives every event published after
    /// this call returned.
    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers.lock().push(tx);
        EventSubscription { rx }
    }

    pub fn publish(&self, event: NodeEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(event.kind = event.kind(), "subscriber queue full, dropping subscriber");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("subscriber went away");
                false
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Drops all subscribers, their subscriptions end once drained.
    pub fn clear(&self) {
        self.subscribers.lock().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// The receiving side of a subscription, obtained from
/// [EventBus::subscribe]. Also usable as a [Stream].
pub struct EventSubscription {
    rx: mpsc::Receiver<NodeEvent>,
}

impl EventSubscription {
    /// Waits for the next event. Returns None once the subscription ended.
    pub async fn recv(&mut self) -> Option<NodeEvent> {
        self.rx.recv().await
    }

    /// Returns an already queued event, if any.
    pub fn try_recv(&mut self) -> Option<NodeEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventSubscription {
    type Item = NodeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
