//! Root-scoped subscription routing.
//!
//! Each root label (`chat-rooms`, `presence`, `messages`) owns one
//! [`SubscriptionRegistry`] behind its own lock. Registration and broadcast are
//! routed by the first path segment.

pub mod policy;
pub mod registry;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use parley_core::TopicPath;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::data::DataAccess;
use crate::frame::BroadcastMessage;
pub use policy::{ChatroomsPolicy, MessagesPolicy, PresencePolicy, SnapshotError, TopicPolicy};
pub use registry::SubscriptionRegistry;

struct RootNode {
    policy: Arc<dyn TopicPolicy>,
    registry: Mutex<SubscriptionRegistry>,
    tickets: AtomicU64,
}

impl RootNode {
    fn add(self: &Arc<Self>, path: &TopicPath, conn: &Arc<Connection>) -> bool {
        if !self.policy.accepts(path.params()) {
            return false;
        }
        let key = path.canonical();
        let ticket = self
            .policy
            .deferred_snapshot()
            .then(|| self.tickets.fetch_add(1, Ordering::Relaxed));

        {
            let mut registry = self.registry.lock();
            // A closed connection has already been swept; adding it now would leak.
            if conn.is_closed() || !registry.insert(&key, conn, ticket) {
                return false;
            }
            self.policy.on_added(&mut registry, &key, conn);
        }
        debug!(conn_id = %conn.id, topic = %key, "subscription added");

        if let Some(ticket) = ticket {
            let node = Arc::clone(self);
            let path = path.clone();
            let conn_id = conn.id.clone();
            tokio::spawn(async move {
                let snapshot = match node.policy.load_snapshot(&path).await {
                    Ok(items) => Some(BroadcastMessage::snapshot(&key, items).to_frame()),
                    Err(error) => {
                        warn!(topic = %key, %error, "snapshot read failed, skipping");
                        None
                    }
                };
                node.registry.lock().complete(&key, &conn_id, ticket, snapshot);
            });
        }
        true
    }

    fn remove(&self, path: &TopicPath, conn: &Arc<Connection>) -> bool {
        let key = path.canonical();
        let mut registry = self.registry.lock();
        if !registry.remove(&key, &conn.id) {
            return false;
        }
        self.policy.on_removed(&mut registry, &key, conn);
        debug!(conn_id = %conn.id, topic = %key, "subscription removed");
        true
    }

    fn remove_connection(&self, conn: &Arc<Connection>) -> usize {
        let mut registry = self.registry.lock();
        let left = registry.remove_connection(&conn.id);
        for key in &left {
            self.policy.on_removed(&mut registry, key, conn);
        }
        left.len()
    }
}

/// The ordered set of root nodes.
pub struct TopicChain {
    order: Vec<&'static str>,
    nodes: HashMap<&'static str, Arc<RootNode>>,
}

impl TopicChain {
    /// Build a chain from policies. Root labels must be unique; a later
    /// duplicate is ignored.
    pub fn new(policies: Vec<Arc<dyn TopicPolicy>>) -> Self {
        let mut order = Vec::with_capacity(policies.len());
        let mut nodes = HashMap::with_capacity(policies.len());
        for policy in policies {
            let root = policy.root();
            if nodes.contains_key(root) {
                warn!(root, "duplicate topic root ignored");
                continue;
            }
            order.push(root);
            nodes.insert(
                root,
                Arc::new(RootNode {
                    policy,
                    registry: Mutex::new(SubscriptionRegistry::default()),
                    tickets: AtomicU64::new(0),
                }),
            );
        }
        Self { order, nodes }
    }

    /// `chat-rooms`, `presence` and `messages`.
    pub fn standard(data: Arc<dyn DataAccess>) -> Self {
        Self::new(vec![
            Arc::new(ChatroomsPolicy::new(Arc::clone(&data))),
            Arc::new(PresencePolicy),
            Arc::new(MessagesPolicy::new(data)),
        ])
    }

    pub fn roots(&self) -> &[&'static str] {
        &self.order
    }

    fn node(&self, root: &str) -> Option<&Arc<RootNode>> {
        self.nodes.get(root)
    }

    /// Subscribe `conn` to `path`. Returns true only for a new membership;
    /// unknown roots, malformed params, duplicates and closed connections
    /// return false with no side effect.
    pub fn add_subscription(&self, path: &TopicPath, conn: &Arc<Connection>) -> bool {
        self.node(path.root())
            .is_some_and(|node| node.add(path, conn))
    }

    pub fn remove_subscription(&self, path: &TopicPath, conn: &Arc<Connection>) -> bool {
        self.node(path.root())
            .is_some_and(|node| node.remove(path, conn))
    }

    /// Sweep a connection out of every root. Returns the number of
    /// memberships removed.
    pub fn remove_connection(&self, conn: &Arc<Connection>) -> usize {
        self.order
            .iter()
            .filter_map(|root| self.nodes.get(root))
            .map(|node| node.remove_connection(conn))
            .sum()
    }

    /// Deliver to every member of the exact topic path. Returns the
    /// recipient count; unknown roots and empty paths deliver nothing.
    pub fn broadcast(&self, message: &BroadcastMessage) -> usize {
        let Ok(path) = TopicPath::parse(&message.topic) else {
            return 0;
        };
        let Some(node) = self.node(path.root()) else {
            return 0;
        };
        let recipients = node
            .registry
            .lock()
            .deliver(&path.canonical(), &message.to_frame());
        debug!(topic = %message.topic, kind = message.kind.as_str(), recipients, "broadcast");
        recipients
    }

    pub fn member_count(&self, path: &TopicPath) -> usize {
        self.node(path.root())
            .map_or(0, |node| node.registry.lock().member_count(&path.canonical()))
    }
}
