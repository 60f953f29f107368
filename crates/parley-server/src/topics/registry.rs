use std::collections::HashMap;
use std::sync::Arc;

use parley_core::ids::ConnectionId;

use crate::connection::Connection;

enum MemberState {
    Live,
    /// Waiting for its snapshot. Broadcasts queue here until it arrives.
    Pending { ticket: u64, queued: Vec<String> },
}

struct Member {
    conn: Arc<Connection>,
    state: MemberState,
}

/// Path → members for one root. Callers hold the root lock around every call.
#[derive(Default)]
pub struct SubscriptionRegistry {
    paths: HashMap<String, HashMap<ConnectionId, Member>>,
}

impl SubscriptionRegistry {
    /// Record a membership. `ticket` marks it pending until
    /// [`Self::complete`] is called with the same ticket.
    /// Returns false if the connection was already a member.
    pub fn insert(&mut self, path: &str, conn: &Arc<Connection>, ticket: Option<u64>) -> bool {
        let members = self.paths.entry(path.to_string()).or_default();
        if members.contains_key(&conn.id) {
            return false;
        }
        let state = match ticket {
            Some(ticket) => MemberState::Pending {
                ticket,
                queued: Vec::new(),
            },
            None => MemberState::Live,
        };
        members.insert(
            conn.id.clone(),
            Member {
                conn: Arc::clone(conn),
                state,
            },
        );
        true
    }

    /// Drop a membership, pruning the path if it empties.
    pub fn remove(&mut self, path: &str, id: &ConnectionId) -> bool {
        let Some(members) = self.paths.get_mut(path) else {
            return false;
        };
        let removed = members.remove(id).is_some();
        if members.is_empty() {
            self.paths.remove(path);
        }
        removed
    }

    /// Drop every membership of a connection; returns the paths it left.
    pub fn remove_connection(&mut self, id: &ConnectionId) -> Vec<String> {
        let mut left = Vec::new();
        self.paths.retain(|path, members| {
            if members.remove(id).is_some() {
                left.push(path.clone());
            }
            !members.is_empty()
        });
        left
    }

    /// Deliver a frame to every member of the exact path. Pending members
    /// queue it. Returns how many members received or queued it.
    pub fn deliver(&mut self, path: &str, frame: &str) -> usize {
        let Some(members) = self.paths.get_mut(path) else {
            return 0;
        };
        for member in members.values_mut() {
            match &mut member.state {
                MemberState::Live => {
                    member.conn.send(frame.to_string());
                }
                MemberState::Pending { queued, .. } => queued.push(frame.to_string()),
            }
        }
        members.len()
    }

    /// Finish a pending membership: send the snapshot (if any), then the
    /// queued frames, and go live. Stale tickets and vanished members are
    /// ignored.
    pub fn complete(
        &mut self,
        path: &str,
        id: &ConnectionId,
        ticket: u64,
        snapshot: Option<String>,
    ) -> bool {
        let Some(member) = self.paths.get_mut(path).and_then(|m| m.get_mut(id)) else {
            return false;
        };
        let queued = match &mut member.state {
            MemberState::Pending {
                ticket: current,
                queued,
            } if *current == ticket => std::mem::take(queued),
            _ => return false,
        };
        member.state = MemberState::Live;
        if let Some(snapshot) = snapshot {
            member.conn.send(snapshot);
        }
        for frame in queued {
            member.conn.send(frame);
        }
        true
    }

    pub fn members(&self, path: &str) -> Vec<Arc<Connection>> {
        self.paths
            .get(path)
            .map(|m| m.values().map(|member| Arc::clone(&member.conn)).collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, path: &str, id: &ConnectionId) -> bool {
        self.paths.get(path).is_some_and(|m| m.contains_key(id))
    }

    pub fn member_count(&self, path: &str) -> usize {
        self.paths.get(path).map_or(0, HashMap::len)
    }

    pub fn path_count(&self) -> usize {
        self.paths.len()
    }
}
