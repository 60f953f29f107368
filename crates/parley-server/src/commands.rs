//! The command chain: `auth`, `subscribe` and `unsubscribe` handlers tried in
//! order until one claims the frame's topic label.

use std::sync::Arc;

use async_trait::async_trait;
use parley_core::validation;
use parley_core::TopicPath;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::connection::Connection;
use crate::data::DataAccess;
use crate::frame::{self, AuthPayload, CommandFrame, TopicsPayload};
use crate::topics::TopicChain;

#[async_trait]
pub trait CommandNode: Send + Sync {
    /// The frame topic this node consumes.
    fn label(&self) -> &'static str;

    async fn handle(&self, conn: &Arc<Connection>, payload: Value);
}

pub struct CommandChain {
    nodes: Vec<Box<dyn CommandNode>>,
}

impl CommandChain {
    pub fn new(nodes: Vec<Box<dyn CommandNode>>) -> Self {
        Self { nodes }
    }

    /// Authenticator, then subscribe, then unsubscribe.
    pub fn standard(data: Arc<dyn DataAccess>, topics: Arc<TopicChain>) -> Self {
        Self::new(vec![
            Box::new(Authenticator::new(data)),
            Box::new(SubscriptionCommand::subscribe(Arc::clone(&topics))),
            Box::new(SubscriptionCommand::unsubscribe(topics)),
        ])
    }

    /// For deployments that attach identity before registering the
    /// connection: no `auth` node.
    pub fn without_auth(topics: Arc<TopicChain>) -> Self {
        Self::new(vec![
            Box::new(SubscriptionCommand::subscribe(Arc::clone(&topics))),
            Box::new(SubscriptionCommand::unsubscribe(topics)),
        ])
    }

    pub fn labels(&self) -> Vec<&'static str> {
        self.nodes.iter().map(|n| n.label()).collect()
    }

    /// Hand the frame to the first node whose label matches. Returns false
    /// when nothing claimed it.
    pub async fn dispatch(&self, conn: &Arc<Connection>, frame: CommandFrame) -> bool {
        match self.nodes.iter().find(|node| node.label() == frame.topic) {
            Some(node) => {
                node.handle(conn, frame.payload).await;
                true
            }
            None => {
                debug!(conn_id = %conn.id, topic = %frame.topic, "unclaimed frame dropped");
                false
            }
        }
    }
}

/// Binds a username to the connection after checking its api key.
pub struct Authenticator {
    data: Arc<dyn DataAccess>,
}

impl Authenticator {
    pub fn new(data: Arc<dyn DataAccess>) -> Self {
        Self { data }
    }

    async fn verify(&self, conn: &Connection, payload: Value) -> Result<String, &'static str> {
        let auth: AuthPayload =
            serde_json::from_value(payload).map_err(|_| "invalid payload")?;
        if !validation::is_username(&auth.username)
            || !validation::is_credential(auth.credential.expose())
        {
            return Err("invalid payload");
        }
        if conn.identity().is_some() {
            return Err("already authenticated");
        }
        let stored = match self.data.api_key_for(&auth.username).await {
            Ok(Some(key)) => key,
            Ok(None) => return Err("unknown user"),
            Err(error) => {
                warn!(conn_id = %conn.id, %error, "credential lookup failed");
                return Err("lookup failed");
            }
        };
        if !auth.credential.matches(&stored) {
            return Err("invalid credential");
        }
        Ok(auth.username)
    }
}

#[async_trait]
impl CommandNode for Authenticator {
    fn label(&self) -> &'static str {
        frame::AUTH
    }

    #[instrument(skip_all, fields(conn_id = %conn.id))]
    async fn handle(&self, conn: &Arc<Connection>, payload: Value) {
        match self.verify(conn, payload).await {
            Ok(username) => {
                if !conn.set_identity(username.as_str()) {
                    conn.send(frame::auth_reply(false, "already authenticated"));
                    return;
                }
                info!(username = %username, "connection authenticated");
                conn.send(frame::auth_reply(true, "authenticated"));
            }
            Err(reason) => {
                debug!(reason, "authentication refused");
                conn.send(frame::auth_reply(false, reason));
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Action {
    Add,
    Remove,
}

/// `subscribe` or `unsubscribe`, gated on an authenticated identity.
pub struct SubscriptionCommand {
    action: Action,
    topics: Arc<TopicChain>,
}

impl SubscriptionCommand {
    pub fn subscribe(topics: Arc<TopicChain>) -> Self {
        Self {
            action: Action::Add,
            topics,
        }
    }

    pub fn unsubscribe(topics: Arc<TopicChain>) -> Self {
        Self {
            action: Action::Remove,
            topics,
        }
    }
}

#[async_trait]
impl CommandNode for SubscriptionCommand {
    fn label(&self) -> &'static str {
        match self.action {
            Action::Add => frame::SUBSCRIBE,
            Action::Remove => frame::UNSUBSCRIBE,
        }
    }

    #[instrument(skip_all, fields(conn_id = %conn.id, command = self.label()))]
    async fn handle(&self, conn: &Arc<Connection>, payload: Value) {
        let request = serde_json::from_value::<TopicsPayload>(payload).ok();

        // The identity gate answers even when the payload is unreadable.
        if conn.identity().is_none() {
            let echoed = request.as_ref().map_or(&[][..], |r| r.topics.as_slice());
            conn.send(frame::topics_reply(
                self.label(),
                echoed,
                false,
                "not authenticated",
            ));
            return;
        }

        let Some(request) = request else {
            debug!("malformed topics payload dropped");
            return;
        };

        let mut changed = 0usize;
        for raw in &request.topics {
            let Ok(path) = TopicPath::parse(raw) else {
                debug!(topic = %raw, "malformed topic skipped");
                continue;
            };
            let applied = match self.action {
                Action::Add => self.topics.add_subscription(&path, conn),
                Action::Remove => self.topics.remove_subscription(&path, conn),
            };
            changed += usize::from(applied);
        }
        debug!(requested = request.topics.len(), changed, "topics processed");

        conn.send(frame::topics_reply(
            self.label(),
            &request.topics,
            true,
            "successful",
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topics::test_support::FakeData;
    use parley_core::security::{derive_api_key, Credential};
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Fixture {
        chain: CommandChain,
        topics: Arc<TopicChain>,
        data: Arc<FakeData>,
        alice_key: String,
    }

    fn fixture() -> Fixture {
        let data = Arc::new(FakeData::default());
        let alice_key = derive_api_key("alice", &Credential::new("passw0rd"));
        data.keys.lock().push(("alice".into(), alice_key.clone()));
        let topics = Arc::new(TopicChain::standard(data.clone()));
        Fixture {
            chain: CommandChain::standard(data.clone(), Arc::clone(&topics)),
            topics,
            data,
            alice_key,
        }
    }

    fn conn() -> (Arc<Connection>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(64);
        (Arc::new(Connection::new(tx)), rx)
    }

    fn cmd(topic: &str, payload: Value) -> CommandFrame {
        CommandFrame {
            topic: topic.into(),
            payload,
        }
    }

    fn reply(rx: &mut mpsc::Receiver<String>) -> Value {
        serde_json::from_str(&rx.try_recv().expect("no reply")).unwrap()
    }

    #[tokio::test]
    async fn auth_success_sets_identity() {
        let f = fixture();
        let (c, mut rx) = conn();
        let frame = cmd("auth", json!({"username": "alice", "credential": f.alice_key}));
        assert!(f.chain.dispatch(&c, frame).await);
        assert_eq!(
            reply(&mut rx),
            json!({"topic": "auth", "payload": {"success": true, "msg": "authenticated"}})
        );
        assert_eq!(c.identity(), Some("alice"));
    }

    #[tokio::test]
    async fn auth_failures_leave_identity_unset() {
        let f = fixture();
        let cases = [
            (json!({"username": "alice"}), "invalid payload"),
            (json!({"username": "al ice", "credential": f.alice_key}), "invalid payload"),
            (json!({"username": "alice", "credential": "short"}), "invalid payload"),
            (json!({"username": "bob", "credential": f.alice_key}), "unknown user"),
            (
                json!({"username": "alice", "api_key": derive_api_key("alice", &Credential::new("wrong123"))}),
                "invalid credential",
            ),
        ];
        for (payload, reason) in cases {
            let (c, mut rx) = conn();
            f.chain.dispatch(&c, cmd("auth", payload)).await;
            let r = reply(&mut rx);
            assert_eq!(r["payload"]["success"], false);
            assert_eq!(r["payload"]["msg"], reason);
            assert_eq!(c.identity(), None);
        }
    }

    #[tokio::test]
    async fn lookup_failure_is_reported() {
        let f = fixture();
        *f.data.fail_reads.lock() = true;
        let (c, mut rx) = conn();
        f.chain
            .dispatch(&c, cmd("auth", json!({"username": "alice", "credential": f.alice_key})))
            .await;
        assert_eq!(reply(&mut rx)["payload"]["msg"], "lookup failed");
    }

    #[tokio::test]
    async fn second_auth_is_refused() {
        let f = fixture();
        let (c, mut rx) = conn();
        let payload = json!({"username": "alice", "credential": f.alice_key});
        f.chain.dispatch(&c, cmd("auth", payload.clone())).await;
        reply(&mut rx);
        f.chain.dispatch(&c, cmd("auth", payload)).await;
        let r = reply(&mut rx);
        assert_eq!(r["payload"]["success"], false);
        assert_eq!(r["payload"]["msg"], "already authenticated");
        assert_eq!(c.identity(), Some("alice"));
    }

    #[tokio::test]
    async fn unauthenticated_subscribe_is_gated() {
        let f = fixture();
        let (c, mut rx) = conn();
        for command in ["subscribe", "unsubscribe"] {
            f.chain
                .dispatch(&c, cmd(command, json!({"topics": ["presence"]})))
                .await;
            assert_eq!(
                reply(&mut rx),
                json!({"topic": command, "payload": {
                    "topics": ["presence"], "success": false, "msg": "not authenticated"
                }})
            );
        }
        assert_eq!(f.topics.member_count(&TopicPath::parse("presence").unwrap()), 0);
    }

    #[tokio::test]
    async fn unauthenticated_malformed_payload_is_still_gated() {
        let f = fixture();
        let (c, mut rx) = conn();
        for payload in [json!({}), json!({"topics": "presence"}), Value::Null] {
            f.chain.dispatch(&c, cmd("subscribe", payload)).await;
            assert_eq!(
                reply(&mut rx),
                json!({"topic": "subscribe", "payload": {
                    "topics": [], "success": false, "msg": "not authenticated"
                }})
            );
        }

        c.set_identity("alice");
        f.chain.dispatch(&c, cmd("subscribe", json!({}))).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_topics_are_skipped() {
        let f = fixture();
        let (c, mut rx) = conn();
        c.set_identity("alice");
        let topics = json!(["", "chat-rooms.", "weather", "presence"]);
        f.chain
            .dispatch(&c, cmd("subscribe", json!({ "topics": topics })))
            .await;

        let mut frames = Vec::new();
        while let Ok(raw) = rx.try_recv() {
            frames.push(serde_json::from_str::<Value>(&raw).unwrap());
        }
        let response = frames.last().unwrap();
        assert_eq!(response["topic"], "subscribe");
        assert_eq!(response["payload"]["success"], true);
        assert_eq!(response["payload"]["msg"], "successful");
        assert_eq!(response["payload"]["topics"], topics);
        assert_eq!(f.topics.member_count(&TopicPath::parse("presence").unwrap()), 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_membership() {
        let f = fixture();
        let (c, _rx) = conn();
        c.set_identity("alice");
        let presence = TopicPath::parse("presence").unwrap();
        f.chain
            .dispatch(&c, cmd("subscribe", json!({"topics": ["presence"]})))
            .await;
        assert_eq!(f.topics.member_count(&presence), 1);
        f.chain
            .dispatch(&c, cmd("unsubscribe", json!({"topics": ["presence"]})))
            .await;
        assert_eq!(f.topics.member_count(&presence), 0);
    }

    #[tokio::test]
    async fn unknown_command_is_dropped() {
        let f = fixture();
        let (c, mut rx) = conn();
        assert!(!f.chain.dispatch(&c, cmd("publish", json!({}))).await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn chain_without_auth_skips_authenticator() {
        let f = fixture();
        let chain = CommandChain::without_auth(Arc::clone(&f.topics));
        assert_eq!(chain.labels(), vec!["subscribe", "unsubscribe"]);
        let (c, mut rx) = conn();
        assert!(!chain
            .dispatch(&c, cmd("auth", json!({"username": "alice", "credential": f.alice_key})))
            .await);
        assert!(rx.try_recv().is_err());
    }
}
