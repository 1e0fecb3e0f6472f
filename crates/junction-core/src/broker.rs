//! Publish/subscribe routing for one realm.
//!
//! The broker keeps two indices that must agree: topic to subscriptions
//! (who receives a publish) and subscription to topic (what an unsubscribe
//! removes). Both live behind a single lock, and events are queued while it
//! is held so each subscriber sees publishes in the order they were routed.
//! Queueing never waits: an event for a subscriber whose outbound queue is
//! full is dropped.

use crate::id::new_id;
use crate::peer::PeerError;
use crate::session::{reply, SessionHandle, SessionTable};
use junction_protocol::messages::{
    Event, Publish, Published, Subscribe, Subscribed, Unsubscribe, Unsubscribed,
};
use junction_protocol::{reason, Dict, Id, Message, MessageType, Uri};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, trace, warn};

#[derive(Debug, Default)]
struct Routes {
    /// topic -> (subscription -> subscriber session)
    topics: HashMap<Uri, HashMap<Id, Id>>,
    /// subscription -> topic
    subscriptions: HashMap<Id, Uri>,
}

impl Routes {
    fn insert(&mut self, topic: Uri, subscription: Id, session: Id) {
        self.topics
            .entry(topic.clone())
            .or_default()
            .insert(subscription, session);
        self.subscriptions.insert(subscription, topic);
    }

    /// Remove a subscription from both indices.
    ///
    /// Returns the topic it was under, or `None` if it is unknown.
    fn remove(&mut self, subscription: Id) -> Option<Uri> {
        let topic = self.subscriptions.remove(&subscription)?;
        let found = self
            .topics
            .get_mut(&topic)
            .is_some_and(|subscribers| subscribers.remove(&subscription).is_some());

        if found {
            if self.topics.get(&topic).is_some_and(HashMap::is_empty) {
                self.topics.remove(&topic);
            }
        } else {
            error!(
                subscription,
                topic = %topic,
                "Subscription missing from topic table"
            );
        }
        debug_assert!(found, "broker indices out of sync for {subscription}");
        Some(topic)
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let forward: usize = self.topics.values().map(HashMap::len).sum();
        forward == self.subscriptions.len()
            && self.topics.values().all(|subscribers| !subscribers.is_empty())
            && self.subscriptions.iter().all(|(id, topic)| {
                self.topics
                    .get(topic)
                    .is_some_and(|subscribers| subscribers.contains_key(id))
            })
    }
}

/// Routes events from publishers to subscribers.
#[derive(Debug)]
pub struct Broker {
    routes: Mutex<Routes>,
    sessions: Arc<SessionTable>,
}

impl Broker {
    /// Create a broker resolving subscribers through `sessions`.
    #[must_use]
    pub fn new(sessions: Arc<SessionTable>) -> Self {
        Self {
            routes: Mutex::new(Routes::default()),
            sessions,
        }
    }

    /// Publish an event to every subscriber of the topic.
    ///
    /// The publisher is skipped unless `exclude_me` is falsy. A PUBLISHED
    /// acknowledgement is sent only when `acknowledge` is `true`.
    /// Subscribers whose outbound queue is full miss the event.
    pub async fn publish(&self, publisher: &SessionHandle, msg: Publish) {
        let publication = new_id();
        let exclude_me = msg.options.get("exclude_me").map_or(true, is_truthy);
        let acknowledge = matches!(msg.options.get("acknowledge"), Some(Value::Bool(true)));

        {
            let routes = self.routes.lock().await;
            let mut recipients = 0usize;

            for (&subscription, &session) in routes.topics.get(&msg.topic).into_iter().flatten() {
                if exclude_me && session == publisher.id() {
                    continue;
                }
                let Some(subscriber) = self.sessions.get(&session).map(|s| s.clone()) else {
                    continue;
                };

                let event = Message::Event(Event {
                    subscription,
                    publication,
                    details: Dict::new(),
                    arguments: msg.arguments.clone(),
                    arguments_kw: msg.arguments_kw.clone(),
                });
                // A slow subscriber loses events rather than stalling the realm
                match subscriber.try_send(event) {
                    Ok(()) => recipients += 1,
                    Err(PeerError::Full) => {
                        warn!(
                            session,
                            subscription,
                            topic = %msg.topic,
                            "Dropped event for full subscriber queue"
                        );
                    }
                    Err(PeerError::Closed) => {
                        trace!(session, subscription, "Dropped event for closed subscriber");
                    }
                }
            }

            trace!(topic = %msg.topic, publication, recipients, "Published event");
        }

        if acknowledge {
            let published = Message::Published(Published {
                request: msg.request,
                publication,
            });
            reply(publisher, published).await;
        }
    }

    /// Subscribe a session to a topic.
    ///
    /// Repeated subscriptions to the same topic yield independent ids.
    pub async fn subscribe(&self, subscriber: &SessionHandle, msg: Subscribe) {
        let subscription = new_id();
        self.routes
            .lock()
            .await
            .insert(msg.topic.clone(), subscription, subscriber.id());

        debug!(
            session = subscriber.id(),
            topic = %msg.topic,
            subscription,
            "Subscribed"
        );

        let subscribed = Message::Subscribed(Subscribed {
            request: msg.request,
            subscription,
        });
        reply(subscriber, subscribed).await;
    }

    /// Remove a subscription.
    pub async fn unsubscribe(&self, subscriber: &SessionHandle, msg: Unsubscribe) {
        let removed = self.routes.lock().await.remove(msg.subscription);

        let response = match removed {
            Some(topic) => {
                debug!(
                    session = subscriber.id(),
                    topic = %topic,
                    subscription = msg.subscription,
                    "Unsubscribed"
                );
                Message::Unsubscribed(Unsubscribed { request: msg.request })
            }
            None => Message::error(
                MessageType::Unsubscribe,
                msg.request,
                reason::NO_SUCH_SUBSCRIPTION,
            ),
        };
        reply(subscriber, response).await;
    }

    /// Drop every subscription held by a session.
    pub async fn remove_session(&self, session: Id) {
        let mut routes = self.routes.lock().await;
        let owned: Vec<Id> = routes
            .topics
            .values()
            .flat_map(|subscribers| {
                subscribers
                    .iter()
                    .filter(move |&(_, &owner)| owner == session)
                    .map(|(&subscription, _)| subscription)
            })
            .collect();

        for subscription in &owned {
            routes.remove(*subscription);
        }

        if !owned.is_empty() {
            debug!(session, removed = owned.len(), "Removed subscriptions of session");
        }
    }

    /// Number of topics with at least one subscriber.
    pub async fn topic_count(&self) -> usize {
        self.routes.lock().await.topics.len()
    }

    /// Number of active subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.routes.lock().await.subscriptions.len()
    }

    #[cfg(test)]
    async fn is_consistent(&self) -> bool {
        self.routes.lock().await.is_consistent()
    }
}

/// Loose truthiness for option values.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerSender;
    use crate::test_support::{assert_idle, join, next, RECV_TIMEOUT};
    use serde_json::json;

    fn broker() -> (Broker, Arc<SessionTable>) {
        let sessions = Arc::new(SessionTable::new());
        (Broker::new(Arc::clone(&sessions)), sessions)
    }

    fn subscribe(request: Id, topic: &str) -> Subscribe {
        Subscribe {
            request,
            topic: topic.into(),
            ..Default::default()
        }
    }

    fn publish(request: Id, topic: &str, options: Value) -> Publish {
        let options = match options {
            Value::Object(map) => map,
            _ => Dict::new(),
        };
        Publish {
            request,
            options,
            topic: topic.into(),
            arguments: vec![json!("hello")],
            ..Default::default()
        }
    }

    async fn subscribed(rx: &mut tokio::sync::mpsc::Receiver<Message>, request: Id) -> Id {
        match next(rx).await {
            Message::Subscribed(s) => {
                assert_eq!(s.request, request);
                s.subscription
            }
            other => panic!("Expected Subscribed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_subscribe_publish_unsubscribe() {
        let (broker, sessions) = broker();
        let (subscriber, mut sub_rx) = join(&sessions, 1);
        let (publisher, mut pub_rx) = join(&sessions, 2);

        broker.subscribe(&subscriber, subscribe(5, "com.example.topic")).await;
        let subscription = subscribed(&mut sub_rx, 5).await;

        broker
            .publish(&publisher, publish(1, "com.example.topic", json!({})))
            .await;
        match next(&mut sub_rx).await {
            Message::Event(event) => {
                assert_eq!(event.subscription, subscription);
                assert_eq!(event.arguments, vec![json!("hello")]);
            }
            other => panic!("Expected Event, got {:?}", other),
        }
        assert_idle(&mut sub_rx).await;
        assert_idle(&mut pub_rx).await;

        broker
            .unsubscribe(
                &subscriber,
                Unsubscribe {
                    request: 6,
                    subscription,
                },
            )
            .await;
        assert_eq!(
            next(&mut sub_rx).await,
            Message::Unsubscribed(Unsubscribed { request: 6 })
        );
        assert_eq!(broker.topic_count().await, 0);

        broker
            .publish(&publisher, publish(2, "com.example.topic", json!({})))
            .await;
        assert_idle(&mut sub_rx).await;
        assert!(broker.is_consistent().await);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown() {
        let (broker, sessions) = broker();
        let (subscriber, mut rx) = join(&sessions, 1);
        broker.subscribe(&subscriber, subscribe(1, "a")).await;
        let _ = subscribed(&mut rx, 1).await;

        broker
            .unsubscribe(
                &subscriber,
                Unsubscribe {
                    request: 2,
                    subscription: 12345,
                },
            )
            .await;
        assert_eq!(
            next(&mut rx).await,
            Message::error(MessageType::Unsubscribe, 2, reason::NO_SUCH_SUBSCRIPTION)
        );
        assert_eq!(broker.subscription_count().await, 1);
        assert!(broker.is_consistent().await);
    }

    #[tokio::test]
    async fn test_duplicate_subscriptions_are_independent() {
        let (broker, sessions) = broker();
        let (subscriber, mut rx) = join(&sessions, 1);
        let (publisher, _pub_rx) = join(&sessions, 2);

        broker.subscribe(&subscriber, subscribe(1, "t")).await;
        let first = subscribed(&mut rx, 1).await;
        broker.subscribe(&subscriber, subscribe(2, "t")).await;
        let second = subscribed(&mut rx, 2).await;
        assert_ne!(first, second);
        assert_eq!(broker.subscription_count().await, 2);
        assert_eq!(broker.topic_count().await, 1);

        broker
            .unsubscribe(
                &subscriber,
                Unsubscribe {
                    request: 3,
                    subscription: first,
                },
            )
            .await;
        let _ = next(&mut rx).await;

        broker.publish(&publisher, publish(4, "t", json!({}))).await;
        match next(&mut rx).await {
            Message::Event(event) => assert_eq!(event.subscription, second),
            other => panic!("Expected Event, got {:?}", other),
        }
        assert_idle(&mut rx).await;
    }

    #[tokio::test]
    async fn test_publish_acknowledge() {
        let (broker, sessions) = broker();
        let (publisher, mut rx) = join(&sessions, 1);

        broker
            .publish(&publisher, publish(42, "nobody.listens", json!({"acknowledge": true})))
            .await;
        match next(&mut rx).await {
            Message::Published(published) => assert_eq!(published.request, 42),
            other => panic!("Expected Published, got {:?}", other),
        }

        broker
            .publish(&publisher, publish(43, "nobody.listens", json!({"acknowledge": false})))
            .await;
        broker
            .publish(&publisher, publish(44, "nobody.listens", json!({})))
            .await;
        assert_idle(&mut rx).await;
    }

    #[tokio::test]
    async fn test_exclude_me() {
        let (broker, sessions) = broker();
        let (session, mut rx) = join(&sessions, 1);
        broker.subscribe(&session, subscribe(1, "echo")).await;
        let subscription = subscribed(&mut rx, 1).await;

        broker.publish(&session, publish(2, "echo", json!({}))).await;
        assert_idle(&mut rx).await;

        broker
            .publish(&session, publish(3, "echo", json!({"exclude_me": false})))
            .await;
        match next(&mut rx).await {
            Message::Event(event) => assert_eq!(event.subscription, subscription),
            other => panic!("Expected Event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_events_keep_publish_order() {
        let (broker, sessions) = broker();
        let (subscriber, mut rx) = join(&sessions, 1);
        let (publisher, _pub_rx) = join(&sessions, 2);
        broker.subscribe(&subscriber, subscribe(1, "seq")).await;
        let _ = subscribed(&mut rx, 1).await;

        for i in 0..10 {
            let mut msg = publish(i, "seq", json!({}));
            msg.arguments = vec![json!(i)];
            broker.publish(&publisher, msg).await;
        }
        for i in 0..10 {
            match next(&mut rx).await {
                Message::Event(event) => assert_eq!(event.arguments, vec![json!(i)]),
                other => panic!("Expected Event, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_full_subscriber_does_not_stall_broker() {
        let (broker, sessions) = broker();
        let (slow_tx, _slow_rx) = tokio::sync::mpsc::channel(1);
        let slow = SessionHandle::new(1, PeerSender::new(slow_tx));
        sessions.insert(1, slow.clone());
        let (fast, mut fast_rx) = join(&sessions, 2);
        let (publisher, _pub_rx) = join(&sessions, 3);

        // SUBSCRIBED takes the slow queue's only slot
        broker.subscribe(&slow, subscribe(1, "t")).await;
        broker.subscribe(&fast, subscribe(2, "t")).await;
        let fast_subscription = subscribed(&mut fast_rx, 2).await;

        tokio::time::timeout(
            RECV_TIMEOUT,
            broker.publish(&publisher, publish(3, "t", json!({}))),
        )
        .await
        .expect("publish stalled on a full subscriber");
        match next(&mut fast_rx).await {
            Message::Event(event) => assert_eq!(event.subscription, fast_subscription),
            other => panic!("Expected Event, got {:?}", other),
        }

        tokio::time::timeout(RECV_TIMEOUT, broker.subscribe(&fast, subscribe(4, "unrelated")))
            .await
            .expect("subscribe stalled behind a full subscriber");
        let _ = subscribed(&mut fast_rx, 4).await;
        assert_eq!(broker.subscription_count().await, 3);
    }

    #[tokio::test]
    async fn test_remove_session() {
        let (broker, sessions) = broker();
        let (leaving, mut leaving_rx) = join(&sessions, 1);
        let (staying, mut staying_rx) = join(&sessions, 2);

        broker.subscribe(&leaving, subscribe(1, "a")).await;
        broker.subscribe(&leaving, subscribe(2, "b")).await;
        broker.subscribe(&staying, subscribe(1, "b")).await;
        let _ = next(&mut leaving_rx).await;
        let _ = next(&mut leaving_rx).await;
        let _ = next(&mut staying_rx).await;

        broker.remove_session(leaving.id()).await;

        assert_eq!(broker.subscription_count().await, 1);
        assert_eq!(broker.topic_count().await, 1);
        assert!(broker.is_consistent().await);
    }

    #[test]
    fn test_is_truthy() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("yes")));
    }
}
