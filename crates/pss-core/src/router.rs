//! Topic router
//!
//! One handler per topic. Inbound plaintexts are dispatched by topic; a topic
//! nobody registered is dropped without error, since not every node runs
//! every protocol.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::crypto::KeyId;
use crate::error::{PssError, PssResult};
use crate::identity::{PeerAddress, PublicKey};
use crate::topic::Topic;

/// How an inbound message was protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Opened with a negotiated session key
    Symmetric(KeyId),
    /// Opened with the local static key
    Asymmetric,
    /// Unencrypted
    Raw,
}

/// A decrypted message on its way to a topic handler.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub topic: Topic,
    /// Authenticated sender; `None` for raw messages
    pub from: Option<PublicKey>,
    /// Reply address bound to the session key, when known
    pub address: Option<PeerAddress>,
    pub payload: Vec<u8>,
    pub kind: MessageKind,
}

/// What a handler is willing to receive besides encrypted messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerCaps {
    /// Accept unencrypted envelopes (only if the node allows them at all)
    pub raw: bool,
}

pub type TopicHandler = Arc<dyn Fn(IncomingMessage) -> PssResult<()> + Send + Sync>;

struct Registration {
    handler: TopicHandler,
    caps: HandlerCaps,
}

/// Registry of topic handlers, owned by the messaging core.
#[derive(Default)]
pub struct TopicRouter {
    handlers: RwLock<HashMap<Topic, Registration>>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `topic`.
    ///
    /// Fails with `TopicAlreadyRegistered` if the topic is taken. The
    /// handshake topic is always taken. Use [`Self::deregister`] first to
    /// replace a handler.
    pub fn register(&self, topic: Topic, handler: TopicHandler, caps: HandlerCaps) -> PssResult<()> {
        if topic.is_handshake() {
            return Err(PssError::TopicAlreadyRegistered(topic));
        }
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&topic) {
            return Err(PssError::TopicAlreadyRegistered(topic));
        }
        handlers.insert(topic, Registration { handler, caps });
        debug!(%topic, raw = caps.raw, "Registered topic handler");
        Ok(())
    }

    /// Remove the handler for `topic`. Returns whether one was registered.
    pub fn deregister(&self, topic: &Topic) -> bool {
        let removed = self.handlers.write().remove(topic).is_some();
        if removed {
            debug!(%topic, "Deregistered topic handler");
        }
        removed
    }

    pub fn is_registered(&self, topic: &Topic) -> bool {
        self.handlers.read().contains_key(topic)
    }

    pub fn caps(&self, topic: &Topic) -> Option<HandlerCaps> {
        self.handlers.read().get(topic).map(|r| r.caps)
    }

    /// Hand `message` to its topic handler.
    ///
    /// Returns `Ok(true)` if a handler ran, `Ok(false)` if the topic is
    /// unknown. Handler errors are logged and do not propagate; they belong to
    /// the handler's protocol, not to the router.
    pub fn dispatch(&self, message: IncomingMessage) -> PssResult<bool> {
        // Clone out so the handler runs without the registry lock held.
        let handler = match self.handlers.read().get(&message.topic) {
            Some(registration) => registration.handler.clone(),
            None => {
                trace!(topic = %message.topic, "No handler for topic, dropping");
                return Ok(false);
            }
        };

        let topic = message.topic;
        if let Err(e) = handler(message) {
            warn!(%topic, error = %e, "Topic handler failed");
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn message(topic: Topic, payload: &[u8]) -> IncomingMessage {
        IncomingMessage {
            topic,
            from: None,
            address: None,
            payload: payload.to_vec(),
            kind: MessageKind::Raw,
        }
    }

    fn collecting() -> (TopicHandler, Arc<Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: TopicHandler = Arc::new(move |msg: IncomingMessage| {
            sink.lock().push(msg.payload);
            Ok(())
        });
        (handler, seen)
    }

    #[test]
    fn test_dispatch_to_registered_topic() {
        let router = TopicRouter::new();
        let topic = Topic::from_protocol("ping", 1);
        let (handler, seen) = collecting();
        router.register(topic, handler, HandlerCaps::default()).unwrap();

        assert!(router.dispatch(message(topic, b"hi")).unwrap());
        assert_eq!(*seen.lock(), vec![b"hi".to_vec()]);
    }

    #[test]
    fn test_unknown_topic_dropped() {
        let router = TopicRouter::new();
        let (handler, seen) = collecting();
        let known = Topic::from_protocol("ping", 1);
        router.register(known, handler, HandlerCaps::default()).unwrap();

        assert!(!router.dispatch(message(Topic::from_protocol("other", 1), b"x")).unwrap());
        assert!(router.dispatch(message(known, b"y")).unwrap());
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let router = TopicRouter::new();
        let topic = Topic::from_protocol("ping", 1);
        let (first, _) = collecting();
        let (second, _) = collecting();
        router.register(topic, first, HandlerCaps::default()).unwrap();
        assert!(matches!(
            router.register(topic, second.clone(), HandlerCaps::default()),
            Err(PssError::TopicAlreadyRegistered(t)) if t == topic
        ));

        assert!(router.deregister(&topic));
        assert!(router.register(topic, second, HandlerCaps { raw: true }).is_ok());
        assert_eq!(router.caps(&topic), Some(HandlerCaps { raw: true }));
    }

    #[test]
    fn test_handshake_topic_reserved() {
        let router = TopicRouter::new();
        let (handler, _) = collecting();
        assert!(router
            .register(Topic::handshake(), handler, HandlerCaps::default())
            .is_err());
    }

    #[test]
    fn test_handler_error_does_not_propagate() {
        let router = TopicRouter::new();
        let topic = Topic::from_protocol("ping", 1);
        let failing: TopicHandler = Arc::new(|_| Err(PssError::Cancelled));
        router.register(topic, failing, HandlerCaps::default()).unwrap();
        assert!(router.dispatch(message(topic, b"")).unwrap());
    }
}
