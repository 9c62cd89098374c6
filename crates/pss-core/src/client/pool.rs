//! Peer pool: one virtual stream per (topic, peer)

use std::collections::HashMap;

use parking_lot::RwLock;

use super::stream::VirtualStream;
use crate::error::{PssError, PssResult};
use crate::identity::PublicKey;
use crate::topic::Topic;

#[derive(Default)]
pub struct PeerPool {
    streams: RwLock<HashMap<(Topic, PublicKey), VirtualStream>>,
}

impl PeerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stream. Fails with `DuplicatePeer` if one exists for its
    /// (topic, peer).
    pub fn insert(&self, stream: VirtualStream) -> PssResult<()> {
        let key = (stream.topic(), stream.peer());
        let mut streams = self.streams.write();
        if streams.contains_key(&key) {
            return Err(PssError::DuplicatePeer {
                peer: key.1,
                topic: key.0,
            });
        }
        streams.insert(key, stream);
        Ok(())
    }

    /// Existing stream for (topic, peer), or a new one from `make`. The flag
    /// is `true` when the stream was created.
    pub fn get_or_insert_with(
        &self,
        topic: Topic,
        peer: PublicKey,
        make: impl FnOnce() -> VirtualStream,
    ) -> (VirtualStream, bool) {
        if let Some(stream) = self.get(&topic, &peer) {
            return (stream, false);
        }
        let mut streams = self.streams.write();
        if let Some(stream) = streams.get(&(topic, peer)) {
            return (stream.clone(), false);
        }
        let stream = make();
        streams.insert((topic, peer), stream.clone());
        (stream, true)
    }

    pub fn get(&self, topic: &Topic, peer: &PublicKey) -> Option<VirtualStream> {
        self.streams.read().get(&(*topic, *peer)).cloned()
    }

    pub fn remove(&self, topic: &Topic, peer: &PublicKey) -> Option<VirtualStream> {
        self.streams.write().remove(&(*topic, *peer))
    }

    /// Remove the entry only if it still holds the stream with `id`.
    pub fn remove_if_same(&self, topic: &Topic, peer: &PublicKey, id: u64) -> Option<VirtualStream> {
        let mut streams = self.streams.write();
        match streams.get(&(*topic, *peer)) {
            Some(stream) if stream.id() == id => streams.remove(&(*topic, *peer)),
            _ => None,
        }
    }

    /// Peers with a stream on `topic`.
    pub fn peers(&self, topic: &Topic) -> Vec<PublicKey> {
        self.streams
            .read()
            .keys()
            .filter(|(t, _)| t == topic)
            .map(|(_, peer)| *peer)
            .collect()
    }

    /// Remove every stream on `topic`.
    pub fn remove_topic(&self, topic: &Topic) -> Vec<VirtualStream> {
        let mut streams = self.streams.write();
        let keys: Vec<_> = streams.keys().filter(|(t, _)| t == topic).copied().collect();
        keys.iter().filter_map(|k| streams.remove(k)).collect()
    }

    pub fn drain(&self) -> Vec<VirtualStream> {
        self.streams.write().drain().map(|(_, stream)| stream).collect()
    }

    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.read().is_empty()
    }
}
