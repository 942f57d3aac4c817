//! Named channels owned by a process.
//!
//! A channel is a [`Stream`] over our half of a socket pair whose other half was
//! sent to the child. The process owns its channels through a registry keyed by
//! name; a canceled channel removes itself from the registry through a weak
//! back-reference, so nothing else keeps it alive.

use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};

use indexmap::IndexMap;

use crate::error::ProcessError;
use crate::lock;
use crate::stream::Stream;

#[derive(Clone)]
pub struct Channel {
    name: Arc<str>,
    stream: Stream,
}

impl Channel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }
}

impl Deref for Channel {
    type Target = Stream;

    fn deref(&self) -> &Stream {
        &self.stream
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("stream", &self.stream)
            .finish()
    }
}

type Entries = Mutex<IndexMap<String, Channel>>;

/// Insertion-ordered set of open channels, keyed by name.
#[derive(Clone, Default)]
pub(crate) struct ChannelRegistry {
    entries: Arc<Entries>,
}

impl ChannelRegistry {
    /// Register `stream` under `name`. Names are unique while a channel is open.
    pub fn register(&self, name: &str, stream: Stream) -> Result<Channel, ProcessError> {
        let channel = Channel {
            name: Arc::from(name),
            stream,
        };
        {
            let mut entries = lock(&self.entries);
            if entries.contains_key(name) {
                return Err(ProcessError::ChannelExists(name.to_string()));
            }
            entries.insert(name.to_string(), channel.clone());
        }

        let registry: Weak<Entries> = Arc::downgrade(&self.entries);
        let key = name.to_string();
        let id = channel.stream.id();
        channel.stream.set_cancel_hook(move || {
            if let Some(entries) = registry.upgrade() {
                remove_if_same(&entries, &key, id);
            }
        });

        tracing::debug!(channel = name, "Channel registered");
        Ok(channel)
    }

    /// Drop `channel` from the registry without canceling it.
    pub fn unregister(&self, channel: &Channel) {
        remove_if_same(&self.entries, channel.name(), channel.stream.id());
    }

    pub fn get(&self, name: &str) -> Option<Channel> {
        lock(&self.entries).get(name).cloned()
    }

    /// Open channels in creation order.
    pub fn snapshot(&self) -> Vec<Channel> {
        lock(&self.entries).values().cloned().collect()
    }
}

fn remove_if_same(entries: &Entries, name: &str, id: usize) {
    let mut entries = lock(entries);
    if entries.get(name).is_some_and(|c| c.stream.id() == id) {
        entries.shift_remove(name);
        tracing::debug!(channel = name, "Channel unregistered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;

    fn stream() -> (Stream, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        (Stream::duplex(OwnedFd::from(ours)).unwrap(), theirs)
    }

    #[tokio::test]
    async fn channels_keep_creation_order() {
        let registry = ChannelRegistry::default();
        let mut peers = Vec::new();
        for name in ["parent", "logs", "control"] {
            let (s, peer) = stream();
            peers.push(peer);
            registry.register(name, s).unwrap();
        }

        let names: Vec<_> = registry
            .snapshot()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, ["parent", "logs", "control"]);
        assert_eq!(registry.get("logs").unwrap().name(), "logs");
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let registry = ChannelRegistry::default();
        let (first, _a) = stream();
        let (second, _b) = stream();

        registry.register("parent", first).unwrap();
        let err = registry.register("parent", second).unwrap_err();
        assert!(matches!(err, ProcessError::ChannelExists(name) if name == "parent"));
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn canceled_channel_leaves_the_registry() {
        let registry = ChannelRegistry::default();
        let (s, _peer) = stream();
        let channel = registry.register("parent", s).unwrap();

        channel.cancel();
        assert!(registry.get("parent").is_none());
        assert_eq!(registry.snapshot().len(), 0);

        // The name is free again, and canceling the old handle twice is harmless.
        let (s, _peer2) = stream();
        registry.register("parent", s).unwrap();
        channel.cancel();
        assert_eq!(registry.snapshot().len(), 1);
    }
}
