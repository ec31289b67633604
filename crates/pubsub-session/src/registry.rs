//! Channel registry: subscribed channels and their callback bindings.

use std::collections::BTreeMap;

use crate::types::{ChannelState, Error, Listener, Message};

pub(crate) struct Channel {
    state: ChannelState,
    listener: Listener,
}

/// Outcome of [`ChannelRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Binding {
    Added,
    Replaced,
}

/// Subscribed channels, keyed by name.
///
/// `version` changes whenever the channel *set* changes. Replacing the
/// listener of an existing channel keeps the version, so an in-flight poll
/// for that set stays valid.
#[derive(Default)]
pub(crate) struct ChannelRegistry {
    channels: BTreeMap<String, Channel>,
    version: u64,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, name: String, listener: Listener) -> Binding {
        let channel = Channel {
            state: ChannelState::Connecting,
            listener,
        };
        match self.channels.insert(name, channel) {
            Some(_) => Binding::Replaced,
            None => {
                self.version += 1;
                Binding::Added
            }
        }
    }

    /// Returns `false` if the channel was not subscribed.
    pub fn unsubscribe(&mut self, name: &str) -> bool {
        if self.channels.remove(name).is_some() {
            self.version += 1;
            true
        } else {
            false
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Channel names in a stable order.
    pub fn names(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    #[cfg(test)]
    pub fn state(&self, name: &str) -> Option<ChannelState> {
        self.channels.get(name).map(|c| c.state)
    }

    /// Mark the channel connected and fire its connect callback, if it was
    /// still waiting for one. Returns `true` when the callback slot was used.
    pub fn connect(&mut self, name: &str) -> bool {
        let Some(channel) = self.channels.get_mut(name) else {
            return false;
        };
        if channel.state != ChannelState::Connecting {
            return false;
        }
        channel.state = ChannelState::Connected;
        if let Some(on_connect) = channel.listener.on_connect.as_mut() {
            on_connect();
        }
        true
    }

    /// Hand a message to the channel's current listener.
    ///
    /// Returns `false` if the channel is no longer subscribed.
    pub fn deliver(&mut self, message: Message) -> bool {
        let Some(channel) = self.channels.get_mut(&message.channel) else {
            return false;
        };
        (channel.listener.on_message)(message);
        true
    }

    /// Names of channels that were connected and are now waiting for a
    /// reconnect.
    pub fn drop_connections(&mut self) -> Vec<String> {
        self.channels
            .iter_mut()
            .filter(|(_, c)| c.state == ChannelState::Connected)
            .map(|(name, c)| {
                c.state = ChannelState::Connecting;
                name.clone()
            })
            .collect()
    }

    pub fn notify_disconnect(&mut self, name: &str, error: &Error) {
        if let Some(on_disconnect) = self
            .channels
            .get_mut(name)
            .and_then(|c| c.listener.on_disconnect.as_mut())
        {
            on_disconnect(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting_listener(messages: &Arc<AtomicUsize>, connects: &Arc<AtomicUsize>) -> Listener {
        let m = Arc::clone(messages);
        let c = Arc::clone(connects);
        Listener::new(move |_| {
            m.fetch_add(1, Ordering::SeqCst);
        })
        .on_connect(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn msg(channel: &str) -> Message {
        Message {
            channel: channel.into(),
            data: serde_json::json!("hi"),
        }
    }

    #[test]
    fn subscribe_and_replace_keep_one_binding() {
        let mut reg = ChannelRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let connects = Arc::new(AtomicUsize::new(0));

        assert_eq!(
            reg.subscribe("demo".into(), counting_listener(&first, &connects)),
            Binding::Added
        );
        let version = reg.version();
        assert_eq!(
            reg.subscribe("demo".into(), counting_listener(&second, &connects)),
            Binding::Replaced
        );
        assert_eq!(reg.version(), version);
        assert_eq!(reg.len(), 1);

        assert!(reg.deliver(msg("demo")));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_changes_version() {
        let mut reg = ChannelRegistry::new();
        let n = Arc::new(AtomicUsize::new(0));
        reg.subscribe("a".into(), counting_listener(&n, &n));
        let version = reg.version();

        assert!(!reg.unsubscribe("missing"));
        assert_eq!(reg.version(), version);

        assert!(reg.unsubscribe("a"));
        assert!(reg.version() > version);
        assert!(reg.is_empty());
        assert_eq!(reg.state("a"), None);
        assert!(!reg.deliver(msg("a")));
    }

    #[test]
    fn connect_fires_once_per_connection() {
        let mut reg = ChannelRegistry::new();
        let messages = Arc::new(AtomicUsize::new(0));
        let connects = Arc::new(AtomicUsize::new(0));
        reg.subscribe("a".into(), counting_listener(&messages, &connects));
        assert_eq!(reg.state("a"), Some(ChannelState::Connecting));

        assert!(reg.connect("a"));
        assert!(!reg.connect("a"));
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(reg.state("a"), Some(ChannelState::Connected));

        assert_eq!(reg.drop_connections(), vec!["a".to_string()]);
        assert_eq!(reg.state("a"), Some(ChannelState::Connecting));
        assert!(reg.drop_connections().is_empty());

        assert!(reg.connect("a"));
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn replaced_binding_reconnects() {
        let mut reg = ChannelRegistry::new();
        let n = Arc::new(AtomicUsize::new(0));
        let connects = Arc::new(AtomicUsize::new(0));
        reg.subscribe("a".into(), counting_listener(&n, &n));
        reg.connect("a");

        reg.subscribe("a".into(), counting_listener(&n, &connects));
        assert_eq!(reg.state("a"), Some(ChannelState::Connecting));
        assert!(reg.connect("a"));
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn names_are_sorted() {
        let mut reg = ChannelRegistry::new();
        let n = Arc::new(AtomicUsize::new(0));
        reg.subscribe("zeta".into(), counting_listener(&n, &n));
        reg.subscribe("alpha".into(), counting_listener(&n, &n));
        assert_eq!(reg.names(), vec!["alpha".to_string(), "zeta".to_string()]);
        assert!(reg.contains("zeta"));
    }
}
