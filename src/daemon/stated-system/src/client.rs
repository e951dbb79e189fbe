//! Client API
//!
//! Coordinates the resolver, the state store, both registries and the event
//! queue behind the public operations.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use stated_core::{ClientConfig, Error, Resolver, Result, StorageLocation};
use tracing::{debug, error, info, warn};

use crate::queue::{EventQueue, WatchEvent};
use crate::registry::{Binding, BindingRegistry, Subscription, SubscriptionRegistry};
use crate::store;

/// What a notification reports about its name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// The publisher wrote a new value
    Changed,
    /// The state file was deleted; the subscription is gone
    Deleted,
}

/// A delivered change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub name: String,
    /// The new value, or the last value seen for a deletion
    pub value: Bytes,
    pub kind: NotificationKind,
}

impl Notification {
    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn is_deleted(&self) -> bool {
        self.kind == NotificationKind::Deleted
    }
}

/// Outcome of draining one event from the queue
#[derive(Debug)]
pub(crate) enum Drained {
    /// Nothing was pending
    Empty,
    /// An event was consumed that produces no notification
    Skipped,
    Delivered(Notification),
}

/// Handle to the state notification system
///
/// Owns one event queue plus every binding and subscription made through it.
/// Dropping the client releases all of them.
pub struct Client {
    config: ClientConfig,
    resolver: Resolver,
    queue: EventQueue,
    bindings: BindingRegistry,
    subscriptions: SubscriptionRegistry,
}

impl Client {
    /// Create a client with its own event queue
    pub fn init(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let queue = EventQueue::new().map_err(|e| {
            error!("unable to create the event queue: {}", e);
            Error::from(e)
        })?;

        info!(
            "stated client ready (shared root {}, event fd {})",
            config.shared_root.display(),
            queue.as_raw_fd()
        );

        Ok(Self {
            resolver: Resolver::new(&config),
            config,
            queue,
            bindings: BindingRegistry::new(),
            subscriptions: SubscriptionRegistry::new(),
        })
    }

    /// Client configured from the environment
    pub fn from_env() -> Result<Self> {
        Self::init(ClientConfig::from_env())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Storage location a name resolves to
    pub fn resolve(&self, name: &str) -> Result<StorageLocation> {
        self.resolver.resolve(name)
    }

    /// Become a publisher of `name`, truncating its current state
    ///
    /// Binding an already bound name adds another binding; nothing prevents
    /// other processes from binding it too.
    pub fn bind(&self, name: &str) -> Result<()> {
        let result = self.resolve(name).and_then(|location| {
            let file = store::open_for_publish(&location.path, self.config.file_mode)?;
            Ok(Binding {
                name: name.to_string(),
                path: location.path,
                file,
            })
        });

        match result {
            Ok(binding) => {
                debug!("bound {} to {}", name, binding.path.display());
                self.bindings.insert(binding);
                Ok(())
            }
            Err(e) => {
                error!("unable to bind to {}", name);
                Err(e)
            }
        }
    }

    pub fn unbind(&self, name: &str) -> Result<()> {
        match self.bindings.remove(name) {
            Some(_) => {
                debug!("unbound {}", name);
                Ok(())
            }
            None => {
                error!("name not bound: {}", name);
                Err(Error::NotBound(name.to_string()))
            }
        }
    }

    /// Replace the state of a bound name
    pub fn publish(&self, name: &str, payload: &[u8]) -> Result<()> {
        let Some(binding) = self.bindings.lookup(name) else {
            error!("tried to publish to an unbound name: {}", name);
            return Err(Error::NotBound(name.to_string()));
        };

        if payload.len() > self.config.max_payload_len {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max: self.config.max_payload_len,
            });
        }

        store::write_record(&binding.file, &binding.path, payload)?;
        counter!("stated_publish_total").increment(1);
        Ok(())
    }

    /// Start observing `name`; subscribing twice is a no-op
    ///
    /// The state file is created empty when nobody has bound the name yet.
    pub fn subscribe(&self, name: &str) -> Result<()> {
        if self.subscriptions.by_name(name).is_some() {
            debug!("already subscribed to {}", name);
            return Ok(());
        }

        let location = self.resolve(name)?;
        let file = store::open_for_subscribe(&location.path, self.config.file_mode)?;
        let token = self.queue.register(&file, &location.path).map_err(|e| {
            error!("unable to watch {}: {}", location.path.display(), e);
            Error::io(&location.path, e)
        })?;

        let subscription = Arc::new(Subscription::new(
            name.to_string(),
            location.path,
            file,
            token,
        ));

        let Some(existing) = self.subscriptions.insert(Arc::clone(&subscription)) else {
            debug!("subscribed to {} (watch {})", name, token.as_raw());
            return Ok(());
        };

        // Lost a race with another subscriber, or the file is already watched.
        // inotify hands out one watch per inode, so a shared token stays registered.
        if existing.token != token {
            if let Err(e) = self.queue.deregister(token, &subscription.file) {
                warn!("failed to drop duplicate watch on {}: {}", name, e);
            }
        }
        if existing.name == name {
            return Ok(());
        }
        Err(Error::io(
            &subscription.path,
            io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("file is already watched as `{}`", existing.name),
            ),
        ))
    }

    pub fn unsubscribe(&self, name: &str) -> Result<()> {
        let Some(subscription) = self.subscriptions.remove_name(name) else {
            debug!("unsubscribe from unknown name {}", name);
            return Err(Error::NotSubscribed(name.to_string()));
        };
        self.release_watch(&subscription);
        debug!("unsubscribed from {}", name);
        Ok(())
    }

    /// Read the current value of a subscribed name
    pub fn get(&self, name: &str) -> Result<Bytes> {
        let Some(subscription) = self.subscriptions.by_name(name) else {
            debug!("subscription lookup for `{}' failed", name);
            return Err(Error::NotSubscribed(name.to_string()));
        };

        subscription
            .refresh(self.config.read_retry_limit)
            .inspect_err(|_| debug!("failed to update subscription {}", name))
    }

    /// Deliver at most one pending notification without blocking
    ///
    /// Returns `None` only once the queue is empty; watch-released
    /// bookkeeping events are consumed on the way. Call repeatedly to drain a
    /// burst of changes.
    pub fn check(&self) -> Result<Option<Notification>> {
        loop {
            match self.drain_one()? {
                Drained::Delivered(notification) => return Ok(Some(notification)),
                Drained::Skipped => continue,
                Drained::Empty => return Ok(None),
            }
        }
    }

    pub(crate) fn drain_one(&self) -> Result<Drained> {
        let event = match self.queue.next_event() {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(Drained::Empty),
            Err(e) => {
                error!("reading the event queue failed: {}", e);
                counter!("stated_errors_total").increment(1);
                return Err(Error::from(e));
            }
        };

        if event.released {
            debug!("watch {} released", event.token.as_raw());
            return Ok(Drained::Skipped);
        }

        let Some(subscription) = self.subscriptions.by_token(event.token) else {
            error!(
                "received an event for watch {} which is not associated with a subscription",
                event.token.as_raw()
            );
            counter!("stated_errors_total").increment(1);
            return Err(Error::UnknownWatch(event.token.as_raw()));
        };

        self.deliver(event, &subscription).map(Drained::Delivered)
    }

    fn deliver(&self, event: WatchEvent, subscription: &Subscription) -> Result<Notification> {
        let deleted = event.deleted || (event.attrib && subscription.is_unlinked());

        if deleted {
            let value = if event.written {
                subscription
                    .refresh(self.config.read_retry_limit)
                    .unwrap_or_else(|_| subscription.cached())
            } else {
                subscription.cached()
            };

            debug!(
                "state file {} was deleted; removing subscription",
                subscription.path.display()
            );
            if let Some(removed) = self.subscriptions.remove_token(subscription.token) {
                self.release_watch(&removed);
            }

            counter!("stated_notifications_total", "kind" => "deleted").increment(1);
            return Ok(Notification {
                name: subscription.name.clone(),
                value,
                kind: NotificationKind::Deleted,
            });
        }

        debug!("watch {} written", event.token.as_raw());
        let value = subscription
            .refresh(self.config.read_retry_limit)
            .inspect_err(|_| {
                error!("failed to update the state of {}", subscription.name);
                counter!("stated_errors_total").increment(1);
            })?;

        counter!("stated_notifications_total", "kind" => "changed").increment(1);
        Ok(Notification {
            name: subscription.name.clone(),
            value,
            kind: NotificationKind::Changed,
        })
    }

    fn release_watch(&self, subscription: &Subscription) {
        if let Err(e) = self.queue.deregister(subscription.token, &subscription.file) {
            warn!("failed to remove watch for {}: {}", subscription.name, e);
        }
    }

    /// Block until a notification may be pending or `timeout` elapses
    ///
    /// `None` waits indefinitely. Returns whether the event descriptor became
    /// readable; an interrupted wait returns `false`.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        self.queue.wait(timeout).map_err(Error::from)
    }

    /// Descriptor that becomes readable while events are pending
    pub fn event_fd(&self) -> RawFd {
        self.queue.as_raw_fd()
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.bindings.lookup(name).is_some()
    }

    pub fn is_subscribed(&self, name: &str) -> bool {
        self.subscriptions.by_name(name).is_some()
    }

    /// Release every binding and subscription
    pub fn release_all(&self) {
        self.bindings.clear();
        for subscription in self.subscriptions.drain() {
            self.release_watch(&subscription);
        }
    }
}

impl AsRawFd for Client {
    fn as_raw_fd(&self) -> RawFd {
        self.event_fd()
    }
}

impl AsFd for Client {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.queue.as_fd()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.release_all();
        debug!("shutting down");
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("event_fd", &self.event_fd())
            .field("bindings", &self.bindings.len())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn client(dir: &TempDir) -> Client {
        std::fs::create_dir_all(dir.path().join("shared")).unwrap();
        Client::init(ClientConfig::rooted_at(dir.path())).unwrap()
    }

    fn expect_changed(client: &Client, name: &str, value: &[u8]) {
        let notification = client.check().unwrap().expect("a pending notification");
        assert_eq!(notification.name, name);
        assert_eq!(&notification.value[..], value);
        assert_eq!(notification.len(), value.len());
        assert_eq!(notification.kind, NotificationKind::Changed);
    }

    #[test]
    fn test_publish_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);

        client.bind("user.example.status").unwrap();
        client.subscribe("user.example.status").unwrap();

        let large = vec![0xABu8; 256 * 1024];
        let payloads: [&[u8]; 4] = [b"I feel fine", b"", b"\0binary\0\xff", &large];
        for payload in payloads {
            client.publish("user.example.status", payload).unwrap();
            assert_eq!(&client.get("user.example.status").unwrap()[..], payload);
        }
    }

    #[test]
    fn test_sequential_changes() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);

        client.bind("x").unwrap();
        client.subscribe("x").unwrap();

        client.publish("x", b"a").unwrap();
        expect_changed(&client, "x", b"a");
        assert!(client.check().unwrap().is_none());

        client.publish("x", b"b").unwrap();
        expect_changed(&client, "x", b"b");
        assert!(client.check().unwrap().is_none());
    }

    #[test]
    fn test_event_fd_signals_pending_change() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);
        client.bind("x").unwrap();
        client.subscribe("x").unwrap();
        assert!(client.event_fd() >= 0);
        assert!(!client.wait(Some(Duration::ZERO)).unwrap());

        client.publish("x", b"ready").unwrap();
        assert!(client.wait(Some(Duration::from_secs(5))).unwrap());
        expect_changed(&client, "x", b"ready");
        assert!(!client.wait(Some(Duration::ZERO)).unwrap());
    }

    #[test]
    fn test_double_bind_targets_same_file() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);

        client.bind("x").unwrap();
        client.bind("x").unwrap();
        client.subscribe("x").unwrap();

        client.publish("x", b"one").unwrap();
        assert_eq!(&client.get("x").unwrap()[..], b"one");

        client.unbind("x").unwrap();
        client.publish("x", b"two").unwrap();
        assert_eq!(&client.get("x").unwrap()[..], b"two");

        client.unbind("x").unwrap();
        assert!(matches!(client.publish("x", b"three"), Err(Error::NotBound(_))));
        assert!(matches!(client.unbind("x"), Err(Error::NotBound(_))));
    }

    #[test]
    fn test_unknown_names() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);

        assert!(matches!(client.get("no-such-name"), Err(Error::NotSubscribed(_))));
        assert!(matches!(
            client.publish("no-such-name", b"value"),
            Err(Error::NotBound(_))
        ));
        assert!(matches!(
            client.unsubscribe("no-such-name"),
            Err(Error::NotSubscribed(_))
        ));
    }

    #[test]
    fn test_invalid_names() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);

        for name in [".hidden", "user..hidden", "...an invalid name...."] {
            assert!(matches!(client.bind(name), Err(Error::InvalidName { .. })));
            assert!(matches!(client.subscribe(name), Err(Error::InvalidName { .. })));
        }
        assert!(!client.is_bound(".hidden"));
        assert!(!client.is_subscribed(".hidden"));
    }

    #[test]
    fn test_unsubscribe_suppresses_delivery() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);

        client.subscribe("n").unwrap();
        client.unsubscribe("n").unwrap();
        client.bind("n").unwrap();
        client.publish("n", b"a").unwrap();

        for _ in 0..4 {
            assert!(client.check().unwrap().is_none());
        }
        assert!(!client.is_subscribed("n"));
    }

    #[test]
    fn test_released_watch_does_not_hide_pending_change() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);

        client.subscribe("a").unwrap();
        client.bind("b").unwrap();
        client.subscribe("b").unwrap();
        client.unsubscribe("a").unwrap();
        client.publish("b", b"v").unwrap();

        expect_changed(&client, "b", b"v");
        assert!(client.check().unwrap().is_none());
    }

    #[test]
    fn test_change_after_deletion_is_delivered() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);

        for name in ["x", "y"] {
            client.bind(name).unwrap();
            client.subscribe(name).unwrap();
        }
        std::fs::remove_file(client.resolve("x").unwrap().path).unwrap();

        let notification = client.check().unwrap().expect("a deletion notification");
        assert_eq!(notification.name, "x");
        assert!(notification.is_deleted());

        client.publish("y", b"after").unwrap();
        expect_changed(&client, "y", b"after");
        assert!(client.check().unwrap().is_none());
    }

    #[test]
    fn test_subscribe_twice_is_noop() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);
        client.bind("x").unwrap();

        client.subscribe("x").unwrap();
        client.subscribe("x").unwrap();
        client.publish("x", b"once").unwrap();
        expect_changed(&client, "x", b"once");
        assert!(client.check().unwrap().is_none());

        client.unsubscribe("x").unwrap();
        assert!(matches!(client.unsubscribe("x"), Err(Error::NotSubscribed(_))));
    }

    #[test]
    fn test_deletion_removes_subscription() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);

        client.bind("x").unwrap();
        client.subscribe("x").unwrap();
        client.publish("x", b"last words").unwrap();
        expect_changed(&client, "x", b"last words");

        std::fs::remove_file(client.resolve("x").unwrap().path).unwrap();

        let notification = client.check().unwrap().expect("a deletion notification");
        assert_eq!(notification.name, "x");
        assert!(notification.is_deleted());
        assert_eq!(&notification.value[..], b"last words");

        assert!(!client.is_subscribed("x"));
        assert!(client.check().unwrap().is_none());
        assert!(matches!(client.get("x"), Err(Error::NotSubscribed(_))));
    }

    #[test]
    fn test_many_names_share_one_queue() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);
        let names = ["alpha", "beta", "user.gamma"];

        for name in names {
            client.bind(name).unwrap();
            client.subscribe(name).unwrap();
        }
        for name in names {
            client.publish(name, name.as_bytes()).unwrap();
        }

        let mut seen = HashSet::new();
        while let Some(notification) = client.check().unwrap() {
            assert_eq!(notification.value, Bytes::from(notification.name.clone()));
            seen.insert(notification.name);
        }
        assert_eq!(seen.len(), names.len());
    }

    #[test]
    fn test_publisher_and_subscriber_clients() {
        let dir = TempDir::new().unwrap();
        let publisher = client(&dir);
        let subscriber = client(&dir);

        publisher.bind("net.link").unwrap();
        subscriber.subscribe("net.link").unwrap();
        publisher.publish("net.link", b"up").unwrap();

        expect_changed(&subscriber, "net.link", b"up");
        assert!(publisher.check().unwrap().is_none());
    }

    #[test]
    fn test_get_before_first_publish() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);

        client.subscribe("later").unwrap();
        assert!(matches!(client.get("later"), Err(Error::CorruptRecord { .. })));
    }

    #[test]
    fn test_payload_limit() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("shared")).unwrap();
        let config = ClientConfig {
            max_payload_len: 4,
            ..ClientConfig::rooted_at(dir.path())
        };
        let client = Client::init(config).unwrap();

        client.bind("x").unwrap();
        assert!(client.publish("x", b"four").is_ok());
        assert!(matches!(
            client.publish("x", b"five!"),
            Err(Error::PayloadTooLarge { len: 5, max: 4 })
        ));
    }

    #[test]
    fn test_missing_shared_root() {
        let dir = TempDir::new().unwrap();
        let client = Client::init(ClientConfig::rooted_at(dir.path())).unwrap();

        assert!(matches!(client.bind("x"), Err(Error::Io { .. })));
        assert!(matches!(client.subscribe("x"), Err(Error::Io { .. })));
        assert!(!client.is_subscribed("x"));
    }

    #[test]
    fn test_reader_never_sees_inconsistent_length() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("shared")).unwrap();
        let config = ClientConfig {
            read_retry_limit: 1000,
            ..ClientConfig::rooted_at(dir.path())
        };
        let client = Client::init(config).unwrap();
        client.bind("busy").unwrap();
        client.subscribe("busy").unwrap();
        client.publish("busy", b"seed").unwrap();

        let lengths: HashSet<usize> = (0..64).map(|i| 1 + i * 37).chain([4]).collect();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for round in 0..2000 {
                    let len = 1 + (round % 64) * 37;
                    client.publish("busy", &vec![b'a' + (round % 26) as u8; len]).unwrap();
                }
            });
            scope.spawn(|| {
                for _ in 0..2000 {
                    match client.get("busy") {
                        Ok(value) => assert!(lengths.contains(&value.len())),
                        Err(Error::Busy { .. }) => {}
                        Err(e) => panic!("unexpected read failure: {e}"),
                    }
                }
            });
        });
    }

    #[test]
    fn test_drop_releases_everything() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);
        client.bind("x").unwrap();
        client.subscribe("x").unwrap();

        client.release_all();
        assert!(!client.is_bound("x"));
        assert!(!client.is_subscribed("x"));
        assert!(matches!(client.publish("x", b"v"), Err(Error::NotBound(_))));
    }
}
