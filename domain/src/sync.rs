use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

/// A mutex-guarded shared value. Readers always get a copy, writers replace
/// the value wholesale.
#[derive(Debug, Default)]
pub struct GuardedValue<T>(RwLock<T>);

impl<T: Clone> GuardedValue<T> {
    pub fn new(value: T) -> Self {
        GuardedValue(RwLock::new(value))
    }

    pub fn get(&self) -> T {
        self.0.read().clone()
    }

    pub fn set(&self, value: T) {
        *self.0.write() = value;
    }
}

/// The identity and upstream session state the Primary holds: the proxy key
/// it authenticates with plus the token, cluster identifier and account id it
/// got back. The token rotates, so readers copy on read.
#[derive(Clone, Default)]
pub struct SharedCredentials {
    pub key: String,
    pub token: Arc<GuardedValue<String>>,
    pub cluster: Arc<GuardedValue<String>>,
    pub account_id: Arc<GuardedValue<String>>,
}

impl SharedCredentials {
    pub fn new(key: impl Into<String>) -> Self {
        SharedCredentials {
            key: key.into(),
            ..Default::default()
        }
    }

    /// The cluster identifier returned by upstream auth, defaulting to "1"
    /// before the first successful authentication.
    pub fn cluster_identifier(&self) -> String {
        let cluster = self.cluster.get();
        if cluster.is_empty() {
            return "1".to_string();
        }
        cluster
    }
}

/// The set of open Proxy -> SDK stream channels, keyed by environment. The
/// on-disconnect handler consults it to force-close every open stream.
#[derive(Clone, Default)]
pub struct ConnectedStreams(Arc<RwLock<HashSet<String>>>);

impl ConnectedStreams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, channel: impl Into<String>) {
        self.0.write().insert(channel.into());
    }

    /// A point-in-time copy of the open channels.
    pub fn snapshot(&self) -> Vec<String> {
        self.0.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guarded_value_copies_on_read() {
        let value = GuardedValue::new("first".to_string());
        let copy = value.get();
        value.set("second".to_string());
        assert_eq!(copy, "first");
        assert_eq!(value.get(), "second");
    }

    #[test]
    fn cluster_identifier_defaults_to_one() {
        let creds = SharedCredentials::new("proxy-key");
        assert_eq!(creds.cluster_identifier(), "1");
        creds.cluster.set("2".to_string());
        assert_eq!(creds.cluster_identifier(), "2");
    }

    #[test]
    fn connected_streams_snapshot_is_stable() {
        let streams = ConnectedStreams::new();
        streams.register("env-1");
        streams.register("env-1");
        streams.register("env-2");

        let mut snapshot = streams.snapshot();
        snapshot.sort();
        assert_eq!(snapshot, vec!["env-1".to_string(), "env-2".to_string()]);
    }
}
