//! The watcher hub.
//!
//! A watcher is a WebSocket client interested in every query carrying its
//! id in the `random` option. The hub is a bounded registry; each watcher
//! owns a bounded inbox and events are dropped, never awaited, when the
//! inbox is full.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use serde::Serialize;
use tokio::sync::mpsc;

/// Per-watcher inbox capacity.
pub const WATCHER_BUFFER: usize = 500;

/// One observed DNS query, as delivered to a watcher.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryEvent {
    pub time: u32,
    pub proto: String,
    pub remote_ip: String,
    pub remote_port: String,
    /// Text rendering of the query; only for `"full"` subprotocol watchers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_text: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_edns0: bool,
    #[serde(skip_serializing_if = "is_zero")]
    pub udp_size: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_subnet: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tls_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tls_cipher_suite: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tls_server_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tls_negotiated_protocol: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub tls_did_resume: bool,
}

fn is_zero(v: &u16) -> bool {
    *v == 0
}

#[derive(Debug)]
pub enum RegisterError {
    /// A live watcher already holds this id.
    Exists,
    /// The hub is full.
    AtCapacity(usize),
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterError::Exists => f.write_str("watcher already exists"),
            RegisterError::AtCapacity(size) => write!(f, "at max size ({size})"),
        }
    }
}

struct Watcher {
    tx: mpsc::Sender<QueryEvent>,
    full: bool,
}

pub struct WatcherHub {
    max_size: usize,
    inner: RwLock<HashMap<String, Watcher>>,
}

impl WatcherHub {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Claim `id`, returning the receiving end of its inbox. `full` records
    /// whether the watcher negotiated the message-text subprotocol.
    pub fn register(
        &self,
        id: &str,
        full: bool,
    ) -> Result<mpsc::Receiver<QueryEvent>, RegisterError> {
        let mut inner = self.inner.write().unwrap();
        if inner.contains_key(id) {
            return Err(RegisterError::Exists);
        }
        if self.max_size > 0 && inner.len() >= self.max_size {
            return Err(RegisterError::AtCapacity(inner.len()));
        }
        let (tx, rx) = mpsc::channel(WATCHER_BUFFER);
        inner.insert(id.to_owned(), Watcher { tx, full });
        Ok(rx)
    }

    pub fn unregister(&self, id: &str) {
        self.inner.write().unwrap().remove(id);
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.inner.read().unwrap().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver an event to the watcher registered under `id`, if any.
    ///
    /// The event is built by the callback so the (possibly large) message
    /// text is only rendered for watchers that asked for it. Delivery never
    /// blocks; a full inbox drops the event.
    pub fn send(&self, id: &str, make_event: impl FnOnce(bool) -> QueryEvent) {
        let inner = self.inner.read().unwrap();
        if let Some(watcher) = inner.get(id) {
            let _ = watcher.tx.try_send(make_event(watcher.full));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_ids_are_refused() {
        let hub = WatcherHub::new(10);
        let _rx = hub.register("cafe", false).unwrap();
        assert!(matches!(
            hub.register("cafe", false),
            Err(RegisterError::Exists)
        ));
        hub.unregister("cafe");
        assert!(hub.register("cafe", false).is_ok());
    }

    #[test]
    fn capacity_is_bounded() {
        let hub = WatcherHub::new(2);
        let _a = hub.register("a", false).unwrap();
        let _b = hub.register("b", false).unwrap();
        assert!(matches!(
            hub.register("c", false),
            Err(RegisterError::AtCapacity(2))
        ));
    }

    #[test]
    fn send_reaches_the_inbox_and_never_blocks() {
        let hub = WatcherHub::new(10);
        let mut rx = hub.register("beef", true).unwrap();
        hub.send("beef", |full| QueryEvent {
            time: 1,
            msg_text: full.then(|| "query text".to_owned()),
            ..Default::default()
        });
        // unknown ids are silently ignored
        hub.send("dead", |_| QueryEvent::default());
        let event = rx.try_recv().unwrap();
        assert_eq!(event.msg_text.as_deref(), Some("query text"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn events_serialize_with_camel_case_and_omissions() {
        let event = QueryEvent {
            time: 5,
            proto: "UDP".into(),
            remote_ip: "192.0.2.1".into(),
            remote_port: "4242".into(),
            ..Default::default()
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"remoteIp\":\"192.0.2.1\""));
        assert!(!json.contains("tlsVersion"));
        assert!(!json.contains("isEdns0"));
    }
}
