//! Connection registry.
//!
//! Each control socket is addressed by its server-assigned `wsId`; the
//! supervisor and watcher registries hold ids, never socket handles, so
//! cleanup on either side is a plain index removal.

use axum::extract::ws::Message;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

pub struct ConnectionHandle {
    /// Outbound frames are funneled through one writer task per socket.
    pub tx: mpsc::UnboundedSender<Message>,
    /// Set by a successful in-band `auth` operation.
    pub auth_token: Mutex<Option<String>>,
}

pub type Connections = DashMap<String, ConnectionHandle>;

/// Send a text frame to one connection. A missing or closed connection is
/// not an error; the subscriber indexes may lag behind socket teardown.
pub fn send_text(connections: &Connections, ws_id: &str, text: &str) {
    if let Some(conn) = connections.get(ws_id) {
        let _ = conn.tx.send(Message::Text(text.to_string()));
    }
}

/// Send a text frame to every connection. Individual send failures never
/// abort the broadcast.
pub fn broadcast(connections: &Connections, text: &str) {
    for conn in connections.iter() {
        let _ = conn.tx.send(Message::Text(text.to_string()));
    }
}
