//! Local connection records
//!
//! A `Client` is one accepted socket, client or server role, tracked
//! from accept until cull. Registration data accumulates here until the
//! connection becomes a `User` (client role) or a link (server role).

use crate::buffer::ConnectionTiming;
use crate::user::RegistrationState;
use crate::{Error, Message, Result};
use tokio::sync::mpsc;
use uuid::Uuid;

/// What kind of listener accepted this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Client,
    Server,
}

/// One local connection.
#[derive(Debug)]
pub struct Client {
    /// Connection id (local only, never visible on the wire)
    pub id: Uuid,
    pub kind: ConnectionKind,
    pub remote_addr: String,
    pub local_addr: String,
    /// Outbound queue; the writer task drains this to the socket
    pub sender: mpsc::UnboundedSender<Message>,
    /// Registration progress
    pub state: RegistrationState,
    /// Pending nick (before full registration)
    pub nick: Option<String>,
    /// Pending ident from USER
    pub ident: Option<String>,
    /// Pending gecos from USER
    pub gecos: Option<String>,
    /// PASS argument, if any
    pub password: Option<String>,
    /// UID once fully registered
    pub uid: Option<String>,
    /// Hostname (reverse DNS when available, else the IP)
    pub hostname: String,
    /// IP as text
    pub ip: String,
    pub timing: ConnectionTiming,
    pub encrypted: bool,
}

impl Client {
    pub fn new(
        id: Uuid,
        kind: ConnectionKind,
        remote_addr: String,
        local_addr: String,
        ip: String,
        sender: mpsc::UnboundedSender<Message>,
        ping_frequency: u64,
        connection_timeout: u64,
    ) -> Self {
        Self {
            id,
            kind,
            remote_addr,
            local_addr,
            sender,
            state: RegistrationState::None,
            nick: None,
            ident: None,
            gecos: None,
            password: None,
            uid: None,
            hostname: ip.clone(),
            ip,
            timing: ConnectionTiming::new(ping_frequency, connection_timeout),
            encrypted: false,
        }
    }

    /// Queue a message for this connection.
    pub fn send(&self, message: Message) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|_| Error::Connection("connection writer is gone".to_string()))
    }

    pub fn is_registered(&self) -> bool {
        self.state.is_registered()
    }

    /// Whether both NICK and USER have arrived.
    pub fn registration_complete(&self) -> bool {
        self.nick.is_some() && self.ident.is_some()
    }

    /// Best name for log lines: nick if known, else the address.
    pub fn display_name(&self) -> String {
        self.nick
            .clone()
            .unwrap_or_else(|| format!("unknown@{}", self.remote_addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (Client, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Client::new(
                Uuid::new_v4(),
                ConnectionKind::Client,
                "10.0.0.1:50000".to_string(),
                "0.0.0.0:6667".to_string(),
                "10.0.0.1".to_string(),
                tx,
                120,
                300,
            ),
            rx,
        )
    }

    #[test]
    fn test_send_queues_message() {
        let (client, mut rx) = client();
        client.send(Message::new("PING", vec!["x".to_string()])).unwrap();
        let got = rx.try_recv().unwrap();
        assert_eq!(got.command, "PING");
    }

    #[test]
    fn test_send_fails_after_receiver_drop() {
        let (client, rx) = client();
        drop(rx);
        assert!(client.send(Message::new("PING", vec![])).is_err());
    }

    #[test]
    fn test_registration_tracking() {
        let (mut client, _rx) = client();
        assert!(!client.registration_complete());
        client.nick = Some("alice".to_string());
        client.state = client.state.on_nick();
        client.ident = Some("alice".to_string());
        client.state = client.state.on_user();
        assert!(client.registration_complete());
        assert!(client.is_registered());
    }
}
