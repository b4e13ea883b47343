//! Shared test harness: a context wired to in-memory channels instead
//! of sockets, plus helpers to attach fake clients and peer links.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use treeircd_core::client::{Client, ConnectionKind};
use treeircd_core::config::{Config, LinkConfig, ListenerConfig, ListenerRole};
use treeircd_core::context::{Context, ServerAction};
use treeircd_core::database::Database;
use treeircd_core::link::{LinkHandle, LinkManager, LinkSession, LinkState};
use treeircd_core::modes::ModeRegistry;
use treeircd_core::motd::MotdManager;
use treeircd_core::server_tree::ServerTree;
use treeircd_core::snomask::SnomaskManager;
use treeircd_core::statistics::Statistics;
use treeircd_core::timer::TimerWheel;
use treeircd_core::user::{UidGenerator, User};
use treeircd_core::utils::unix_time;
use treeircd_core::xline::XLineManager;
use treeircd_core::{CaseMapping, Message};
use uuid::Uuid;

pub const SERVER_NAME: &str = "root.example.net";
pub const SID: &str = "000";

pub struct Harness {
    pub ctx: Arc<Context>,
    pub sessions: HashMap<Uuid, LinkSession>,
    pub actions_rx: mpsc::UnboundedReceiver<ServerAction>,
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.name = SERVER_NAME.to_string();
    config.server.sid = Some(SID.to_string());
    config.server.pid_file = None;
    config.listeners.push(ListenerConfig {
        address: "127.0.0.1".to_string(),
        port: 6667,
        role: ListenerRole::Clients,
        transport: None,
    });
    config.network.links.push(LinkConfig {
        name: "peer.example.net".to_string(),
        address: "127.0.0.1".to_string(),
        port: 7001,
        send_password: "sendpass".to_string(),
        recv_password: "recvpass".to_string(),
        auto_connect_secs: 0,
        failover: None,
        timeout_secs: 30,
        transport: None,
        hidden: false,
    });
    config
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

pub fn harness_with(config: Config) -> Harness {
    let (actions_tx, actions_rx) = mpsc::unbounded_channel();
    let mapping = CaseMapping::Rfc1459;
    let ctx = Arc::new(Context {
        config: Arc::new(config.clone()),
        database: Arc::new(Database::new(mapping, 8)),
        clients: Arc::new(DashMap::new()),
        tree: Arc::new(RwLock::new(ServerTree::new(
            SERVER_NAME.to_string(),
            "test root".to_string(),
            SID.to_string(),
        ))),
        links: Arc::new(LinkManager::new()),
        xlines: Arc::new(XLineManager::new(mapping)),
        snomasks: Arc::new(SnomaskManager::new(SERVER_NAME.to_string())),
        modes: Arc::new(ModeRegistry::with_defaults(&config.channel)),
        uid_gen: Arc::new(UidGenerator::new(SID.to_string())),
        motd: Arc::new(MotdManager::empty()),
        timers: TimerWheel::new(),
        statistics: Arc::new(Statistics::new()),
        server_name: SERVER_NAME.to_string(),
        sid: SID.to_string(),
        version: "treeircd-test".to_string(),
        started_at: unix_time(),
        actions: actions_tx,
    });
    Harness {
        ctx,
        sessions: HashMap::new(),
        actions_rx,
    }
}

impl Harness {
    /// Attach a connected peer link with the given name and SID.
    /// Returns the link's connection id and the receiver capturing
    /// everything we send to that peer.
    pub async fn attach_peer(
        &mut self,
        name: &str,
        sid: &str,
    ) -> (Uuid, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        {
            let mut tree = self.ctx.tree.write().await;
            let root = tree.root_name().to_string();
            tree.add_server(&root, name.to_string(), "peer".to_string(), sid.to_string(), Some(id))
                .expect("peer added");
        }
        self.ctx.links.register(LinkHandle {
            id,
            peer_name: name.to_string(),
            sender: tx.clone(),
        });
        let mut session = LinkSession::new_inbound(id, tx, 30);
        session.state = LinkState::Connected;
        session.peer_name = Some(name.to_string());
        session.peer_sid = Some(sid.to_string());
        self.sessions.insert(id, session);
        (id, rx)
    }

    /// Attach a fake local client connection. Returns the connection id
    /// and the receiver capturing everything sent to it.
    pub fn attach_client(&self) -> (Uuid, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let client = Client::new(
            id,
            ConnectionKind::Client,
            "10.0.0.9:50000".to_string(),
            "127.0.0.1:6667".to_string(),
            "10.0.0.9".to_string(),
            tx,
            120,
            300,
        );
        self.ctx.clients.insert(id, client);
        (id, rx)
    }

    /// Insert a fully registered local user backed by a fake connection.
    pub fn add_local_user(&self, uid: &str, nick: &str, ts: i64) -> mpsc::UnboundedReceiver<Message> {
        let (conn_id, rx) = self.attach_client();
        let mut user = User::new_local(
            uid.to_string(),
            nick.to_string(),
            "ident".to_string(),
            "local.example".to_string(),
            "Test User".to_string(),
            "10.0.0.9".to_string(),
            SERVER_NAME.to_string(),
            conn_id,
            ts,
        );
        user.ts = ts;
        self.ctx.database.add_user(user).expect("user added");
        if let Some(mut client) = self.ctx.clients.get_mut(&conn_id) {
            client.uid = Some(uid.to_string());
            client.nick = Some(nick.to_string());
            client.state = treeircd_core::RegistrationState::All;
        }
        rx
    }

    /// Insert a remote user as if a UID line had been accepted.
    pub fn add_remote_user(&self, uid: &str, nick: &str, server: &str, ts: i64) {
        let user = User::new_remote(
            uid.to_string(),
            nick.to_string(),
            "ident".to_string(),
            "remote.example".to_string(),
            "remote.example".to_string(),
            "Remote User".to_string(),
            "10.0.0.2".to_string(),
            server.to_string(),
            ts,
        );
        self.ctx.database.add_user(user).expect("remote user added");
    }

    /// Feed one wire line into the link layer as if the peer sent it.
    pub async fn peer_line(&mut self, id: Uuid, line: &str) -> treeircd_core::Result<()> {
        let message = Message::parse(line).expect("test line parses");
        treeircd_core::link::handle_line(&self.ctx, &mut self.sessions, id, message).await
    }
}

/// Drain every queued message from a receiver.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}
