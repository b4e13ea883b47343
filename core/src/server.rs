//! Main server: listeners, the event loop, timers and teardown
//!
//! One task per listener accepts sockets and hands them reader/writer
//! tasks; everything those tasks produce funnels into the single main
//! loop, which owns the link-session table and serializes all protocol
//! state changes. Timers (ping cycle, handshake deadlines, x-line
//! expiry, auto-connect) fire through the wheel or the loop's
//! one-second tick.

use crate::client::{Client, ConnectionKind};
use crate::commands::CommandRegistry;
use crate::config::{Config, ListenerRole};
use crate::connection::{accept_stream, spawn_io_tasks, ConnectionEvent};
use crate::context::{Context, ServerAction};
use crate::database::Database;
use crate::link::{self, LinkManager, LinkSession};
use crate::modes::ModeRegistry;
use crate::motd::MotdManager;
use crate::server_tree::ServerTree;
use crate::snomask::SnomaskManager;
use crate::statistics::Statistics;
use crate::timer::TimerWheel;
use crate::user::UidGenerator;
use crate::utils::unix_time;
use crate::xline::XLineManager;
use crate::{Error, Message, Result};
use dashmap::DashMap;
use rustls::{Certificate, PrivateKey, ServerConfig as RustlsServerConfig};
use std::collections::HashMap;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_rustls::TlsAcceptor;
use uuid::Uuid;

const VERSION_STRING: &str = concat!("treeircd-", env!("CARGO_PKG_VERSION"));

/// Notifications from accept/connect tasks to the main loop.
enum LoopEvent {
    /// A server-role connection was accepted; create its session.
    NewServerInbound { id: Uuid },
    /// An outbound connect completed; start the handshake.
    NewOutbound { id: Uuid, link_name: String },
}

/// The daemon.
pub struct Server {
    config: Config,
    ctx: Option<Arc<Context>>,
    tls_acceptor: Option<TlsAcceptor>,
    actions_rx: Option<mpsc::UnboundedReceiver<ServerAction>>,
    registry: Arc<CommandRegistry>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            ctx: None,
            tls_acceptor: None,
            actions_rx: None,
            registry: Arc::new(CommandRegistry::with_defaults()),
        }
    }

    /// Validate configuration and build the shared context.
    pub async fn init(&mut self) -> Result<()> {
        self.config.validate()?;

        if self.config.security.tls.enabled {
            self.setup_tls()?;
        }

        let sid = self.config.server.server_id();
        let server_name = self.config.server.name.clone();
        let mapping = self.config.security.casemapping;

        let motd = match self.config.server.motd_file {
            Some(ref path) => MotdManager::load(path)?,
            None => MotdManager::empty(),
        };

        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        let timers = TimerWheel::new();

        let ctx = Arc::new(Context {
            config: Arc::new(self.config.clone()),
            database: Arc::new(Database::new(mapping, self.config.limits.whowas_history)),
            clients: Arc::new(DashMap::new()),
            tree: Arc::new(RwLock::new(ServerTree::new(
                server_name.clone(),
                self.config.server.description.clone(),
                sid.clone(),
            ))),
            links: Arc::new(LinkManager::new()),
            xlines: Arc::new(XLineManager::new(mapping)),
            snomasks: Arc::new(SnomaskManager::new(server_name.clone())),
            modes: Arc::new(ModeRegistry::with_defaults(&self.config.channel)),
            uid_gen: Arc::new(UidGenerator::new(sid)),
            motd: Arc::new(motd),
            timers,
            statistics: Arc::new(Statistics::new()),
            server_name,
            sid: self.config.server.server_id(),
            version: VERSION_STRING.to_string(),
            started_at: unix_time(),
            actions: actions_tx,
        });

        self.actions_rx = Some(actions_rx);
        self.ctx = Some(ctx);
        tracing::info!("server initialized");
        Ok(())
    }

    fn setup_tls(&mut self) -> Result<()> {
        let tls = &self.config.security.tls;
        let cert_file = tls
            .cert_file
            .as_ref()
            .ok_or_else(|| Error::Config("TLS certificate file not specified".to_string()))?;
        let key_file = tls
            .key_file
            .as_ref()
            .ok_or_else(|| Error::Config("TLS key file not specified".to_string()))?;

        let cert_chain = load_certificates(cert_file)?;
        let private_key = load_private_key(key_file)?;

        let tls_config = RustlsServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(Error::Tls)?;

        self.tls_acceptor = Some(TlsAcceptor::from(Arc::new(tls_config)));
        tracing::info!("TLS configuration loaded");
        Ok(())
    }

    /// Bind listeners and run the main loop until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        let ctx = self.ctx.clone().ok_or_else(|| {
            Error::Server("run() called before init()".to_string())
        })?;
        let mut actions_rx = self
            .actions_rx
            .take()
            .ok_or_else(|| Error::Server("run() called twice".to_string()))?;

        self.write_pid_file()?;

        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<ConnectionEvent>();
        let (loop_tx, mut loop_rx) = mpsc::unbounded_channel::<LoopEvent>();

        for listener in &self.config.listeners {
            let bind = format!("{}:{}", listener.address, listener.port);
            let socket = TcpListener::bind(&bind).await?;
            tracing::info!(address = %bind, role = ?listener.role, "listening");
            let role = listener.role;
            let tls = if listener.transport.as_deref() == Some("tls") {
                self.tls_acceptor.clone()
            } else {
                None
            };
            tokio::spawn(accept_loop(
                socket,
                role,
                tls,
                ctx.clone(),
                conn_tx.clone(),
                loop_tx.clone(),
            ));
        }

        TimerWheel::start(ctx.timers.clone());
        self.schedule_background_timers(&ctx);

        // Kick the auto-connect links once at startup.
        for link in &self.config.network.links {
            if link.auto_connect_secs > 0 {
                let _ = ctx.actions.send(ServerAction::ConnectLink {
                    name: link.name.clone(),
                });
            }
        }

        let mut sessions: HashMap<Uuid, LinkSession> = HashMap::new();
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
        let mut seconds: u64 = 0;

        tracing::info!(version = VERSION_STRING, "server running");
        loop {
            tokio::select! {
                Some(event) = conn_rx.recv() => {
                    self.handle_connection_event(&ctx, &mut sessions, event).await;
                }
                Some(event) = loop_rx.recv() => {
                    match event {
                        LoopEvent::NewServerInbound { id } => {
                            let sender = ctx.clients.get(&id).map(|c| c.sender.clone());
                            if let Some(sender) = sender {
                                let timeout = self.config.network.links.iter()
                                    .map(|l| l.timeout_secs)
                                    .min()
                                    .unwrap_or(30);
                                let session = LinkSession::new_inbound(id, sender, timeout);
                                link::send_capab(&ctx, &session);
                                sessions.insert(id, session);
                            }
                        }
                        LoopEvent::NewOutbound { id, link_name } => {
                            let sender = ctx.clients.get(&id).map(|c| c.sender.clone());
                            let timeout = self.config.link_block(&link_name)
                                .map(|l| l.timeout_secs)
                                .unwrap_or(30);
                            if let Some(sender) = sender {
                                let session = LinkSession::new_outbound(id, sender, link_name, timeout);
                                link::send_capab(&ctx, &session);
                                sessions.insert(id, session);
                            }
                        }
                    }
                }
                Some(action) = actions_rx.recv() => {
                    self.handle_action(&ctx, &mut sessions, action, &loop_tx, &conn_tx).await;
                }
                _ = tick.tick() => {
                    seconds += 1;
                    self.per_second(&ctx, &mut sessions, seconds).await;
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupt received, shutting down");
                    break;
                }
            }
        }

        self.shutdown(&ctx, &mut sessions).await;
        Ok(())
    }

    async fn handle_connection_event(
        &self,
        ctx: &Arc<Context>,
        sessions: &mut HashMap<Uuid, LinkSession>,
        event: ConnectionEvent,
    ) {
        match event {
            ConnectionEvent::Line(id, message) => {
                ctx.statistics.bump(&ctx.statistics.messages_received);
                if let Some(mut client) = ctx.clients.get_mut(&id) {
                    client.timing.update_activity();
                }
                if sessions.contains_key(&id) {
                    if let Err(e) = link::handle_line(ctx, sessions, id, message).await {
                        let peer = ctx
                            .links
                            .peer_name_of(&id)
                            .or_else(|| sessions.get(&id).and_then(|s| s.peer_name.clone()));
                        tracing::warn!(error = %e, peer = ?peer, "link error");
                        match peer {
                            Some(peer) if ctx.links.is_connected(&peer) => {
                                self.drop_link(ctx, sessions, &peer, &e.to_string()).await;
                            }
                            _ => {
                                sessions.remove(&id);
                                ctx.drop_connection(&id, &e.to_string());
                            }
                        }
                    }
                } else if let Err(e) = self.registry.dispatch(ctx, id, &message).await {
                    tracing::debug!(connection = %id, error = %e, "command error");
                }
            }
            ConnectionEvent::Closed(id, reason) => {
                if sessions.remove(&id).is_some() {
                    match ctx.links.peer_name_of(&id) {
                        Some(peer) => {
                            self.squit_peer(ctx, &peer, &reason).await;
                        }
                        None => ctx.drop_connection(&id, &reason),
                    }
                    return;
                }
                let uid = ctx.clients.get(&id).and_then(|c| c.uid.clone());
                match uid {
                    Some(uid) => {
                        ctx.quit_user(&uid, &reason, None).await;
                    }
                    None => ctx.drop_connection(&id, &reason),
                }
            }
        }
    }

    async fn handle_action(
        &self,
        ctx: &Arc<Context>,
        sessions: &mut HashMap<Uuid, LinkSession>,
        action: ServerAction,
        loop_tx: &mpsc::UnboundedSender<LoopEvent>,
        conn_tx: &mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        match action {
            ServerAction::DropLink { peer, reason } => {
                self.drop_link(ctx, sessions, &peer, &reason).await;
            }
            ServerAction::ConnectLink { name } => {
                if ctx.links.is_connected(&name) {
                    return;
                }
                let Some(block) = self.config.link_block(&name).cloned() else {
                    return;
                };
                let ctx = ctx.clone();
                let loop_tx = loop_tx.clone();
                let conn_tx = conn_tx.clone();
                tokio::spawn(async move {
                    let address = format!("{}:{}", block.address, block.port);
                    match TcpStream::connect(&address).await {
                        Ok(stream) => {
                            let remote_addr = match stream.peer_addr() {
                                Ok(a) => a,
                                Err(e) => {
                                    tracing::warn!(error = %e, "outbound connect lost its peer");
                                    return;
                                }
                            };
                            let id = register_wrapped(
                                &ctx,
                                Box::new(stream),
                                ConnectionKind::Server,
                                remote_addr,
                                conn_tx,
                            );
                            ctx.snotice('l', format!("Connecting to {} ({})", block.name, address));
                            let _ = loop_tx.send(LoopEvent::NewOutbound {
                                id,
                                link_name: block.name,
                            });
                        }
                        Err(e) => {
                            ctx.snotice(
                                'l',
                                format!("Connection to {} ({}) failed: {}", block.name, address, e),
                            );
                            if let Some(failover) = block.failover {
                                let _ = ctx
                                    .actions
                                    .send(ServerAction::ConnectLink { name: failover });
                            }
                        }
                    }
                });
            }
        }
    }

    /// Tear down a connected link with an ERROR line and full squit.
    async fn drop_link(
        &self,
        ctx: &Arc<Context>,
        sessions: &mut HashMap<Uuid, LinkSession>,
        peer: &str,
        reason: &str,
    ) {
        let Some(handle) = ctx.links.get(peer) else {
            return;
        };
        let _ = handle
            .sender
            .send(Message::new("ERROR", vec![format!("Closing link: {}", reason)]));
        sessions.remove(&handle.id);
        ctx.clients.remove(&handle.id);
        self.squit_peer(ctx, peer, reason).await;
    }

    /// A directly connected peer is gone: remove its subtree, purge its
    /// users, tell the survivors.
    async fn squit_peer(&self, ctx: &Arc<Context>, peer: &str, reason: &str) {
        let Some(handle) = ctx.links.get(peer) else {
            return;
        };
        if ctx.links.unregister_by_id(&handle.id).is_none() {
            return;
        }
        ctx.clients.remove(&handle.id);
        let removed = {
            let mut tree = ctx.tree.write().await;
            tree.remove_subtree(peer)
        };
        let split_reason = format!("{} {}", ctx.server_name, peer);
        let lost = ctx.purge_users_of_servers(&removed, &split_reason);
        ctx.statistics.bump(&ctx.statistics.squits);
        ctx.snotice(
            'q',
            format!(
                "Netsplit: lost link to {} ({}): {} servers, {} users removed",
                peer,
                reason,
                removed.len(),
                lost
            ),
        );
        ctx.one_to_many(ctx.sid_message(
            "SQUIT",
            vec![peer.to_string(), reason.to_string()],
        ))
        .await;
    }

    /// Once-per-second housekeeping: handshake deadlines and, on a
    /// slower cadence, the ping cycle.
    async fn per_second(
        &self,
        ctx: &Arc<Context>,
        sessions: &mut HashMap<Uuid, LinkSession>,
        seconds: u64,
    ) {
        let now = unix_time();
        for id in link::expired_handshakes(sessions, now) {
            tracing::warn!(connection = %id, "link handshake timed out");
            sessions.remove(&id);
            ctx.drop_connection(&id, "Handshake timed out");
        }

        if seconds % 30 != 0 {
            return;
        }

        // Client ping cycle.
        let mut to_ping = Vec::new();
        let mut to_timeout = Vec::new();
        for entry in ctx.clients.iter() {
            if entry.kind != ConnectionKind::Client {
                continue;
            }
            if entry.timing.is_timed_out() {
                to_timeout.push((entry.id, entry.uid.clone()));
            } else if entry.timing.should_send_ping() {
                to_ping.push(entry.id);
            }
        }
        for id in to_ping {
            ctx.send_to_connection(&id, Message::new("PING", vec![ctx.server_name.clone()]));
            if let Some(mut client) = ctx.clients.get_mut(&id) {
                client.timing.record_ping_sent();
            }
        }
        for (id, uid) in to_timeout {
            match uid {
                Some(uid) => {
                    ctx.quit_user(&uid, "Ping timeout", None).await;
                }
                None => ctx.drop_connection(&id, "Registration timeout"),
            }
        }

        // Server ping cycle.
        let peers: Vec<(String, bool)> = {
            let tree = ctx.tree.read().await;
            tree.direct_peers()
                .into_iter()
                .filter_map(|p| tree.find(&p).map(|n| (p, n.ping_answered)))
                .collect()
        };
        for (peer, answered) in peers {
            if !answered {
                ctx.snotice('l', format!("No PONG from {} within the window", peer));
                let _ = ctx.actions.send(ServerAction::DropLink {
                    peer,
                    reason: "Ping timeout".to_string(),
                });
                continue;
            }
            {
                let mut tree = ctx.tree.write().await;
                if let Some(node) = tree.find_mut(&peer) {
                    node.ping_answered = false;
                    node.last_ping = Some(now);
                }
            }
            ctx.links.send_to_peer(
                &peer,
                ctx.sid_message("PING", vec![ctx.server_name.clone(), peer.clone()]),
            );
        }
    }

    fn schedule_background_timers(&self, ctx: &Arc<Context>) {
        // X-line expiry sweep.
        {
            let xlines = ctx.xlines.clone();
            ctx.timers.schedule_repeating(
                self.config.xline.expiry_sweep_secs.max(1),
                move || {
                    let swept = xlines.expire_sweep();
                    if swept > 0 {
                        tracing::debug!(count = swept, "expired x-lines swept");
                    }
                },
            );
        }
        // Auto-connect retry per link block.
        for link in &self.config.network.links {
            if link.auto_connect_secs == 0 {
                continue;
            }
            let name = link.name.clone();
            let links = ctx.links.clone();
            let actions = ctx.actions.clone();
            ctx.timers
                .schedule_repeating(link.auto_connect_secs, move || {
                    if !links.is_connected(&name) {
                        let _ = actions.send(ServerAction::ConnectLink { name: name.clone() });
                    }
                });
        }
    }

    fn write_pid_file(&self) -> Result<()> {
        if let Some(ref path) = self.config.server.pid_file {
            std::fs::write(path, format!("{}\n", std::process::id()))?;
        }
        Ok(())
    }

    /// Ordered teardown, leaves first, every step unconditional: links
    /// squit, clients closed, registries dropped with the context, PID
    /// file removed.
    async fn shutdown(&self, ctx: &Arc<Context>, sessions: &mut HashMap<Uuid, LinkSession>) {
        let peers = ctx.tree.read().await.direct_peers();
        for peer in peers {
            self.drop_link(ctx, sessions, &peer, "Server shutting down").await;
        }
        for session in sessions.values() {
            session.send_error("Server shutting down");
        }
        sessions.clear();

        let uids = ctx.database.all_uids();
        for uid in uids {
            ctx.remove_user_local(&uid, "Server shutting down");
        }
        for entry in ctx.clients.iter().map(|e| e.id).collect::<Vec<_>>() {
            ctx.drop_connection(&entry, "Server shutting down");
        }

        if let Some(ref path) = self.config.server.pid_file {
            let _ = std::fs::remove_file(path);
        }
        tracing::info!("shutdown complete");
    }
}

/// Accept loop for one listener.
async fn accept_loop(
    socket: TcpListener,
    role: ListenerRole,
    tls: Option<TlsAcceptor>,
    ctx: Arc<Context>,
    conn_tx: mpsc::UnboundedSender<ConnectionEvent>,
    loop_tx: mpsc::UnboundedSender<LoopEvent>,
) {
    loop {
        let (stream, remote_addr) = match socket.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        ctx.statistics
            .bump(&ctx.statistics.connections_accepted);

        if role == ListenerRole::Clients
            && ctx.clients.len() >= ctx.config.limits.max_clients
        {
            tracing::warn!(remote = %remote_addr, "connection refused: server full");
            continue;
        }

        let kind = match role {
            ListenerRole::Clients => ConnectionKind::Client,
            ListenerRole::Servers => ConnectionKind::Server,
        };
        let ctx = ctx.clone();
        let conn_tx = conn_tx.clone();
        let loop_tx = loop_tx.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            let id = match accept_stream(stream, tls).await {
                Ok(wrapped) => {
                    let id = register_wrapped(&ctx, wrapped, kind, remote_addr, conn_tx);
                    id
                }
                Err(e) => {
                    tracing::debug!(remote = %remote_addr, error = %e, "TLS accept failed");
                    return;
                }
            };
            if kind == ConnectionKind::Server {
                let _ = loop_tx.send(LoopEvent::NewServerInbound { id });
            }
        });
    }
}

fn register_wrapped(
    ctx: &Arc<Context>,
    stream: Box<dyn crate::connection::ConnectionStream>,
    kind: ConnectionKind,
    remote_addr: std::net::SocketAddr,
    conn_tx: mpsc::UnboundedSender<ConnectionEvent>,
) -> Uuid {
    let id = Uuid::new_v4();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let limits = &ctx.config.limits;
    let (recvq, sendq) = match kind {
        ConnectionKind::Client => (limits.recvq_bytes, limits.sendq_bytes),
        ConnectionKind::Server => (limits.server_sendq_bytes, limits.server_sendq_bytes),
    };
    let client = Client::new(
        id,
        kind,
        remote_addr.to_string(),
        String::new(),
        remote_addr.ip().to_string(),
        out_tx,
        limits.ping_frequency_secs,
        limits.connection_timeout_secs,
    );
    ctx.clients.insert(id, client);
    spawn_io_tasks(id, stream, out_rx, conn_tx, recvq, sendq);
    id
}

/// Load certificates from file
fn load_certificates(filename: &str) -> Result<Vec<Certificate>> {
    let certfile = std::fs::File::open(filename)
        .map_err(|e| Error::Config(format!("Failed to open certificate file: {}", e)))?;
    let mut reader = BufReader::new(certfile);
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|e| Error::Config(format!("Failed to parse certificate file: {}", e)))?;
    Ok(certs.into_iter().map(Certificate).collect())
}

/// Load private key from file
fn load_private_key(filename: &str) -> Result<PrivateKey> {
    let keyfile = std::fs::File::open(filename)
        .map_err(|e| Error::Config(format!("Failed to open key file: {}", e)))?;
    let mut reader = BufReader::new(keyfile);
    let keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|e| Error::Config(format!("Failed to parse key file: {}", e)))?;
    if keys.is_empty() {
        return Err(Error::Config("No private keys found in file".to_string()));
    }
    Ok(PrivateKey(keys[0].clone()))
}
