//! Shared server context threaded through command and link handlers
//!
//! There is no global server singleton: everything a handler may touch
//! hangs off one `Context` that the main loop constructs at startup and
//! hands down by reference. Destruction of users ("culling") funnels
//! through `quit_user`, which is idempotent and the only place
//! membership purge, peer propagation and socket teardown meet.

use crate::client::Client;
use crate::config::Config;
use crate::database::Database;
use crate::link::LinkManager;
use crate::modes::ModeRegistry;
use crate::motd::MotdManager;
use crate::numeric::NumericReply;
use crate::server_tree::ServerTree;
use crate::snomask::SnomaskManager;
use crate::statistics::Statistics;
use crate::timer::TimerWheel;
use crate::user::UidGenerator;
use crate::utils::unix_time;
use crate::xline::XLineManager;
use crate::{Message, Prefix};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Requests handlers make of the main loop (actions that need the
/// socket table, which only the loop owns).
#[derive(Debug)]
pub enum ServerAction {
    /// Tear down the link to a directly connected peer.
    DropLink { peer: String, reason: String },
    /// Open an outbound connection to a configured link block.
    ConnectLink { name: String },
}

/// Everything handlers need, shared by `Arc`.
pub struct Context {
    pub config: Arc<Config>,
    pub database: Arc<Database>,
    /// Local connections by id
    pub clients: Arc<DashMap<Uuid, Client>>,
    pub tree: Arc<RwLock<ServerTree>>,
    pub links: Arc<LinkManager>,
    pub xlines: Arc<XLineManager>,
    pub snomasks: Arc<SnomaskManager>,
    pub modes: Arc<ModeRegistry>,
    pub uid_gen: Arc<UidGenerator>,
    pub motd: Arc<MotdManager>,
    pub timers: Arc<TimerWheel>,
    pub statistics: Arc<Statistics>,
    pub server_name: String,
    pub sid: String,
    pub version: String,
    pub started_at: i64,
    /// Channel to the main loop for socket-table actions
    pub actions: mpsc::UnboundedSender<ServerAction>,
}

impl Context {
    // --- local delivery ------------------------------------------------

    /// Queue a message on a local connection.
    pub fn send_to_connection(&self, id: &Uuid, message: Message) {
        if let Some(client) = self.clients.get(id) {
            let _ = client.send(message);
        }
    }

    /// Send a numeric to a connection, using its nick when known.
    pub fn send_numeric(&self, id: &Uuid, reply: NumericReply, params: Vec<String>) {
        let target = self
            .clients
            .get(id)
            .and_then(|c| c.nick.clone())
            .unwrap_or_else(|| "*".to_string());
        self.send_to_connection(id, reply.reply(&self.server_name, &target, params));
    }

    /// Queue a message for a user if they are connected locally.
    pub fn send_to_local_user(&self, uid: &str, message: Message) {
        let local_id = self
            .database
            .get_user(uid)
            .and_then(|u| u.local_id);
        if let Some(id) = local_id {
            self.send_to_connection(&id, message);
        }
    }

    /// Deliver to every local member of a channel, optionally skipping one.
    pub fn send_to_channel_local(&self, channel: &str, message: Message, skip_uid: Option<&str>) {
        for uid in self.database.channel_members(channel, 0) {
            if Some(uid.as_str()) == skip_uid {
                continue;
            }
            self.send_to_local_user(&uid, message.clone());
        }
    }

    /// Resolve a command parameter that may be a nick or a UID.
    pub fn resolve_target_uid(&self, name_or_uid: &str) -> Option<String> {
        if crate::user::looks_like_uid(name_or_uid)
            && self.database.get_user(name_or_uid).is_some()
        {
            return Some(name_or_uid.to_string());
        }
        self.database.find_uid_by_nick(name_or_uid)
    }

    /// Nickname of the user attached to a connection id, for snotices.
    pub fn nick_of_connection(&self, id: &Uuid) -> Option<String> {
        self.clients.get(id).and_then(|c| c.nick.clone())
    }

    /// Raise a server notice on a snomask letter.
    pub fn snotice(&self, letter: char, text: impl AsRef<str>) {
        let text = text.as_ref();
        tracing::info!(snomask = %letter, "{}", text);
        self.snomasks
            .notice(letter, |id| self.nick_of_connection(id), text);
    }

    // --- routing to peers ---------------------------------------------

    /// Route to exactly the server `target` is reached through.
    pub async fn one_to_one(&self, target_server: &str, message: Message) {
        let route = {
            let tree = self.tree.read().await;
            tree.best_route_to(target_server).map(|n| n.name.clone())
        };
        if let Some(peer) = route {
            self.links.send_to_peer(&peer, message);
        }
    }

    /// Route to every directly connected peer.
    pub async fn one_to_many(&self, message: Message) {
        let peers = self.tree.read().await.direct_peers();
        for peer in peers {
            self.links.send_to_peer(&peer, message.clone());
        }
    }

    /// Route to every peer except the branch `omit_server` arrived from.
    pub async fn one_to_all_but_sender(&self, omit_server: Option<&str>, message: Message) {
        let peers = self.tree.read().await.peers_except(omit_server);
        for peer in peers {
            self.links.send_to_peer(&peer, message.clone());
        }
    }

    /// Route a channel message down exactly the branches that carry at
    /// least one member of rank >= `min_rank`, skipping the sender's
    /// branch and any exempt user's server.
    pub async fn route_to_channel(
        &self,
        channel: &str,
        message: Message,
        omit_server: Option<&str>,
        min_rank: u32,
        exempt_uid: Option<&str>,
    ) {
        let mut member_servers = HashSet::new();
        for uid in self.database.channel_members(channel, min_rank) {
            if Some(uid.as_str()) == exempt_uid {
                continue;
            }
            if let Some(user) = self.database.get_user(&uid) {
                member_servers.insert(user.server.clone());
            }
        }
        let branches = {
            let tree = self.tree.read().await;
            tree.branches_for(member_servers.iter().map(|s| s.as_str()), omit_server)
        };
        for peer in branches {
            self.links.send_to_peer(&peer, message.clone());
        }
    }

    // --- user lifecycle ------------------------------------------------

    /// Count of users with a local connection.
    pub fn local_user_count(&self) -> usize {
        self.clients
            .iter()
            .filter(|c| c.uid.is_some())
            .count()
    }

    /// Destroy a user with local-side effects only: membership purge,
    /// QUIT to local channel members, socket teardown. Peers are NOT
    /// told; use `quit_user` for that, or pair this with an explicit
    /// KILL/SQUIT the peers already saw.
    ///
    /// Idempotent; removing an already-gone UID returns false and has
    /// no side effects.
    pub fn remove_user_local(&self, uid: &str, reason: &str) -> bool {
        let channels: Vec<String> = match self.database.get_user(uid) {
            Some(user) => user.channels.iter().cloned().collect(),
            None => return false,
        };

        let mut audience: HashSet<Uuid> = HashSet::new();
        for channel in &channels {
            for member in self.database.channel_members(channel, 0) {
                if member == uid {
                    continue;
                }
                if let Some(user) = self.database.get_user(&member) {
                    if let Some(conn) = user.local_id {
                        audience.insert(conn);
                    }
                }
            }
        }

        let Some((user, _destroyed)) = self.database.remove_user(uid, unix_time()) else {
            return false;
        };

        let quit_msg = Message::with_prefix(user.prefix(), "QUIT", vec![reason.to_string()]);
        for conn in audience {
            self.send_to_connection(&conn, quit_msg.clone());
        }

        if let Some(conn_id) = user.local_id {
            self.send_to_connection(
                &conn_id,
                Message::new("ERROR", vec![format!("Closing link: {}", reason)]),
            );
            self.clients.remove(&conn_id);
            self.snomasks.unsubscribe(&conn_id);
            self.snotice(
                'c',
                format!("Client exiting: {} [{}] ({})", user.hostmask(), user.ip, reason),
            );
        }
        true
    }

    /// Destroy a user: purge memberships, tell local channel members,
    /// close the local socket if any, propagate QUIT to the network.
    ///
    /// Idempotent; quitting an already-gone UID returns false and has no
    /// side effects. `omit_server` names the server the QUIT arrived
    /// from so propagation skips that branch.
    pub async fn quit_user(
        &self,
        uid: &str,
        reason: &str,
        omit_server: Option<&str>,
    ) -> bool {
        if !self.remove_user_local(uid, reason) {
            return false;
        }
        let wire_quit = Message::with_prefix(
            Prefix::Server(uid.to_string()),
            "QUIT",
            vec![reason.to_string()],
        );
        self.one_to_all_but_sender(omit_server, wire_quit).await;
        true
    }

    /// Quit every user on the given servers with local-only
    /// announcements; peers learn of the loss from the SQUIT itself.
    /// Returns how many users were destroyed.
    pub fn purge_users_of_servers(&self, servers: &[String], reason: &str) -> usize {
        let mut purged = 0;
        for server in servers {
            for uid in self.database.uids_on_server(server) {
                // Audience first, as in quit_user.
                let channels: Vec<String> = match self.database.get_user(&uid) {
                    Some(user) => user.channels.iter().cloned().collect(),
                    None => continue,
                };
                let mut audience: HashSet<Uuid> = HashSet::new();
                for channel in &channels {
                    for member in self.database.channel_members(channel, 0) {
                        if member == uid {
                            continue;
                        }
                        if let Some(user) = self.database.get_user(&member) {
                            if let Some(conn) = user.local_id {
                                audience.insert(conn);
                            }
                        }
                    }
                }
                if let Some((user, _)) = self.database.remove_user(&uid, unix_time()) {
                    let quit = Message::with_prefix(
                        user.prefix(),
                        "QUIT",
                        vec![reason.to_string()],
                    );
                    for conn in audience {
                        self.send_to_connection(&conn, quit.clone());
                    }
                    purged += 1;
                }
            }
        }
        purged
    }

    /// Drop an unregistered or server-role connection.
    pub fn drop_connection(&self, id: &Uuid, reason: &str) {
        if let Some((_, client)) = self.clients.remove(id) {
            let _ = client.send(Message::new(
                "ERROR",
                vec![format!("Closing link: {}", reason)],
            ));
        }
        self.snomasks.unsubscribe(id);
    }

    /// Test a (just-registered or renamed) local user against the
    /// x-lines; on a hit, quit them and propagate. Returns true when the
    /// user was removed.
    pub async fn enforce_xlines(&self, uid: &str) -> bool {
        let hit = {
            let Some(user) = self.database.get_user(uid) else {
                return false;
            };
            self.xlines.check_user(&user)
        };
        let Some(hit) = hit else {
            return false;
        };
        let reason = self
            .config
            .xline
            .quit_template
            .replace("%reason%", &hit.reason);
        self.snotice(
            'x',
            format!("{}-line active for {} ({})", hit.kind.letter(), hit.mask, hit.reason),
        );
        self.quit_user(uid, &reason, None).await;
        true
    }

    /// Build a message prefixed with our server name.
    pub fn server_message(&self, command: &str, params: Vec<String>) -> Message {
        Message::with_prefix(
            Prefix::Server(self.server_name.clone()),
            command,
            params,
        )
    }

    /// Build a message prefixed with our SID (S2S form).
    pub fn sid_message(&self, command: &str, params: Vec<String>) -> Message {
        Message::with_prefix(Prefix::Server(self.sid.clone()), command, params)
    }
}
