//! Server-link sockets: state machine, authentication and burst control
//!
//! One `LinkSession` tracks a socket from accept/connect until it either
//! reaches CONNECTED (and its peer enters the server tree) or dies. The
//! session owns the handshake: CAPAB negotiation, SERVER authentication
//! against the link blocks, the BURST timestamp check, and burst
//! emission. Lines arriving after CONNECTED are server protocol and are
//! dispatched in `s2s`.

use crate::burst::{build_burst, BurstSource};
use crate::context::Context;
use crate::handshake::{
    generate_challenge, hmac_password, verify_password, CapabPhase, CapabilitySet,
};
use crate::s2s;
use crate::utils::unix_time;
use crate::{Error, Message, Result};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Handshake progress of one link socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Outbound socket, TCP connect still in flight
    Connecting,
    /// Exchanging CAPAB / waiting for SERVER
    WaitAuth1,
    /// Inbound side has replied SERVER, waiting for BURST
    WaitAuth2,
    /// Authenticated; server protocol flows
    Connected,
}

/// One link socket's handshake and session state.
pub struct LinkSession {
    pub id: Uuid,
    pub sender: mpsc::UnboundedSender<Message>,
    pub state: LinkState,
    pub outbound: bool,
    /// Link block name this socket is for (outbound) or matched (inbound)
    pub link_name: Option<String>,
    /// Challenge we advertised in our CAPAB
    pub our_challenge: String,
    /// Peer's accumulated CAPAB advertisement
    pub their_capab: CapabilitySet,
    pub capab_finished: bool,
    /// Peer identity from its SERVER line
    pub peer_name: Option<String>,
    pub peer_sid: Option<String>,
    pub peer_description: Option<String>,
    /// Peer is still replaying its burst
    pub bursting: bool,
    /// Unix time the handshake must have completed by
    pub deadline: i64,
}

impl LinkSession {
    pub fn new_inbound(id: Uuid, sender: mpsc::UnboundedSender<Message>, timeout_secs: u64) -> Self {
        Self {
            id,
            sender,
            state: LinkState::WaitAuth1,
            outbound: false,
            link_name: None,
            our_challenge: generate_challenge(),
            their_capab: CapabilitySet::default(),
            capab_finished: false,
            peer_name: None,
            peer_sid: None,
            peer_description: None,
            bursting: false,
            deadline: unix_time() + timeout_secs as i64,
        }
    }

    pub fn new_outbound(
        id: Uuid,
        sender: mpsc::UnboundedSender<Message>,
        link_name: String,
        timeout_secs: u64,
    ) -> Self {
        Self {
            id,
            sender,
            state: LinkState::WaitAuth1,
            outbound: true,
            link_name: Some(link_name),
            our_challenge: generate_challenge(),
            their_capab: CapabilitySet::default(),
            capab_finished: false,
            peer_name: None,
            peer_sid: None,
            peer_description: None,
            bursting: false,
            deadline: unix_time() + timeout_secs as i64,
        }
    }

    /// Queue a line on this link.
    pub fn send(&self, message: Message) {
        let _ = self.sender.send(message);
    }

    /// Send an ERROR line; the caller then drops the socket.
    pub fn send_error(&self, reason: &str) {
        self.send(Message::new("ERROR", vec![reason.to_string()]));
    }
}

/// Handle to a fully connected link, for routing.
#[derive(Clone)]
pub struct LinkHandle {
    pub id: Uuid,
    pub peer_name: String,
    pub sender: mpsc::UnboundedSender<Message>,
}

/// Registry of connected links, name-addressable for the router.
pub struct LinkManager {
    by_name: DashMap<String, LinkHandle>,
    names_by_id: DashMap<Uuid, String>,
}

impl LinkManager {
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            names_by_id: DashMap::new(),
        }
    }

    pub fn register(&self, handle: LinkHandle) {
        self.names_by_id.insert(handle.id, handle.peer_name.clone());
        self.by_name.insert(handle.peer_name.clone(), handle);
    }

    pub fn unregister_by_id(&self, id: &Uuid) -> Option<String> {
        let (_, name) = self.names_by_id.remove(id)?;
        self.by_name.remove(&name);
        Some(name)
    }

    pub fn peer_name_of(&self, id: &Uuid) -> Option<String> {
        self.names_by_id.get(id).map(|n| n.clone())
    }

    pub fn get(&self, peer_name: &str) -> Option<LinkHandle> {
        self.by_name.get(peer_name).map(|h| h.clone())
    }

    pub fn is_connected(&self, peer_name: &str) -> bool {
        self.by_name.contains_key(peer_name)
    }

    pub fn send_to_peer(&self, peer_name: &str, message: Message) {
        if let Some(handle) = self.by_name.get(peer_name) {
            let _ = handle.sender.send(message);
        }
    }

    pub fn connected_count(&self) -> usize {
        self.by_name.len()
    }
}

impl Default for LinkManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Send our CAPAB advertisement. Both sides do this as soon as the
/// socket is up.
pub fn send_capab(ctx: &Context, session: &LinkSession) {
    let ours = CapabilitySet::local(&ctx.config, &session.our_challenge);
    for msg in ours.to_messages() {
        session.send(msg);
    }
}

/// Send our SERVER introduction, HMAC-signing the password when the
/// peer advertised a challenge.
fn send_server_intro(ctx: &Context, session: &LinkSession, send_password: &str) {
    let password = match session.their_capab.challenge() {
        Some(challenge) => hmac_password(send_password, challenge),
        None => send_password.to_string(),
    };
    session.send(Message::new(
        "SERVER",
        vec![
            ctx.server_name.clone(),
            password,
            "0".to_string(),
            ctx.sid.clone(),
            ctx.config.server.description.clone(),
        ],
    ));
}

/// Process one line on a link socket that has not reached CONNECTED, or
/// dispatch to the server-protocol handlers once it has. Fatal errors
/// propagate to the caller, which squits the link.
pub async fn handle_line(
    ctx: &Arc<Context>,
    sessions: &mut HashMap<Uuid, LinkSession>,
    id: Uuid,
    message: Message,
) -> Result<()> {
    let state = match sessions.get(&id) {
        Some(s) => s.state,
        None => return Ok(()),
    };

    match state {
        LinkState::Connecting => {
            // Nothing should arrive before our connect completes.
            Err(Error::ProtocolViolation(format!(
                "line before connect completed: {}",
                message.command
            )))
        }
        LinkState::WaitAuth1 => handle_wait_auth_1(ctx, sessions, id, message).await,
        LinkState::WaitAuth2 => handle_wait_auth_2(ctx, sessions, id, message).await,
        LinkState::Connected => s2s::dispatch(ctx, sessions, id, message).await,
    }
}

async fn handle_wait_auth_1(
    ctx: &Arc<Context>,
    sessions: &mut HashMap<Uuid, LinkSession>,
    id: Uuid,
    message: Message,
) -> Result<()> {
    let session = sessions.get_mut(&id).expect("session checked by caller");
    match message.command.as_str() {
        "CAPAB" => {
            if session.their_capab.absorb(&message)? == CapabPhase::Finished {
                session.capab_finished = true;
                let ours = CapabilitySet::local(&ctx.config, &session.our_challenge);
                if let Err(e) = ours.compare(&session.their_capab) {
                    session.send_error(&format!("CAPAB negotiation failed: {}", e));
                    return Err(e);
                }
                if session.outbound {
                    // Their challenge is known now; introduce ourselves.
                    let link_name = session.link_name.clone().unwrap_or_default();
                    let send_password = ctx
                        .config
                        .link_block(&link_name)
                        .map(|l| l.send_password.clone())
                        .unwrap_or_default();
                    send_server_intro(ctx, session, &send_password);
                }
            }
            Ok(())
        }
        "SERVER" => {
            if !session.capab_finished {
                session.send_error("SERVER before CAPAB END");
                return Err(Error::ProtocolViolation("SERVER before CAPAB END".into()));
            }
            accept_server_line(ctx, sessions, id, &message).await
        }
        "ERROR" => Err(Error::ProtocolViolation(format!(
            "remote error: {}",
            message.arg(0).unwrap_or("")
        ))),
        "USER" | "NICK" => {
            session.send_error("Client connections to this port are prohibited");
            Err(Error::ProtocolViolation("client on server port".into()))
        }
        other => {
            session.send_error(&format!("Invalid command in negotiation phase: {}", other));
            Err(Error::ProtocolViolation(format!(
                "invalid handshake command {}",
                other
            )))
        }
    }
}

/// Validate a SERVER line against the link blocks.
///
/// Inbound: reply with our own SERVER and move to WAIT_AUTH_2.
/// Outbound: this is the peer's reply; the handshake is complete and we
/// begin the burst.
async fn accept_server_line(
    ctx: &Arc<Context>,
    sessions: &mut HashMap<Uuid, LinkSession>,
    id: Uuid,
    message: &Message,
) -> Result<()> {
    let session = sessions.get_mut(&id).expect("session checked by caller");

    let name = message
        .arg(0)
        .ok_or_else(|| Error::ProtocolViolation("SERVER without name".into()))?
        .to_string();
    let password = message.arg(1).unwrap_or("").to_string();
    let hops: u32 = message.arg(2).and_then(|h| h.parse().ok()).unwrap_or(0);
    let sid = message
        .arg(3)
        .ok_or_else(|| Error::ProtocolViolation("SERVER without SID".into()))?
        .to_string();
    let description = message.arg(4).unwrap_or("").to_string();

    if hops != 0 {
        session.send_error("Server too far away for authentication");
        return Err(Error::ProtocolViolation("nonzero hopcount at auth".into()));
    }
    if !crate::config::is_valid_sid(&sid) {
        session.send_error("Invalid SID");
        return Err(Error::ProtocolViolation(format!("invalid SID {}", sid)));
    }

    let block = match ctx.config.link_block(&name) {
        Some(b) => b.clone(),
        None => {
            session.send_error("Invalid credentials");
            ctx.snotice(
                'l',
                format!("Server connection from {} denied: no link block", name),
            );
            return Err(Error::ProtocolViolation(format!(
                "no link block for {}",
                name
            )));
        }
    };
    if session.outbound && session.link_name.as_deref() != Some(name.as_str()) {
        session.send_error("Server name does not match link block");
        return Err(Error::ProtocolViolation(format!(
            "expected {} in SERVER reply, got {}",
            session.link_name.as_deref().unwrap_or("?"),
            name
        )));
    }
    if !verify_password(&password, &block.recv_password, Some(&session.our_challenge)) {
        session.send_error("Invalid credentials");
        ctx.snotice(
            'l',
            format!("Server connection from {} denied: bad password", name),
        );
        return Err(Error::ProtocolViolation(format!("bad password from {}", name)));
    }

    {
        let tree = ctx.tree.read().await;
        if tree.find(&name).is_some() {
            session.send_error(&format!("Server {} already exists on the network", name));
            return Err(Error::ProtocolViolation(format!(
                "server {} already linked",
                name
            )));
        }
        if tree.find_by_sid(&sid).is_some() {
            session.send_error(&format!("SID {} already in use on the network", sid));
            return Err(Error::ProtocolViolation(format!("SID {} already linked", sid)));
        }
    }

    session.peer_name = Some(name.clone());
    session.peer_sid = Some(sid);
    session.peer_description = Some(description);
    session.link_name = Some(name.clone());

    if session.outbound {
        // Peer accepted our credentials and replied; we are linked.
        complete_link(ctx, sessions, id, None).await
    } else {
        let session = sessions.get_mut(&id).expect("session exists");
        send_server_intro(ctx, session, &block.send_password);
        session.state = LinkState::WaitAuth2;
        ctx.snotice('l', format!("Verified incoming server connection from {}", name));
        Ok(())
    }
}

async fn handle_wait_auth_2(
    ctx: &Arc<Context>,
    sessions: &mut HashMap<Uuid, LinkSession>,
    id: Uuid,
    message: Message,
) -> Result<()> {
    match message.command.as_str() {
        // They already sent SERVER in WAIT_AUTH_1; silently ignore.
        "SERVER" => Ok(()),
        "CAPAB" => {
            let session = sessions.get_mut(&id).expect("session checked by caller");
            session.their_capab.absorb(&message)?;
            Ok(())
        }
        "BURST" => {
            let remote_time: i64 = message.arg(0).and_then(|t| t.parse().ok()).unwrap_or(0);
            complete_link(ctx, sessions, id, Some(remote_time)).await
        }
        "ERROR" => Err(Error::ProtocolViolation(format!(
            "remote error: {}",
            message.arg(0).unwrap_or(""),
        ))),
        _ => Ok(()),
    }
}

/// Finish the handshake: clock check, tree insertion, network
/// announcement and our own burst.
async fn complete_link(
    ctx: &Arc<Context>,
    sessions: &mut HashMap<Uuid, LinkSession>,
    id: Uuid,
    remote_burst_time: Option<i64>,
) -> Result<()> {
    let session = sessions.get_mut(&id).expect("session checked by caller");

    if let Some(their_time) = remote_burst_time {
        let delta = their_time - unix_time();
        if delta.abs() > ctx.config.limits.max_ts_skew_secs {
            session.send_error(&format!(
                "Your clocks are out by {} seconds. Link aborted, PLEASE SYNC YOUR CLOCKS!",
                delta.abs()
            ));
            return Err(Error::TsSkew(delta));
        }
        if delta != 0 {
            tracing::warn!(
                peer = session.peer_name.as_deref().unwrap_or("?"),
                delta,
                "tolerating clock skew on link"
            );
        }
    }

    let peer_name = session
        .peer_name
        .clone()
        .ok_or_else(|| Error::ProtocolViolation("link completed without identity".into()))?;
    let peer_sid = session.peer_sid.clone().unwrap_or_default();
    let peer_desc = session.peer_description.clone().unwrap_or_default();

    session.state = LinkState::Connected;
    session.bursting = true;

    {
        let mut tree = ctx.tree.write().await;
        let root = tree.root_name().to_string();
        tree.add_server(&root, peer_name.clone(), peer_desc.clone(), peer_sid, Some(id))?;
        if let Some(node) = tree.find_mut(&peer_name) {
            node.bursting = true;
        }
    }
    ctx.links.register(LinkHandle {
        id,
        peer_name: peer_name.clone(),
        sender: sessions.get(&id).expect("session exists").sender.clone(),
    });

    // Tell the rest of the network about the new server.
    let announce = ctx.server_message(
        "SERVER",
        vec![
            peer_name.clone(),
            "*".to_string(),
            "1".to_string(),
            sessions
                .get(&id)
                .and_then(|s| s.peer_sid.clone())
                .unwrap_or_default(),
            peer_desc,
        ],
    );
    ctx.one_to_all_but_sender(Some(&peer_name), announce).await;

    ctx.snotice('l', format!("Bursting to {}.", peer_name));
    let burst = {
        let tree = ctx.tree.read().await;
        let source = BurstSource {
            server_name: &ctx.server_name,
            sid: &ctx.sid,
            version: &ctx.version,
            database: &ctx.database,
            tree: &tree,
            xlines: &ctx.xlines,
            max_modes_per_line: ctx.config.limits.max_modes_per_line,
        };
        build_burst(&source, &peer_name, unix_time())
    };
    let session = sessions.get(&id).expect("session exists");
    for line in burst {
        session.send(line);
    }
    ctx.snotice('l', format!("Finished bursting to {}.", peer_name));
    Ok(())
}

/// Abort handshakes that blew their deadline. Returns ids the caller
/// must drop.
pub fn expired_handshakes(sessions: &HashMap<Uuid, LinkSession>, now: i64) -> Vec<Uuid> {
    sessions
        .values()
        .filter(|s| s.state != LinkState::Connected && now >= s.deadline)
        .map(|s| s.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(state: LinkState, deadline: i64) -> LinkSession {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut s = LinkSession::new_inbound(Uuid::new_v4(), tx, 30);
        s.state = state;
        s.deadline = deadline;
        s
    }

    #[test]
    fn test_expired_handshakes() {
        let mut sessions = HashMap::new();
        let stuck = session(LinkState::WaitAuth1, 100);
        let stuck_id = stuck.id;
        let healthy = session(LinkState::Connected, 100);
        sessions.insert(stuck.id, stuck);
        sessions.insert(healthy.id, healthy);

        let expired = expired_handshakes(&sessions, 150);
        assert_eq!(expired, vec![stuck_id]);
        assert!(expired_handshakes(&sessions, 50).is_empty());
    }

    #[test]
    fn test_link_manager_registry() {
        let mgr = LinkManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        mgr.register(LinkHandle {
            id,
            peer_name: "peer.example.net".to_string(),
            sender: tx,
        });
        assert!(mgr.is_connected("peer.example.net"));
        assert_eq!(mgr.peer_name_of(&id).as_deref(), Some("peer.example.net"));

        mgr.send_to_peer("peer.example.net", Message::new("PING", vec![]));
        assert_eq!(rx.try_recv().unwrap().command, "PING");

        assert_eq!(
            mgr.unregister_by_id(&id).as_deref(),
            Some("peer.example.net")
        );
        assert!(!mgr.is_connected("peer.example.net"));
    }
}
