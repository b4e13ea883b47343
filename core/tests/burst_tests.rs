//! Link handshake, burst application and netsplit accounting

mod common;

use common::{drain, harness, test_config, SERVER_NAME};
use treeircd_core::handshake::{hmac_password, CapabilitySet};
use treeircd_core::link::{LinkSession, LinkState};
use treeircd_core::s2s;
use treeircd_core::MemberPrefix;
use uuid::Uuid;

/// Run a full inbound handshake against the harness and return the
/// session id plus the receiver capturing our side of the wire.
async fn inbound_handshake(
    h: &mut common::Harness,
) -> (Uuid, tokio::sync::mpsc::UnboundedReceiver<treeircd_core::Message>) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let id = Uuid::new_v4();
    let session = LinkSession::new_inbound(id, tx, 30);
    h.sessions.insert(id, session);

    // We advertise first; grab our challenge from the capture.
    treeircd_core::link::send_capab(&h.ctx, h.sessions.get(&id).unwrap());
    let our_capab_lines = drain(&mut rx);
    let mut ours_seen = CapabilitySet::default();
    for line in &our_capab_lines {
        let _ = ours_seen.absorb(line);
    }
    let our_challenge = ours_seen.challenge().expect("we advertise a challenge").to_string();

    // Peer advertises the same feature set.
    let peer_capab = CapabilitySet::local(&test_config(), "peerchallenge");
    for line in peer_capab.to_messages() {
        h.peer_line(id, &line.to_wire()).await.unwrap();
    }

    // Peer authenticates with the HMAC of our recv password.
    let password = hmac_password("recvpass", &our_challenge);
    h.peer_line(
        id,
        &format!("SERVER peer.example.net {} 0 001 :Peer server", password),
    )
    .await
    .unwrap();
    assert_eq!(h.sessions.get(&id).unwrap().state, LinkState::WaitAuth2);

    // Our SERVER reply went out.
    let sent = drain(&mut rx);
    let server_reply = sent
        .iter()
        .find(|m| m.command == "SERVER")
        .expect("SERVER reply sent");
    assert_eq!(server_reply.params[0], SERVER_NAME);

    (id, rx)
}

#[tokio::test]
async fn inbound_handshake_reaches_connected_and_bursts() {
    let mut h = harness();
    let _local = h.add_local_user("000AAAAAA", "alice", 100);
    h.ctx.database.create_channel("#a", 400);
    h.ctx
        .database
        .add_member("#a", "000AAAAAA", MemberPrefix::OP)
        .unwrap();

    let (id, mut rx) = inbound_handshake(&mut h).await;

    let now = treeircd_core::utils::unix_time();
    h.peer_line(id, &format!("BURST {}", now)).await.unwrap();
    assert_eq!(h.sessions.get(&id).unwrap().state, LinkState::Connected);

    let burst = drain(&mut rx);
    assert_eq!(burst.first().unwrap().command, "BURST");
    assert_eq!(burst.last().unwrap().command, "ENDBURST");
    assert!(burst.iter().any(|m| m.command == "UID" && m.params[2] == "alice"));
    assert!(burst.iter().any(|m| m.command == "FJOIN" && m.params[0] == "#a"));

    // The new server is in the tree with its link attached.
    let tree = h.ctx.tree.read().await;
    let node = tree.find("peer.example.net").expect("peer in tree");
    assert_eq!(node.sid, "001");
    assert_eq!(node.link_id, Some(id));
}

#[tokio::test]
async fn handshake_rejects_bad_password() {
    let mut h = harness();
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let id = Uuid::new_v4();
    h.sessions.insert(id, LinkSession::new_inbound(id, tx, 30));

    let peer_capab = CapabilitySet::local(&test_config(), "x");
    for line in peer_capab.to_messages() {
        h.peer_line(id, &line.to_wire()).await.unwrap();
    }
    let result = h
        .peer_line(id, "SERVER peer.example.net wrongpass 0 001 :Peer")
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn handshake_rejects_capability_mismatch() {
    let mut h = harness();
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let id = Uuid::new_v4();
    h.sessions.insert(id, LinkSession::new_inbound(id, tx, 30));

    let mut other = test_config();
    other.channel.halfop = false;
    let peer_capab = CapabilitySet::local(&other, "x");
    let mut failed = false;
    for line in peer_capab.to_messages() {
        if h.peer_line(id, &line.to_wire()).await.is_err() {
            failed = true;
        }
    }
    assert!(failed, "differing feature sets must refuse the link");
}

#[tokio::test]
async fn burst_rejects_excessive_clock_skew() {
    let mut h = harness();
    let (id, _rx) = inbound_handshake(&mut h).await;

    let skewed = treeircd_core::utils::unix_time() + 4000;
    let result = h.peer_line(id, &format!("BURST {}", skewed)).await;
    assert!(matches!(result, Err(treeircd_core::Error::TsSkew(_))));
}

/// Applying a peer's burst produces matching state: users, memberships,
/// prefixes, modes and topic. (The emit side is covered above and in
/// the burst unit tests; together they give the sync property.)
#[tokio::test]
async fn applying_burst_recreates_state() {
    let mut h = harness();
    let (peer_id, _peer_rx) = h.attach_peer("peer.example.net", "001").await;

    for line in [
        ":001 UID 001AAAAAA 900 remote1 h.example h.example ident 10.0.0.2 +iw :Remote One",
        ":001 UID 001AAAAAB 901 remote2 h.example h.example ident 10.0.0.3 + :Remote Two",
        ":001AAAAAA OPERTYPE :NetAdmin",
        ":001 FJOIN #syncd 800 :@,001AAAAAA +,001AAAAAB",
        ":001 FMODE #syncd 800 +ntk sesame",
        ":001 FTOPIC #syncd 790 remote1 :hello world",
        ":001 METADATA 001AAAAAA swhois :shown in whois",
        "ENDBURST",
    ] {
        h.peer_line(peer_id, line).await.unwrap();
    }

    let u1 = h.ctx.database.get_user("001AAAAAA").expect("remote1 exists");
    assert_eq!(u1.nick, "remote1");
    assert_eq!(u1.ts, 900);
    assert!(u1.has_mode('i') && u1.has_mode('w'));
    assert!(u1.is_oper());
    assert_eq!(u1.metadata.get("swhois").map(String::as_str), Some("shown in whois"));
    drop(u1);

    let channel = h.ctx.database.get_channel("#syncd").expect("channel exists");
    assert_eq!(channel.ts, 800);
    assert!(channel.member_prefix("001AAAAAA").contains(MemberPrefix::OP));
    assert!(channel.member_prefix("001AAAAAB").contains(MemberPrefix::VOICE));
    assert!(channel.has_mode('n') && channel.has_mode('t'));
    assert_eq!(channel.key.as_deref(), Some("sesame"));
    let topic = channel.topic.as_ref().expect("topic set");
    assert_eq!(topic.text, "hello world");
    assert_eq!(topic.set_at, 790);
    drop(channel);

    // Burst complete: the peer is no longer marked bursting.
    let tree = h.ctx.tree.read().await;
    assert!(!tree.find("peer.example.net").unwrap().bursting);
}

/// SQUIT of a server removes exactly its users, with no dangling
/// memberships, and reports the loss.
#[tokio::test]
async fn squit_purges_split_users() {
    let mut h = harness();
    let (peer_id, _peer_rx) = h.attach_peer("peer.example.net", "001").await;
    let mut local_rx = h.add_local_user("000AAAAAA", "alice", 100);

    // A server behind the peer with two users sharing a channel with us.
    h.peer_line(peer_id, ":001 SERVER leaf.example.net * 2 002 :Leaf")
        .await
        .unwrap();
    h.peer_line(
        peer_id,
        ":002 UID 002AAAAAA 900 far1 h.example h.example ident 10.0.0.5 + :Far One",
    )
    .await
    .unwrap();
    h.peer_line(
        peer_id,
        ":002 UID 002AAAAAB 901 far2 h.example h.example ident 10.0.0.6 + :Far Two",
    )
    .await
    .unwrap();
    h.ctx.database.create_channel("#x", 100);
    h.ctx.database.add_member("#x", "000AAAAAA", MemberPrefix::NONE).unwrap();
    h.ctx.database.add_member("#x", "002AAAAAA", MemberPrefix::NONE).unwrap();
    h.ctx.database.add_member("#x", "002AAAAAB", MemberPrefix::NONE).unwrap();
    drain(&mut local_rx);

    let lost = s2s::perform_remote_squit(&h.ctx, "leaf.example.net", "test split", None).await;
    assert_eq!(lost, 2, "exactly the split server's users are destroyed");

    assert!(h.ctx.database.get_user("002AAAAAA").is_none());
    assert!(h.ctx.database.get_user("002AAAAAB").is_none());
    assert!(h.ctx.database.get_user("000AAAAAA").is_some());

    let channel = h.ctx.database.get_channel("#x").expect("channel survives");
    assert_eq!(channel.member_count(), 1, "no dangling memberships");
    drop(channel);

    // The local member watched both users quit with split notation.
    let seen = drain(&mut local_rx);
    let quits: Vec<_> = seen.iter().filter(|m| m.command == "QUIT").collect();
    assert_eq!(quits.len(), 2);
    assert!(quits[0].params[0].contains("leaf.example.net"));

    let tree = h.ctx.tree.read().await;
    assert!(tree.find("leaf.example.net").is_none());
}

/// Quitting a user twice is a no-op the second time.
#[tokio::test]
async fn double_quit_is_idempotent() {
    let h = harness();
    let _rx = h.add_local_user("000AAAAAA", "alice", 100);
    assert!(h.ctx.quit_user("000AAAAAA", "bye", None).await);
    assert!(!h.ctx.quit_user("000AAAAAA", "bye again", None).await);
}
