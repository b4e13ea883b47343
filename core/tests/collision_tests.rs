//! Timestamp collision scenarios
//!
//! End-to-end checks of the nickname and channel TS arbitration as seen
//! from one side of a link: introductions and FJOINs arrive on a
//! connected peer session and the resulting state and wire traffic are
//! inspected.

mod common;

use common::{drain, harness, SID};
use treeircd_core::MemberPrefix;

/// Local user older: the remote copy is killed back down the link and
/// the local user survives untouched.
#[tokio::test]
async fn nick_collision_local_wins() {
    let mut h = harness();
    let (peer_id, mut peer_rx) = h.attach_peer("peer.example.net", "001").await;
    let _rx = h.add_local_user("000AAAAAA", "alice", 100);

    h.peer_line(
        peer_id,
        ":001 UID 001AAAAAA 200 alice remote.example remote.example ident 10.0.0.2 +i :Remote",
    )
    .await
    .unwrap();

    let sent = drain(&mut peer_rx);
    let kill = sent
        .iter()
        .find(|m| m.command == "KILL")
        .expect("a KILL goes back down the link");
    assert_eq!(kill.source_name(), SID);
    assert_eq!(kill.params[0], "001AAAAAA");
    assert_eq!(kill.params[1], "Nickname collision");

    // The local user is unchanged and the intro was discarded.
    let alice = h.ctx.database.find_user_by_nick("alice").expect("alice survives");
    assert_eq!(alice.uid, "000AAAAAA");
    assert_eq!(alice.ts, 100);
    assert!(h.ctx.database.get_user("001AAAAAA").is_none());
}

/// Remote user older: the local copy is quit with "Nickname collision"
/// and the remote user takes the name.
#[tokio::test]
async fn nick_collision_remote_wins() {
    let mut h = harness();
    let (peer_id, mut peer_rx) = h.attach_peer("peer.example.net", "001").await;
    let _rx = h.add_local_user("000AAAAAA", "alice", 100);

    h.peer_line(
        peer_id,
        ":001 UID 001AAAAAA 50 alice remote.example remote.example ident 10.0.0.2 +i :Remote",
    )
    .await
    .unwrap();

    assert!(h.ctx.database.get_user("000AAAAAA").is_none(), "local copy quit");
    let alice = h.ctx.database.find_user_by_nick("alice").expect("remote owns the nick");
    assert_eq!(alice.uid, "001AAAAAA");
    assert_eq!(alice.ts, 50);

    // No KILL went back; the peer's copy won.
    let sent = drain(&mut peer_rx);
    assert!(sent.iter().all(|m| m.command != "KILL"));
}

/// Equal ages kill both copies.
#[tokio::test]
async fn nick_collision_equal_kills_both() {
    let mut h = harness();
    let (peer_id, mut peer_rx) = h.attach_peer("peer.example.net", "001").await;
    let _rx = h.add_local_user("000AAAAAA", "alice", 100);

    h.peer_line(
        peer_id,
        ":001 UID 001AAAAAA 100 alice remote.example remote.example ident 10.0.0.2 +i :Remote",
    )
    .await
    .unwrap();

    assert!(h.ctx.database.find_user_by_nick("alice").is_none());
    let sent = drain(&mut peer_rx);
    assert!(sent.iter().any(|m| m.command == "KILL" && m.params[0] == "001AAAAAA"));
}

/// The same UID arriving twice is a lying link, not a collision.
#[tokio::test]
async fn nick_collision_same_uid_drops_link() {
    let mut h = harness();
    let (peer_id, _peer_rx) = h.attach_peer("peer.example.net", "001").await;
    h.add_remote_user("001AAAAAA", "alice", "peer.example.net", 100);

    let result = h
        .peer_line(
            peer_id,
            ":001 UID 001AAAAAA 200 alice remote.example remote.example ident 10.0.0.2 +i :Dup",
        )
        .await;
    assert!(matches!(
        result,
        Err(treeircd_core::Error::ProtocolViolation(_))
    ));
}

/// Channel merge where the remote side is older: our TS drops, every
/// local prefix is stripped and documented with FMODE, the remote
/// member joins plain.
#[tokio::test]
async fn channel_merge_we_lose() {
    let mut h = harness();
    let (peer_id, mut peer_rx) = h.attach_peer("peer.example.net", "001").await;
    let _rx1 = h.add_local_user("000AAAAAA", "u1", 90);
    let _rx2 = h.add_local_user("000AAAAAB", "u2", 91);
    h.add_remote_user("001AAAAAB", "peer_u1", "peer.example.net", 95);

    h.ctx.database.create_channel("#a", 500);
    h.ctx
        .database
        .add_member("#a", "000AAAAAA", MemberPrefix::OP)
        .unwrap();
    h.ctx
        .database
        .add_member("#a", "000AAAAAB", MemberPrefix::VOICE)
        .unwrap();

    h.peer_line(peer_id, ":001 FJOIN #a 300 :,001AAAAAB").await.unwrap();

    let channel = h.ctx.database.get_channel("#a").unwrap();
    assert_eq!(channel.ts, 300, "TS lowered to the remote value");
    assert!(channel.member_prefix("000AAAAAA").is_empty(), "op stripped");
    assert!(channel.member_prefix("000AAAAAB").is_empty(), "voice stripped");
    assert!(channel.is_member("001AAAAAB"));
    assert!(channel.member_prefix("001AAAAAB").is_empty());
    drop(channel);

    let sent = drain(&mut peer_rx);
    // The losing side documents the strip so third parties can follow.
    let fmode = sent
        .iter()
        .find(|m| m.command == "FMODE" && m.params[0] == "#a")
        .expect("documenting FMODE emitted");
    assert_eq!(fmode.params[1], "300");
    assert!(fmode.params[2].starts_with('-'));
    assert!(fmode.params[2].contains('o'));
    assert!(fmode.params[2].contains('v'));
}

/// Equal timestamps merge memberships and keep both sides' prefixes.
#[tokio::test]
async fn channel_merge_equal_ts() {
    let mut h = harness();
    let (peer_id, _peer_rx) = h.attach_peer("peer.example.net", "001").await;
    let _rx1 = h.add_local_user("000AAAAAA", "u1", 90);
    h.add_remote_user("001AAAAAB", "peer_u1", "peer.example.net", 95);

    h.ctx.database.create_channel("#a", 500);
    h.ctx
        .database
        .add_member("#a", "000AAAAAA", MemberPrefix::OP)
        .unwrap();

    h.peer_line(peer_id, ":001 FJOIN #a 500 :@,001AAAAAB").await.unwrap();

    let channel = h.ctx.database.get_channel("#a").unwrap();
    assert_eq!(channel.ts, 500);
    assert!(channel.member_prefix("000AAAAAA").contains(MemberPrefix::OP));
    assert!(channel.member_prefix("001AAAAAB").contains(MemberPrefix::OP));
}

/// When we are older, remote members join stripped and our TS stands.
#[tokio::test]
async fn channel_merge_we_win() {
    let mut h = harness();
    let (peer_id, _peer_rx) = h.attach_peer("peer.example.net", "001").await;
    let _rx1 = h.add_local_user("000AAAAAA", "u1", 90);
    h.add_remote_user("001AAAAAB", "peer_u1", "peer.example.net", 95);

    h.ctx.database.create_channel("#a", 300);
    h.ctx
        .database
        .add_member("#a", "000AAAAAA", MemberPrefix::OP)
        .unwrap();

    h.peer_line(peer_id, ":001 FJOIN #a 500 :@,001AAAAAB").await.unwrap();

    let channel = h.ctx.database.get_channel("#a").unwrap();
    assert_eq!(channel.ts, 300, "our older TS stands");
    assert!(channel.member_prefix("000AAAAAA").contains(MemberPrefix::OP));
    assert!(
        channel.member_prefix("001AAAAAB").is_empty(),
        "winner ignores the loser's prefixes"
    );
}

/// TS monotonicity: a merge never raises the channel TS.
#[tokio::test]
async fn channel_ts_never_raised() {
    let mut h = harness();
    let (peer_id, _peer_rx) = h.attach_peer("peer.example.net", "001").await;
    h.add_remote_user("001AAAAAB", "peer_u1", "peer.example.net", 95);

    h.ctx.database.create_channel("#a", 400);
    let before = h.ctx.database.get_channel("#a").unwrap().ts;

    for ts in [700, 500, 400, 350] {
        let line = format!(":001 FJOIN #a {} :,001AAAAAB", ts);
        h.peer_line(peer_id, &line).await.unwrap();
        let now = h.ctx.database.get_channel("#a").unwrap().ts;
        assert!(now <= before, "TS may only fall");
    }
    assert_eq!(h.ctx.database.get_channel("#a").unwrap().ts, 350);
}

/// FMODE with a newer TS is bounced with our state, not applied.
#[tokio::test]
async fn fmode_newer_ts_bounced() {
    let mut h = harness();
    let (peer_id, mut peer_rx) = h.attach_peer("peer.example.net", "001").await;
    h.ctx.database.create_channel("#a", 300);
    h.add_remote_user("001AAAAAB", "peer_u1", "peer.example.net", 95);
    h.ctx
        .database
        .add_member("#a", "001AAAAAB", MemberPrefix::NONE)
        .unwrap();

    h.peer_line(peer_id, ":001 FMODE #a 500 +m").await.unwrap();

    let channel = h.ctx.database.get_channel("#a").unwrap();
    assert!(!channel.has_mode('m'), "newer-TS change refused");
    drop(channel);

    let sent = drain(&mut peer_rx);
    let bounce = sent
        .iter()
        .find(|m| m.command == "FMODE")
        .expect("bounce sent back");
    assert_eq!(bounce.params[0], "#a");
    assert_eq!(bounce.params[1], "300", "bounce carries our lower TS");
    assert_eq!(bounce.params[2], "-m", "unset mode is reinforced off");
}

/// FMODE with an older TS is honoured completely.
#[tokio::test]
async fn fmode_older_ts_accepted() {
    let mut h = harness();
    let (peer_id, _peer_rx) = h.attach_peer("peer.example.net", "001").await;
    h.ctx.database.create_channel("#a", 500);
    h.add_remote_user("001AAAAAB", "peer_u1", "peer.example.net", 95);
    h.ctx
        .database
        .add_member("#a", "001AAAAAB", MemberPrefix::NONE)
        .unwrap();

    h.peer_line(peer_id, ":001 FMODE #a 300 +mk sesame").await.unwrap();

    let channel = h.ctx.database.get_channel("#a").unwrap();
    assert!(channel.has_mode('m'));
    assert_eq!(channel.key.as_deref(), Some("sesame"));
    assert_eq!(channel.ts, 300, "lower TS recorded");
}

/// Equal-TS parametric conflict: the smaller value survives and the
/// loser's value is reinforced back at the sender.
#[tokio::test]
async fn fmode_equal_ts_parametric_merge() {
    let mut h = harness();
    let (peer_id, mut peer_rx) = h.attach_peer("peer.example.net", "001").await;
    h.ctx.database.create_channel("#a", 500);
    {
        let mut channel = h.ctx.database.get_channel_mut("#a").unwrap();
        channel.limit = Some(10);
    }
    h.add_remote_user("001AAAAAB", "peer_u1", "peer.example.net", 95);
    h.ctx
        .database
        .add_member("#a", "001AAAAAB", MemberPrefix::NONE)
        .unwrap();

    h.peer_line(peer_id, ":001 FMODE #a 500 +l 50").await.unwrap();

    let channel = h.ctx.database.get_channel("#a").unwrap();
    assert_eq!(channel.limit, Some(10), "smaller limit wins the tie");
    drop(channel);

    let sent = drain(&mut peer_rx);
    let bounce = sent
        .iter()
        .find(|m| m.command == "FMODE" && m.params.get(2).map(|s| s.as_str()) == Some("+l"))
        .expect("our limit reinforced");
    assert_eq!(bounce.params[3], "10");
}
