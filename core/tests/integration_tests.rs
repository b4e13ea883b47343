//! Client protocol integration: registration, channels, messaging,
//! dispatcher gates

mod common;

use common::{drain, harness, Harness};
use std::sync::Arc;
use treeircd_core::commands::CommandRegistry;
use treeircd_core::{Message, MemberPrefix};
use uuid::Uuid;

struct Client {
    id: Uuid,
    rx: tokio::sync::mpsc::UnboundedReceiver<Message>,
}

async fn line(
    registry: &CommandRegistry,
    h: &Harness,
    client: &mut Client,
    raw: &str,
) {
    let message = Message::parse(raw).expect("test line parses");
    registry
        .dispatch(&h.ctx, client.id, &message)
        .await
        .expect("dispatch does not error");
}

async fn register_user(
    registry: &CommandRegistry,
    h: &Harness,
    nick: &str,
) -> Client {
    let (id, rx) = h.attach_client();
    let mut client = Client { id, rx };
    line(registry, h, &mut client, &format!("NICK {}", nick)).await;
    line(
        registry,
        h,
        &mut client,
        &format!("USER {} 0 * :Test User", nick),
    )
    .await;
    client
}

fn numerics(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .filter(|m| m.command.chars().all(|c| c.is_ascii_digit()))
        .map(|m| m.command.clone())
        .collect()
}

#[tokio::test]
async fn registration_flow_sends_welcome() {
    let h = harness();
    let registry = Arc::new(CommandRegistry::with_defaults());
    let mut alice = register_user(&registry, &h, "alice").await;

    let seen = drain(&mut alice.rx);
    let codes = numerics(&seen);
    for expected in ["001", "002", "003", "004", "005"] {
        assert!(codes.contains(&expected.to_string()), "missing {expected}");
    }
    // 422: no MOTD file in the test config.
    assert!(codes.contains(&"422".to_string()));

    let user = h.ctx.database.find_user_by_nick("alice").expect("registered");
    assert!(user.is_local());
    assert!(user.uid.starts_with(common::SID));
}

#[tokio::test]
async fn commands_require_registration() {
    let h = harness();
    let registry = Arc::new(CommandRegistry::with_defaults());
    let (id, rx) = h.attach_client();
    let mut client = Client { id, rx };

    line(&registry, &h, &mut client, "JOIN #rust").await;
    let seen = drain(&mut client.rx);
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].command, "451");
}

#[tokio::test]
async fn unknown_command_gets_421() {
    let h = harness();
    let registry = Arc::new(CommandRegistry::with_defaults());
    let mut alice = register_user(&registry, &h, "alice").await;
    drain(&mut alice.rx);

    line(&registry, &h, &mut alice, "FROBNICATE now").await;
    let seen = drain(&mut alice.rx);
    assert_eq!(seen[0].command, "421");
}

#[tokio::test]
async fn nick_in_use_gets_433() {
    let h = harness();
    let registry = Arc::new(CommandRegistry::with_defaults());
    let _alice = register_user(&registry, &h, "alice").await;

    let (id, rx) = h.attach_client();
    let mut bob = Client { id, rx };
    line(&registry, &h, &mut bob, "NICK ALICE").await;
    let seen = drain(&mut bob.rx);
    assert_eq!(seen[0].command, "433", "case-folded nick is taken");
}

#[tokio::test]
async fn join_creates_channel_with_op() {
    let h = harness();
    let registry = Arc::new(CommandRegistry::with_defaults());
    let mut alice = register_user(&registry, &h, "alice").await;
    drain(&mut alice.rx);

    line(&registry, &h, &mut alice, "JOIN #rust").await;
    let seen = drain(&mut alice.rx);
    assert!(seen.iter().any(|m| m.command == "JOIN"));
    assert!(seen.iter().any(|m| m.command == "353"));
    assert!(seen.iter().any(|m| m.command == "366"));

    let uid = h.ctx.database.find_uid_by_nick("alice").unwrap();
    let channel = h.ctx.database.get_channel("#rust").expect("created");
    assert!(channel.member_prefix(&uid).contains(MemberPrefix::OP), "first joiner is opped");
}

#[tokio::test]
async fn join_comma_list_expands() {
    let h = harness();
    let registry = Arc::new(CommandRegistry::with_defaults());
    let mut alice = register_user(&registry, &h, "alice").await;
    drain(&mut alice.rx);

    line(&registry, &h, &mut alice, "JOIN #a,#b,#c").await;
    for name in ["#a", "#b", "#c"] {
        assert!(h.ctx.database.get_channel(name).is_some(), "{name} joined");
    }
}

#[tokio::test]
async fn join_gates_are_enforced() {
    let h = harness();
    let registry = Arc::new(CommandRegistry::with_defaults());
    let mut alice = register_user(&registry, &h, "alice").await;
    let mut bob = register_user(&registry, &h, "bob").await;
    drain(&mut alice.rx);
    drain(&mut bob.rx);

    line(&registry, &h, &mut alice, "JOIN #gate").await;
    line(&registry, &h, &mut alice, "MODE #gate +k sesame").await;
    line(&registry, &h, &mut bob, "JOIN #gate").await;
    let seen = drain(&mut bob.rx);
    assert_eq!(seen[0].command, "475", "keyed channel refuses without key");

    line(&registry, &h, &mut bob, "JOIN #gate sesame").await;
    assert!(h
        .ctx
        .database
        .get_channel("#gate")
        .unwrap()
        .is_member(&h.ctx.database.find_uid_by_nick("bob").unwrap()));

    // Invite-only against a third user.
    line(&registry, &h, &mut alice, "MODE #gate +i-k sesame").await;
    let mut carol = register_user(&registry, &h, "carol").await;
    drain(&mut carol.rx);
    line(&registry, &h, &mut carol, "JOIN #gate").await;
    let seen = drain(&mut carol.rx);
    assert_eq!(seen[0].command, "473");

    line(&registry, &h, &mut alice, "INVITE carol #gate").await;
    drain(&mut carol.rx);
    line(&registry, &h, &mut carol, "JOIN #gate").await;
    assert!(h
        .ctx
        .database
        .get_channel("#gate")
        .unwrap()
        .is_member(&h.ctx.database.find_uid_by_nick("carol").unwrap()));
}

#[tokio::test]
async fn ban_blocks_join_but_except_overrides() {
    let h = harness();
    let registry = Arc::new(CommandRegistry::with_defaults());
    let mut alice = register_user(&registry, &h, "alice").await;
    let mut bob = register_user(&registry, &h, "bob").await;
    drain(&mut alice.rx);
    drain(&mut bob.rx);

    line(&registry, &h, &mut alice, "JOIN #walls").await;
    line(&registry, &h, &mut alice, "MODE #walls +b bob!*@*").await;
    line(&registry, &h, &mut bob, "JOIN #walls").await;
    let seen = drain(&mut bob.rx);
    assert_eq!(seen[0].command, "474");

    line(&registry, &h, &mut alice, "MODE #walls +e bob!*@*").await;
    line(&registry, &h, &mut bob, "JOIN #walls").await;
    let seen = drain(&mut bob.rx);
    assert!(seen.iter().any(|m| m.command == "JOIN"));
}

#[tokio::test]
async fn privmsg_reaches_channel_members_only() {
    let h = harness();
    let registry = Arc::new(CommandRegistry::with_defaults());
    let mut alice = register_user(&registry, &h, "alice").await;
    let mut bob = register_user(&registry, &h, "bob").await;
    let mut carol = register_user(&registry, &h, "carol").await;

    line(&registry, &h, &mut alice, "JOIN #talk").await;
    line(&registry, &h, &mut bob, "JOIN #talk").await;
    drain(&mut alice.rx);
    drain(&mut bob.rx);
    drain(&mut carol.rx);

    line(&registry, &h, &mut alice, "PRIVMSG #talk :hello there").await;

    let bob_seen = drain(&mut bob.rx);
    let delivered = bob_seen
        .iter()
        .find(|m| m.command == "PRIVMSG")
        .expect("member receives the message");
    assert_eq!(delivered.params[1], "hello there");
    assert!(delivered.source_name().contains("alice"));

    assert!(drain(&mut carol.rx).is_empty(), "non-member hears nothing");
    assert!(
        drain(&mut alice.rx).iter().all(|m| m.command != "PRIVMSG"),
        "no echo to the sender"
    );
}

#[tokio::test]
async fn mode_changes_apply_and_announce() {
    let h = harness();
    let registry = Arc::new(CommandRegistry::with_defaults());
    let mut alice = register_user(&registry, &h, "alice").await;
    let mut bob = register_user(&registry, &h, "bob").await;

    line(&registry, &h, &mut alice, "JOIN #m").await;
    line(&registry, &h, &mut bob, "JOIN #m").await;
    drain(&mut alice.rx);
    drain(&mut bob.rx);

    line(&registry, &h, &mut alice, "MODE #m +o bob").await;
    let seen = drain(&mut bob.rx);
    let mode = seen.iter().find(|m| m.command == "MODE").expect("announced");
    assert_eq!(mode.params, vec!["#m", "+o", "bob"]);

    let bob_uid = h.ctx.database.find_uid_by_nick("bob").unwrap();
    assert!(h
        .ctx
        .database
        .get_channel("#m")
        .unwrap()
        .member_prefix(&bob_uid)
        .contains(MemberPrefix::OP));

    // A plain member may not set modes.
    line(&registry, &h, &mut bob, "MODE #m -o bob").await;
    // (bob is op now, so deop himself is allowed; verify a non-op denial
    // with a fresh member instead.)
    let mut carol = register_user(&registry, &h, "carol").await;
    line(&registry, &h, &mut carol, "JOIN #m").await;
    drain(&mut carol.rx);
    line(&registry, &h, &mut carol, "MODE #m +m").await;
    let seen = drain(&mut carol.rx);
    assert!(seen.iter().any(|m| m.command == "482"));
}

#[tokio::test]
async fn kick_requires_rank_and_removes() {
    let h = harness();
    let registry = Arc::new(CommandRegistry::with_defaults());
    let mut alice = register_user(&registry, &h, "alice").await;
    let mut bob = register_user(&registry, &h, "bob").await;

    line(&registry, &h, &mut alice, "JOIN #k").await;
    line(&registry, &h, &mut bob, "JOIN #k").await;
    drain(&mut alice.rx);
    drain(&mut bob.rx);

    line(&registry, &h, &mut bob, "KICK #k alice :no").await;
    let seen = drain(&mut bob.rx);
    assert_eq!(seen[0].command, "482");

    line(&registry, &h, &mut alice, "KICK #k bob :yes").await;
    let bob_uid = h.ctx.database.find_uid_by_nick("bob").unwrap();
    assert!(!h.ctx.database.get_channel("#k").unwrap().is_member(&bob_uid));
}

#[tokio::test]
async fn part_destroys_empty_channel() {
    let h = harness();
    let registry = Arc::new(CommandRegistry::with_defaults());
    let mut alice = register_user(&registry, &h, "alice").await;
    drain(&mut alice.rx);

    line(&registry, &h, &mut alice, "JOIN #gone").await;
    assert!(h.ctx.database.get_channel("#gone").is_some());
    line(&registry, &h, &mut alice, "PART #gone :bye").await;
    assert!(h.ctx.database.get_channel("#gone").is_none());
}

#[tokio::test]
async fn oper_up_and_kill() {
    let mut config = common::test_config();
    config.network.operators.push(treeircd_core::config::OperatorConfig {
        name: "root".to_string(),
        password_hash: treeircd_core::config::PasswordHasher::hash("secret"),
        hostmask: "*@*".to_string(),
        oper_type: "NetAdmin".to_string(),
        flags: vec![
            treeircd_core::config::OperatorFlag::GlobalOper,
            treeircd_core::config::OperatorFlag::Squit,
        ],
    });
    let h = common::harness_with(config);
    let registry = Arc::new(CommandRegistry::with_defaults());
    let mut alice = register_user(&registry, &h, "alice").await;
    let mut victim = register_user(&registry, &h, "victim").await;
    drain(&mut alice.rx);
    drain(&mut victim.rx);

    line(&registry, &h, &mut alice, "OPER root secret").await;
    let seen = drain(&mut alice.rx);
    assert!(seen.iter().any(|m| m.command == "381"));
    let alice_uid = h.ctx.database.find_uid_by_nick("alice").unwrap();
    assert!(h.ctx.database.get_user(&alice_uid).unwrap().is_oper());

    line(&registry, &h, &mut alice, "KILL victim :begone").await;
    assert!(h.ctx.database.find_user_by_nick("victim").is_none());

    // Non-opers cannot KILL.
    let mut mallory = register_user(&registry, &h, "mallory").await;
    drain(&mut mallory.rx);
    line(&registry, &h, &mut mallory, "KILL alice :hah").await;
    let seen = drain(&mut mallory.rx);
    assert_eq!(seen[0].command, "481");
    assert!(h.ctx.database.find_user_by_nick("alice").is_some());
}

#[tokio::test]
async fn whois_and_whowas() {
    let h = harness();
    let registry = Arc::new(CommandRegistry::with_defaults());
    let mut alice = register_user(&registry, &h, "alice").await;
    let mut bob = register_user(&registry, &h, "bob").await;
    drain(&mut alice.rx);
    drain(&mut bob.rx);

    line(&registry, &h, &mut alice, "WHOIS bob").await;
    let seen = drain(&mut alice.rx);
    let codes = numerics(&seen);
    assert!(codes.contains(&"311".to_string()));
    assert!(codes.contains(&"312".to_string()));
    assert!(codes.contains(&"318".to_string()));

    line(&registry, &h, &mut bob, "QUIT :done").await;
    line(&registry, &h, &mut alice, "WHOWAS bob").await;
    let seen = drain(&mut alice.rx);
    let codes = numerics(&seen);
    assert!(codes.contains(&"314".to_string()));
    assert!(codes.contains(&"369".to_string()));
}

#[tokio::test]
async fn qline_blocks_registration() {
    let h = harness();
    let registry = Arc::new(CommandRegistry::with_defaults());
    h.ctx.xlines.add(treeircd_core::XLine {
        kind: treeircd_core::XLineKind::Q,
        mask: "evil*".to_string(),
        setter: "oper".to_string(),
        set_time: treeircd_core::utils::unix_time(),
        duration: 0,
        reason: "reserved nick".to_string(),
    });

    let _banned = register_user(&registry, &h, "evilbot").await;
    assert!(
        h.ctx.database.find_user_by_nick("evilbot").is_none(),
        "Q-lined nick is removed on registration"
    );
}
