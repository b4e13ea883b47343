//! Netburst construction
//!
//! After a handshake completes, each side replays everything it knows in
//! a fixed order: BURST timestamp, our version, the server tree, all
//! users (with oper/away riders), all channels (FJOIN membership, FMODE
//! modes and lists, FTOPIC), x-lines, extension metadata, ENDBURST.
//! Users require their servers to exist and channels require their
//! users, hence the order.

use crate::channel::Channel;
use crate::database::Database;
use crate::modes::{stack_mode_changes, ModeChange};
use crate::server_tree::ServerTree;
use crate::xline::XLineManager;
use crate::{Message, Prefix};

/// Members carried per FJOIN line before splitting.
const FJOIN_MEMBERS_PER_LINE: usize = 15;

/// Everything the burst builder needs to know about us.
pub struct BurstSource<'a> {
    pub server_name: &'a str,
    pub sid: &'a str,
    pub version: &'a str,
    pub database: &'a Database,
    pub tree: &'a ServerTree,
    pub xlines: &'a XLineManager,
    pub max_modes_per_line: usize,
}

/// Build the complete burst for a newly linked peer.
pub fn build_burst(source: &BurstSource<'_>, peer_name: &str, now: i64) -> Vec<Message> {
    let mut out = Vec::new();

    out.push(Message::new("BURST", vec![now.to_string()]));
    out.push(Message::with_prefix(
        Prefix::Server(source.server_name.to_string()),
        "VERSION",
        vec![source.version.to_string()],
    ));

    burst_servers(source, peer_name, &mut out);
    burst_users(source, &mut out);
    burst_channels(source, &mut out);
    burst_xlines(source, &mut out);
    burst_metadata(source, &mut out);

    out.push(Message::new("ENDBURST", Vec::new()));
    out
}

/// Recursive server enumeration, parents before children, skipping
/// ourselves (announced during the handshake) and the peer being
/// burst to (it knows itself).
fn burst_servers(source: &BurstSource<'_>, peer_name: &str, out: &mut Vec<Message>) {
    for name in source.tree.burst_order() {
        if source.tree.is_root(&name) || name == peer_name {
            continue;
        }
        let Some(node) = source.tree.find(&name) else {
            continue;
        };
        let parent = node
            .parent
            .clone()
            .unwrap_or_else(|| source.server_name.to_string());
        out.push(Message::with_prefix(
            Prefix::Server(parent),
            "SERVER",
            vec![
                node.name.clone(),
                "*".to_string(),
                node.hops.to_string(),
                node.sid.clone(),
                node.description.clone(),
            ],
        ));
        if !node.version.is_empty() {
            out.push(Message::with_prefix(
                Prefix::Server(node.name.clone()),
                "VERSION",
                vec![node.version.clone()],
            ));
        }
    }
}

fn burst_users(source: &BurstSource<'_>, out: &mut Vec<Message>) {
    for uid in source.database.all_uids() {
        let Some(user) = source.database.get_user(&uid) else {
            continue;
        };
        out.push(Message::with_prefix(
            Prefix::Server(user.sid().to_string()),
            "UID",
            vec![
                user.uid.clone(),
                user.ts.to_string(),
                user.nick.clone(),
                user.host.clone(),
                user.dhost.clone(),
                user.ident.clone(),
                user.ip.clone(),
                user.modes_string(),
                user.gecos.clone(),
            ],
        ));
        if let Some(ref oper_type) = user.oper_type {
            out.push(Message::with_prefix(
                Prefix::Server(user.uid.clone()),
                "OPERTYPE",
                vec![oper_type.clone()],
            ));
        }
        if let Some(ref away) = user.away {
            out.push(Message::with_prefix(
                Prefix::Server(user.uid.clone()),
                "AWAY",
                vec![away.clone()],
            ));
        }
    }
}

fn burst_channels(source: &BurstSource<'_>, out: &mut Vec<Message>) {
    for name in source.database.all_channel_names() {
        let Some(channel) = source.database.get_channel(&name) else {
            continue;
        };
        burst_one_channel(source, &channel, out);
    }
}

fn burst_one_channel(source: &BurstSource<'_>, channel: &Channel, out: &mut Vec<Message>) {
    let sid = Prefix::Server(source.sid.to_string());

    // Membership, split over several FJOINs when large. Every line
    // repeats the channel TS so each stands alone.
    let mut members: Vec<String> = channel
        .members
        .iter()
        .map(|(uid, prefix)| format!("{},{}", prefix.all_symbols(), uid))
        .collect();
    members.sort();
    if members.is_empty() {
        return;
    }
    for chunk in members.chunks(FJOIN_MEMBERS_PER_LINE) {
        out.push(Message::with_prefix(
            sid.clone(),
            "FJOIN",
            vec![
                channel.name.clone(),
                channel.ts.to_string(),
                chunk.join(" "),
            ],
        ));
    }

    // Simple and parametric modes in one FMODE.
    let modes = channel.modes_string(true);
    if modes.len() > 1 {
        let mut params: Vec<String> = vec![channel.name.clone(), channel.ts.to_string()];
        params.extend(modes.split(' ').map(String::from));
        out.push(Message::with_prefix(sid.clone(), "FMODE", params));
    }

    // List modes, chunked at the mode-per-line cap.
    for (letter, store) in [
        ('b', &channel.bans),
        ('e', &channel.excepts),
        ('I', &channel.invexes),
    ] {
        let changes: Vec<ModeChange> = store
            .iter()
            .map(|entry| ModeChange {
                adding: true,
                letter,
                param: Some(entry.mask.clone()),
            })
            .collect();
        for (mode_str, mode_params) in stack_mode_changes(&changes, source.max_modes_per_line) {
            let mut params = vec![channel.name.clone(), channel.ts.to_string(), mode_str];
            params.extend(mode_params);
            out.push(Message::with_prefix(sid.clone(), "FMODE", params));
        }
    }

    if let Some(ref topic) = channel.topic {
        out.push(Message::with_prefix(
            sid.clone(),
            "FTOPIC",
            vec![
                channel.name.clone(),
                topic.set_at.to_string(),
                topic.set_by.clone(),
                topic.text.clone(),
            ],
        ));
    }
}

fn burst_xlines(source: &BurstSource<'_>, out: &mut Vec<Message>) {
    use crate::xline::XLineKind;
    let sid = Prefix::Server(source.sid.to_string());
    for kind in [XLineKind::Z, XLineKind::Q, XLineKind::G, XLineKind::E] {
        for line in source.xlines.lines_of(kind) {
            out.push(Message::with_prefix(
                sid.clone(),
                "ADDLINE",
                vec![
                    kind.letter().to_string(),
                    line.mask,
                    line.setter,
                    line.set_time.to_string(),
                    line.duration.to_string(),
                    line.reason,
                ],
            ));
        }
    }
}

fn burst_metadata(source: &BurstSource<'_>, out: &mut Vec<Message>) {
    let sid = Prefix::Server(source.sid.to_string());
    for uid in source.database.all_uids() {
        let Some(user) = source.database.get_user(&uid) else {
            continue;
        };
        for (key, value) in &user.metadata {
            out.push(Message::with_prefix(
                sid.clone(),
                "METADATA",
                vec![user.uid.clone(), key.clone(), value.clone()],
            ));
        }
    }
    for name in source.database.all_channel_names() {
        let Some(channel) = source.database.get_channel(&name) else {
            continue;
        };
        for (key, value) in &channel.metadata {
            out.push(Message::with_prefix(
                sid.clone(),
                "METADATA",
                vec![channel.name.clone(), key.clone(), value.clone()],
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::casemap::CaseMapping;
    use crate::channel::{MemberPrefix, Topic};
    use crate::user::User;
    use crate::utils::unix_time;
    use crate::xline::{XLine, XLineKind};

    fn remote_user(uid: &str, nick: &str, server: &str) -> User {
        User::new_remote(
            uid.to_string(),
            nick.to_string(),
            "ident".into(),
            "host.example".into(),
            "host.example".into(),
            "Real".into(),
            "10.0.0.1".into(),
            server.to_string(),
            1000,
        )
    }

    fn setup() -> (Database, ServerTree, XLineManager) {
        let database = Database::new(CaseMapping::Rfc1459, 4);
        let tree = ServerTree::new("root.example.net".into(), "root".into(), "000".into());
        let xlines = XLineManager::new(CaseMapping::Rfc1459);
        (database, tree, xlines)
    }

    fn burst(database: &Database, tree: &ServerTree, xlines: &XLineManager) -> Vec<Message> {
        let source = BurstSource {
            server_name: "root.example.net",
            sid: "000",
            version: "treeircd-0.9",
            database,
            tree,
            xlines,
            max_modes_per_line: 20,
        };
        build_burst(&source, "peer.example.net", 5000)
    }

    #[test]
    fn test_burst_frame_and_order() {
        let (database, tree, xlines) = setup();
        database.add_user(remote_user("000AAAAAA", "alice", "root.example.net")).unwrap();
        database.create_channel("#a", 1000);
        database
            .add_member("#a", "000AAAAAA", MemberPrefix::OP)
            .unwrap();
        xlines.add(XLine {
            kind: XLineKind::G,
            mask: "*@bad.example".into(),
            setter: "oper".into(),
            set_time: unix_time(),
            duration: 0,
            reason: "spam".into(),
        });

        let lines = burst(&database, &tree, &xlines);
        assert_eq!(lines.first().unwrap().command, "BURST");
        assert_eq!(lines.first().unwrap().params[0], "5000");
        assert_eq!(lines.last().unwrap().command, "ENDBURST");

        let pos = |cmd: &str| lines.iter().position(|m| m.command == cmd).unwrap();
        assert!(pos("VERSION") < pos("UID"));
        assert!(pos("UID") < pos("FJOIN"));
        assert!(pos("FJOIN") < pos("ADDLINE"));
    }

    #[test]
    fn test_uid_line_shape() {
        let (database, tree, xlines) = setup();
        let mut user = remote_user("000AAAAAA", "alice", "root.example.net");
        user.set_mode('i');
        database.add_user(user).unwrap();

        let lines = burst(&database, &tree, &xlines);
        let uid_line = lines.iter().find(|m| m.command == "UID").unwrap();
        assert_eq!(
            uid_line.params,
            vec!["000AAAAAA", "1000", "alice", "host.example", "host.example", "ident", "10.0.0.1", "+i", "Real"]
        );
        assert_eq!(uid_line.prefix, Some(Prefix::Server("000".into())));
    }

    #[test]
    fn test_fjoin_carries_prefixes() {
        let (database, tree, xlines) = setup();
        database.add_user(remote_user("000AAAAAA", "alice", "root.example.net")).unwrap();
        database.add_user(remote_user("000AAAAAB", "bob", "root.example.net")).unwrap();
        database.create_channel("#a", 1234);
        database.add_member("#a", "000AAAAAA", MemberPrefix::OP).unwrap();
        database.add_member("#a", "000AAAAAB", MemberPrefix::NONE).unwrap();

        let lines = burst(&database, &tree, &xlines);
        let fjoin = lines.iter().find(|m| m.command == "FJOIN").unwrap();
        assert_eq!(fjoin.params[0], "#a");
        assert_eq!(fjoin.params[1], "1234");
        assert!(fjoin.params[2].contains("@,000AAAAAA"));
        assert!(fjoin.params[2].contains(",000AAAAAB"));
    }

    #[test]
    fn test_topic_and_oper_riders() {
        let (database, tree, xlines) = setup();
        let mut user = remote_user("000AAAAAA", "alice", "root.example.net");
        user.oper_up("NetAdmin".into());
        user.away = Some("gone".into());
        database.add_user(user).unwrap();
        database.create_channel("#a", 1000);
        database.add_member("#a", "000AAAAAA", MemberPrefix::NONE).unwrap();
        database.get_channel_mut("#a").unwrap().topic = Some(Topic {
            text: "welcome".into(),
            set_by: "alice".into(),
            set_at: 999,
        });

        let lines = burst(&database, &tree, &xlines);
        assert!(lines.iter().any(|m| m.command == "OPERTYPE"));
        assert!(lines.iter().any(|m| m.command == "AWAY"));
        let ftopic = lines.iter().find(|m| m.command == "FTOPIC").unwrap();
        assert_eq!(ftopic.params, vec!["#a", "999", "alice", "welcome"]);
    }

}
