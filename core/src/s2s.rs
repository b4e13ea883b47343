//! Server-to-server protocol: verb dispatch on connected links
//!
//! Everything after CONNECTED arrives here. Lines are forwarded along
//! the spanning tree ("hot potato") after local application; collision
//! resolution for UID/FJOIN/FMODE consults the decision tables in
//! `collision`. Malformed input on a link is fatal for that link.

use crate::channel::MemberPrefix;
use crate::collision::{
    compare_channel_ts, compare_fmode_ts, merged_member_prefix, resolve_nick_collision,
    ChannelMerge, FmodeMerge, NickCollision,
};
use crate::context::{Context, ServerAction};
use crate::link::LinkSession;
use crate::modes::{
    apply_channel_change, apply_user_change, parse_mode_string, stack_mode_changes, ModeChange,
    ModeKind,
};
use crate::user::{looks_like_uid, User};
use crate::utils::unix_time;
use crate::xline::{XLine, XLineKind};
use crate::{Error, Message, Prefix, Result};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Dispatch one server-protocol line from a connected link.
pub async fn dispatch(
    ctx: &Arc<Context>,
    sessions: &mut HashMap<Uuid, LinkSession>,
    id: Uuid,
    message: Message,
) -> Result<()> {
    let peer_name = match ctx.links.peer_name_of(&id) {
        Some(name) => name,
        None => return Ok(()),
    };

    // Direction check: a prefixed line must have arrived on the link
    // its source is actually reached through, or some peer is lying.
    if let Some(source_server) = source_server_of(ctx, &message).await {
        if !ctx.tree.read().await.is_root(&source_server) {
            let route = {
                let tree = ctx.tree.read().await;
                tree.best_route_to(&source_server).map(|n| n.name.clone())
            };
            if route.as_deref() != Some(peer_name.as_str()) {
                tracing::warn!(
                    command = %message.command,
                    source = %source_server,
                    link = %peer_name,
                    "fake direction, line ignored"
                );
                return Ok(());
            }
        }
    }

    match message.command.as_str() {
        "PING" => handle_ping(ctx, &peer_name, &message).await,
        "PONG" => handle_pong(ctx, &peer_name, &message).await,
        "UID" => handle_uid(ctx, sessions, id, &peer_name, &message).await,
        "FJOIN" => handle_fjoin(ctx, &peer_name, &message).await,
        "FMODE" => handle_fmode(ctx, &peer_name, &message).await,
        "FTOPIC" => handle_ftopic(ctx, &peer_name, &message).await,
        "TOPIC" => handle_live_topic(ctx, &peer_name, &message).await,
        "NICK" => handle_nick_change(ctx, &peer_name, &message).await,
        "QUIT" => handle_quit(ctx, &peer_name, &message).await,
        "KILL" => handle_kill(ctx, &peer_name, &message).await,
        "PART" => handle_part(ctx, &peer_name, &message).await,
        "KICK" => handle_kick(ctx, &peer_name, &message).await,
        "SQUIT" => handle_squit(ctx, &peer_name, &message).await,
        "RSQUIT" => handle_rsquit(ctx, &peer_name, &message).await,
        "SERVER" => handle_server_intro(ctx, &peer_name, &message).await,
        "BURST" => handle_burst_start(ctx, sessions, id, &peer_name, &message).await,
        "ENDBURST" => handle_endburst(ctx, sessions, id, &peer_name).await,
        "VERSION" => handle_version(ctx, &message).await,
        "ADDLINE" => handle_addline(ctx, &peer_name, &message).await,
        "DELLINE" => handle_delline(ctx, &peer_name, &message).await,
        "METADATA" => handle_metadata(ctx, &peer_name, &message).await,
        "FHOST" => handle_fhost(ctx, &peer_name, &message).await,
        "FNAME" => handle_fname(ctx, &peer_name, &message).await,
        "OPERTYPE" => handle_opertype(ctx, &peer_name, &message).await,
        "AWAY" => handle_away(ctx, &peer_name, &message).await,
        "MODE" => handle_remote_umode(ctx, &peer_name, &message).await,
        "INVITE" => handle_invite(ctx, &peer_name, &message).await,
        "PRIVMSG" | "NOTICE" => handle_message_verb(ctx, &peer_name, &message).await,
        "WALLOPS" => handle_wallops(ctx, &peer_name, &message).await,
        "SVSNICK" => handle_svsnick(ctx, &peer_name, &message).await,
        "SVSJOIN" => handle_svsjoin(ctx, &peer_name, &message).await,
        "IDLE" => handle_idle(ctx, &peer_name, &message).await,
        "PUSH" => handle_push(ctx, &peer_name, &message).await,
        "ENCAP" => handle_encap(ctx, &peer_name, &message).await,
        "MODENOTICE" => handle_modenotice(ctx, &peer_name, &message).await,
        "SNONOTICE" => handle_snonotice(ctx, &peer_name, &message).await,
        "OPERNOTICE" => handle_opernotice(ctx, &peer_name, &message).await,
        "ERROR" => Err(Error::ProtocolViolation(format!(
            "remote error from {}: {}",
            peer_name,
            message.arg(0).unwrap_or("")
        ))),
        other => {
            tracing::debug!(link = %peer_name, command = %other, "unhandled server verb dropped");
            Ok(())
        }
    }
}

/// The server a line's prefix belongs to: the owning server for a UID,
/// the named server for a server prefix, or the link peer when bare.
async fn source_server_of(ctx: &Context, message: &Message) -> Option<String> {
    let name = message.source_name();
    if name.is_empty() {
        return None;
    }
    if looks_like_uid(name) {
        return ctx.database.get_user(name).map(|u| u.server.clone());
    }
    let tree = ctx.tree.read().await;
    tree.resolve(name).map(|n| n.name.clone())
}

fn need(message: &Message, count: usize) -> Result<()> {
    if message.params.len() < count {
        return Err(Error::ProtocolViolation(format!(
            "{} with {} params, need {}",
            message.command,
            message.params.len(),
            count
        )));
    }
    Ok(())
}

/// Translate UID parameters of prefix-mode changes into nicks for the
/// client-visible MODE line.
fn client_visible_changes(ctx: &Context, changes: &[ModeChange]) -> Vec<ModeChange> {
    changes
        .iter()
        .map(|change| {
            let param = change.param.as_ref().map(|p| {
                if looks_like_uid(p) {
                    ctx.database
                        .get_user(p)
                        .map(|u| u.nick.clone())
                        .unwrap_or_else(|| p.clone())
                } else {
                    p.clone()
                }
            });
            ModeChange {
                adding: change.adding,
                letter: change.letter,
                param,
            }
        })
        .collect()
}

/// Broadcast applied channel mode changes to local members, prefixed by
/// the given source.
fn announce_mode_locally(
    ctx: &Context,
    prefix: Prefix,
    channel: &str,
    changes: &[ModeChange],
    max_per_line: usize,
) {
    let visible = client_visible_changes(ctx, changes);
    for (mode_str, params) in stack_mode_changes(&visible, max_per_line) {
        let mut all = vec![channel.to_string(), mode_str];
        all.extend(params);
        let msg = Message::with_prefix(prefix.clone(), "MODE", all);
        ctx.send_to_channel_local(channel, msg, None);
    }
}

/// Client-protocol prefix for a source that may be a UID or server.
fn display_prefix(ctx: &Context, source: &str) -> Prefix {
    if looks_like_uid(source) {
        if let Some(user) = ctx.database.get_user(source) {
            return user.prefix();
        }
    }
    Prefix::Server(ctx.server_name.clone())
}

// --- ping / pong -------------------------------------------------------

async fn handle_ping(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 1)?;
    let origin = message.params[0].clone();
    let destination = message.arg(1).unwrap_or(&ctx.server_name).to_string();
    let ours = {
        let tree = ctx.tree.read().await;
        tree.is_root(&destination) || tree.resolve(&destination).is_none()
    };
    if ours || destination == ctx.sid {
        ctx.links.send_to_peer(
            peer_name,
            ctx.sid_message("PONG", vec![ctx.server_name.clone(), origin]),
        );
    } else {
        ctx.one_to_one(&destination, message.clone()).await;
    }
    Ok(())
}

async fn handle_pong(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    let source = message.arg(0).unwrap_or(peer_name).to_string();
    let mut tree = ctx.tree.write().await;
    for name in [source, peer_name.to_string()] {
        if let Some(node) = tree.find_mut(&name) {
            node.ping_answered = true;
        }
    }
    Ok(())
}

// --- user introduction and the nickname TS engine ----------------------

async fn handle_uid(
    ctx: &Arc<Context>,
    sessions: &mut HashMap<Uuid, LinkSession>,
    id: Uuid,
    peer_name: &str,
    message: &Message,
) -> Result<()> {
    need(message, 9)?;
    let uid = message.params[0].clone();
    let ts: i64 = message.params[1]
        .parse()
        .map_err(|_| Error::ProtocolViolation(format!("bad TS in UID: {}", message.params[1])))?;
    let nick = message.params[2].clone();
    let host = message.params[3].clone();
    let dhost = message.params[4].clone();
    let ident = message.params[5].clone();
    let ip = message.params[6].clone();
    let modes = message.params[7].clone();
    let gecos = message.params[8].clone();

    if !looks_like_uid(&uid) {
        return Err(Error::ProtocolViolation(format!("malformed UID {}", uid)));
    }

    // The introducing server is named by the prefix SID.
    let source_sid = message.source_name().to_string();
    let server_name = {
        let tree = ctx.tree.read().await;
        tree.resolve(&source_sid)
            .map(|n| n.name.clone())
            .ok_or_else(|| {
                Error::ProtocolViolation(format!("UID from unknown server {}", source_sid))
            })?
    };

    // Nickname collision arbitration.
    if let Some(existing) = ctx.database.find_user_by_nick(&nick) {
        let existing_uid = existing.uid.clone();
        let existing_ts = existing.ts;
        drop(existing);
        match resolve_nick_collision(existing_ts, ts, existing_uid == uid) {
            NickCollision::KillRemote => {
                if let Some(session) = sessions.get(&id) {
                    session.send(ctx.sid_message(
                        "KILL",
                        vec![uid.clone(), "Nickname collision".to_string()],
                    ));
                }
                ctx.snotice('k', format!("Nick collision on {}: remote copy killed", nick));
                return Ok(());
            }
            NickCollision::KillLocal => {
                ctx.quit_user(&existing_uid, "Nickname collision", None).await;
                ctx.snotice('k', format!("Nick collision on {}: local copy killed", nick));
            }
            NickCollision::KillBoth => {
                if let Some(session) = sessions.get(&id) {
                    session.send(ctx.sid_message(
                        "KILL",
                        vec![uid.clone(), "Nickname collision".to_string()],
                    ));
                }
                ctx.quit_user(&existing_uid, "Nickname collision", None).await;
                ctx.snotice('k', format!("Nick collision on {}: both copies killed", nick));
                return Ok(());
            }
            NickCollision::ProtocolViolation => {
                return Err(Error::ProtocolViolation(format!(
                    "duplicate UID {} introduced for nick {}",
                    uid, nick
                )));
            }
        }
    }

    let mut user = User::new_remote(
        uid, nick, ident, host, dhost, gecos, ip, server_name.clone(), ts,
    );
    for letter in modes.trim_start_matches('+').chars() {
        user.set_mode(letter);
    }
    let hostmask = user.hostmask();
    let user_ip = user.ip.clone();
    ctx.database.add_user(user).map_err(|e| {
        Error::ProtocolViolation(format!("cannot introduce user: {}", e))
    })?;

    {
        let mut tree = ctx.tree.write().await;
        if let Some(node) = tree.find_mut(&server_name) {
            node.user_count += 1;
        }
    }

    ctx.snotice(
        'C',
        format!("Client connecting at {}: {} [{}]", server_name, hostmask, user_ip),
    );
    ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;
    Ok(())
}

// --- channel TS merge --------------------------------------------------

async fn handle_fjoin(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 3)?;
    let channel_name = message.params[0].clone();
    let remote_ts: i64 = message.params[1]
        .parse()
        .map_err(|_| Error::ProtocolViolation(format!("bad TS in FJOIN: {}", message.params[1])))?;

    // Forward first so our documenting FMODEs arrive after the FJOIN at
    // every third party.
    ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;

    let local_ts = ctx.database.get_channel(&channel_name).map(|c| c.ts);
    let merge = compare_channel_ts(local_ts, remote_ts);

    if local_ts.is_none() {
        ctx.database.create_channel(&channel_name, remote_ts);
    }

    // Losing side: lower TS, wipe every local prefix, document it.
    if merge == ChannelMerge::WeLose && local_ts.is_some() {
        let stripped = {
            let mut channel = ctx
                .database
                .get_channel_mut(&channel_name)
                .expect("channel existence checked above");
            tracing::info!(
                channel = %channel_name,
                from = channel.ts,
                to = remote_ts,
                "channel TS lowered, stripping local status"
            );
            channel.ts = remote_ts;
            channel.strip_all_prefixes()
        };
        let changes: Vec<ModeChange> = stripped
            .iter()
            .flat_map(|(uid, prefix)| {
                prefix.mode_letters().into_iter().map(move |letter| ModeChange {
                    adding: false,
                    letter,
                    param: Some(uid.clone()),
                })
            })
            .collect();
        if !changes.is_empty() {
            let max = ctx.config.limits.max_modes_per_line;
            for (mode_str, params) in stack_mode_changes(&changes, max) {
                let mut all = vec![
                    channel_name.clone(),
                    remote_ts.to_string(),
                    mode_str,
                ];
                all.extend(params);
                ctx.one_to_many(ctx.sid_message("FMODE", all)).await;
            }
            announce_mode_locally(
                ctx,
                Prefix::Server(ctx.server_name.clone()),
                &channel_name,
                &changes,
                max,
            );
        }
    }

    // Introduce the listed members.
    for token in message.params[2].split(' ').filter(|t| !t.is_empty()) {
        let (symbols, uid) = match token.rsplit_once(',') {
            Some(pair) => pair,
            None => continue,
        };
        let mut prefix = MemberPrefix::NONE;
        let mut valid = true;
        for symbol in symbols.chars() {
            match MemberPrefix::from_symbol(symbol) {
                Some(bit) => prefix.insert(bit),
                None => {
                    valid = false;
                    break;
                }
            }
        }
        if !valid {
            return Err(Error::ProtocolViolation(format!(
                "invalid prefix '{}' in FJOIN",
                symbols
            )));
        }
        let Some(user) = ctx.database.get_user(uid) else {
            // Desynced nick; pass it over, someone downstream may know it.
            tracing::warn!(channel = %channel_name, uid, "unknown user in FJOIN ignored");
            continue;
        };
        let user_prefix = user.prefix();
        drop(user);

        let kept = merged_member_prefix(merge, prefix);

        // Already a member on both sides: union the status bits.
        let current = ctx
            .database
            .get_channel(&channel_name)
            .filter(|c| c.is_member(uid))
            .map(|c| c.member_prefix(uid));
        if let Some(current) = current {
            let union = current.union(kept);
            if union != current {
                if let Some(mut channel) = ctx.database.get_channel_mut(&channel_name) {
                    channel.members.insert(uid.to_string(), union);
                }
                let changes: Vec<ModeChange> = union
                    .mode_letters()
                    .into_iter()
                    .filter(|l| {
                        MemberPrefix::from_mode_letter(*l)
                            .map(|bit| !current.contains(bit))
                            .unwrap_or(false)
                    })
                    .map(|letter| ModeChange {
                        adding: true,
                        letter,
                        param: Some(uid.to_string()),
                    })
                    .collect();
                if !changes.is_empty() {
                    announce_mode_locally(
                        ctx,
                        Prefix::Server(ctx.server_name.clone()),
                        &channel_name,
                        &changes,
                        ctx.config.limits.max_modes_per_line,
                    );
                }
            }
            continue;
        }
        ctx.database
            .add_member(&channel_name, uid, kept)
            .map_err(|e| Error::ProtocolViolation(format!("FJOIN membership: {}", e)))?;

        let join = Message::with_prefix(user_prefix, "JOIN", vec![channel_name.clone()]);
        ctx.send_to_channel_local(&channel_name, join, Some(uid));

        if !kept.is_empty() {
            let changes: Vec<ModeChange> = kept
                .mode_letters()
                .into_iter()
                .map(|letter| ModeChange {
                    adding: true,
                    letter,
                    param: Some(uid.to_string()),
                })
                .collect();
            announce_mode_locally(
                ctx,
                Prefix::Server(ctx.server_name.clone()),
                &channel_name,
                &changes,
                ctx.config.limits.max_modes_per_line,
            );
        }
    }
    Ok(())
}

// --- timestamped mode changes ------------------------------------------

async fn handle_fmode(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 3)?;
    let target = message.params[0].clone();
    let remote_ts: i64 = message.params[1]
        .parse()
        .map_err(|_| Error::ProtocolViolation(format!("bad TS in FMODE: {}", message.params[1])))?;
    let mode_str = message.params[2].clone();
    let mode_params: Vec<String> = message.params[3..].to_vec();
    let source = message.source_name().to_string();

    if !target.starts_with('#') {
        return fmode_user_target(ctx, peer_name, message, &target, remote_ts).await;
    }

    let Some(local_ts) = ctx.database.get_channel(&target).map(|c| c.ts) else {
        // Channel is gone already; nothing to merge.
        return Ok(());
    };

    let source_server = source_server_of(ctx, message)
        .await
        .unwrap_or_else(|| peer_name.to_string());
    let uline = ctx.config.is_uline(&source_server);

    let changes = match parse_mode_string(&ctx.modes, ModeKind::Channel, &mode_str, &mode_params) {
        Ok(c) => c,
        Err(e) => {
            return Err(Error::ProtocolViolation(format!(
                "unknown mode in FMODE from {}: {}",
                source_server, e
            )))
        }
    };

    match compare_fmode_ts(local_ts, remote_ts, uline) {
        FmodeMerge::Accept => {
            if uline && remote_ts > local_ts {
                ctx.snotice(
                    'l',
                    format!(
                        "U-lined server {} has bad TS for {} (accepted change); sync your clocks",
                        source_server, target
                    ),
                );
            }
            apply_and_announce(ctx, &source, &target, &changes, remote_ts.min(local_ts)).await;
            ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;
        }
        FmodeMerge::MergePerMode => {
            let mut keep = Vec::new();
            let mut bounce = Vec::new();
            for change in changes {
                let handler = ctx.modes.get(change.letter, ModeKind::Channel);
                let parametric = handler
                    .map(|h| h.needs_param(true) && !h.is_list_mode() && h.prefix_rank().is_none())
                    .unwrap_or(false);
                if parametric && change.adding {
                    let (is_set, ours) = {
                        let channel = ctx.database.get_channel(&target).expect("checked");
                        handler.expect("checked").mode_set(&channel)
                    };
                    let theirs = change.param.clone().unwrap_or_default();
                    if is_set && handler.expect("checked").check_timestamp(&theirs, &ours) {
                        // Ours survives; reinforce it back at the sender.
                        bounce.push(ModeChange {
                            adding: true,
                            letter: change.letter,
                            param: Some(ours),
                        });
                        continue;
                    }
                }
                keep.push(change);
            }
            apply_and_announce(ctx, &source, &target, &keep, local_ts).await;
            ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;
            if !bounce.is_empty() {
                send_fmode_bounce(ctx, &source_server, &target, local_ts, &bounce).await;
            }
        }
        FmodeMerge::Bounce => {
            // Reinforce our current state for every letter they sent.
            let mut bounce = Vec::new();
            for change in changes {
                let Some(handler) = ctx.modes.get(change.letter, ModeKind::Channel) else {
                    continue;
                };
                if handler.is_list_mode() || handler.prefix_rank().is_some() {
                    // Their list/prefix change simply never happened here;
                    // invert it so they undo it.
                    bounce.push(ModeChange {
                        adding: !change.adding,
                        letter: change.letter,
                        param: change.param.clone(),
                    });
                    continue;
                }
                let (is_set, ours) = {
                    let channel = ctx.database.get_channel(&target).expect("checked");
                    handler.mode_set(&channel)
                };
                bounce.push(ModeChange {
                    adding: is_set,
                    letter: change.letter,
                    param: if handler.needs_param(is_set) && !ours.is_empty() {
                        Some(ours)
                    } else {
                        None
                    },
                });
            }
            send_fmode_bounce(ctx, &source_server, &target, local_ts, &bounce).await;
        }
    }
    Ok(())
}

/// Apply a validated change set to a channel and announce it locally.
async fn apply_and_announce(
    ctx: &Arc<Context>,
    source: &str,
    target: &str,
    changes: &[ModeChange],
    new_ts: i64,
) {
    let list_limit = ctx
        .config
        .channel
        .list_limit_for(ctx.database.case_mapping(), target);
    let applied: Vec<ModeChange> = {
        let Some(mut channel) = ctx.database.get_channel_mut(target) else {
            return;
        };
        channel.ts = new_ts;
        changes
            .iter()
            .filter(|change| {
                apply_channel_change(
                    &ctx.modes,
                    &mut channel,
                    change,
                    source,
                    unix_time(),
                    list_limit,
                )
            })
            .cloned()
            .collect()
    };
    if !applied.is_empty() {
        announce_mode_locally(
            ctx,
            display_prefix(ctx, source),
            target,
            &applied,
            ctx.config.limits.max_modes_per_line,
        );
    }
}

async fn send_fmode_bounce(
    ctx: &Arc<Context>,
    source_server: &str,
    target: &str,
    our_ts: i64,
    bounce: &[ModeChange],
) {
    let max = ctx.config.limits.max_modes_per_line;
    for (mode_str, params) in stack_mode_changes(bounce, max) {
        let mut all = vec![target.to_string(), our_ts.to_string(), mode_str];
        all.extend(params);
        ctx.one_to_one(source_server, ctx.sid_message("FMODE", all))
            .await;
    }
}

/// FMODE whose target is a user: apply under the same TS rules against
/// the nick age.
async fn fmode_user_target(
    ctx: &Arc<Context>,
    peer_name: &str,
    message: &Message,
    target: &str,
    remote_ts: i64,
) -> Result<()> {
    let Some(uid) = ctx.resolve_target_uid(target) else {
        return Ok(());
    };
    let local_ts = ctx.database.get_user(&uid).map(|u| u.ts).unwrap_or(0);
    if remote_ts > local_ts {
        return Ok(());
    }
    let changes = parse_mode_string(
        &ctx.modes,
        ModeKind::User,
        message.arg(2).unwrap_or(""),
        &message.params[3..].to_vec(),
    )
    .map_err(|e| Error::ProtocolViolation(format!("unknown user mode in FMODE: {}", e)))?;
    if let Some(mut user) = ctx.database.get_user_mut(&uid) {
        for change in &changes {
            apply_user_change(&mut user, change);
        }
    }
    ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;
    Ok(())
}

// --- topics ------------------------------------------------------------

async fn handle_ftopic(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 4)?;
    let channel_name = &message.params[0];
    let set_at: i64 = message.params[1].parse().unwrap_or(0);
    let set_by = message.params[2].clone();
    let text = message.params[3].clone();

    let accepted = {
        let Some(mut channel) = ctx.database.get_channel_mut(channel_name) else {
            return Ok(());
        };
        // Burst topic merge: the earliest-set topic survives.
        let accept = match channel.topic {
            None => true,
            Some(ref existing) => set_at < existing.set_at,
        };
        if accept {
            channel.topic = Some(crate::channel::Topic {
                text: text.clone(),
                set_by: set_by.clone(),
                set_at,
            });
        }
        accept
    };

    if accepted {
        let topic_msg = ctx.server_message("TOPIC", vec![channel_name.clone(), text]);
        ctx.send_to_channel_local(channel_name, topic_msg, None);
        ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;
    }
    Ok(())
}

/// A live TOPIC change from a remote user: always applied.
async fn handle_live_topic(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 2)?;
    let channel_name = &message.params[0];
    let text = message.params[1].clone();
    let source = message.source_name().to_string();

    let setter_nick = if looks_like_uid(&source) {
        ctx.database
            .get_user(&source)
            .map(|u| u.nick.clone())
            .unwrap_or(source.clone())
    } else {
        source.clone()
    };

    {
        let Some(mut channel) = ctx.database.get_channel_mut(channel_name) else {
            return Ok(());
        };
        channel.topic = Some(crate::channel::Topic {
            text: text.clone(),
            set_by: setter_nick,
            set_at: unix_time(),
        });
    }
    let local = Message::with_prefix(
        display_prefix(ctx, &source),
        "TOPIC",
        vec![channel_name.clone(), text],
    );
    ctx.send_to_channel_local(channel_name, local, None);
    ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;
    Ok(())
}

// --- nick changes, quits, kills ---------------------------------------

async fn handle_nick_change(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 2)?;
    let uid = message.source_name().to_string();
    let new_nick = message.params[0].clone();
    let ts: i64 = message.params[1].parse().unwrap_or_else(|_| unix_time());

    if ctx.database.get_user(&uid).is_none() {
        return Ok(());
    }

    // A rename can collide exactly like an introduction.
    if let Some(existing) = ctx.database.find_user_by_nick(&new_nick) {
        if existing.uid != uid {
            let existing_uid = existing.uid.clone();
            let existing_ts = existing.ts;
            drop(existing);
            match resolve_nick_collision(existing_ts, ts, false) {
                NickCollision::KillRemote => {
                    ctx.quit_user(&uid, "Nickname collision", None).await;
                    return Ok(());
                }
                NickCollision::KillLocal => {
                    ctx.quit_user(&existing_uid, "Nickname collision", None).await;
                }
                NickCollision::KillBoth | NickCollision::ProtocolViolation => {
                    ctx.quit_user(&uid, "Nickname collision", None).await;
                    ctx.quit_user(&existing_uid, "Nickname collision", None).await;
                    return Ok(());
                }
            }
        }
    }

    let old_prefix = ctx.database.get_user(&uid).map(|u| u.prefix());
    if ctx.database.change_nick(&uid, &new_nick, ts).is_ok() {
        if let Some(prefix) = old_prefix {
            let nick_msg = Message::with_prefix(prefix, "NICK", vec![new_nick]);
            // Every local user sharing a channel sees the rename once.
            let mut seen = std::collections::HashSet::new();
            let channels: Vec<String> = ctx
                .database
                .get_user(&uid)
                .map(|u| u.channels.iter().cloned().collect())
                .unwrap_or_default();
            for channel in channels {
                for member in ctx.database.channel_members(&channel, 0) {
                    if member != uid && seen.insert(member.clone()) {
                        ctx.send_to_local_user(&member, nick_msg.clone());
                    }
                }
            }
        }
        ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;
    }
    Ok(())
}

async fn handle_quit(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    let uid = message.source_name().to_string();
    let reason = message.arg(0).unwrap_or("Client exited").to_string();
    let server = ctx.database.get_user(&uid).map(|u| u.server.clone());
    if ctx.quit_user(&uid, &reason, Some(peer_name)).await {
        if let Some(server) = server {
            let mut tree = ctx.tree.write().await;
            if let Some(node) = tree.find_mut(&server) {
                node.user_count = node.user_count.saturating_sub(1);
            }
        }
    }
    Ok(())
}

async fn handle_kill(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 1)?;
    let target = &message.params[0];
    let reason = message.arg(1).unwrap_or("Killed").to_string();
    let source = message.source_name().to_string();

    let Some(uid) = ctx.resolve_target_uid(target) else {
        return Ok(());
    };
    let is_local = ctx
        .database
        .get_user(&uid)
        .map(|u| u.is_local())
        .unwrap_or(false);

    ctx.statistics.bump(&ctx.statistics.kills);
    ctx.snotice('k', format!("Received KILL for {} from {}: {}", target, source, reason));

    if is_local {
        // We own the victim; everyone else learns via the QUIT.
        ctx.quit_user(&uid, &format!("Killed ({})", reason), Some(peer_name))
            .await;
    } else {
        // Forward the KILL itself; a QUIT on top would duplicate it.
        ctx.remove_user_local(&uid, &format!("Killed ({})", reason));
        ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;
    }
    Ok(())
}

async fn handle_part(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 1)?;
    let uid = message.source_name().to_string();
    let channel_name = message.params[0].clone();

    let Some(user) = ctx.database.get_user(&uid) else {
        return Ok(());
    };
    let user_prefix = user.prefix();
    drop(user);

    let mut params = vec![channel_name.clone()];
    if let Some(reason) = message.arg(1) {
        params.push(reason.to_string());
    }
    let part = Message::with_prefix(user_prefix, "PART", params);
    ctx.send_to_channel_local(&channel_name, part, Some(&uid));
    ctx.database.remove_member(&channel_name, &uid);
    ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;
    Ok(())
}

async fn handle_kick(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 2)?;
    let channel_name = message.params[0].clone();
    let target = message.params[1].clone();
    let reason = message.arg(2).unwrap_or("Kicked").to_string();
    let source = message.source_name().to_string();

    let Some(uid) = ctx.resolve_target_uid(&target) else {
        return Ok(());
    };
    let victim_nick = ctx
        .database
        .get_user(&uid)
        .map(|u| u.nick.clone())
        .unwrap_or(target);

    let kick = Message::with_prefix(
        display_prefix(ctx, &source),
        "KICK",
        vec![channel_name.clone(), victim_nick, reason],
    );
    ctx.send_to_channel_local(&channel_name, kick, None);
    ctx.database.remove_member(&channel_name, &uid);
    ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;
    Ok(())
}

// --- server management -------------------------------------------------

async fn handle_server_intro(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 5)?;
    let name = message.params[0].clone();
    let hops: u32 = message.params[2].parse().unwrap_or(1);
    let sid = message.params[3].clone();
    let description = message.params[4].clone();

    let parent = {
        let tree = ctx.tree.read().await;
        let prefix = message.source_name();
        if prefix.is_empty() {
            peer_name.to_string()
        } else {
            tree.resolve(prefix)
                .map(|n| n.name.clone())
                .unwrap_or_else(|| peer_name.to_string())
        }
    };

    {
        let mut tree = ctx.tree.write().await;
        tree.add_server(&parent, name.clone(), description, sid, None)?;
        if let Some(node) = tree.find_mut(&name) {
            node.hops = hops;
        }
    }
    ctx.snotice('l', format!("Server {} introduced by {}", name, parent));
    ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;
    Ok(())
}

/// The peer's burst is starting (outbound side sees this after its own
/// SERVER reply). The timestamp gets the same skew check the inbound
/// side applies in the handshake.
async fn handle_burst_start(
    ctx: &Arc<Context>,
    sessions: &mut HashMap<Uuid, LinkSession>,
    id: Uuid,
    peer_name: &str,
    message: &Message,
) -> Result<()> {
    if let Some(their_time) = message.arg(0).and_then(|t| t.parse::<i64>().ok()) {
        let delta = their_time - unix_time();
        if delta.abs() > ctx.config.limits.max_ts_skew_secs {
            return Err(Error::TsSkew(delta));
        }
        if delta != 0 {
            tracing::warn!(peer = %peer_name, delta, "tolerating clock skew on link");
        }
    }
    if let Some(session) = sessions.get_mut(&id) {
        session.bursting = true;
    }
    {
        let mut tree = ctx.tree.write().await;
        if let Some(node) = tree.find_mut(peer_name) {
            node.bursting = true;
        }
    }
    Ok(())
}

async fn handle_endburst(
    ctx: &Arc<Context>,
    sessions: &mut HashMap<Uuid, LinkSession>,
    id: Uuid,
    peer_name: &str,
) -> Result<()> {
    if let Some(session) = sessions.get_mut(&id) {
        session.bursting = false;
    }
    {
        let mut tree = ctx.tree.write().await;
        if let Some(node) = tree.find_mut(peer_name) {
            node.bursting = false;
        }
    }
    ctx.snotice('l', format!("Finished receiving burst from {}.", peer_name));
    Ok(())
}

async fn handle_version(ctx: &Arc<Context>, message: &Message) -> Result<()> {
    let name = message.source_name().to_string();
    let version = message.arg(0).unwrap_or("").to_string();
    let mut tree = ctx.tree.write().await;
    if let Some(resolved) = tree.resolve(&name).map(|n| n.name.clone()) {
        if let Some(node) = tree.find_mut(&resolved) {
            node.version = version;
        }
    }
    Ok(())
}

async fn handle_squit(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 1)?;
    let target = message.params[0].clone();
    let reason = message.arg(1).unwrap_or("SQUIT").to_string();
    perform_remote_squit(ctx, &target, &reason, Some(peer_name)).await;
    Ok(())
}

/// Remove a remote (not directly linked) server subtree and everything
/// on it, announcing onward.
pub async fn perform_remote_squit(
    ctx: &Arc<Context>,
    target: &str,
    reason: &str,
    omit: Option<&str>,
) -> usize {
    let (removed, parent) = {
        let mut tree = ctx.tree.write().await;
        let parent = tree
            .find(target)
            .and_then(|n| n.parent.clone())
            .unwrap_or_default();
        (tree.remove_subtree(target), parent)
    };
    if removed.is_empty() {
        return 0;
    }
    let split_reason = format!("{} {}", parent, target);
    let lost = ctx.purge_users_of_servers(&removed, &split_reason);
    ctx.statistics.bump(&ctx.statistics.squits);
    ctx.snotice(
        'q',
        format!(
            "Netsplit: {} split from {} ({}), {} servers and {} users lost",
            target,
            parent,
            reason,
            removed.len(),
            lost
        ),
    );
    ctx.one_to_all_but_sender(
        omit,
        ctx.sid_message("SQUIT", vec![target.to_string(), reason.to_string()]),
    )
    .await;
    lost
}

async fn handle_rsquit(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 1)?;
    let target = message.params[0].clone();
    let reason = message.arg(1).unwrap_or("RSQUIT").to_string();

    if ctx.links.is_connected(&target) {
        // It is our own socket; ask the main loop to drop it.
        let _ = ctx.actions.send(ServerAction::DropLink {
            peer: target,
            reason,
        });
        return Ok(());
    }
    // Not ours; pass it toward whoever holds the socket.
    let route_exists = {
        let tree = ctx.tree.read().await;
        tree.find(&target).is_some()
    };
    if route_exists {
        ctx.one_to_one(&target, message.clone()).await;
    } else {
        tracing::debug!(target = %target, from = %peer_name, "RSQUIT for unknown server dropped");
    }
    Ok(())
}

// --- x-lines -----------------------------------------------------------

async fn handle_addline(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 6)?;
    let kind = message.params[0]
        .chars()
        .next()
        .and_then(XLineKind::from_letter)
        .ok_or_else(|| {
            Error::ProtocolViolation(format!("unknown ADDLINE kind {}", message.params[0]))
        })?;
    let mask = message.params[1].clone();
    let setter = message.params[2].clone();
    let set_time: i64 = message.params[3].parse().unwrap_or_else(|_| unix_time());
    let duration: u64 = message.params[4].parse().unwrap_or(0);
    let reason = message.params[5].clone();

    ctx.xlines.add(XLine {
        kind,
        mask: mask.clone(),
        setter: setter.clone(),
        set_time,
        duration,
        reason,
    });
    ctx.snotice(
        'x',
        format!("{} added {}-line on {}", setter, kind.letter(), mask),
    );

    // Enforce at once against everyone we hold locally.
    for uid in ctx.database.all_uids() {
        let is_local = ctx
            .database
            .get_user(&uid)
            .map(|u| u.is_local())
            .unwrap_or(false);
        if is_local {
            ctx.enforce_xlines(&uid).await;
        }
    }

    ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;
    Ok(())
}

async fn handle_delline(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 2)?;
    let kind = message.params[0]
        .chars()
        .next()
        .and_then(XLineKind::from_letter)
        .ok_or_else(|| {
            Error::ProtocolViolation(format!("unknown DELLINE kind {}", message.params[0]))
        })?;
    let mask = &message.params[1];
    if ctx.xlines.remove(kind, mask) {
        ctx.snotice('x', format!("{}-line on {} removed", kind.letter(), mask));
    }
    ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;
    Ok(())
}

// --- metadata and attribute changes ------------------------------------

async fn handle_metadata(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 3)?;
    let target = message.params[0].clone();
    let key = message.params[1].clone();
    let value = message.params[2].clone();

    if target.starts_with('#') {
        if let Some(mut channel) = ctx.database.get_channel_mut(&target) {
            if value.is_empty() {
                channel.metadata.remove(&key);
            } else {
                channel.metadata.insert(key, value);
            }
        }
    } else if target != "*" {
        if let Some(uid) = ctx.resolve_target_uid(&target) {
            if let Some(mut user) = ctx.database.get_user_mut(&uid) {
                if value.is_empty() {
                    user.metadata.remove(&key);
                } else {
                    user.metadata.insert(key, value);
                }
            }
        }
    }
    ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;
    Ok(())
}

async fn handle_fhost(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 1)?;
    let uid = message.source_name().to_string();
    if let Some(mut user) = ctx.database.get_user_mut(&uid) {
        user.dhost = message.params[0].clone();
    }
    ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;
    Ok(())
}

async fn handle_fname(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 1)?;
    let uid = message.source_name().to_string();
    if let Some(mut user) = ctx.database.get_user_mut(&uid) {
        user.gecos = message.params[0].clone();
    }
    ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;
    Ok(())
}

async fn handle_opertype(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 1)?;
    let uid = message.source_name().to_string();
    let oper_type = message.params[0].clone();
    let nick = {
        let Some(mut user) = ctx.database.get_user_mut(&uid) else {
            return Ok(());
        };
        user.oper_up(oper_type.clone());
        user.nick.clone()
    };
    ctx.snotice('o', format!("{} is now an operator of type {}", nick, oper_type));
    ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;
    Ok(())
}

async fn handle_away(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    let uid = message.source_name().to_string();
    if let Some(mut user) = ctx.database.get_user_mut(&uid) {
        user.away = message.arg(0).filter(|m| !m.is_empty()).map(String::from);
    }
    ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;
    Ok(())
}

/// A remote user changing their own umodes.
async fn handle_remote_umode(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 2)?;
    let uid = message.source_name().to_string();
    let changes = match parse_mode_string(
        &ctx.modes,
        ModeKind::User,
        &message.params[1],
        &message.params[2..].to_vec(),
    ) {
        Ok(c) => c,
        Err(_) => return Ok(()),
    };
    if let Some(mut user) = ctx.database.get_user_mut(&uid) {
        for change in &changes {
            apply_user_change(&mut user, change);
        }
    }
    ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;
    Ok(())
}

// --- messaging ---------------------------------------------------------

async fn handle_message_verb(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 2)?;
    let source = message.source_name().to_string();
    let raw_target = message.params[0].clone();
    let text = message.params[1].clone();

    let (min_rank, channel_name) = match raw_target.chars().next() {
        Some('@') => (30, raw_target[1..].to_string()),
        Some('+') => (10, raw_target[1..].to_string()),
        _ => (0, raw_target.clone()),
    };

    if channel_name.starts_with('#') {
        let local = Message::with_prefix(
            display_prefix(ctx, &source),
            message.command.clone(),
            vec![raw_target.clone(), text],
        );
        for uid in ctx.database.channel_members(&channel_name, min_rank) {
            if uid == source {
                continue;
            }
            ctx.send_to_local_user(&uid, local.clone());
        }
        let source_server = source_server_of(ctx, message).await;
        ctx.route_to_channel(
            &channel_name,
            message.clone(),
            source_server.as_deref(),
            min_rank,
            Some(&source),
        )
        .await;
        return Ok(());
    }

    let Some(uid) = ctx.resolve_target_uid(&raw_target) else {
        return Ok(());
    };
    let (is_local, nick, server) = match ctx.database.get_user(&uid) {
        Some(u) => (u.is_local(), u.nick.clone(), u.server.clone()),
        None => return Ok(()),
    };
    if is_local {
        let local = Message::with_prefix(
            display_prefix(ctx, &source),
            message.command.clone(),
            vec![nick, text],
        );
        ctx.send_to_local_user(&uid, local);
    } else {
        ctx.one_to_one(&server, message.clone()).await;
    }
    Ok(())
}

/// Remote INVITE: mark the invitation and deliver when the target is ours.
async fn handle_invite(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 2)?;
    let source = message.source_name().to_string();
    let target = message.params[0].clone();
    let channel_name = message.params[1].clone();

    let Some(uid) = ctx.resolve_target_uid(&target) else {
        return Ok(());
    };
    let (is_local, nick, server) = match ctx.database.get_user(&uid) {
        Some(u) => (u.is_local(), u.nick.clone(), u.server.clone()),
        None => return Ok(()),
    };
    if is_local {
        if let Some(mut channel) = ctx.database.get_channel_mut(&channel_name) {
            channel.invited.insert(uid.clone());
        }
        let invite = Message::with_prefix(
            display_prefix(ctx, &source),
            "INVITE",
            vec![nick, channel_name],
        );
        ctx.send_to_local_user(&uid, invite);
    } else {
        ctx.one_to_one(&server, message.clone()).await;
    }
    let _ = peer_name;
    Ok(())
}

async fn handle_wallops(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 1)?;
    let source = message.source_name().to_string();
    let local = Message::with_prefix(
        display_prefix(ctx, &source),
        "WALLOPS",
        vec![message.params[0].clone()],
    );
    for uid in ctx.database.all_uids() {
        let wants = ctx
            .database
            .get_user(&uid)
            .map(|u| u.is_local() && u.has_mode('w'))
            .unwrap_or(false);
        if wants {
            ctx.send_to_local_user(&uid, local.clone());
        }
    }
    ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;
    Ok(())
}

async fn handle_opernotice(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 1)?;
    for uid in ctx.database.all_uids() {
        let is_local_oper = ctx
            .database
            .get_user(&uid)
            .map(|u| u.is_local() && u.is_oper())
            .unwrap_or(false);
        if is_local_oper {
            let nick = ctx.database.get_user(&uid).map(|u| u.nick.clone()).unwrap_or_default();
            ctx.send_to_local_user(
                &uid,
                ctx.server_message("NOTICE", vec![nick, message.params[0].clone()]),
            );
        }
    }
    ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;
    Ok(())
}

async fn handle_modenotice(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 2)?;
    let wanted: Vec<char> = message.params[0].chars().collect();
    let text = message.params[1].clone();
    for uid in ctx.database.all_uids() {
        let (matches, nick) = ctx
            .database
            .get_user(&uid)
            .map(|u| {
                (
                    u.is_local() && wanted.iter().all(|m| u.has_mode(*m)),
                    u.nick.clone(),
                )
            })
            .unwrap_or((false, String::new()));
        if matches {
            ctx.send_to_local_user(
                &uid,
                ctx.server_message("NOTICE", vec![nick, text.clone()]),
            );
        }
    }
    ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;
    Ok(())
}

async fn handle_snonotice(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 2)?;
    let letter = message.params[0].chars().next().unwrap_or('l');
    let source = message.source_name().to_string();
    ctx.snotice(letter, format!("From {}: {}", source, message.params[1]));
    ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;
    Ok(())
}

// --- services verbs ----------------------------------------------------

/// SVSNICK and SVSJOIN are only honoured from u-lined sources.
async fn uline_guard(ctx: &Arc<Context>, message: &Message) -> Option<()> {
    let source = source_server_of(ctx, message).await?;
    if ctx.config.is_uline(&source) {
        Some(())
    } else {
        tracing::warn!(source = %source, command = %message.command, "SVS verb from non-uline ignored");
        None
    }
}

async fn handle_svsnick(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 3)?;
    if uline_guard(ctx, message).await.is_none() {
        return Ok(());
    }
    let target = message.params[0].clone();
    let new_nick = message.params[1].clone();
    let ts: i64 = message.params[2].parse().unwrap_or_else(|_| unix_time());

    let Some(uid) = ctx.resolve_target_uid(&target) else {
        return Ok(());
    };
    let is_local = ctx
        .database
        .get_user(&uid)
        .map(|u| u.is_local())
        .unwrap_or(false);

    if is_local {
        if ctx.database.nick_in_use(&new_nick) {
            // Target name taken; the original resolves this by killing.
            ctx.quit_user(&uid, "Nickname collision", None).await;
            return Ok(());
        }
        let old_prefix = ctx.database.get_user(&uid).map(|u| u.prefix());
        if ctx.database.change_nick(&uid, &new_nick, ts).is_ok() {
            if let Some(prefix) = old_prefix {
                let nick_msg = Message::with_prefix(prefix, "NICK", vec![new_nick.clone()]);
                ctx.send_to_local_user(&uid, nick_msg.clone());
                let channels: Vec<String> = ctx
                    .database
                    .get_user(&uid)
                    .map(|u| u.channels.iter().cloned().collect())
                    .unwrap_or_default();
                let mut seen = std::collections::HashSet::new();
                for channel in channels {
                    for member in ctx.database.channel_members(&channel, 0) {
                        if member != uid && seen.insert(member.clone()) {
                            ctx.send_to_local_user(&member, nick_msg.clone());
                        }
                    }
                }
            }
            // The network learns via a normal NICK from the user.
            ctx.one_to_all_but_sender(
                Some(peer_name),
                Message::with_prefix(
                    Prefix::Server(uid.clone()),
                    "NICK",
                    vec![new_nick, ts.to_string()],
                ),
            )
            .await;
        }
    } else {
        ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;
    }
    Ok(())
}

async fn handle_svsjoin(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 2)?;
    if uline_guard(ctx, message).await.is_none() {
        return Ok(());
    }
    let target = message.params[0].clone();
    let channel_name = message.params[1].clone();

    let Some(uid) = ctx.resolve_target_uid(&target) else {
        return Ok(());
    };
    let is_local = ctx
        .database
        .get_user(&uid)
        .map(|u| u.is_local())
        .unwrap_or(false);
    if is_local {
        crate::commands::channel::force_join(ctx, &uid, &channel_name).await;
    } else {
        ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;
    }
    Ok(())
}

// --- point-to-point helpers -------------------------------------------

async fn handle_idle(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 1)?;
    let requester = message.source_name().to_string();
    let target = message.params[0].clone();

    if message.params.len() >= 3 {
        // Response leg: signon + idle seconds travel back to the
        // requester, who emits the WHOIS numerics.
        let Some(uid) = ctx.resolve_target_uid(&target) else {
            return Ok(());
        };
        let (is_local, nick) = match ctx.database.get_user(&uid) {
            Some(u) => (u.is_local(), u.nick.clone()),
            None => return Ok(()),
        };
        if is_local {
            let responder_nick = ctx
                .database
                .get_user(&requester)
                .map(|u| u.nick.clone())
                .unwrap_or(requester.clone());
            ctx.send_to_local_user(
                &uid,
                crate::numeric::NumericReply::RplWhoisIdle.reply(
                    &ctx.server_name,
                    &nick,
                    vec![
                        responder_nick,
                        message.params[2].clone(),
                        message.params[1].clone(),
                        "seconds idle, signon time".to_string(),
                    ],
                ),
            );
        } else {
            let server = ctx.database.get_user(&uid).map(|u| u.server.clone());
            if let Some(server) = server {
                ctx.one_to_one(&server, message.clone()).await;
            }
        }
        return Ok(());
    }

    // Query leg.
    let Some(uid) = ctx.resolve_target_uid(&target) else {
        return Ok(());
    };
    let (is_local, local_id, signon, server) = match ctx.database.get_user(&uid) {
        Some(u) => (u.is_local(), u.local_id, u.signon, u.server.clone()),
        None => return Ok(()),
    };
    if is_local {
        let idle_secs = local_id
            .and_then(|conn| ctx.clients.get(&conn))
            .map(|c| c.timing.last_activity.elapsed().as_secs())
            .unwrap_or(0);
        let reply = Message::with_prefix(
            Prefix::Server(uid.clone()),
            "IDLE",
            vec![requester.clone(), signon.to_string(), idle_secs.to_string()],
        );
        // Back toward the requester, which is not necessarily the
        // branch the query arrived on.
        let requester_server = ctx.database.get_user(&requester).map(|u| u.server.clone());
        match requester_server {
            Some(server) => ctx.one_to_one(&server, reply).await,
            None => ctx.links.send_to_peer(peer_name, reply),
        }
    } else {
        ctx.one_to_one(&server, message.clone()).await;
    }
    Ok(())
}

async fn handle_push(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 2)?;
    let target = message.params[0].clone();
    let Some(uid) = ctx.resolve_target_uid(&target) else {
        return Ok(());
    };
    let (is_local, server) = match ctx.database.get_user(&uid) {
        Some(u) => (u.is_local(), u.server.clone()),
        None => return Ok(()),
    };
    if is_local {
        if let Ok(inner) = Message::parse(&message.params[1]) {
            ctx.send_to_local_user(&uid, inner);
        }
    } else {
        ctx.one_to_one(&server, message.clone()).await;
    }
    let _ = peer_name;
    Ok(())
}

async fn handle_encap(ctx: &Arc<Context>, peer_name: &str, message: &Message) -> Result<()> {
    need(message, 2)?;
    // Encapsulated module traffic: nothing for the core to do beyond
    // keeping it flowing to everyone who might care.
    ctx.one_to_all_but_sender(Some(peer_name), message.clone()).await;
    Ok(())
}
