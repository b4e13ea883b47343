//! Channel membership commands: JOIN, PART, KICK, TOPIC, NAMES, INVITE, LIST

use crate::channel::MemberPrefix;
use crate::commands::{loop_call, CommandHandler, CommandRegistry};
use crate::context::Context;
use crate::numeric::NumericReply;
use crate::utils::{is_valid_channel_name, match_mask, unix_time};
use crate::{Message, Prefix, Result};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

pub fn register(registry: &mut CommandRegistry) {
    registry.register("JOIN", 1, 0, Arc::new(JoinHandler));
    registry.register("PART", 1, 0, Arc::new(PartHandler));
    registry.register("KICK", 2, 0, Arc::new(KickHandler));
    registry.register("TOPIC", 1, 0, Arc::new(TopicHandler));
    registry.register("NAMES", 0, 0, Arc::new(NamesHandler));
    registry.register("INVITE", 2, 0, Arc::new(InviteHandler));
    registry.register("LIST", 0, 0, Arc::new(ListHandler));
}

fn uid_of(ctx: &Context, conn_id: &Uuid) -> Option<String> {
    ctx.clients.get(conn_id).and_then(|c| c.uid.clone())
}

/// Why a join was refused, mapped to its numeric.
fn join_denial(
    ctx: &Context,
    uid: &str,
    channel_name: &str,
    key: Option<&str>,
) -> Option<(NumericReply, &'static str)> {
    let channel = ctx.database.get_channel(channel_name)?;
    let user = ctx.database.get_user(uid)?;

    if channel.has_mode('i') && !channel.invited.contains(uid) {
        return Some((NumericReply::ErrInviteOnlyChan, "Cannot join channel (+i)"));
    }
    if let Some(ref chan_key) = channel.key {
        if key != Some(chan_key.as_str()) {
            return Some((NumericReply::ErrBadChannelKey, "Cannot join channel (+k)"));
        }
    }
    if let Some(limit) = channel.limit {
        if channel.member_count() >= limit as usize {
            return Some((NumericReply::ErrChannelIsFull, "Cannot join channel (+l)"));
        }
    }

    let mapping = ctx.database.case_mapping();
    let masks = [
        format!("{}!{}", user.nick, user.user_at_host()),
        format!("{}!{}@{}", user.nick, user.ident, user.dhost),
        format!("{}!{}@{}", user.nick, user.ident, user.ip),
    ];
    let hits = |store: &crate::channel::ListModeStore| {
        store
            .iter()
            .any(|e| masks.iter().any(|m| match_mask(mapping, &e.mask, m)))
    };
    if hits(&channel.bans) && !hits(&channel.excepts) {
        return Some((NumericReply::ErrBannedFromChan, "Cannot join channel (+b)"));
    }
    None
}

/// Shared join tail: membership, local announcements, topic, names, and
/// the FJOIN that introduces the member to the network.
async fn complete_join(ctx: &Arc<Context>, conn_id: Option<Uuid>, uid: &str, channel_name: &str) {
    let created = ctx.database.create_channel(channel_name, unix_time());
    let prefix = if created {
        if ctx.config.channel.founder_on_create {
            let mut p = MemberPrefix::FOUNDER;
            p.insert(MemberPrefix::OP);
            p
        } else {
            MemberPrefix::OP
        }
    } else {
        MemberPrefix::NONE
    };

    if ctx.database.add_member(channel_name, uid, prefix).is_err() {
        return;
    }
    if let Some(mut channel) = ctx.database.get_channel_mut(channel_name) {
        channel.invited.remove(uid);
    }

    let (user_prefix, ts) = {
        let user = ctx.database.get_user(uid).expect("member just added");
        let ts = ctx
            .database
            .get_channel(channel_name)
            .map(|c| c.ts)
            .unwrap_or_else(unix_time);
        (user.prefix(), ts)
    };

    let join = Message::with_prefix(user_prefix, "JOIN", vec![channel_name.to_string()]);
    ctx.send_to_channel_local(channel_name, join, None);

    if let Some(conn_id) = conn_id {
        // Topic and names for the joiner.
        let topic = ctx
            .database
            .get_channel(channel_name)
            .and_then(|c| c.topic.clone());
        if let Some(topic) = topic {
            ctx.send_numeric(
                &conn_id,
                NumericReply::RplTopic,
                vec![channel_name.to_string(), topic.text],
            );
            ctx.send_numeric(
                &conn_id,
                NumericReply::RplTopicWhoTime,
                vec![
                    channel_name.to_string(),
                    topic.set_by,
                    topic.set_at.to_string(),
                ],
            );
        }
        send_names(ctx, conn_id, channel_name);
    }

    let member = format!("{},{}", prefix.all_symbols(), uid);
    ctx.one_to_many(Message::with_prefix(
        Prefix::Server(ctx.sid.clone()),
        "FJOIN",
        vec![channel_name.to_string(), ts.to_string(), member],
    ))
    .await;
}

/// Services-driven join (SVSJOIN): gates are bypassed.
pub(crate) async fn force_join(ctx: &Arc<Context>, uid: &str, channel_name: &str) {
    if !is_valid_channel_name(channel_name, ctx.config.limits.max_channel_name_length) {
        return;
    }
    let already = ctx
        .database
        .get_channel(channel_name)
        .map(|c| c.is_member(uid))
        .unwrap_or(false);
    if already {
        return;
    }
    let conn_id = ctx.database.get_user(uid).and_then(|u| u.local_id);
    complete_join(ctx, conn_id, uid, channel_name).await;
}

/// 353/366 for one channel.
pub(crate) fn send_names(ctx: &Context, conn_id: Uuid, channel_name: &str) {
    let mut names: Vec<String> = Vec::new();
    if let Some(channel) = ctx.database.get_channel(channel_name) {
        for (uid, prefix) in &channel.members {
            if let Some(user) = ctx.database.get_user(uid) {
                let mut entry = String::new();
                if let Some(symbol) = prefix.symbol() {
                    entry.push(symbol);
                }
                entry.push_str(&user.nick);
                names.push(entry);
            }
        }
    }
    names.sort();
    for chunk in names.chunks(20) {
        ctx.send_numeric(
            &conn_id,
            NumericReply::RplNameReply,
            vec![
                "=".to_string(),
                channel_name.to_string(),
                chunk.join(" "),
            ],
        );
    }
    ctx.send_numeric(
        &conn_id,
        NumericReply::RplEndOfNames,
        vec![channel_name.to_string(), "End of /NAMES list".to_string()],
    );
}

struct JoinHandler;

#[async_trait]
impl CommandHandler for JoinHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        if loop_call(self, ctx, conn_id, message, 0).await? {
            return Ok(());
        }
        let Some(uid) = uid_of(ctx, &conn_id) else {
            return Ok(());
        };
        let channel_name = message.params[0].clone();
        let key = message.arg(1);

        if !is_valid_channel_name(&channel_name, ctx.config.limits.max_channel_name_length) {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrNoSuchChannel,
                vec![channel_name, "No such channel".to_string()],
            );
            return Ok(());
        }

        let (already, channel_count) = {
            let user = ctx.database.get_user(&uid).expect("registered");
            (
                user.channels.contains(&channel_name),
                user.channels.len(),
            )
        };
        if already {
            return Ok(());
        }
        if channel_count >= ctx.config.limits.max_channels_per_user {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrTooManyChannels,
                vec![channel_name, "You have joined too many channels".to_string()],
            );
            return Ok(());
        }
        if let Some((numeric, text)) = join_denial(ctx, &uid, &channel_name, key) {
            ctx.send_numeric(
                &conn_id,
                numeric,
                vec![channel_name, text.to_string()],
            );
            return Ok(());
        }

        complete_join(ctx, Some(conn_id), &uid, &channel_name).await;
        Ok(())
    }
}

struct PartHandler;

#[async_trait]
impl CommandHandler for PartHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        if loop_call(self, ctx, conn_id, message, 0).await? {
            return Ok(());
        }
        let Some(uid) = uid_of(ctx, &conn_id) else {
            return Ok(());
        };
        let channel_name = message.params[0].clone();
        let reason = message.arg(1).unwrap_or("").to_string();

        let is_member = ctx
            .database
            .get_channel(&channel_name)
            .map(|c| c.is_member(&uid))
            .unwrap_or(false);
        if !is_member {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrNotOnChannel,
                vec![channel_name, "You're not on that channel".to_string()],
            );
            return Ok(());
        }

        let user_prefix = ctx.database.get_user(&uid).expect("member").prefix();
        let mut params = vec![channel_name.clone()];
        if !reason.is_empty() {
            params.push(reason.clone());
        }
        let part = Message::with_prefix(user_prefix, "PART", params.clone());
        ctx.send_to_channel_local(&channel_name, part, None);
        ctx.database.remove_member(&channel_name, &uid);

        ctx.one_to_many(Message::with_prefix(
            Prefix::Server(uid.clone()),
            "PART",
            params,
        ))
        .await;
        Ok(())
    }
}

struct KickHandler;

#[async_trait]
impl CommandHandler for KickHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        if loop_call(self, ctx, conn_id, message, 1).await? {
            return Ok(());
        }
        let Some(uid) = uid_of(ctx, &conn_id) else {
            return Ok(());
        };
        let channel_name = message.params[0].clone();
        let target_nick = message.params[1].clone();
        let reason = message
            .arg(2)
            .map(|r| r.chars().take(ctx.config.limits.max_kick_length).collect())
            .unwrap_or_else(|| target_nick.clone());

        let Some(channel) = ctx.database.get_channel(&channel_name) else {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrNoSuchChannel,
                vec![channel_name, "No such channel".to_string()],
            );
            return Ok(());
        };
        if !channel.is_member(&uid) {
            drop(channel);
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrNotOnChannel,
                vec![channel_name, "You're not on that channel".to_string()],
            );
            return Ok(());
        }
        let kicker_rank = channel.member_prefix(&uid).rank();
        drop(channel);

        if kicker_rank < 20 {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrChanOpPrivsNeeded,
                vec![channel_name, "You're not channel operator".to_string()],
            );
            return Ok(());
        }

        let Some(target_uid) = ctx.resolve_target_uid(&target_nick) else {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrNoSuchNick,
                vec![target_nick, "No such nick/channel".to_string()],
            );
            return Ok(());
        };
        let target_on = ctx
            .database
            .get_channel(&channel_name)
            .map(|c| c.is_member(&target_uid))
            .unwrap_or(false);
        if !target_on {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrUserNotInChannel,
                vec![
                    target_nick,
                    channel_name,
                    "They aren't on that channel".to_string(),
                ],
            );
            return Ok(());
        }
        // A kicker may not remove someone who outranks them.
        let target_rank = ctx
            .database
            .get_channel(&channel_name)
            .map(|c| c.member_prefix(&target_uid).rank())
            .unwrap_or(0);
        if target_rank > kicker_rank {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrChanOpPrivsNeeded,
                vec![channel_name, "You're not channel operator".to_string()],
            );
            return Ok(());
        }

        let kicker_prefix = ctx.database.get_user(&uid).expect("member").prefix();
        let victim_nick = ctx
            .database
            .get_user(&target_uid)
            .map(|u| u.nick.clone())
            .unwrap_or(target_nick);
        let kick = Message::with_prefix(
            kicker_prefix,
            "KICK",
            vec![channel_name.clone(), victim_nick, reason.clone()],
        );
        ctx.send_to_channel_local(&channel_name, kick, None);
        ctx.database.remove_member(&channel_name, &target_uid);

        ctx.one_to_many(Message::with_prefix(
            Prefix::Server(uid.clone()),
            "KICK",
            vec![channel_name, target_uid, reason],
        ))
        .await;
        Ok(())
    }
}

struct TopicHandler;

#[async_trait]
impl CommandHandler for TopicHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        let Some(uid) = uid_of(ctx, &conn_id) else {
            return Ok(());
        };
        let channel_name = message.params[0].clone();

        let Some(channel) = ctx.database.get_channel(&channel_name) else {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrNoSuchChannel,
                vec![channel_name, "No such channel".to_string()],
            );
            return Ok(());
        };

        // Query form.
        if message.params.len() < 2 {
            match channel.topic.clone() {
                Some(topic) => {
                    drop(channel);
                    ctx.send_numeric(
                        &conn_id,
                        NumericReply::RplTopic,
                        vec![channel_name.clone(), topic.text],
                    );
                    ctx.send_numeric(
                        &conn_id,
                        NumericReply::RplTopicWhoTime,
                        vec![channel_name, topic.set_by, topic.set_at.to_string()],
                    );
                }
                None => {
                    drop(channel);
                    ctx.send_numeric(
                        &conn_id,
                        NumericReply::RplNoTopic,
                        vec![channel_name, "No topic is set".to_string()],
                    );
                }
            }
            return Ok(());
        }

        // Set form.
        if !channel.is_member(&uid) {
            drop(channel);
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrNotOnChannel,
                vec![channel_name, "You're not on that channel".to_string()],
            );
            return Ok(());
        }
        let rank = channel.member_prefix(&uid).rank();
        let restricted = channel.has_mode('t');
        drop(channel);
        if restricted && rank < 20 {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrChanOpPrivsNeeded,
                vec![channel_name, "You're not channel operator".to_string()],
            );
            return Ok(());
        }

        let text: String = message.params[1]
            .chars()
            .take(ctx.config.limits.max_topic_length)
            .collect();
        let (user_prefix, nick) = {
            let user = ctx.database.get_user(&uid).expect("member");
            (user.prefix(), user.nick.clone())
        };
        if let Some(mut channel) = ctx.database.get_channel_mut(&channel_name) {
            channel.topic = Some(crate::channel::Topic {
                text: text.clone(),
                set_by: nick,
                set_at: unix_time(),
            });
        }
        let topic = Message::with_prefix(
            user_prefix,
            "TOPIC",
            vec![channel_name.clone(), text.clone()],
        );
        ctx.send_to_channel_local(&channel_name, topic, None);
        ctx.one_to_many(Message::with_prefix(
            Prefix::Server(uid),
            "TOPIC",
            vec![channel_name, text],
        ))
        .await;
        Ok(())
    }
}

struct NamesHandler;

#[async_trait]
impl CommandHandler for NamesHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        if loop_call(self, ctx, conn_id, message, 0).await? {
            return Ok(());
        }
        match message.arg(0) {
            Some(channel_name) => send_names(ctx, conn_id, channel_name),
            None => {
                // Bare NAMES just terminates; listing every channel is noise.
                ctx.send_numeric(
                    &conn_id,
                    NumericReply::RplEndOfNames,
                    vec!["*".to_string(), "End of /NAMES list".to_string()],
                );
            }
        }
        Ok(())
    }
}

struct InviteHandler;

#[async_trait]
impl CommandHandler for InviteHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        let Some(uid) = uid_of(ctx, &conn_id) else {
            return Ok(());
        };
        let target_nick = message.params[0].clone();
        let channel_name = message.params[1].clone();

        let Some(target_uid) = ctx.resolve_target_uid(&target_nick) else {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrNoSuchNick,
                vec![target_nick, "No such nick/channel".to_string()],
            );
            return Ok(());
        };

        let Some(channel) = ctx.database.get_channel(&channel_name) else {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrNoSuchChannel,
                vec![channel_name, "No such channel".to_string()],
            );
            return Ok(());
        };
        if !channel.is_member(&uid) {
            drop(channel);
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrNotOnChannel,
                vec![channel_name, "You're not on that channel".to_string()],
            );
            return Ok(());
        }
        if channel.is_member(&target_uid) {
            drop(channel);
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrUserOnChannel,
                vec![
                    target_nick,
                    channel_name,
                    "is already on channel".to_string(),
                ],
            );
            return Ok(());
        }
        let invite_only = channel.has_mode('i');
        let rank = channel.member_prefix(&uid).rank();
        drop(channel);
        if invite_only && rank < 20 {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrChanOpPrivsNeeded,
                vec![channel_name, "You're not channel operator".to_string()],
            );
            return Ok(());
        }

        let (is_local, target_server, target_display) = {
            let target = ctx.database.get_user(&target_uid).expect("resolved");
            (target.is_local(), target.server.clone(), target.nick.clone())
        };
        let inviter_prefix = ctx.database.get_user(&uid).expect("member").prefix();

        if is_local {
            if let Some(mut channel) = ctx.database.get_channel_mut(&channel_name) {
                channel.invited.insert(target_uid.clone());
            }
            ctx.send_to_local_user(
                &target_uid,
                Message::with_prefix(
                    inviter_prefix,
                    "INVITE",
                    vec![target_display.clone(), channel_name.clone()],
                ),
            );
        } else {
            ctx.one_to_one(
                &target_server,
                Message::with_prefix(
                    Prefix::Server(uid.clone()),
                    "INVITE",
                    vec![target_uid.clone(), channel_name.clone()],
                ),
            )
            .await;
        }
        ctx.send_numeric(
            &conn_id,
            NumericReply::RplInviting,
            vec![target_display, channel_name],
        );
        Ok(())
    }
}

struct ListHandler;

#[async_trait]
impl CommandHandler for ListHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        let uid = uid_of(ctx, &conn_id);
        let filter = message.arg(0).map(String::from);

        ctx.send_numeric(
            &conn_id,
            NumericReply::RplListStart,
            vec!["Channel".to_string(), "Users Name".to_string()],
        );
        let mapping = ctx.database.case_mapping();
        for name in ctx.database.all_channel_names() {
            if let Some(ref pattern) = filter {
                if !match_mask(mapping, pattern, &name) {
                    continue;
                }
            }
            let Some(channel) = ctx.database.get_channel(&name) else {
                continue;
            };
            // Secret and private channels only show to their members.
            let member = uid.as_deref().map(|u| channel.is_member(u)).unwrap_or(false);
            if (channel.has_mode('s') || channel.has_mode('p')) && !member {
                continue;
            }
            let count = channel.member_count();
            let topic = channel
                .topic
                .as_ref()
                .map(|t| t.text.clone())
                .unwrap_or_default();
            drop(channel);
            ctx.send_numeric(
                &conn_id,
                NumericReply::RplList,
                vec![name, count.to_string(), topic],
            );
        }
        ctx.send_numeric(
            &conn_id,
            NumericReply::RplListEnd,
            vec!["End of /LIST".to_string()],
        );
        Ok(())
    }
}
