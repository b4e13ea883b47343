//! The MODE command, channel and user views

use crate::commands::{CommandHandler, CommandRegistry};
use crate::context::Context;
use crate::modes::{
    apply_channel_change, apply_user_change, parse_mode_string, stack_mode_changes, ModeChange,
    ModeKind, ModeSource, ModeVerdict,
};
use crate::numeric::NumericReply;
use crate::utils::unix_time;
use crate::{Error, Message, Prefix, Result};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

pub fn register(registry: &mut CommandRegistry) {
    registry.register("MODE", 1, 0, Arc::new(ModeHandler));
}

struct ModeHandler;

#[async_trait]
impl CommandHandler for ModeHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        let target = message.params[0].clone();
        if target.starts_with('#') {
            channel_mode(ctx, conn_id, message, &target).await
        } else {
            user_mode(ctx, conn_id, message, &target).await
        }
    }
}

/// 367/368-style list replies per list-mode letter.
fn send_list_query(ctx: &Context, conn_id: &Uuid, channel_name: &str, letter: char) {
    let (each, end, end_text) = match letter {
        'b' => (
            NumericReply::RplBanList,
            NumericReply::RplEndOfBanList,
            "End of channel ban list",
        ),
        'e' => (
            NumericReply::RplExceptList,
            NumericReply::RplEndOfExceptList,
            "End of channel exception list",
        ),
        'I' => (
            NumericReply::RplInviteList,
            NumericReply::RplEndOfInviteList,
            "End of channel invite list",
        ),
        _ => return,
    };
    if let Some(channel) = ctx.database.get_channel(channel_name) {
        for entry in channel.list_store(letter).map(|s| s.iter()).into_iter().flatten() {
            ctx.send_numeric(
                conn_id,
                each,
                vec![
                    channel_name.to_string(),
                    entry.mask.clone(),
                    entry.setter.clone(),
                    entry.set_time.to_string(),
                ],
            );
        }
    }
    ctx.send_numeric(
        conn_id,
        end,
        vec![channel_name.to_string(), end_text.to_string()],
    );
}

async fn channel_mode(
    ctx: &Arc<Context>,
    conn_id: Uuid,
    message: &Message,
    channel_name: &str,
) -> Result<()> {
    let Some(uid) = ctx.clients.get(&conn_id).and_then(|c| c.uid.clone()) else {
        return Ok(());
    };

    let Some((ts, member_rank, is_member)) = ctx
        .database
        .get_channel(channel_name)
        .map(|c| (c.ts, c.member_prefix(&uid).rank(), c.is_member(&uid)))
    else {
        ctx.send_numeric(
            &conn_id,
            NumericReply::ErrNoSuchChannel,
            vec![channel_name.to_string(), "No such channel".to_string()],
        );
        return Ok(());
    };

    // Query form: MODE #chan
    if message.params.len() < 2 {
        let modes = ctx
            .database
            .get_channel(channel_name)
            .map(|c| c.modes_string(is_member))
            .unwrap_or_default();
        ctx.send_numeric(
            &conn_id,
            NumericReply::RplChannelModeIs,
            vec![channel_name.to_string(), modes],
        );
        ctx.send_numeric(
            &conn_id,
            NumericReply::RplChannelCreated,
            vec![channel_name.to_string(), ts.to_string()],
        );
        return Ok(());
    }

    let mode_str = message.params[1].clone();
    let mode_params: Vec<String> = message.params[2..].to_vec();
    let parsed = match parse_mode_string(&ctx.modes, ModeKind::Channel, &mode_str, &mode_params) {
        Ok(p) => p,
        Err(Error::UnknownCommand(letter)) => {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrUnknownMode,
                vec![letter, "is unknown mode char to me".to_string()],
            );
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let is_oper = ctx
        .database
        .get_user(&uid)
        .map(|u| u.is_oper())
        .unwrap_or(false);
    let nick = ctx
        .database
        .get_user(&uid)
        .map(|u| u.nick.clone())
        .unwrap_or_default();
    let source = ModeSource {
        rank: member_rank,
        is_server: false,
        is_oper,
        name: &nick,
    };

    let mut to_apply: Vec<ModeChange> = Vec::new();
    let mut denied = false;
    for change in parsed {
        let handler = ctx
            .modes
            .get(change.letter, ModeKind::Channel)
            .expect("parse validated the letter");

        // Bare list mode is a query, not a change.
        if handler.is_list_mode() && change.param.is_none() {
            send_list_query(ctx, &conn_id, channel_name, change.letter);
            continue;
        }

        if handler.on_change(&source, change.adding, change.param.as_deref()) == ModeVerdict::Deny
        {
            denied = true;
            continue;
        }

        // Prefix modes name a member; resolve the nick to a UID.
        if handler.prefix_rank().is_some() {
            let target_nick = change.param.clone().unwrap_or_default();
            let Some(target_uid) = ctx.resolve_target_uid(&target_nick) else {
                ctx.send_numeric(
                    &conn_id,
                    NumericReply::ErrNoSuchNick,
                    vec![target_nick, "No such nick/channel".to_string()],
                );
                continue;
            };
            let on_channel = ctx
                .database
                .get_channel(channel_name)
                .map(|c| c.is_member(&target_uid))
                .unwrap_or(false);
            if !on_channel {
                ctx.send_numeric(
                    &conn_id,
                    NumericReply::ErrUserNotInChannel,
                    vec![
                        target_nick,
                        channel_name.to_string(),
                        "They aren't on that channel".to_string(),
                    ],
                );
                continue;
            }
            to_apply.push(ModeChange {
                adding: change.adding,
                letter: change.letter,
                param: Some(target_uid),
            });
            continue;
        }

        to_apply.push(change);
    }
    if denied {
        ctx.send_numeric(
            &conn_id,
            NumericReply::ErrChanOpPrivsNeeded,
            vec![
                channel_name.to_string(),
                "You're not channel operator".to_string(),
            ],
        );
    }
    if to_apply.is_empty() {
        return Ok(());
    }

    let list_limit = ctx
        .config
        .channel
        .list_limit_for(ctx.database.case_mapping(), channel_name);
    let now = unix_time();
    let applied: Vec<ModeChange> = {
        let Some(mut channel) = ctx.database.get_channel_mut(channel_name) else {
            return Ok(());
        };
        to_apply
            .into_iter()
            .filter(|change| {
                apply_channel_change(&ctx.modes, &mut channel, change, &nick, now, list_limit)
            })
            .collect()
    };
    if applied.is_empty() {
        return Ok(());
    }

    // Local members see nicks; the network sees UIDs under the channel TS.
    let visible: Vec<ModeChange> = applied
        .iter()
        .map(|change| {
            let param = change.param.as_ref().map(|p| {
                if crate::user::looks_like_uid(p) {
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
        .collect();
    let max = ctx.config.limits.max_modes_per_line;
    let user_prefix = ctx.database.get_user(&uid).expect("sender exists").prefix();
    for (line_modes, line_params) in stack_mode_changes(&visible, max) {
        let mut all = vec![channel_name.to_string(), line_modes];
        all.extend(line_params);
        let msg = Message::with_prefix(user_prefix.clone(), "MODE", all);
        ctx.send_to_channel_local(channel_name, msg, None);
    }
    for (line_modes, line_params) in stack_mode_changes(&applied, max) {
        let mut all = vec![channel_name.to_string(), ts.to_string(), line_modes];
        all.extend(line_params);
        ctx.one_to_many(Message::with_prefix(
            Prefix::Server(uid.clone()),
            "FMODE",
            all,
        ))
        .await;
    }
    Ok(())
}

async fn user_mode(
    ctx: &Arc<Context>,
    conn_id: Uuid,
    message: &Message,
    target: &str,
) -> Result<()> {
    let Some(uid) = ctx.clients.get(&conn_id).and_then(|c| c.uid.clone()) else {
        return Ok(());
    };
    let own_nick = ctx
        .database
        .get_user(&uid)
        .map(|u| u.nick.clone())
        .unwrap_or_default();
    if !ctx.database.case_mapping().eq(target, &own_nick) {
        ctx.send_numeric(
            &conn_id,
            NumericReply::ErrUsersDontMatch,
            vec!["Can't change mode for other users".to_string()],
        );
        return Ok(());
    }

    if message.params.len() < 2 {
        let modes = ctx
            .database
            .get_user(&uid)
            .map(|u| u.modes_string())
            .unwrap_or_default();
        ctx.send_numeric(&conn_id, NumericReply::RplUmodeIs, vec![modes]);
        return Ok(());
    }

    let parsed = match parse_mode_string(&ctx.modes, ModeKind::User, &message.params[1], &[]) {
        Ok(p) => p,
        Err(Error::UnknownCommand(_)) => {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrUmodeUnknownFlag,
                vec!["Unknown MODE flag".to_string()],
            );
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let is_oper = ctx
        .database
        .get_user(&uid)
        .map(|u| u.is_oper())
        .unwrap_or(false);
    let source = ModeSource {
        rank: 0,
        is_server: false,
        is_oper,
        name: &own_nick,
    };

    let applied: Vec<ModeChange> = {
        let Some(mut user) = ctx.database.get_user_mut(&uid) else {
            return Ok(());
        };
        parsed
            .into_iter()
            .filter(|change| {
                let handler = ctx
                    .modes
                    .get(change.letter, ModeKind::User)
                    .expect("parse validated the letter");
                handler.on_change(&source, change.adding, None) == ModeVerdict::Allow
                    && apply_user_change(&mut user, change)
            })
            .collect()
    };
    if applied.is_empty() {
        return Ok(());
    }

    for (line_modes, _) in stack_mode_changes(&applied, usize::MAX) {
        let echo = Message::with_prefix(
            Prefix::Server(own_nick.clone()),
            "MODE",
            vec![own_nick.clone(), line_modes.clone()],
        );
        ctx.send_to_connection(&conn_id, echo);
        ctx.one_to_many(Message::with_prefix(
            Prefix::Server(uid.clone()),
            "MODE",
            vec![uid.clone(), line_modes],
        ))
        .await;
    }
    Ok(())
}
