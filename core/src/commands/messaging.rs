//! PRIVMSG, NOTICE and WALLOPS

use crate::commands::{flags, loop_call, CommandHandler, CommandRegistry};
use crate::context::Context;
use crate::numeric::NumericReply;
use crate::utils::match_mask;
use crate::{Message, Prefix, Result};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

pub fn register(registry: &mut CommandRegistry) {
    registry.register("PRIVMSG", 0, 0, Arc::new(MessageHandler { notice: false }));
    registry.register("NOTICE", 0, 0, Arc::new(MessageHandler { notice: true }));
    registry.register("WALLOPS", 1, flags::OPER_ONLY, Arc::new(WallopsHandler));
}

struct MessageHandler {
    /// NOTICE never generates error replies back at the sender.
    notice: bool,
}

impl MessageHandler {
    fn refuse(&self, ctx: &Context, conn_id: &Uuid, numeric: NumericReply, params: Vec<String>) {
        if !self.notice {
            ctx.send_numeric(conn_id, numeric, params);
        }
    }
}

#[async_trait]
impl CommandHandler for MessageHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        if message.params.is_empty() {
            self.refuse(
                ctx,
                &conn_id,
                NumericReply::ErrNoRecipient,
                vec![format!("No recipient given ({})", message.command)],
            );
            return Ok(());
        }
        if message.params.len() < 2 || message.params[1].is_empty() {
            self.refuse(
                ctx,
                &conn_id,
                NumericReply::ErrNoTextToSend,
                vec!["No text to send".to_string()],
            );
            return Ok(());
        }
        if loop_call(self, ctx, conn_id, message, 0).await? {
            return Ok(());
        }

        let Some(uid) = ctx.clients.get(&conn_id).and_then(|c| c.uid.clone()) else {
            return Ok(());
        };
        let raw_target = message.params[0].clone();
        let text = message.params[1].clone();

        let (min_rank, channel_name) = match raw_target.chars().next() {
            Some('@') => (30, raw_target[1..].to_string()),
            Some('+') => (10, raw_target[1..].to_string()),
            _ => (0, raw_target.clone()),
        };

        if channel_name.starts_with('#') {
            return self
                .to_channel(ctx, conn_id, &uid, &raw_target, &channel_name, min_rank, text)
                .await;
        }
        self.to_user(ctx, conn_id, &uid, &raw_target, text).await
    }
}

impl MessageHandler {
    #[allow(clippy::too_many_arguments)]
    async fn to_channel(
        &self,
        ctx: &Arc<Context>,
        conn_id: Uuid,
        uid: &str,
        raw_target: &str,
        channel_name: &str,
        min_rank: u32,
        text: String,
    ) -> Result<()> {
        let verdict = {
            let Some(channel) = ctx.database.get_channel(channel_name) else {
                self.refuse(
                    ctx,
                    &conn_id,
                    NumericReply::ErrNoSuchChannel,
                    vec![channel_name.to_string(), "No such channel".to_string()],
                );
                return Ok(());
            };
            let member = channel.is_member(uid);
            let rank = channel.member_prefix(uid).rank();
            if channel.has_mode('n') && !member {
                Some("No external messages")
            } else if channel.has_mode('m') && rank < 10 {
                Some("You need voice (+v)")
            } else {
                let mapping = ctx.database.case_mapping();
                let banned = ctx.database.get_user(uid).map(|user| {
                    let masks = [
                        format!("{}!{}", user.nick, user.user_at_host()),
                        format!("{}!{}@{}", user.nick, user.ident, user.dhost),
                    ];
                    let hits = |store: &crate::channel::ListModeStore| {
                        store
                            .iter()
                            .any(|e| masks.iter().any(|m| match_mask(mapping, &e.mask, m)))
                    };
                    member && hits(&channel.bans) && !hits(&channel.excepts)
                });
                if banned == Some(true) {
                    Some("You are banned (+b)")
                } else {
                    None
                }
            }
        };
        if let Some(why) = verdict {
            self.refuse(
                ctx,
                &conn_id,
                NumericReply::ErrCannotSendToChan,
                vec![channel_name.to_string(), format!("Cannot send to channel ({})", why)],
            );
            return Ok(());
        }

        let sender_prefix = ctx.database.get_user(uid).expect("sender exists").prefix();
        let local = Message::with_prefix(
            sender_prefix,
            self.command(),
            vec![raw_target.to_string(), text.clone()],
        );
        for member in ctx.database.channel_members(channel_name, min_rank) {
            if member == uid {
                continue;
            }
            ctx.send_to_local_user(&member, local.clone());
        }

        let wire = Message::with_prefix(
            Prefix::Server(uid.to_string()),
            self.command(),
            vec![raw_target.to_string(), text],
        );
        ctx.route_to_channel(channel_name, wire, None, min_rank, Some(uid))
            .await;
        Ok(())
    }

    async fn to_user(
        &self,
        ctx: &Arc<Context>,
        conn_id: Uuid,
        uid: &str,
        target: &str,
        text: String,
    ) -> Result<()> {
        let Some(target_uid) = ctx.resolve_target_uid(target) else {
            self.refuse(
                ctx,
                &conn_id,
                NumericReply::ErrNoSuchNick,
                vec![target.to_string(), "No such nick/channel".to_string()],
            );
            return Ok(());
        };
        let (is_local, nick, server, away) = {
            let target = ctx.database.get_user(&target_uid).expect("resolved");
            (
                target.is_local(),
                target.nick.clone(),
                target.server.clone(),
                target.away.clone(),
            )
        };

        if is_local {
            let sender_prefix = ctx.database.get_user(uid).expect("sender exists").prefix();
            ctx.send_to_local_user(
                &target_uid,
                Message::with_prefix(sender_prefix, self.command(), vec![nick.clone(), text]),
            );
        } else {
            ctx.one_to_one(
                &server,
                Message::with_prefix(
                    Prefix::Server(uid.to_string()),
                    self.command(),
                    vec![target_uid, text],
                ),
            )
            .await;
        }

        if let Some(away) = away {
            if !self.notice {
                ctx.send_numeric(&conn_id, NumericReply::RplAway, vec![nick, away]);
            }
        }
        Ok(())
    }

    fn command(&self) -> &'static str {
        if self.notice {
            "NOTICE"
        } else {
            "PRIVMSG"
        }
    }
}

struct WallopsHandler;

#[async_trait]
impl CommandHandler for WallopsHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        let Some(uid) = ctx.clients.get(&conn_id).and_then(|c| c.uid.clone()) else {
            return Ok(());
        };
        let text = message.params[0].clone();
        let sender_prefix = ctx.database.get_user(&uid).expect("oper exists").prefix();
        let local = Message::with_prefix(sender_prefix, "WALLOPS", vec![text.clone()]);

        for other in ctx.database.all_uids() {
            let wants = ctx
                .database
                .get_user(&other)
                .map(|u| u.is_local() && u.has_mode('w'))
                .unwrap_or(false);
            if wants {
                ctx.send_to_local_user(&other, local.clone());
            }
        }
        ctx.one_to_many(Message::with_prefix(
            Prefix::Server(uid),
            "WALLOPS",
            vec![text],
        ))
        .await;
        Ok(())
    }
}
