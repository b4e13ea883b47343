//! Operator commands: OPER, KILL, REHASH, CONNECT, SQUIT and the
//! x-line management commands

use crate::commands::{flags, CommandHandler, CommandRegistry};
use crate::config::OperatorFlag;
use crate::context::{Context, ServerAction};
use crate::numeric::NumericReply;
use crate::snomask::SNOMASK_LETTERS;
use crate::utils::{match_mask, parse_duration, unix_time};
use crate::xline::{XLine, XLineKind};
use crate::{Message, Prefix, Result};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

pub fn register(registry: &mut CommandRegistry) {
    registry.register("OPER", 2, 0, Arc::new(OperHandler));
    registry.register("KILL", 2, flags::OPER_ONLY, Arc::new(KillHandler));
    registry.register("REHASH", 0, flags::OPER_ONLY, Arc::new(RehashHandler));
    registry.register("CONNECT", 1, flags::OPER_ONLY, Arc::new(ConnectHandler));
    registry.register("SQUIT", 1, flags::OPER_ONLY, Arc::new(SquitHandler));
    for (name, kind) in [
        ("GLINE", XLineKind::G),
        ("KLINE", XLineKind::K),
        ("ZLINE", XLineKind::Z),
        ("QLINE", XLineKind::Q),
        ("ELINE", XLineKind::E),
    ] {
        registry.register(name, 1, flags::OPER_ONLY, Arc::new(XLineHandler { kind }));
    }
}

fn uid_of(ctx: &Context, conn_id: &Uuid) -> Option<String> {
    ctx.clients.get(conn_id).and_then(|c| c.uid.clone())
}

fn oper_flags(ctx: &Context, uid: &str) -> Vec<OperatorFlag> {
    let oper_type = ctx
        .database
        .get_user(uid)
        .and_then(|u| u.oper_type.clone());
    let Some(oper_type) = oper_type else {
        return Vec::new();
    };
    ctx.config
        .network
        .operators
        .iter()
        .find(|o| o.oper_type == oper_type)
        .map(|o| o.flags.clone())
        .unwrap_or_default()
}

struct OperHandler;

#[async_trait]
impl CommandHandler for OperHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        let Some(uid) = uid_of(ctx, &conn_id) else {
            return Ok(());
        };
        let name = &message.params[0];
        let password = &message.params[1];

        let user_at_host = ctx
            .database
            .get_user(&uid)
            .map(|u| u.user_at_host())
            .unwrap_or_default();
        let mapping = ctx.database.case_mapping();

        let block = ctx.config.network.operators.iter().find(|o| {
            o.name == *name
                && o.verify_password(password)
                && match_mask(mapping, &o.hostmask, &user_at_host)
        });
        let Some(block) = block else {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrNoOperHost,
                vec!["Invalid oper credentials".to_string()],
            );
            ctx.snotice('o', format!("Failed OPER attempt by {}", user_at_host));
            return Ok(());
        };

        let (nick, oper_type) = {
            let mut user = ctx.database.get_user_mut(&uid).expect("registered");
            user.oper_up(block.oper_type.clone());
            user.snomasks = SNOMASK_LETTERS.iter().copied().collect();
            (user.nick.clone(), block.oper_type.clone())
        };
        {
            let sender = ctx.clients.get(&conn_id).map(|c| c.sender.clone());
            if let Some(sender) = sender {
                ctx.snomasks
                    .subscribe(conn_id, sender, SNOMASK_LETTERS.iter().copied());
            }
        }

        ctx.send_numeric(
            &conn_id,
            NumericReply::RplYoureOper,
            vec!["You are now an IRC operator".to_string()],
        );
        ctx.send_to_connection(
            &conn_id,
            Message::with_prefix(
                Prefix::Server(nick.clone()),
                "MODE",
                vec![nick.clone(), "+o".to_string()],
            ),
        );
        ctx.snotice('o', format!("{} is now an operator of type {}", nick, oper_type));
        ctx.one_to_many(Message::with_prefix(
            Prefix::Server(uid),
            "OPERTYPE",
            vec![oper_type],
        ))
        .await;
        Ok(())
    }
}

struct KillHandler;

#[async_trait]
impl CommandHandler for KillHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        let Some(uid) = uid_of(ctx, &conn_id) else {
            return Ok(());
        };
        let target = message.params[0].clone();
        let reason = message.params[1].clone();

        if ctx.tree.read().await.find(&target).is_some() {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrCantKillServer,
                vec!["You can't kill a server!".to_string()],
            );
            return Ok(());
        }
        let Some(target_uid) = ctx.resolve_target_uid(&target) else {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrNoSuchNick,
                vec![target, "No such nick/channel".to_string()],
            );
            return Ok(());
        };

        let target_is_local = ctx
            .database
            .get_user(&target_uid)
            .map(|u| u.is_local())
            .unwrap_or(false);
        let flags = oper_flags(ctx, &uid);
        if !target_is_local && !flags.contains(&OperatorFlag::GlobalOper) {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrNoPrivileges,
                vec!["Permission Denied - Only global operators may kill remote users"
                    .to_string()],
            );
            return Ok(());
        }

        let killer_nick = ctx
            .database
            .get_user(&uid)
            .map(|u| u.nick.clone())
            .unwrap_or_default();
        let full_reason = format!("Killed ({} ({}))", killer_nick, reason);
        ctx.statistics.bump(&ctx.statistics.kills);
        ctx.snotice(
            'k',
            format!("{} issued KILL on {} ({})", killer_nick, target, reason),
        );

        // Peers see the KILL; removal travels with it.
        ctx.one_to_many(Message::with_prefix(
            Prefix::Server(uid),
            "KILL",
            vec![target_uid.clone(), full_reason.clone()],
        ))
        .await;
        ctx.remove_user_local(&target_uid, &full_reason);
        Ok(())
    }
}

struct RehashHandler;

#[async_trait]
impl CommandHandler for RehashHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, _message: &Message) -> Result<()> {
        ctx.send_numeric(
            &conn_id,
            NumericReply::RplRehashing,
            vec!["ircd.conf".to_string(), "Rehashing".to_string()],
        );
        let nick = ctx.nick_of_connection(&conn_id).unwrap_or_default();
        ctx.snotice('o', format!("{} is rehashing the configuration", nick));
        // The launcher owns the config file; expiry of dead x-lines is
        // the one reload action the core performs itself.
        let swept = ctx.xlines.expire_sweep();
        if swept > 0 {
            ctx.snotice('x', format!("Expired {} x-lines during rehash", swept));
        }
        Ok(())
    }
}

struct ConnectHandler;

#[async_trait]
impl CommandHandler for ConnectHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        let Some(uid) = uid_of(ctx, &conn_id) else {
            return Ok(());
        };
        let flags = oper_flags(ctx, &uid);
        if !flags.contains(&OperatorFlag::LocalConnect)
            && !flags.contains(&OperatorFlag::RemoteConnect)
        {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrNoPrivileges,
                vec!["Permission Denied - You may not CONNECT".to_string()],
            );
            return Ok(());
        }
        let target = message.params[0].clone();
        if ctx.config.link_block(&target).is_none() {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrNoSuchServer,
                vec![target, "No such link block".to_string()],
            );
            return Ok(());
        }
        if ctx.links.is_connected(&target) {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrNoSuchServer,
                vec![target, "Already connected".to_string()],
            );
            return Ok(());
        }
        let nick = ctx.nick_of_connection(&conn_id).unwrap_or_default();
        ctx.snotice('l', format!("{} requested CONNECT to {}", nick, target));
        let _ = ctx.actions.send(ServerAction::ConnectLink { name: target });
        Ok(())
    }
}

struct SquitHandler;

#[async_trait]
impl CommandHandler for SquitHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        let Some(uid) = uid_of(ctx, &conn_id) else {
            return Ok(());
        };
        if !oper_flags(ctx, &uid).contains(&OperatorFlag::Squit) {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrNoPrivileges,
                vec!["Permission Denied - You may not SQUIT".to_string()],
            );
            return Ok(());
        }
        let target = message.params[0].clone();
        let reason = message
            .arg(1)
            .map(String::from)
            .unwrap_or_else(|| "SQUIT by operator".to_string());

        let known = ctx.tree.read().await.find(&target).is_some();
        if !known || ctx.tree.read().await.is_root(&target) {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrNoSuchServer,
                vec![target, "No such server".to_string()],
            );
            return Ok(());
        }

        let nick = ctx.nick_of_connection(&conn_id).unwrap_or_default();
        ctx.snotice('q', format!("{} issued SQUIT for {} ({})", nick, target, reason));

        if ctx.links.is_connected(&target) {
            let _ = ctx.actions.send(ServerAction::DropLink {
                peer: target,
                reason,
            });
        } else {
            // Someone else holds the socket; ask them to drop it.
            ctx.one_to_one(
                &target,
                Message::with_prefix(
                    Prefix::Server(uid),
                    "RSQUIT",
                    vec![target.clone(), reason],
                ),
            )
            .await;
        }
        Ok(())
    }
}

struct XLineHandler {
    kind: XLineKind,
}

#[async_trait]
impl CommandHandler for XLineHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        let Some(uid) = uid_of(ctx, &conn_id) else {
            return Ok(());
        };
        let nick = ctx
            .database
            .get_user(&uid)
            .map(|u| u.nick.clone())
            .unwrap_or_default();
        let first = message.params[0].clone();

        // Removal form: XLINE -mask
        if let Some(mask) = first.strip_prefix('-') {
            if ctx.xlines.remove(self.kind, mask) {
                ctx.snotice(
                    'x',
                    format!("{} removed {}-line on {}", nick, self.kind.letter(), mask),
                );
                if self.kind.is_global() {
                    ctx.one_to_many(ctx.sid_message(
                        "DELLINE",
                        vec![self.kind.letter().to_string(), mask.to_string()],
                    ))
                    .await;
                }
            } else {
                ctx.send_numeric(
                    &conn_id,
                    NumericReply::ErrNoSuchNick,
                    vec![mask.to_string(), "No such line".to_string()],
                );
            }
            return Ok(());
        }

        if self.kind.is_global()
            && !oper_flags(ctx, &uid).contains(&OperatorFlag::NetworkBan)
        {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrNoPrivileges,
                vec!["Permission Denied - You may not set network bans".to_string()],
            );
            return Ok(());
        }

        let duration = message
            .arg(1)
            .and_then(parse_duration)
            .unwrap_or(0);
        let reason = message
            .arg(2)
            .or(message.arg(1).filter(|a| parse_duration(a).is_none()))
            .unwrap_or("No reason given")
            .to_string();

        let line = XLine {
            kind: self.kind,
            mask: first.clone(),
            setter: nick.clone(),
            set_time: unix_time(),
            duration,
            reason: reason.clone(),
        };
        ctx.xlines.add(line);
        ctx.snotice(
            'x',
            format!(
                "{} added {}{}-line on {} ({})",
                nick,
                if duration == 0 { "permanent " } else { "" },
                self.kind.letter(),
                first,
                reason
            ),
        );

        if self.kind.is_global() {
            ctx.one_to_many(ctx.sid_message(
                "ADDLINE",
                vec![
                    self.kind.letter().to_string(),
                    first,
                    nick,
                    unix_time().to_string(),
                    duration.to_string(),
                    reason,
                ],
            ))
            .await;
        }

        // Enforce at once against local users.
        for other in ctx.database.all_uids() {
            let is_local = ctx
                .database
                .get_user(&other)
                .map(|u| u.is_local())
                .unwrap_or(false);
            if is_local {
                ctx.enforce_xlines(&other).await;
            }
        }
        Ok(())
    }
}
