//! Informational queries: WHOIS, WHO, WHOWAS, USERHOST, ISON, LUSERS,
//! MOTD, ADMIN, VERSION, TIME, STATS, LINKS, MAP, USERS, SUMMON

use crate::commands::connection::queries_lusers;
use crate::commands::{loop_call, CommandHandler, CommandRegistry};
use crate::context::Context;
use crate::numeric::NumericReply;
use crate::utils::{match_mask, unix_time};
use crate::xline::XLineKind;
use crate::{Message, Prefix, Result};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

pub fn register(registry: &mut CommandRegistry) {
    registry.register("WHOIS", 1, 0, Arc::new(WhoisHandler));
    registry.register("WHO", 1, 0, Arc::new(WhoHandler));
    registry.register("WHOWAS", 1, 0, Arc::new(WhowasHandler));
    registry.register("USERHOST", 1, 0, Arc::new(UserhostHandler));
    registry.register("ISON", 1, 0, Arc::new(IsonHandler));
    registry.register("LUSERS", 0, 0, Arc::new(LusersHandler));
    registry.register("MOTD", 0, 0, Arc::new(MotdHandler));
    registry.register("ADMIN", 0, 0, Arc::new(AdminHandler));
    registry.register("VERSION", 0, 0, Arc::new(VersionHandler));
    registry.register("TIME", 0, 0, Arc::new(TimeHandler));
    registry.register("STATS", 1, 0, Arc::new(StatsHandler));
    registry.register("LINKS", 0, 0, Arc::new(LinksHandler));
    registry.register("MAP", 0, 0, Arc::new(MapHandler));
    registry.register("USERS", 0, 0, Arc::new(UsersHandler));
    registry.register("SUMMON", 0, 0, Arc::new(SummonHandler));
}

fn uid_of(ctx: &Context, conn_id: &Uuid) -> Option<String> {
    ctx.clients.get(conn_id).and_then(|c| c.uid.clone())
}

struct WhoisHandler;

#[async_trait]
impl CommandHandler for WhoisHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        if loop_call(self, ctx, conn_id, message, 0).await? {
            return Ok(());
        }
        let target = message.params[0].clone();
        let Some(target_uid) = ctx.resolve_target_uid(&target) else {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrNoSuchNick,
                vec![target.clone(), "No such nick/channel".to_string()],
            );
            ctx.send_numeric(
                &conn_id,
                NumericReply::RplEndOfWhois,
                vec![target, "End of /WHOIS list".to_string()],
            );
            return Ok(());
        };

        let (nick, ident, dhost, gecos, server, is_oper, oper_type, away, is_local, local_id, channels) = {
            let user = ctx.database.get_user(&target_uid).expect("resolved");
            (
                user.nick.clone(),
                user.ident.clone(),
                user.dhost.clone(),
                user.gecos.clone(),
                user.server.clone(),
                user.is_oper(),
                user.oper_type.clone(),
                user.away.clone(),
                user.is_local(),
                user.local_id,
                user.channels.iter().cloned().collect::<Vec<_>>(),
            )
        };

        ctx.send_numeric(
            &conn_id,
            NumericReply::RplWhoisUser,
            vec![nick.clone(), ident, dhost, "*".to_string(), gecos],
        );

        // Channel list, respecting secret channels.
        let viewer_uid = uid_of(ctx, &conn_id);
        let mut chan_entries = Vec::new();
        for channel_name in channels {
            if let Some(channel) = ctx.database.get_channel(&channel_name) {
                let viewer_in = viewer_uid
                    .as_deref()
                    .map(|v| channel.is_member(v))
                    .unwrap_or(false);
                if channel.has_mode('s') && !viewer_in {
                    continue;
                }
                let mut entry = String::new();
                if let Some(symbol) = channel.member_prefix(&target_uid).symbol() {
                    entry.push(symbol);
                }
                entry.push_str(&channel.name);
                chan_entries.push(entry);
            }
        }
        if !chan_entries.is_empty() {
            ctx.send_numeric(
                &conn_id,
                NumericReply::RplWhoisChannels,
                vec![nick.clone(), chan_entries.join(" ")],
            );
        }

        let server_desc = ctx
            .tree
            .read()
            .await
            .find(&server)
            .map(|n| n.description.clone())
            .unwrap_or_default();
        ctx.send_numeric(
            &conn_id,
            NumericReply::RplWhoisServer,
            vec![nick.clone(), server, server_desc],
        );

        if is_oper {
            ctx.send_numeric(
                &conn_id,
                NumericReply::RplWhoisOperator,
                vec![
                    nick.clone(),
                    format!(
                        "is an IRC operator of type {}",
                        oper_type.unwrap_or_else(|| "IRCop".to_string())
                    ),
                ],
            );
        }
        if let Some(away) = away {
            ctx.send_numeric(&conn_id, NumericReply::RplAway, vec![nick.clone(), away]);
        }

        if is_local {
            let (idle, signon) = {
                let idle = local_id
                    .and_then(|id| ctx.clients.get(&id))
                    .map(|c| c.timing.last_activity.elapsed().as_secs())
                    .unwrap_or(0);
                let signon = ctx
                    .database
                    .get_user(&target_uid)
                    .map(|u| u.signon)
                    .unwrap_or(0);
                (idle, signon)
            };
            ctx.send_numeric(
                &conn_id,
                NumericReply::RplWhoisIdle,
                vec![
                    nick.clone(),
                    idle.to_string(),
                    signon.to_string(),
                    "seconds idle, signon time".to_string(),
                ],
            );
        } else if let Some(viewer) = viewer_uid {
            // Ask the owning server; the reply produces a late 317.
            let target_server = ctx
                .database
                .get_user(&target_uid)
                .map(|u| u.server.clone())
                .unwrap_or_default();
            ctx.one_to_one(
                &target_server,
                Message::with_prefix(
                    Prefix::Server(viewer),
                    "IDLE",
                    vec![target_uid.clone()],
                ),
            )
            .await;
        }

        ctx.send_numeric(
            &conn_id,
            NumericReply::RplEndOfWhois,
            vec![nick, "End of /WHOIS list".to_string()],
        );
        Ok(())
    }
}

struct WhoHandler;

#[async_trait]
impl CommandHandler for WhoHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        let mask = message.params[0].clone();
        let mapping = ctx.database.case_mapping();

        let mut rows: Vec<(String, String)> = Vec::new();
        if mask.starts_with('#') {
            if let Some(channel) = ctx.database.get_channel(&mask) {
                for (uid, prefix) in &channel.members {
                    if let Some(user) = ctx.database.get_user(uid) {
                        let mut status = if user.is_away() { "G" } else { "H" }.to_string();
                        if user.is_oper() {
                            status.push('*');
                        }
                        if let Some(symbol) = prefix.symbol() {
                            status.push(symbol);
                        }
                        rows.push((
                            format!(
                                "{} {} {} {} {} {}",
                                channel.name, user.ident, user.dhost, user.server, user.nick, status
                            ),
                            format!("0 {}", user.gecos),
                        ));
                    }
                }
            }
        } else {
            for uid in ctx.database.all_uids() {
                if let Some(user) = ctx.database.get_user(&uid) {
                    if mask != "*"
                        && !match_mask(mapping, &mask, &user.nick)
                        && !match_mask(mapping, &mask, &user.dhost)
                    {
                        continue;
                    }
                    // Invisible users only show through shared channels.
                    if user.has_mode('i') {
                        let viewer = uid_of(ctx, &conn_id);
                        let shares = viewer
                            .and_then(|v| {
                                ctx.database.get_user(&v).map(|me| {
                                    me.channels.iter().any(|c| user.channels.contains(c))
                                })
                            })
                            .unwrap_or(false);
                        if !shares {
                            continue;
                        }
                    }
                    let status = if user.is_away() { "G" } else { "H" };
                    rows.push((
                        format!(
                            "* {} {} {} {} {}",
                            user.ident, user.dhost, user.server, user.nick, status
                        ),
                        format!("0 {}", user.gecos),
                    ));
                }
            }
        }
        for (head, tail) in rows {
            let mut params: Vec<String> = head.split(' ').map(String::from).collect();
            params.push(tail);
            ctx.send_numeric(&conn_id, NumericReply::RplWhoReply, params);
        }
        ctx.send_numeric(
            &conn_id,
            NumericReply::RplEndOfWho,
            vec![mask, "End of /WHO list".to_string()],
        );
        Ok(())
    }
}

struct WhowasHandler;

#[async_trait]
impl CommandHandler for WhowasHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        let nick = message.params[0].clone();
        let entries = ctx.database.whowas_entries(&nick);
        if entries.is_empty() {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrWasNoSuchNick,
                vec![nick.clone(), "There was no such nickname".to_string()],
            );
        } else {
            for entry in entries {
                ctx.send_numeric(
                    &conn_id,
                    NumericReply::RplWhoWasUser,
                    vec![
                        entry.nick,
                        entry.ident,
                        entry.dhost,
                        "*".to_string(),
                        entry.gecos,
                    ],
                );
            }
        }
        ctx.send_numeric(
            &conn_id,
            NumericReply::RplEndOfWhoWas,
            vec![nick, "End of WHOWAS".to_string()],
        );
        Ok(())
    }
}

struct UserhostHandler;

#[async_trait]
impl CommandHandler for UserhostHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        let mut replies = Vec::new();
        for nick in message.params.iter().take(5) {
            if let Some(user) = ctx.database.find_user_by_nick(nick) {
                replies.push(format!(
                    "{}{}={}{}",
                    user.nick,
                    if user.is_oper() { "*" } else { "" },
                    if user.is_away() { "-" } else { "+" },
                    user.user_at_host()
                ));
            }
        }
        ctx.send_numeric(
            &conn_id,
            NumericReply::RplUserhost,
            vec![replies.join(" ")],
        );
        Ok(())
    }
}

struct IsonHandler;

#[async_trait]
impl CommandHandler for IsonHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        let mut online = Vec::new();
        for nick in &message.params {
            for word in nick.split(' ') {
                if let Some(user) = ctx.database.find_user_by_nick(word) {
                    online.push(user.nick.clone());
                }
            }
        }
        ctx.send_numeric(&conn_id, NumericReply::RplIson, vec![online.join(" ")]);
        Ok(())
    }
}

struct LusersHandler;

#[async_trait]
impl CommandHandler for LusersHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, _message: &Message) -> Result<()> {
        queries_lusers(ctx, conn_id).await;
        Ok(())
    }
}

struct MotdHandler;

#[async_trait]
impl CommandHandler for MotdHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, _message: &Message) -> Result<()> {
        let nick = ctx.nick_of_connection(&conn_id).unwrap_or_else(|| "*".into());
        for reply in ctx.motd.replies(&ctx.server_name, &nick) {
            ctx.send_to_connection(&conn_id, reply);
        }
        Ok(())
    }
}

struct AdminHandler;

#[async_trait]
impl CommandHandler for AdminHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, _message: &Message) -> Result<()> {
        let server = &ctx.config.server;
        ctx.send_numeric(
            &conn_id,
            NumericReply::RplAdminMe,
            vec![ctx.server_name.clone(), "Administrative info".to_string()],
        );
        ctx.send_numeric(
            &conn_id,
            NumericReply::RplAdminLoc1,
            vec![server.admin_location1.clone()],
        );
        ctx.send_numeric(
            &conn_id,
            NumericReply::RplAdminLoc2,
            vec![server.admin_location2.clone()],
        );
        ctx.send_numeric(
            &conn_id,
            NumericReply::RplAdminEmail,
            vec![server.admin_email.clone()],
        );
        Ok(())
    }
}

struct VersionHandler;

#[async_trait]
impl CommandHandler for VersionHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, _message: &Message) -> Result<()> {
        ctx.send_numeric(
            &conn_id,
            NumericReply::RplVersion,
            vec![
                ctx.version.clone(),
                ctx.server_name.clone(),
                ctx.config.network.name.clone(),
            ],
        );
        Ok(())
    }
}

struct TimeHandler;

#[async_trait]
impl CommandHandler for TimeHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, _message: &Message) -> Result<()> {
        ctx.send_numeric(
            &conn_id,
            NumericReply::RplTime,
            vec![
                ctx.server_name.clone(),
                chrono::Utc::now().to_rfc2822(),
            ],
        );
        Ok(())
    }
}

struct StatsHandler;

#[async_trait]
impl CommandHandler for StatsHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        let query = message.params[0].clone();
        match query.chars().next() {
            Some('u') => {
                let uptime = unix_time() - ctx.started_at;
                let (days, rem) = (uptime / 86_400, uptime % 86_400);
                ctx.send_numeric(
                    &conn_id,
                    NumericReply::RplStatsUptime,
                    vec![format!(
                        "Server Up {} days, {:02}:{:02}:{:02}",
                        days,
                        rem / 3600,
                        (rem % 3600) / 60,
                        rem % 60
                    )],
                );
            }
            Some('o') => {
                for oper in &ctx.config.network.operators {
                    ctx.send_numeric(
                        &conn_id,
                        NumericReply::RplStatsOLine,
                        vec![
                            "O".to_string(),
                            oper.hostmask.clone(),
                            "*".to_string(),
                            oper.name.clone(),
                        ],
                    );
                }
            }
            Some('k') | Some('g') => {
                let kind = if query.starts_with('k') {
                    XLineKind::K
                } else {
                    XLineKind::G
                };
                for line in ctx.xlines.lines_of(kind) {
                    ctx.send_numeric(
                        &conn_id,
                        NumericReply::RplStatsKLine,
                        vec![
                            kind.letter().to_string(),
                            line.mask,
                            line.setter,
                            line.reason,
                        ],
                    );
                }
            }
            Some('m') => {
                ctx.send_numeric(
                    &conn_id,
                    NumericReply::RplStatsCommands,
                    vec![
                        "TOTAL".to_string(),
                        ctx.statistics
                            .commands_handled
                            .load(std::sync::atomic::Ordering::Relaxed)
                            .to_string(),
                    ],
                );
            }
            _ => {}
        }
        ctx.send_numeric(
            &conn_id,
            NumericReply::RplEndOfStats,
            vec![query, "End of /STATS report".to_string()],
        );
        Ok(())
    }
}

struct LinksHandler;

#[async_trait]
impl CommandHandler for LinksHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, _message: &Message) -> Result<()> {
        let rows: Vec<(String, String, u32, String)> = {
            let tree = ctx.tree.read().await;
            tree.server_names()
                .into_iter()
                .filter_map(|name| tree.find(&name).map(|n| n.clone()))
                .filter(|n| !n.hidden)
                .map(|n| {
                    (
                        n.name.clone(),
                        n.parent.unwrap_or_else(|| ctx.server_name.clone()),
                        n.hops,
                        n.description,
                    )
                })
                .collect()
        };
        for (name, parent, hops, description) in rows {
            ctx.send_numeric(
                &conn_id,
                NumericReply::RplLinks,
                vec![name, parent, format!("{} {}", hops, description)],
            );
        }
        ctx.send_numeric(
            &conn_id,
            NumericReply::RplEndOfLinks,
            vec!["*".to_string(), "End of /LINKS list".to_string()],
        );
        Ok(())
    }
}

struct MapHandler;

#[async_trait]
impl CommandHandler for MapHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, _message: &Message) -> Result<()> {
        let nick = ctx.nick_of_connection(&conn_id).unwrap_or_else(|| "*".into());
        let lines = {
            let tree = ctx.tree.read().await;
            let mut out = Vec::new();
            draw_map(&tree, tree.root_name(), 0, &mut out);
            out
        };
        for line in lines {
            ctx.send_to_connection(
                &conn_id,
                ctx.server_message("NOTICE", vec![nick.clone(), line]),
            );
        }
        Ok(())
    }
}

fn draw_map(tree: &crate::server_tree::ServerTree, name: &str, depth: usize, out: &mut Vec<String>) {
    if let Some(node) = tree.find(name) {
        out.push(format!(
            "{}{} [{} users]",
            "  ".repeat(depth),
            node.name,
            node.user_count
        ));
        for child in &node.children {
            draw_map(tree, child, depth + 1, out);
        }
    }
}

struct UsersHandler;

#[async_trait]
impl CommandHandler for UsersHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, _message: &Message) -> Result<()> {
        ctx.send_numeric(
            &conn_id,
            NumericReply::ErrUsersDisabled,
            vec!["USERS has been disabled".to_string()],
        );
        Ok(())
    }
}

struct SummonHandler;

#[async_trait]
impl CommandHandler for SummonHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, _message: &Message) -> Result<()> {
        ctx.send_numeric(
            &conn_id,
            NumericReply::ErrSummonDisabled,
            vec!["SUMMON has been disabled".to_string()],
        );
        Ok(())
    }
}
