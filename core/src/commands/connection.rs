//! Registration and connection-maintenance commands
//!
//! NICK, USER, PASS, PING, PONG, QUIT, AWAY. Registration completes
//! when both NICK and USER have been seen; at that point the connection
//! is given a UID, tested against the x-lines, welcomed, and announced
//! to the network.

use crate::commands::{flags, CommandHandler, CommandRegistry};
use crate::context::Context;
use crate::numeric::NumericReply;
use crate::user::{RegistrationState, User};
use crate::utils::{is_valid_nick, unix_time};
use crate::{Message, Prefix, Result};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

pub fn register(registry: &mut CommandRegistry) {
    registry.register("PASS", 1, flags::PRE_REG, Arc::new(PassHandler));
    registry.register("NICK", 0, flags::PRE_REG, Arc::new(NickHandler));
    registry.register("USER", 4, flags::PRE_REG, Arc::new(UserHandler));
    registry.register("PING", 1, flags::PRE_REG, Arc::new(PingHandler));
    registry.register("PONG", 0, flags::PRE_REG, Arc::new(PongHandler));
    registry.register("QUIT", 0, flags::PRE_REG, Arc::new(QuitHandler));
    registry.register("AWAY", 0, 0, Arc::new(AwayHandler));
}

struct PassHandler;

#[async_trait]
impl CommandHandler for PassHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        let Some(mut client) = ctx.clients.get_mut(&conn_id) else {
            return Ok(());
        };
        if client.is_registered() {
            drop(client);
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrAlreadyRegistered,
                vec!["You may not reregister".to_string()],
            );
            return Ok(());
        }
        client.password = Some(message.params[0].clone());
        Ok(())
    }
}

struct NickHandler;

#[async_trait]
impl CommandHandler for NickHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        let Some(new_nick) = message.arg(0).map(String::from) else {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrNoNicknameGiven,
                vec!["No nickname given".to_string()],
            );
            return Ok(());
        };
        if !is_valid_nick(&new_nick, ctx.config.limits.max_nick_length) {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrErroneousNickname,
                vec![new_nick, "Erroneous nickname".to_string()],
            );
            return Ok(());
        }

        let (registered, own_uid) = {
            let Some(client) = ctx.clients.get(&conn_id) else {
                return Ok(());
            };
            (client.is_registered(), client.uid.clone())
        };

        // In use by someone else? A registered user changing only the
        // case of their own nick is allowed through.
        let taken_by_other = match ctx.database.find_uid_by_nick(&new_nick) {
            Some(uid) => Some(uid) != own_uid,
            None => false,
        };
        if taken_by_other {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrNicknameInUse,
                vec![new_nick, "Nickname is already in use".to_string()],
            );
            return Ok(());
        }

        if !registered {
            {
                let Some(mut client) = ctx.clients.get_mut(&conn_id) else {
                    return Ok(());
                };
                client.nick = Some(new_nick);
                client.state = client.state.on_nick();
            }
            try_complete_registration(ctx, conn_id).await;
            return Ok(());
        }

        // Post-registration nick change.
        let uid = own_uid.expect("registered client has a uid");
        let ts = unix_time();
        let old_prefix = ctx.database.get_user(&uid).map(|u| u.prefix());
        if ctx.database.change_nick(&uid, &new_nick, ts).is_err() {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrNicknameInUse,
                vec![new_nick, "Nickname is already in use".to_string()],
            );
            return Ok(());
        }
        if let Some(mut client) = ctx.clients.get_mut(&conn_id) {
            client.nick = Some(new_nick.clone());
        }

        if let Some(prefix) = old_prefix {
            let nick_msg = Message::with_prefix(prefix, "NICK", vec![new_nick.clone()]);
            ctx.send_to_connection(&conn_id, nick_msg.clone());
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

        ctx.one_to_many(Message::with_prefix(
            Prefix::Server(uid.clone()),
            "NICK",
            vec![new_nick, ts.to_string()],
        ))
        .await;

        // A Q-line may cover the new name.
        ctx.enforce_xlines(&uid).await;
        Ok(())
    }
}

struct UserHandler;

#[async_trait]
impl CommandHandler for UserHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        {
            let Some(mut client) = ctx.clients.get_mut(&conn_id) else {
                return Ok(());
            };
            if client.is_registered() {
                drop(client);
                ctx.send_numeric(
                    &conn_id,
                    NumericReply::ErrAlreadyRegistered,
                    vec!["You may not reregister".to_string()],
                );
                return Ok(());
            }
            client.ident = Some(message.params[0].clone());
            client.gecos = Some(message.params[3].clone());
            client.state = client.state.on_user();
        }
        try_complete_registration(ctx, conn_id).await;
        Ok(())
    }
}

struct PingHandler;

#[async_trait]
impl CommandHandler for PingHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        ctx.send_to_connection(
            &conn_id,
            ctx.server_message(
                "PONG",
                vec![ctx.server_name.clone(), message.params[0].clone()],
            ),
        );
        Ok(())
    }
}

struct PongHandler;

#[async_trait]
impl CommandHandler for PongHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, _message: &Message) -> Result<()> {
        if let Some(mut client) = ctx.clients.get_mut(&conn_id) {
            client.timing.record_pong_received();
        }
        Ok(())
    }
}

struct QuitHandler;

#[async_trait]
impl CommandHandler for QuitHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        let reason = message
            .arg(0)
            .map(|r| format!("Quit: {}", r))
            .unwrap_or_else(|| "Client exited".to_string());
        let uid = ctx.clients.get(&conn_id).and_then(|c| c.uid.clone());
        match uid {
            Some(uid) => {
                ctx.quit_user(&uid, &reason, None).await;
            }
            None => ctx.drop_connection(&conn_id, &reason),
        }
        Ok(())
    }
}

struct AwayHandler;

#[async_trait]
impl CommandHandler for AwayHandler {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()> {
        let Some(uid) = ctx.clients.get(&conn_id).and_then(|c| c.uid.clone()) else {
            return Ok(());
        };
        let away = message
            .arg(0)
            .filter(|m| !m.is_empty())
            .map(|m| m.chars().take(ctx.config.limits.max_away_length).collect::<String>());

        if let Some(mut user) = ctx.database.get_user_mut(&uid) {
            user.away = away.clone();
        }
        match away {
            Some(ref text) => {
                ctx.send_numeric(
                    &conn_id,
                    NumericReply::RplNowAway,
                    vec!["You have been marked as being away".to_string()],
                );
                ctx.one_to_many(Message::with_prefix(
                    Prefix::Server(uid.clone()),
                    "AWAY",
                    vec![text.clone()],
                ))
                .await;
            }
            None => {
                ctx.send_numeric(
                    &conn_id,
                    NumericReply::RplUnAway,
                    vec!["You are no longer marked as being away".to_string()],
                );
                ctx.one_to_many(Message::with_prefix(
                    Prefix::Server(uid.clone()),
                    "AWAY",
                    vec![],
                ))
                .await;
            }
        }
        Ok(())
    }
}

/// Finish registration once NICK and USER have both arrived: connection
/// password check, user creation, x-line test, welcome numerics,
/// network announcement.
pub(crate) async fn try_complete_registration(ctx: &Arc<Context>, conn_id: Uuid) {
    let (nick, ident, gecos, hostname, ip, password) = {
        let Some(client) = ctx.clients.get(&conn_id) else {
            return;
        };
        if client.state != RegistrationState::All || client.uid.is_some() {
            return;
        }
        if !client.registration_complete() {
            return;
        }
        (
            client.nick.clone().expect("checked"),
            client.ident.clone().expect("checked"),
            client.gecos.clone().unwrap_or_default(),
            client.hostname.clone(),
            client.ip.clone(),
            client.password.clone(),
        )
    };

    if let Some(ref required) = ctx.config.security.client_password {
        if password.as_deref() != Some(required.as_str()) {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrPasswdMismatch,
                vec!["Password incorrect".to_string()],
            );
            ctx.drop_connection(&conn_id, "Bad password");
            return;
        }
    }

    // The nick may have been grabbed while USER was still outstanding.
    if ctx.database.nick_in_use(&nick) {
        ctx.send_numeric(
            &conn_id,
            NumericReply::ErrNicknameInUse,
            vec![nick, "Nickname is already in use".to_string()],
        );
        if let Some(mut client) = ctx.clients.get_mut(&conn_id) {
            client.nick = None;
            client.state = RegistrationState::UserSeen;
        }
        return;
    }

    let uid = ctx.uid_gen.next_uid();
    let now = unix_time();
    let user = User::new_local(
        uid.clone(),
        nick.clone(),
        ident,
        hostname,
        gecos,
        ip,
        ctx.server_name.clone(),
        conn_id,
        now,
    );
    let hostmask = user.hostmask();
    let user_ip = user.ip.clone();
    if ctx.database.add_user(user).is_err() {
        ctx.drop_connection(&conn_id, "Registration race lost");
        return;
    }
    if let Some(mut client) = ctx.clients.get_mut(&conn_id) {
        client.uid = Some(uid.clone());
    }
    ctx.statistics.note_local_users(ctx.local_user_count());

    // Bans apply the moment the user becomes addressable.
    if ctx.enforce_xlines(&uid).await {
        return;
    }

    send_welcome(ctx, conn_id, &nick).await;

    let uid_line = {
        let user = ctx.database.get_user(&uid).expect("just added");
        Message::with_prefix(
            Prefix::Server(ctx.sid.clone()),
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
        )
    };
    ctx.one_to_many(uid_line).await;
    ctx.snotice('c', format!("Client connecting: {} [{}]", hostmask, user_ip));
}

async fn send_welcome(ctx: &Arc<Context>, conn_id: Uuid, nick: &str) {
    let network = &ctx.config.network.name;
    ctx.send_numeric(
        &conn_id,
        NumericReply::RplWelcome,
        vec![format!("Welcome to the {} IRC Network {}", network, nick)],
    );
    ctx.send_numeric(
        &conn_id,
        NumericReply::RplYourHost,
        vec![format!(
            "Your host is {}, running version {}",
            ctx.server_name, ctx.version
        )],
    );
    ctx.send_numeric(
        &conn_id,
        NumericReply::RplCreated,
        vec![format!(
            "This server was created {}",
            chrono::DateTime::from_timestamp(ctx.started_at, 0)
                .map(|t| t.to_rfc2822())
                .unwrap_or_default()
        )],
    );
    ctx.send_numeric(
        &conn_id,
        NumericReply::RplMyInfo,
        vec![
            ctx.server_name.clone(),
            ctx.version.clone(),
            "iows".to_string(),
            ctx.modes.chanmodes_token().replace(',', ""),
        ],
    );

    let mut tokens = vec![
        format!("NETWORK={}", network),
        "CHANTYPES=#".to_string(),
        format!("CASEMAPPING={}", ctx.config.security.casemapping.token()),
        format!("PREFIX={}", ctx.modes.prefix_token()),
        format!("CHANMODES={}", ctx.modes.chanmodes_token()),
        format!("NICKLEN={}", ctx.config.limits.max_nick_length),
        format!("CHANNELLEN={}", ctx.config.limits.max_channel_name_length),
        format!("TOPICLEN={}", ctx.config.limits.max_topic_length),
        format!("MODES={}", ctx.config.limits.max_modes_per_line),
        format!("MAXCHANNELS={}", ctx.config.limits.max_channels_per_user),
    ];
    tokens.extend(ctx.config.network.isupport.iter().cloned());
    tokens.push("are supported by this server".to_string());
    ctx.send_numeric(&conn_id, NumericReply::RplISupport, tokens);

    queries_lusers(ctx, conn_id).await;
    for reply in ctx.motd.replies(&ctx.server_name, nick) {
        ctx.send_to_connection(&conn_id, reply);
    }
}

/// The LUSERS block, shared between registration and the LUSERS command.
pub(crate) async fn queries_lusers(ctx: &Arc<Context>, conn_id: Uuid) {
    let total = ctx.database.user_count();
    let local = ctx.local_user_count();
    let servers = ctx.tree.read().await.server_count();
    let opers = ctx
        .database
        .all_uids()
        .iter()
        .filter(|uid| {
            ctx.database
                .get_user(uid)
                .map(|u| u.is_oper())
                .unwrap_or(false)
        })
        .count();
    let channels = ctx.database.channel_count();

    ctx.send_numeric(
        &conn_id,
        NumericReply::RplLUserClient,
        vec![format!(
            "There are {} users on {} servers",
            total, servers
        )],
    );
    if opers > 0 {
        ctx.send_numeric(
            &conn_id,
            NumericReply::RplLUserOp,
            vec![opers.to_string(), "operator(s) online".to_string()],
        );
    }
    if channels > 0 {
        ctx.send_numeric(
            &conn_id,
            NumericReply::RplLUserChannels,
            vec![channels.to_string(), "channels formed".to_string()],
        );
    }
    ctx.send_numeric(
        &conn_id,
        NumericReply::RplLUserMe,
        vec![format!(
            "I have {} clients and {} servers",
            local,
            ctx.links.connected_count()
        )],
    );
    ctx.send_numeric(
        &conn_id,
        NumericReply::RplLocalUsers,
        vec![
            local.to_string(),
            ctx.statistics.max_local_users().to_string(),
            format!(
                "Current local users {}, max {}",
                local,
                ctx.statistics.max_local_users()
            ),
        ],
    );
    ctx.send_numeric(
        &conn_id,
        NumericReply::RplGlobalUsers,
        vec![
            total.to_string(),
            total.to_string(),
            format!("Current global users {}", total),
        ],
    );
}
