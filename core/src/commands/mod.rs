//! Client command dispatch
//!
//! Commands register a handler with a minimum parameter count and gate
//! flags. Dispatch validates the count and flags, runs the registered
//! pre-command hooks (any of which may suppress the command), invokes
//! the handler and then the post-command hooks. Handlers that accept
//! comma lists fan out through `loop_call`.

pub mod channel;
pub mod connection;
pub mod messaging;
pub mod mode;
pub mod oper;
pub mod queries;

use crate::context::Context;
use crate::numeric::NumericReply;
use crate::utils::comma_split;
use crate::{Message, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Gate flags on a command definition.
pub mod flags {
    /// May be used before registration completes (NICK, USER, PASS..)
    pub const PRE_REG: u8 = 0x01;
    /// Requires oper status
    pub const OPER_ONLY: u8 = 0x02;
}

/// One registered command handler.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, ctx: &Arc<Context>, conn_id: Uuid, message: &Message) -> Result<()>;
}

/// What a pre-command hook decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookVerdict {
    Continue,
    Suppress,
}

/// Observers around command execution.
#[async_trait]
pub trait CommandHook: Send + Sync {
    /// Runs before the handler; `Suppress` stops the command silently.
    async fn pre(&self, _ctx: &Arc<Context>, _conn_id: Uuid, _message: &Message) -> HookVerdict {
        HookVerdict::Continue
    }
    /// Runs after a handler completed without error.
    async fn post(&self, _ctx: &Arc<Context>, _conn_id: Uuid, _message: &Message) {}
}

/// A command table entry.
pub struct CommandDef {
    pub name: &'static str,
    pub min_params: usize,
    pub flags: u8,
    pub handler: Arc<dyn CommandHandler>,
}

/// The command table plus hook chains.
pub struct CommandRegistry {
    commands: HashMap<&'static str, CommandDef>,
    hooks: Vec<Arc<dyn CommandHook>>,
}

impl CommandRegistry {
    /// Build the registry with the full standard command set.
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            commands: HashMap::new(),
            hooks: Vec::new(),
        };
        connection::register(&mut registry);
        channel::register(&mut registry);
        messaging::register(&mut registry);
        mode::register(&mut registry);
        oper::register(&mut registry);
        queries::register(&mut registry);
        registry
    }

    pub fn register(
        &mut self,
        name: &'static str,
        min_params: usize,
        flags: u8,
        handler: Arc<dyn CommandHandler>,
    ) {
        self.commands.insert(
            name,
            CommandDef {
                name,
                min_params,
                flags,
                handler,
            },
        );
    }

    pub fn add_hook(&mut self, hook: Arc<dyn CommandHook>) {
        self.hooks.push(hook);
    }

    pub fn get(&self, name: &str) -> Option<&CommandDef> {
        self.commands.get(name)
    }

    /// Validate and run one client line.
    pub async fn dispatch(
        &self,
        ctx: &Arc<Context>,
        conn_id: Uuid,
        message: &Message,
    ) -> Result<()> {
        let name = message.command.as_str();

        if ctx
            .config
            .channel
            .disabled_commands
            .iter()
            .any(|c| c.eq_ignore_ascii_case(name))
        {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrUnknownCommand,
                vec![name.to_string(), "This command has been disabled".to_string()],
            );
            return Ok(());
        }

        let Some(def) = self.commands.get(name) else {
            ctx.statistics.bump(&ctx.statistics.unknown_commands);
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrUnknownCommand,
                vec![name.to_string(), "Unknown command".to_string()],
            );
            return Ok(());
        };

        let (registered, is_oper) = {
            let Some(client) = ctx.clients.get(&conn_id) else {
                return Ok(());
            };
            let is_oper = client
                .uid
                .as_deref()
                .and_then(|uid| ctx.database.get_user(uid))
                .map(|u| u.is_oper())
                .unwrap_or(false);
            (client.is_registered(), is_oper)
        };

        if def.flags & flags::PRE_REG == 0 && !registered {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrNotRegistered,
                vec!["You have not registered".to_string()],
            );
            return Ok(());
        }
        if def.flags & flags::OPER_ONLY != 0 && !is_oper {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrNoPrivileges,
                vec!["Permission Denied - You do not have the required operator privileges"
                    .to_string()],
            );
            return Ok(());
        }
        if message.params.len() < def.min_params {
            ctx.send_numeric(
                &conn_id,
                NumericReply::ErrNeedMoreParams,
                vec![def.name.to_string(), "Not enough parameters".to_string()],
            );
            return Ok(());
        }

        for hook in &self.hooks {
            if hook.pre(ctx, conn_id, message).await == HookVerdict::Suppress {
                return Ok(());
            }
        }

        ctx.statistics.bump(&ctx.statistics.commands_handled);
        def.handler.handle(ctx, conn_id, message).await?;

        for hook in &self.hooks {
            hook.post(ctx, conn_id, message).await;
        }
        Ok(())
    }
}

/// Comma-list fan-out: when parameter `index` holds more than one comma
/// element, re-invoke the handler once per element and report true so
/// the outer call returns immediately.
pub async fn loop_call<H>(
    handler: &H,
    ctx: &Arc<Context>,
    conn_id: Uuid,
    message: &Message,
    index: usize,
) -> Result<bool>
where
    H: CommandHandler + ?Sized,
{
    let Some(list) = message.params.get(index) else {
        return Ok(false);
    };
    if !list.contains(',') {
        return Ok(false);
    }
    for element in comma_split(list) {
        let mut single = message.clone();
        single.params[index] = element;
        handler.handle(ctx, conn_id, &single).await?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_covers_core_commands() {
        let registry = CommandRegistry::with_defaults();
        for name in [
            "NICK", "USER", "PASS", "PING", "PONG", "QUIT", "JOIN", "PART", "KICK", "MODE",
            "TOPIC", "NAMES", "WHO", "WHOIS", "WHOWAS", "PRIVMSG", "NOTICE", "LUSERS", "LIST",
            "MOTD", "ADMIN", "VERSION", "TIME", "STATS", "LINKS", "MAP", "INVITE", "AWAY",
            "OPER", "KILL", "REHASH", "CONNECT", "SQUIT", "USERHOST", "ISON", "SUMMON", "USERS",
            "WALLOPS",
        ] {
            assert!(registry.get(name).is_some(), "{name} not registered");
        }
    }

    #[test]
    fn test_pre_reg_flags() {
        let registry = CommandRegistry::with_defaults();
        for name in ["NICK", "USER", "PASS", "PING", "PONG", "QUIT"] {
            assert!(
                registry.get(name).unwrap().flags & flags::PRE_REG != 0,
                "{name} should be allowed before registration"
            );
        }
        assert_eq!(registry.get("JOIN").unwrap().flags & flags::PRE_REG, 0);
        assert!(registry.get("KILL").unwrap().flags & flags::OPER_ONLY != 0);
    }
}
