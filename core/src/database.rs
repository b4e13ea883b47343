//! In-memory registries for users, channels and WHOWAS history
//!
//! All lookup tables live here so the uniqueness and membership
//! invariants can be maintained in one place: a fully registered user
//! appears exactly once in the nick hash and once in the UID hash, and a
//! user is in a channel's member map iff the channel is in the user's
//! back-index. Membership is only ever mutated through `add_member` /
//! `remove_member`.

use crate::casemap::CaseMapping;
use crate::channel::{Channel, MemberPrefix};
use crate::user::User;
use crate::{Error, Result};
use dashmap::mapref::one::{Ref, RefMut};
use dashmap::DashMap;
use std::collections::VecDeque;

/// A WHOWAS history entry.
#[derive(Debug, Clone)]
pub struct WhowasEntry {
    pub nick: String,
    pub ident: String,
    pub dhost: String,
    pub gecos: String,
    pub server: String,
    pub signoff: i64,
}

/// The in-memory data store.
pub struct Database {
    /// Users by UID
    users: DashMap<String, User>,
    /// Folded nick -> UID
    nicks: DashMap<String, String>,
    /// Channels by folded name
    channels: DashMap<String, Channel>,
    /// WHOWAS ring per folded nick
    whowas: DashMap<String, VecDeque<WhowasEntry>>,
    /// Case mapping used for all name folding
    mapping: CaseMapping,
    /// WHOWAS entries kept per nick
    whowas_depth: usize,
}

impl Database {
    pub fn new(mapping: CaseMapping, whowas_depth: usize) -> Self {
        Self {
            users: DashMap::new(),
            nicks: DashMap::new(),
            channels: DashMap::new(),
            whowas: DashMap::new(),
            mapping,
            whowas_depth,
        }
    }

    pub fn case_mapping(&self) -> CaseMapping {
        self.mapping
    }

    // --- users ---------------------------------------------------------

    /// Introduce a fully registered user into the hashes.
    pub fn add_user(&self, user: User) -> Result<()> {
        let folded = self.mapping.fold(&user.nick);
        if self.users.contains_key(&user.uid) {
            return Err(Error::User(format!("duplicate UID {}", user.uid)));
        }
        if self.nicks.contains_key(&folded) {
            return Err(Error::NickInUse(user.nick.clone()));
        }
        self.nicks.insert(folded, user.uid.clone());
        self.users.insert(user.uid.clone(), user);
        Ok(())
    }

    /// Remove a user, purging every membership. Idempotent: a second
    /// call for the same UID finds nothing and does nothing.
    ///
    /// Returns the removed user and the names of channels that became
    /// empty and were destroyed.
    pub fn remove_user(&self, uid: &str, signoff: i64) -> Option<(User, Vec<String>)> {
        let (_, user) = self.users.remove(uid)?;
        let folded = self.mapping.fold(&user.nick);
        // Only unhash the nick if it still points at this user; a
        // collision winner may already own the name.
        if let Some(entry) = self.nicks.get(&folded) {
            if *entry == uid {
                drop(entry);
                self.nicks.remove(&folded);
            }
        }

        let mut destroyed = Vec::new();
        for channel_name in &user.channels {
            let key = self.mapping.fold(channel_name);
            let mut remove = false;
            if let Some(mut channel) = self.channels.get_mut(&key) {
                channel.members.remove(uid);
                remove = channel.members.is_empty();
            }
            if remove {
                if let Some((_, chan)) = self.channels.remove(&key) {
                    destroyed.push(chan.name);
                }
            }
        }

        self.push_whowas(&user, signoff);
        Some((user, destroyed))
    }

    fn push_whowas(&self, user: &User, signoff: i64) {
        let entry = WhowasEntry {
            nick: user.nick.clone(),
            ident: user.ident.clone(),
            dhost: user.dhost.clone(),
            gecos: user.gecos.clone(),
            server: user.server.clone(),
            signoff,
        };
        let mut ring = self
            .whowas
            .entry(self.mapping.fold(&user.nick))
            .or_default();
        ring.push_front(entry);
        ring.truncate(self.whowas_depth);
    }

    pub fn get_user(&self, uid: &str) -> Option<Ref<'_, String, User>> {
        self.users.get(uid)
    }

    pub fn get_user_mut(&self, uid: &str) -> Option<RefMut<'_, String, User>> {
        self.users.get_mut(uid)
    }

    pub fn find_uid_by_nick(&self, nick: &str) -> Option<String> {
        self.nicks.get(&self.mapping.fold(nick)).map(|r| r.clone())
    }

    pub fn find_user_by_nick(&self, nick: &str) -> Option<Ref<'_, String, User>> {
        let uid = self.find_uid_by_nick(nick)?;
        self.users.get(&uid)
    }

    pub fn nick_in_use(&self, nick: &str) -> bool {
        self.nicks.contains_key(&self.mapping.fold(nick))
    }

    /// Change a user's nick, updating the hash and nick TS.
    pub fn change_nick(&self, uid: &str, new_nick: &str, ts: i64) -> Result<()> {
        let folded_new = self.mapping.fold(new_nick);
        let mut user = self
            .users
            .get_mut(uid)
            .ok_or_else(|| Error::NoSuchTarget(uid.to_string()))?;
        let folded_old = self.mapping.fold(&user.nick);
        if folded_old != folded_new && self.nicks.contains_key(&folded_new) {
            return Err(Error::NickInUse(new_nick.to_string()));
        }
        self.push_whowas(&user, ts);
        self.nicks.remove(&folded_old);
        self.nicks.insert(folded_new, uid.to_string());
        user.nick = new_nick.to_string();
        user.ts = ts;
        Ok(())
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// All UIDs currently known. Snapshot, for iteration with mutation.
    pub fn all_uids(&self) -> Vec<String> {
        self.users.iter().map(|e| e.key().clone()).collect()
    }

    /// UIDs of users on the given server.
    pub fn uids_on_server(&self, server: &str) -> Vec<String> {
        self.users
            .iter()
            .filter(|e| e.server == server)
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn whowas_entries(&self, nick: &str) -> Vec<WhowasEntry> {
        self.whowas
            .get(&self.mapping.fold(nick))
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    // --- channels ------------------------------------------------------

    pub fn get_channel(&self, name: &str) -> Option<Ref<'_, String, Channel>> {
        self.channels.get(&self.mapping.fold(name))
    }

    pub fn get_channel_mut(&self, name: &str) -> Option<RefMut<'_, String, Channel>> {
        self.channels.get_mut(&self.mapping.fold(name))
    }

    pub fn channel_exists(&self, name: &str) -> bool {
        self.channels.contains_key(&self.mapping.fold(name))
    }

    /// Create the channel if absent. Returns whether it was created.
    pub fn create_channel(&self, name: &str, ts: i64) -> bool {
        let key = self.mapping.fold(name);
        if self.channels.contains_key(&key) {
            return false;
        }
        self.channels.insert(key, Channel::new(name.to_string(), ts));
        true
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn all_channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|e| e.name.clone()).collect()
    }

    /// Put a user into a channel with the given status, maintaining both
    /// sides of the membership relation.
    pub fn add_member(&self, channel_name: &str, uid: &str, prefix: MemberPrefix) -> Result<()> {
        let key = self.mapping.fold(channel_name);
        let mut channel = self
            .channels
            .get_mut(&key)
            .ok_or_else(|| Error::NoSuchTarget(channel_name.to_string()))?;
        let display_name = channel.name.clone();
        channel.members.insert(uid.to_string(), prefix);
        drop(channel);

        let mut user = self
            .users
            .get_mut(uid)
            .ok_or_else(|| Error::NoSuchTarget(uid.to_string()))?;
        user.channels.insert(display_name);
        Ok(())
    }

    /// Remove a user from a channel. Destroys the channel when the last
    /// member leaves; returns true in that case.
    pub fn remove_member(&self, channel_name: &str, uid: &str) -> bool {
        let key = self.mapping.fold(channel_name);
        let mut destroyed = false;
        let mut display_name = None;
        if let Some(mut channel) = self.channels.get_mut(&key) {
            channel.members.remove(uid);
            display_name = Some(channel.name.clone());
            destroyed = channel.members.is_empty();
        }
        if destroyed {
            self.channels.remove(&key);
        }
        if let Some(name) = display_name {
            if let Some(mut user) = self.users.get_mut(uid) {
                user.channels.remove(&name);
            }
        }
        destroyed
    }

    /// Member UIDs of a channel, optionally requiring a minimum status
    /// rank (for `@#chan` / `+#chan` targets).
    pub fn channel_members(&self, name: &str, min_rank: u32) -> Vec<String> {
        self.get_channel(name)
            .map(|chan| {
                chan.members
                    .iter()
                    .filter(|(_, p)| p.rank() >= min_rank)
                    .map(|(uid, _)| uid.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}
