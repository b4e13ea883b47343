//! Server-notice masks
//!
//! Operators subscribe to single-letter notice classes; subsystems raise
//! notices tagged with a letter and the fanout delivers a server NOTICE
//! to every subscribed local oper. Remote snotices arrive via the
//! SNONOTICE verb and feed the same fanout.

use crate::{Message, Prefix};
use dashmap::DashMap;
use std::collections::HashSet;
use tokio::sync::mpsc;
use uuid::Uuid;

/// The notice classes in use.
///
/// `c` local connects/quits, `C` remote connects, `l` link events,
/// `k` kills, `x` x-line activity, `o` oper-ups, `q` netsplits.
pub const SNOMASK_LETTERS: &[char] = &['c', 'C', 'l', 'k', 'x', 'o', 'q'];

/// Subscription registry and fanout.
pub struct SnomaskManager {
    server_name: String,
    /// connection id -> (sender, subscribed letters)
    subscribers: DashMap<Uuid, (mpsc::UnboundedSender<Message>, HashSet<char>)>,
}

impl SnomaskManager {
    pub fn new(server_name: String) -> Self {
        Self {
            server_name,
            subscribers: DashMap::new(),
        }
    }

    /// Subscribe a local oper connection to a set of letters. Letters
    /// outside `SNOMASK_LETTERS` are dropped.
    pub fn subscribe(
        &self,
        id: Uuid,
        sender: mpsc::UnboundedSender<Message>,
        letters: impl IntoIterator<Item = char>,
    ) {
        let letters: HashSet<char> = letters
            .into_iter()
            .filter(|l| SNOMASK_LETTERS.contains(l))
            .collect();
        self.subscribers.insert(id, (sender, letters));
    }

    /// Remove a connection from the fanout entirely.
    pub fn unsubscribe(&self, id: &Uuid) {
        self.subscribers.remove(id);
    }

    /// Letters a connection is subscribed to.
    pub fn letters_for(&self, id: &Uuid) -> HashSet<char> {
        self.subscribers
            .get(id)
            .map(|e| e.1.clone())
            .unwrap_or_default()
    }

    /// Raise a notice on one letter. Returns how many opers got it.
    pub fn notice(&self, letter: char, nick_of: impl Fn(&Uuid) -> Option<String>, text: &str) -> usize {
        let mut delivered = 0;
        for entry in self.subscribers.iter() {
            let (sender, letters) = entry.value();
            if !letters.contains(&letter) {
                continue;
            }
            let target = match nick_of(entry.key()) {
                Some(nick) => nick,
                None => continue,
            };
            let msg = Message::with_prefix(
                Prefix::Server(self.server_name.clone()),
                "NOTICE",
                vec![target, format!("*** {}", text)],
            );
            if sender.send(msg).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fanout_only_to_subscribers() {
        let mgr = SnomaskManager::new("irc.example.net".to_string());
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let id1 = Uuid::new_v4();
        let id2 = Uuid::new_v4();
        mgr.subscribe(id1, tx1, ['l', 'k']);
        mgr.subscribe(id2, tx2, ['c']);

        let nick_of = |id: &Uuid| {
            Some(if *id == id1 { "oper1" } else { "oper2" }.to_string())
        };

        let delivered = mgr.notice('l', nick_of, "link up");
        assert_eq!(delivered, 1);
        let msg = rx1.try_recv().unwrap();
        assert_eq!(msg.command, "NOTICE");
        assert_eq!(msg.params[1], "*** link up");
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_unknown_letters_dropped() {
        let mgr = SnomaskManager::new("irc.example.net".to_string());
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        mgr.subscribe(id, tx, ['z', 'l']);
        let letters = mgr.letters_for(&id);
        assert!(letters.contains(&'l'));
        assert!(!letters.contains(&'z'));
    }

    #[test]
    fn test_unsubscribe() {
        let mgr = SnomaskManager::new("irc.example.net".to_string());
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        mgr.subscribe(id, tx, ['l']);
        mgr.unsubscribe(&id);
        assert_eq!(mgr.notice('l', |_| Some("x".into()), "gone"), 0);
    }
}
