//! The spanning tree of known servers and route computation
//!
//! Every server on the network appears exactly once in the tree. We are
//! the root; servers we hold a socket to are children of the root, and
//! everything else hangs below whichever peer introduced it. Routing a
//! message to a server means finding the direct child whose subtree
//! contains it; the tree itself is pure data and the link layer maps the
//! resulting peer names onto sockets.

use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// One node in the server tree.
#[derive(Debug, Clone)]
pub struct TreeServer {
    pub name: String,
    pub description: String,
    pub sid: String,
    /// Parent server name; None for the root
    pub parent: Option<String>,
    /// The child-of-root through which this server is reached; equals
    /// our own child's name, and the node's own name iff parent == root
    pub route: Option<String>,
    pub children: Vec<String>,
    /// Connection id of the local link socket; None for non-adjacent servers
    pub link_id: Option<Uuid>,
    pub hops: u32,
    pub version: String,
    /// Still replaying its burst
    pub bursting: bool,
    /// Last time we sent this server a PING
    pub last_ping: Option<i64>,
    /// The last PING was answered
    pub ping_answered: bool,
    pub user_count: usize,
    pub hidden: bool,
}

/// The tree, indexed by name and by SID.
pub struct ServerTree {
    root: String,
    nodes: HashMap<String, TreeServer>,
    sids: HashMap<String, String>,
}

impl ServerTree {
    /// Create a tree containing only ourselves.
    pub fn new(name: String, description: String, sid: String) -> Self {
        let mut nodes = HashMap::new();
        let mut sids = HashMap::new();
        sids.insert(sid.clone(), name.clone());
        nodes.insert(
            name.clone(),
            TreeServer {
                name: name.clone(),
                description,
                sid,
                parent: None,
                route: None,
                children: Vec::new(),
                link_id: None,
                hops: 0,
                version: String::new(),
                bursting: false,
                last_ping: None,
                ping_answered: true,
                user_count: 0,
                hidden: false,
            },
        );
        Self {
            root: name,
            nodes,
            sids,
        }
    }

    pub fn root_name(&self) -> &str {
        &self.root
    }

    pub fn is_root(&self, name: &str) -> bool {
        self.root == name
    }

    pub fn find(&self, name: &str) -> Option<&TreeServer> {
        self.nodes.get(name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut TreeServer> {
        self.nodes.get_mut(name)
    }

    pub fn find_by_sid(&self, sid: &str) -> Option<&TreeServer> {
        self.sids.get(sid).and_then(|name| self.nodes.get(name))
    }

    pub fn server_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn server_names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Add a server under `parent`. Duplicate names or SIDs are
    /// protocol violations at the link layer, so they error here.
    pub fn add_server(
        &mut self,
        parent: &str,
        name: String,
        description: String,
        sid: String,
        link_id: Option<Uuid>,
    ) -> Result<()> {
        if self.nodes.contains_key(&name) {
            return Err(Error::ProtocolViolation(format!(
                "server {} already exists",
                name
            )));
        }
        if self.sids.contains_key(&sid) {
            return Err(Error::ProtocolViolation(format!(
                "SID {} already in use",
                sid
            )));
        }
        let parent_node = self
            .nodes
            .get(parent)
            .ok_or_else(|| Error::NoSuchTarget(parent.to_string()))?;
        let hops = parent_node.hops + 1;
        // Attached directly to us: the node routes through itself.
        // Deeper: it routes wherever its parent routes.
        let route = if parent == self.root {
            Some(name.clone())
        } else {
            parent_node.route.clone()
        };

        self.nodes.get_mut(parent).expect("checked above").children.push(name.clone());
        self.sids.insert(sid.clone(), name.clone());
        self.nodes.insert(
            name.clone(),
            TreeServer {
                name,
                description,
                sid,
                parent: Some(parent.to_string()),
                route,
                children: Vec::new(),
                link_id,
                hops,
                version: String::new(),
                bursting: false,
                last_ping: None,
                ping_answered: true,
                user_count: 0,
                hidden: false,
            },
        );
        Ok(())
    }

    /// Remove a server and its whole subtree (squit). Returns the names
    /// of every removed server, leaves first.
    pub fn remove_subtree(&mut self, name: &str) -> Vec<String> {
        if name == self.root || !self.nodes.contains_key(name) {
            return Vec::new();
        }
        let mut removed = Vec::new();
        self.collect_subtree(name, &mut removed);
        // collect_subtree pushes parents before children; reverse for
        // leaves-first destruction order.
        removed.reverse();
        for server in &removed {
            if let Some(node) = self.nodes.remove(server) {
                self.sids.remove(&node.sid);
                if let Some(parent) = node.parent {
                    if let Some(p) = self.nodes.get_mut(&parent) {
                        p.children.retain(|c| c != server);
                    }
                }
            }
        }
        removed
    }

    fn collect_subtree(&self, name: &str, out: &mut Vec<String>) {
        out.push(name.to_string());
        if let Some(node) = self.nodes.get(name) {
            for child in &node.children {
                self.collect_subtree(child, out);
            }
        }
    }

    /// The direct child of the root through which `name` is reached.
    /// None when `name` is the root itself or unknown.
    pub fn best_route_to(&self, name: &str) -> Option<&TreeServer> {
        if name == self.root {
            return None;
        }
        let node = self.nodes.get(name)?;
        let route = node.route.as_ref()?;
        self.nodes.get(route)
    }

    /// Resolve a name or SID to a server node.
    pub fn resolve(&self, name_or_sid: &str) -> Option<&TreeServer> {
        self.nodes
            .get(name_or_sid)
            .or_else(|| self.find_by_sid(name_or_sid))
    }

    /// Names of directly connected peers (children of the root that hold
    /// a link socket).
    pub fn direct_peers(&self) -> Vec<String> {
        self.nodes
            .get(&self.root)
            .map(|root| {
                root.children
                    .iter()
                    .filter(|c| {
                        self.nodes
                            .get(*c)
                            .map(|n| n.link_id.is_some())
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Direct peers except the one `omit` is reached through.
    pub fn peers_except(&self, omit: Option<&str>) -> Vec<String> {
        let omit_route = omit.and_then(|o| {
            if self.is_root(o) {
                None
            } else {
                self.nodes.get(o).and_then(|n| n.route.clone())
            }
        });
        self.direct_peers()
            .into_iter()
            .filter(|p| Some(p.as_str()) != omit_route.as_deref())
            .collect()
    }

    /// The minimal set of direct peers needed to reach every server in
    /// `targets`, excluding the branch `omit` came through. Used for
    /// channel message fanout: one copy down each needed branch.
    pub fn branches_for<'a>(
        &self,
        targets: impl Iterator<Item = &'a str>,
        omit: Option<&str>,
    ) -> HashSet<String> {
        let omit_route = omit.and_then(|o| {
            if self.is_root(o) {
                None
            } else {
                self.nodes.get(o).and_then(|n| n.route.clone())
            }
        });
        let mut branches = HashSet::new();
        for target in targets {
            if target == self.root {
                continue;
            }
            if let Some(route) = self.best_route_to(target) {
                if Some(route.name.as_str()) != omit_route.as_deref() {
                    branches.insert(route.name.clone());
                }
            }
        }
        branches
    }

    /// Servers listed in burst order: parents always before children.
    pub fn burst_order(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_subtree(&self.root, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// root -> hub1 -> leaf1
    ///      \-> hub2 -> leaf2 -> leaf3
    fn sample_tree() -> ServerTree {
        let mut tree = ServerTree::new(
            "root.example.net".into(),
            "root".into(),
            "000".into(),
        );
        tree.add_server(
            "root.example.net",
            "hub1.example.net".into(),
            "hub1".into(),
            "001".into(),
            Some(Uuid::new_v4()),
        )
        .unwrap();
        tree.add_server(
            "root.example.net",
            "hub2.example.net".into(),
            "hub2".into(),
            "002".into(),
            Some(Uuid::new_v4()),
        )
        .unwrap();
        tree.add_server(
            "hub1.example.net",
            "leaf1.example.net".into(),
            "leaf1".into(),
            "003".into(),
            None,
        )
        .unwrap();
        tree.add_server(
            "hub2.example.net",
            "leaf2.example.net".into(),
            "leaf2".into(),
            "004".into(),
            None,
        )
        .unwrap();
        tree.add_server(
            "leaf2.example.net",
            "leaf3.example.net".into(),
            "leaf3".into(),
            "005".into(),
            None,
        )
        .unwrap();
        tree
    }

    #[test]
    fn test_best_route() {
        let tree = sample_tree();
        assert_eq!(
            tree.best_route_to("leaf3.example.net").unwrap().name,
            "hub2.example.net"
        );
        assert_eq!(
            tree.best_route_to("leaf1.example.net").unwrap().name,
            "hub1.example.net"
        );
        // A direct peer routes through itself.
        assert_eq!(
            tree.best_route_to("hub1.example.net").unwrap().name,
            "hub1.example.net"
        );
        assert!(tree.best_route_to("root.example.net").is_none());
    }

    #[test]
    fn test_route_invariant_holds_for_all_nodes() {
        let tree = sample_tree();
        for name in tree.server_names() {
            if tree.is_root(&name) {
                continue;
            }
            let node = tree.find(&name).unwrap();
            let is_direct = node.parent.as_deref() == Some(tree.root_name());
            assert_eq!(
                node.route.as_deref() == Some(name.as_str()),
                is_direct,
                "route==self iff parent==root, violated for {name}"
            );
        }
    }

    #[test]
    fn test_duplicate_name_and_sid_rejected() {
        let mut tree = sample_tree();
        assert!(tree
            .add_server(
                "root.example.net",
                "hub1.example.net".into(),
                "dup".into(),
                "009".into(),
                None
            )
            .is_err());
        assert!(tree
            .add_server(
                "root.example.net",
                "new.example.net".into(),
                "new".into(),
                "001".into(),
                None
            )
            .is_err());
    }

    #[test]
    fn test_remove_subtree_leaves_first() {
        let mut tree = sample_tree();
        let removed = tree.remove_subtree("hub2.example.net");
        assert_eq!(
            removed,
            vec![
                "leaf3.example.net".to_string(),
                "leaf2.example.net".to_string(),
                "hub2.example.net".to_string(),
            ]
        );
        assert_eq!(tree.server_count(), 3);
        assert!(tree.find_by_sid("004").is_none());
        assert!(!tree
            .find("root.example.net")
            .unwrap()
            .children
            .contains(&"hub2.example.net".to_string()));
    }

    #[test]
    fn test_branches_for_fanout() {
        let tree = sample_tree();
        let targets = ["leaf1.example.net", "leaf3.example.net", "root.example.net"];
        let branches = tree.branches_for(targets.iter().copied(), None);
        assert_eq!(branches.len(), 2);
        assert!(branches.contains("hub1.example.net"));
        assert!(branches.contains("hub2.example.net"));

        // Omitting the sender's branch drops it from the set.
        let branches =
            tree.branches_for(targets.iter().copied(), Some("leaf3.example.net"));
        assert_eq!(branches.len(), 1);
        assert!(branches.contains("hub1.example.net"));
    }

    #[test]
    fn test_peers_except() {
        let tree = sample_tree();
        let peers = tree.peers_except(Some("leaf2.example.net"));
        assert_eq!(peers, vec!["hub1.example.net".to_string()]);
        assert_eq!(tree.peers_except(None).len(), 2);
    }

    #[test]
    fn test_burst_order_parents_first() {
        let tree = sample_tree();
        let order = tree.burst_order();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("hub2.example.net") < pos("leaf2.example.net"));
        assert!(pos("leaf2.example.net") < pos("leaf3.example.net"));
        assert_eq!(pos("root.example.net"), 0);
    }

    #[test]
    fn test_resolve_by_sid() {
        let tree = sample_tree();
        assert_eq!(
            tree.resolve("004").unwrap().name,
            "leaf2.example.net"
        );
        assert_eq!(
            tree.resolve("hub1.example.net").unwrap().sid,
            "001"
        );
    }
}
