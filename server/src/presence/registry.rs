//! Connection registry: who is online, across how many tabs.
//!
//! A named user may hold several connections at once (tabs, reconnects);
//! each one is tracked with its own last-seen timestamp so the reaper can
//! drop a dead tab without dropping the whole session. Connections without a
//! display name are tracked individually as anonymous identities.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Opaque id assigned to a transport connection when it attaches.
pub type ConnectionId = String;

/// The identity a connection counts towards in the online total.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Named(String),
    Anonymous(ConnectionId),
}

/// Result of a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRef {
    pub identity: Identity,
    /// True when this registration created a new session or anonymous entry
    /// rather than refreshing an existing one.
    pub is_new: bool,
}

#[derive(Debug)]
struct Session {
    connections: HashSet<ConnectionId>,
    tabs: HashSet<String>,
    last_active: Instant,
}

impl Session {
    fn new(now: Instant) -> Self {
        Self {
            connections: HashSet::new(),
            tabs: HashSet::new(),
            last_active: now,
        }
    }
}

#[derive(Debug)]
pub struct ConnectionRegistry {
    /// display_name -> session
    sessions: HashMap<String, Session>,
    /// connection_id -> last seen, for connections without a name
    anonymous: HashMap<ConnectionId, Instant>,
    /// connection_id -> owning identity (one owner per connection)
    owners: HashMap<ConnectionId, Identity>,
    /// connection_id -> last seen, for connections inside named sessions
    connection_seen: HashMap<ConnectionId, Instant>,
    connection_tabs: HashMap<ConnectionId, String>,
    /// tab_id -> display_name (lookup only)
    tabs: HashMap<String, String>,
    stale_after: Duration,
}

impl ConnectionRegistry {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            anonymous: HashMap::new(),
            owners: HashMap::new(),
            connection_seen: HashMap::new(),
            connection_tabs: HashMap::new(),
            tabs: HashMap::new(),
            stale_after,
        }
    }

    /// Register a connection under a display name, or anonymously when the
    /// name is absent or blank.
    ///
    /// Re-registering a connection under the identity it already has only
    /// refreshes it. Registering it under a different identity moves it.
    pub fn register(
        &mut self,
        connection_id: &str,
        display_name: Option<&str>,
        tab_id: Option<&str>,
        now: Instant,
    ) -> SessionRef {
        let name = display_name.map(str::trim).filter(|n| !n.is_empty());
        let tab = tab_id.map(str::trim).filter(|t| !t.is_empty());

        match name {
            None => self.register_anonymous(connection_id, now),
            Some(name) => self.register_named(connection_id, name, tab, now),
        }
    }

    fn register_anonymous(&mut self, connection_id: &str, now: Instant) -> SessionRef {
        let identity = Identity::Anonymous(connection_id.to_string());
        match self.owners.get(connection_id) {
            Some(Identity::Anonymous(_)) => {
                self.anonymous.insert(connection_id.to_string(), now);
                return SessionRef {
                    identity,
                    is_new: false,
                };
            }
            Some(Identity::Named(_)) => {
                self.remove_connection(connection_id);
            }
            None => {}
        }

        self.anonymous.insert(connection_id.to_string(), now);
        self.owners
            .insert(connection_id.to_string(), identity.clone());
        SessionRef {
            identity,
            is_new: true,
        }
    }

    fn register_named(
        &mut self,
        connection_id: &str,
        name: &str,
        tab: Option<&str>,
        now: Instant,
    ) -> SessionRef {
        let identity = Identity::Named(name.to_string());
        let already_owned = self.owners.get(connection_id) == Some(&identity);
        if !already_owned && self.owners.contains_key(connection_id) {
            self.remove_connection(connection_id);
        }

        let is_new = !self.sessions.contains_key(name);
        let session = self
            .sessions
            .entry(name.to_string())
            .or_insert_with(|| Session::new(now));
        session.connections.insert(connection_id.to_string());
        session.last_active = now;

        if let Some(tab) = tab {
            session.tabs.insert(tab.to_string());
            self.tabs.insert(tab.to_string(), name.to_string());
            if let Some(previous) = self
                .connection_tabs
                .insert(connection_id.to_string(), tab.to_string())
            {
                if previous != tab {
                    self.forget_tab_if_unused(name, &previous);
                }
            }
        }

        self.owners
            .insert(connection_id.to_string(), identity.clone());
        self.connection_seen.insert(connection_id.to_string(), now);

        SessionRef { identity, is_new }
    }

    /// Move a connection under a new display name, merging it into an
    /// existing session for that name when there is one. The connection's
    /// tab travels with it.
    pub fn rename(&mut self, connection_id: &str, display_name: &str, now: Instant) -> SessionRef {
        let tab = self.connection_tabs.get(connection_id).cloned();
        self.register(connection_id, Some(display_name), tab.as_deref(), now)
    }

    /// Refresh a connection's last-activity timestamp. Unknown connections
    /// are ignored; returns whether the connection was known.
    pub fn touch(&mut self, connection_id: &str, now: Instant) -> bool {
        match self.owners.get(connection_id) {
            Some(Identity::Named(name)) => {
                if let Some(session) = self.sessions.get_mut(name) {
                    session.last_active = now;
                }
                self.connection_seen.insert(connection_id.to_string(), now);
                true
            }
            Some(Identity::Anonymous(_)) => {
                self.anonymous.insert(connection_id.to_string(), now);
                true
            }
            None => false,
        }
    }

    /// Remove a connection. Returns true when this removed the last
    /// connection of its identity, i.e. someone actually went offline.
    pub fn unregister(&mut self, connection_id: &str) -> bool {
        self.remove_connection(connection_id)
    }

    fn remove_connection(&mut self, connection_id: &str) -> bool {
        let Some(identity) = self.owners.remove(connection_id) else {
            return false;
        };
        self.connection_seen.remove(connection_id);
        let tab = self.connection_tabs.remove(connection_id);

        match identity {
            Identity::Anonymous(_) => self.anonymous.remove(connection_id).is_some(),
            Identity::Named(name) => {
                let emptied = match self.sessions.get_mut(&name) {
                    Some(session) => {
                        session.connections.remove(connection_id);
                        session.connections.is_empty()
                    }
                    None => return false,
                };

                if emptied {
                    if let Some(session) = self.sessions.remove(&name) {
                        for tab in session.tabs {
                            if self.tabs.get(&tab) == Some(&name) {
                                self.tabs.remove(&tab);
                            }
                        }
                    }
                    return true;
                }

                if let Some(tab) = tab {
                    self.forget_tab_if_unused(&name, &tab);
                }
                false
            }
        }
    }

    /// Drop a tab from a session once no remaining connection uses it.
    fn forget_tab_if_unused(&mut self, name: &str, tab: &str) {
        let Some(session) = self.sessions.get_mut(name) else {
            return;
        };
        let in_use = session
            .connections
            .iter()
            .any(|c| self.connection_tabs.get(c).map(String::as_str) == Some(tab));
        if !in_use {
            session.tabs.remove(tab);
            if self.tabs.get(tab).map(String::as_str) == Some(name) {
                self.tabs.remove(tab);
            }
        }
    }

    /// Number of distinct identities online: named sessions plus anonymous
    /// connections.
    pub fn count(&self) -> usize {
        self.sessions.len() + self.anonymous.len()
    }

    /// Evict everything that has not been seen within the staleness
    /// threshold. A session that is stale as a whole goes at once; otherwise
    /// its individual connections are checked against their own timestamps.
    ///
    /// Returns the removed connection ids.
    pub fn reap(&mut self, now: Instant) -> Vec<ConnectionId> {
        let stale_after = self.stale_after;
        let is_stale = |seen: Instant| now.saturating_duration_since(seen) > stale_after;

        let mut removed = Vec::new();
        for session in self.sessions.values() {
            if is_stale(session.last_active) {
                removed.extend(session.connections.iter().cloned());
                continue;
            }
            for connection_id in &session.connections {
                let stale = self
                    .connection_seen
                    .get(connection_id)
                    .map(|seen| is_stale(*seen))
                    .unwrap_or(true);
                if stale {
                    removed.push(connection_id.clone());
                }
            }
        }
        removed.extend(
            self.anonymous
                .iter()
                .filter(|(_, seen)| is_stale(**seen))
                .map(|(id, _)| id.clone()),
        );

        for connection_id in &removed {
            self.remove_connection(connection_id);
        }
        removed
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.owners.contains_key(connection_id)
    }

    #[cfg(test)]
    /// Display name a tab belongs to.
    pub fn tab_owner(&self, tab_id: &str) -> Option<&str> {
        self.tabs.get(tab_id).map(String::as_str)
    }

    #[cfg(test)]
    /// Number of live connections held by a named session.
    pub fn session_connections(&self, display_name: &str) -> usize {
        self.sessions
            .get(display_name)
            .map(|s| s.connections.len())
            .unwrap_or(0)
    }

    /// Every registered connection, named or anonymous.
    pub fn connection_ids(&self) -> impl Iterator<Item = &ConnectionId> {
        self.owners.keys()
    }
}
