//! Per-connection session state machine (spec §4.8, §3): the same client
//! connection persists across a player's whole lifetime and across
//! migrations — only the routing fields and state change.
//!
//! State transitions are a single CAS on an `AtomicU8`, the same pattern
//! `citadel-writeback` uses for `businessVersion`/`dbVersion` bookkeeping,
//! generalized from a version counter to a finite state machine so two
//! racing transitions (e.g. a migration completing while the client
//! disconnects) can't both win.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    Connected = 0,
    Authenticated = 1,
    Gaming = 2,
    Migrating = 3,
    Offline = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connected,
            1 => SessionState::Authenticated,
            2 => SessionState::Gaming,
            3 => SessionState::Migrating,
            _ => SessionState::Offline,
        }
    }
}

/// One gate connection's routing state (spec §3's `Session`). `attributes`
/// is a free-form bag for anything a handler wants to stash on the
/// connection (locale, client version, feature flags) without widening
/// this struct per feature.
pub struct Session {
    pub session_id: u64,
    pub account: Mutex<String>,
    player_id: AtomicI64,
    state: AtomicU8,
    last_active: AtomicI64,
    game_server_id: AtomicI64,
    game_addr: Mutex<Option<String>>,
    world_server_id: AtomicI64,
    world_addr: Mutex<Option<String>>,
    alliance_id: AtomicI64,
    alliance_addr: Mutex<Option<String>>,
    attributes: Mutex<std::collections::HashMap<String, String>>,
}

impl Session {
    pub fn new(session_id: u64) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            account: Mutex::new(String::new()),
            player_id: AtomicI64::new(-1),
            state: AtomicU8::new(SessionState::Connected as u8),
            last_active: AtomicI64::new(0),
            game_server_id: AtomicI64::new(0),
            game_addr: Mutex::new(None),
            world_server_id: AtomicI64::new(0),
            world_addr: Mutex::new(None),
            alliance_id: AtomicI64::new(0),
            alliance_addr: Mutex::new(None),
            attributes: Mutex::new(std::collections::HashMap::new()),
        })
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn player_id(&self) -> i64 {
        self.player_id.load(Ordering::SeqCst)
    }

    fn cas(&self, from: SessionState, to: SessionState) -> bool {
        self.state.compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    /// `CONNECTED →auth→ AUTHENTICATED`.
    pub fn authenticate(&self, player_id: i64, account: impl Into<String>) -> bool {
        if self.cas(SessionState::Connected, SessionState::Authenticated) {
            self.player_id.store(player_id, Ordering::SeqCst);
            *self.account.lock() = account.into();
            true
        } else {
            false
        }
    }

    /// `AUTHENTICATED →enterGame→ GAMING`.
    pub fn enter_game(&self, game_server_id: u64, game_addr: impl Into<String>) -> bool {
        if self.cas(SessionState::Authenticated, SessionState::Gaming) {
            self.game_server_id.store(game_server_id as i64, Ordering::SeqCst);
            *self.game_addr.lock() = Some(game_addr.into());
            true
        } else {
            false
        }
    }

    /// Assigns the world a player starts in, alongside `enterGame` — the
    /// state machine (spec §4.8) only names the GAME transition
    /// explicitly, since a player always enters a world together with
    /// their game server. Not a state transition itself, so it can be
    /// called any time before the first migration.
    pub fn set_world(&self, world_server_id: u64, world_addr: impl Into<String>) {
        self.world_server_id.store(world_server_id as i64, Ordering::SeqCst);
        *self.world_addr.lock() = Some(world_addr.into());
    }

    /// Assigns the alliance address, same rationale as [`Session::set_world`].
    pub fn set_alliance(&self, alliance_id: u64, alliance_addr: impl Into<String>) {
        self.alliance_id.store(alliance_id as i64, Ordering::SeqCst);
        *self.alliance_addr.lock() = Some(alliance_addr.into());
    }

    /// `GAMING →startMigration→ MIGRATING`.
    pub fn start_migration(&self) -> bool {
        self.cas(SessionState::Gaming, SessionState::Migrating)
    }

    /// `MIGRATING →cancelMigration→ GAMING`, the rollback path any failed
    /// migration step takes.
    pub fn cancel_migration(&self) -> bool {
        self.cas(SessionState::Migrating, SessionState::Gaming)
    }

    /// `MIGRATING →completeWorldMigration→ GAMING`, atomically updating the
    /// world routing fields alongside the state flip.
    pub fn complete_world_migration(&self, new_world_id: u64, new_world_addr: impl Into<String>) -> bool {
        if self.cas(SessionState::Migrating, SessionState::Gaming) {
            self.world_server_id.store(new_world_id as i64, Ordering::SeqCst);
            *self.world_addr.lock() = Some(new_world_addr.into());
            true
        } else {
            false
        }
    }

    /// `MIGRATING →completeGameMigration→ GAMING`.
    pub fn complete_game_migration(&self, new_game_id: u64, new_game_addr: impl Into<String>) -> bool {
        if self.cas(SessionState::Migrating, SessionState::Gaming) {
            self.game_server_id.store(new_game_id as i64, Ordering::SeqCst);
            *self.game_addr.lock() = Some(new_game_addr.into());
            true
        } else {
            false
        }
    }

    /// `GAMING|MIGRATING →disconnect→ OFFLINE`. Tries both source states
    /// since a disconnect can race a migration.
    pub fn disconnect(&self) -> bool {
        self.cas(SessionState::Gaming, SessionState::Offline)
            || self.cas(SessionState::Migrating, SessionState::Offline)
            || self.cas(SessionState::Authenticated, SessionState::Offline)
            || self.cas(SessionState::Connected, SessionState::Offline)
    }

    pub fn is_migrating(&self) -> bool {
        self.state() == SessionState::Migrating
    }

    pub fn can_route_to_game(&self) -> bool {
        self.state() == SessionState::Gaming && self.game_addr.lock().is_some()
    }

    pub fn can_route_to_world(&self) -> bool {
        self.state() == SessionState::Gaming && self.world_addr.lock().is_some()
    }

    pub fn game_addr(&self) -> Option<String> {
        self.game_addr.lock().clone()
    }

    pub fn world_addr(&self) -> Option<String> {
        self.world_addr.lock().clone()
    }

    pub fn alliance_addr(&self) -> Option<String> {
        self.alliance_addr.lock().clone()
    }

    pub fn game_server_id(&self) -> u64 {
        self.game_server_id.load(Ordering::SeqCst) as u64
    }

    pub fn world_server_id(&self) -> u64 {
        self.world_server_id.load(Ordering::SeqCst) as u64
    }

    pub fn alliance_id(&self) -> u64 {
        self.alliance_id.load(Ordering::SeqCst) as u64
    }

    pub fn touch(&self, now_epoch_secs: i64) {
        self.last_active.store(now_epoch_secs, Ordering::Relaxed);
    }

    pub fn last_active(&self) -> i64 {
        self.last_active.load(Ordering::Relaxed)
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.lock().insert(key.into(), value.into());
    }

    pub fn attribute(&self, key: &str) -> Option<String> {
        self.attributes.lock().get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_lifecycle_transitions_in_order() {
        let session = Session::new(1);
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.authenticate(42, "acct-1"));
        assert_eq!(session.state(), SessionState::Authenticated);
        assert!(session.enter_game(7, "10.0.0.1:9000"));
        assert!(session.can_route_to_game());
        assert!(session.start_migration());
        assert!(session.is_migrating());
        assert!(session.complete_world_migration(9, "10.0.0.9:9100"));
        assert_eq!(session.state(), SessionState::Gaming);
        assert_eq!(session.world_addr().as_deref(), Some("10.0.0.9:9100"));
        assert!(session.disconnect());
        assert_eq!(session.state(), SessionState::Offline);
    }

    #[test]
    fn out_of_order_transition_is_rejected() {
        let session = Session::new(2);
        assert!(!session.enter_game(1, "x"));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn failed_migration_rolls_back_to_gaming() {
        let session = Session::new(3);
        session.authenticate(1, "a");
        session.enter_game(1, "addr");
        assert!(session.start_migration());
        assert!(session.cancel_migration());
        assert_eq!(session.state(), SessionState::Gaming);
    }

    #[test]
    fn double_migration_start_only_succeeds_once() {
        let session = Session::new(4);
        session.authenticate(1, "a");
        session.enter_game(1, "addr");
        assert!(session.start_migration());
        assert!(!session.start_migration());
    }
}
