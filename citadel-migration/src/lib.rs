//! Migration coordinator (spec §4.9, C9): orchestrates WORLD, GAME, and
//! FULL player migrations as a staged save/load/commit sequence wrapped in
//! an overall deadline, rolling the session back to `GAMING` on any failed
//! step.
//!
//! Generalizes the deadline-wrapped, rollback-on-failure staged commit
//! shape of a distributed transaction coordinator (the same "any step
//! fails, unwind to the prior state" structure as a two-phase commit) from
//! "commit a replicated put" to "commit a player's routing fields to a new
//! world/game server." The RPC steps themselves are an injectable trait,
//! the same way `citadel-writeback` takes its persistence backend as a
//! `Lander` trait instead of a concrete client dependency.

use std::sync::Arc;

use async_trait::async_trait;
use citadel_config::MigrationConfig;
use citadel_errors::{CitadelError, MigrationErrorCode};
use citadel_gate::Session;
use dashmap::DashMap;
use tracing::{info, instrument, warn};

/// The RPC calls a migration makes into the source/target world and game
/// servers, and the client notification at the end. A production
/// implementation wires this to `citadel-rpc-client::ServiceProxy`; tests
/// and this crate's own unit tests use an in-memory fake.
#[async_trait]
pub trait MigrationRpc: Send + Sync {
    async fn save_world_region(&self, player_id: i64, world_addr: &str) -> Result<(), CitadelError>;
    async fn load_world_data(&self, player_id: i64, world_addr: &str) -> Result<(), CitadelError>;
    async fn save_game_state(&self, player_id: i64, game_addr: &str) -> Result<(), CitadelError>;
    async fn load_game_state(&self, player_id: i64, game_addr: &str) -> Result<(), CitadelError>;
    async fn notify_client(&self, session: &Session, message: &str);
}

#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub new_world_id: Option<u64>,
    pub new_game_id: Option<u64>,
}

fn migration_error(code: MigrationErrorCode, message: impl Into<String>) -> CitadelError {
    CitadelError::Migration { code, message: message.into() }
}

/// RAII handle on the per-player in-flight guard: removes the player's
/// entry when the migration attempt (success, failure, or timeout) ends,
/// whichever branch returns first.
struct InFlightGuard<'a> {
    map: &'a DashMap<i64, ()>,
    player_id: i64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.player_id);
    }
}

/// Orchestrates migrations for one process. Construct once per gate/world
/// process and share behind an `Arc`.
pub struct MigrationCoordinator<R: MigrationRpc> {
    rpc: Arc<R>,
    config: MigrationConfig,
    in_flight: DashMap<i64, ()>,
}

impl<R: MigrationRpc> MigrationCoordinator<R> {
    pub fn new(rpc: Arc<R>, config: MigrationConfig) -> Self {
        Self { rpc, config, in_flight: DashMap::new() }
    }

    fn claim(&self, player_id: i64) -> Result<InFlightGuard<'_>, CitadelError> {
        if self.in_flight.insert(player_id, ()).is_some() {
            return Err(migration_error(MigrationErrorCode::InProgress, format!("migration already in-flight for player {player_id}")));
        }
        Ok(InFlightGuard { map: &self.in_flight, player_id })
    }

    async fn with_deadline<F>(&self, session: &Session, fut: F) -> Result<MigrationOutcome, CitadelError>
    where
        F: std::future::Future<Output = Result<MigrationOutcome, CitadelError>>,
    {
        match tokio::time::timeout(self.config.deadline(), fut).await {
            Ok(result) => result,
            Err(_) => {
                session.cancel_migration();
                Err(migration_error(MigrationErrorCode::CoordinatorException, "migration deadline exceeded"))
            }
        }
    }

    /// The common case: migrate a player to a new world server, the
    /// player's game server untouched.
    #[instrument(skip(self, session))]
    pub async fn migrate_world(&self, session: &Arc<Session>, new_world_id: u64, new_world_addr: &str) -> Result<MigrationOutcome, CitadelError> {
        if !session.can_route_to_world() {
            return Err(migration_error(MigrationErrorCode::CannotStart, "session cannot currently route to world"));
        }
        let player_id = session.player_id();
        let _guard = self.claim(player_id)?;
        self.with_deadline(session, self.run_world_steps(session, new_world_id, new_world_addr)).await
    }

    async fn run_world_steps(&self, session: &Session, new_world_id: u64, new_world_addr: &str) -> Result<MigrationOutcome, CitadelError> {
        if !session.start_migration() {
            return Err(migration_error(MigrationErrorCode::StateNotAllowed, "session is not in GAMING state"));
        }
        let source_addr = session.world_addr().unwrap_or_default();
        if let Err(error) = self.rpc.save_world_region(session.player_id(), &source_addr).await {
            warn!(%error, "world region save failed, rolling back");
            session.cancel_migration();
            return Err(migration_error(MigrationErrorCode::SaveFailed, error.to_string()));
        }
        if let Err(error) = self.rpc.load_world_data(session.player_id(), new_world_addr).await {
            warn!(%error, "world data load failed, rolling back");
            session.cancel_migration();
            return Err(migration_error(MigrationErrorCode::LoadFailed, error.to_string()));
        }
        if !session.complete_world_migration(new_world_id, new_world_addr) {
            session.cancel_migration();
            return Err(migration_error(MigrationErrorCode::RouteUpdateFailed, "failed to commit new world routing fields"));
        }
        self.rpc.notify_client(session, "world migration complete").await;
        info!(player_id = session.player_id(), new_world_id, "world migration committed");
        Ok(MigrationOutcome { new_world_id: Some(new_world_id), new_game_id: None })
    }

    /// Rare: migrate a player to a new game server, world untouched.
    #[instrument(skip(self, session))]
    pub async fn migrate_game(&self, session: &Arc<Session>, new_game_id: u64, new_game_addr: &str) -> Result<MigrationOutcome, CitadelError> {
        if !session.can_route_to_game() {
            return Err(migration_error(MigrationErrorCode::CannotStart, "session cannot currently route to game"));
        }
        let player_id = session.player_id();
        let _guard = self.claim(player_id)?;
        self.with_deadline(session, self.run_game_steps(session, new_game_id, new_game_addr)).await
    }

    async fn run_game_steps(&self, session: &Session, new_game_id: u64, new_game_addr: &str) -> Result<MigrationOutcome, CitadelError> {
        if !session.start_migration() {
            return Err(migration_error(MigrationErrorCode::StateNotAllowed, "session is not in GAMING state"));
        }
        let source_addr = session.game_addr().unwrap_or_default();
        if let Err(error) = self.rpc.save_game_state(session.player_id(), &source_addr).await {
            warn!(%error, "game state save failed, rolling back");
            session.cancel_migration();
            return Err(migration_error(MigrationErrorCode::SaveFailed, error.to_string()));
        }
        if let Err(error) = self.rpc.load_game_state(session.player_id(), new_game_addr).await {
            warn!(%error, "game state load failed, rolling back");
            session.cancel_migration();
            return Err(migration_error(MigrationErrorCode::LoadFailed, error.to_string()));
        }
        if !session.complete_game_migration(new_game_id, new_game_addr) {
            session.cancel_migration();
            return Err(migration_error(MigrationErrorCode::RouteUpdateFailed, "failed to commit new game routing fields"));
        }
        self.rpc.notify_client(session, "game migration complete").await;
        info!(player_id = session.player_id(), new_game_id, "game migration committed");
        Ok(MigrationOutcome { new_world_id: None, new_game_id: Some(new_game_id) })
    }

    /// Both planes move together: save-game, save-world, load-game,
    /// load-world, commit, notify — the ordering spec §4.9 calls out
    /// explicitly for FULL migrations.
    #[instrument(skip(self, session))]
    pub async fn migrate_full(
        &self,
        session: &Arc<Session>,
        new_game_id: u64,
        new_game_addr: &str,
        new_world_id: u64,
        new_world_addr: &str,
    ) -> Result<MigrationOutcome, CitadelError> {
        if !session.can_route_to_game() || !session.can_route_to_world() {
            return Err(migration_error(MigrationErrorCode::CannotStart, "session cannot currently route to game and world"));
        }
        let player_id = session.player_id();
        let _guard = self.claim(player_id)?;
        self.with_deadline(session, self.run_full_steps(session, new_game_id, new_game_addr, new_world_id, new_world_addr))
            .await
    }

    async fn run_full_steps(
        &self,
        session: &Session,
        new_game_id: u64,
        new_game_addr: &str,
        new_world_id: u64,
        new_world_addr: &str,
    ) -> Result<MigrationOutcome, CitadelError> {
        if !session.start_migration() {
            return Err(migration_error(MigrationErrorCode::StateNotAllowed, "session is not in GAMING state"));
        }
        let player_id = session.player_id();
        let source_game_addr = session.game_addr().unwrap_or_default();
        let source_world_addr = session.world_addr().unwrap_or_default();

        if let Err(error) = self.rpc.save_game_state(player_id, &source_game_addr).await {
            warn!(%error, "full migration: game save failed, rolling back");
            session.cancel_migration();
            return Err(migration_error(MigrationErrorCode::SaveFailed, error.to_string()));
        }
        if let Err(error) = self.rpc.save_world_region(player_id, &source_world_addr).await {
            warn!(%error, "full migration: world save failed, rolling back");
            session.cancel_migration();
            return Err(migration_error(MigrationErrorCode::SaveFailed, error.to_string()));
        }
        if let Err(error) = self.rpc.load_game_state(player_id, new_game_addr).await {
            warn!(%error, "full migration: game load failed, rolling back");
            session.cancel_migration();
            return Err(migration_error(MigrationErrorCode::LoadFailed, error.to_string()));
        }
        if let Err(error) = self.rpc.load_world_data(player_id, new_world_addr).await {
            warn!(%error, "full migration: world load failed, rolling back");
            session.cancel_migration();
            return Err(migration_error(MigrationErrorCode::LoadFailed, error.to_string()));
        }
        if !session.complete_game_migration(new_game_id, new_game_addr) {
            session.cancel_migration();
            return Err(migration_error(MigrationErrorCode::RouteUpdateFailed, "failed to commit new game routing fields"));
        }
        if !session.complete_world_migration(new_world_id, new_world_addr) {
            session.cancel_migration();
            return Err(migration_error(MigrationErrorCode::RouteUpdateFailed, "failed to commit new world routing fields"));
        }
        self.rpc.notify_client(session, "full migration complete").await;
        info!(player_id, new_game_id, new_world_id, "full migration committed");
        Ok(MigrationOutcome { new_world_id: Some(new_world_id), new_game_id: Some(new_game_id) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct FakeRpc {
        fail_load: AtomicBool,
        sleep_on_save: Option<Duration>,
    }

    impl FakeRpc {
        fn new() -> Self {
            Self { fail_load: AtomicBool::new(false), sleep_on_save: None }
        }
    }

    #[async_trait]
    impl MigrationRpc for FakeRpc {
        async fn save_world_region(&self, _player_id: i64, _world_addr: &str) -> Result<(), CitadelError> {
            if let Some(delay) = self.sleep_on_save {
                tokio::time::sleep(delay).await;
            }
            Ok(())
        }
        async fn load_world_data(&self, _player_id: i64, _world_addr: &str) -> Result<(), CitadelError> {
            if self.fail_load.load(Ordering::SeqCst) {
                Err(CitadelError::Transport("world service unreachable".to_string()))
            } else {
                Ok(())
            }
        }
        async fn save_game_state(&self, _player_id: i64, _game_addr: &str) -> Result<(), CitadelError> {
            Ok(())
        }
        async fn load_game_state(&self, _player_id: i64, _game_addr: &str) -> Result<(), CitadelError> {
            Ok(())
        }
        async fn notify_client(&self, _session: &Session, _message: &str) {}
    }

    fn gaming_session(player_id: i64) -> Arc<Session> {
        let session = Session::new(1);
        session.authenticate(player_id, "acct");
        session.enter_game(1, "game-addr:9000");
        session.set_world(1, "world-addr:9100");
        session
    }

    #[tokio::test]
    async fn world_migration_commits_and_returns_to_gaming() {
        let session = gaming_session(7);

        let rpc = Arc::new(FakeRpc::new());
        let config = MigrationConfig::default();
        let coordinator = MigrationCoordinator::new(rpc, config);

        let result = coordinator.migrate_world(&session, 2, "world-addr-2:9100").await.unwrap();
        assert_eq!(result.new_world_id, Some(2));
        assert_eq!(session.state(), citadel_gate::SessionState::Gaming);
        assert_eq!(session.world_addr().as_deref(), Some("world-addr-2:9100"));
    }

    #[tokio::test]
    async fn failed_load_rolls_back_to_gaming() {
        let session = gaming_session(8);

        let rpc = Arc::new(FakeRpc::new());
        rpc.fail_load.store(true, Ordering::SeqCst);
        let coordinator = MigrationCoordinator::new(rpc, MigrationConfig::default());

        let result = coordinator.migrate_world(&session, 2, "world-addr-2:9100").await;
        assert!(result.is_err());
        assert_eq!(session.state(), citadel_gate::SessionState::Gaming);
        assert_eq!(session.world_addr().as_deref(), Some("world-addr:9100"));
    }

    #[tokio::test]
    async fn concurrent_migration_for_same_player_is_rejected() {
        let session = gaming_session(9);

        let rpc = Arc::new(FakeRpc { fail_load: AtomicBool::new(false), sleep_on_save: Some(Duration::from_millis(100)) });
        let coordinator = Arc::new(MigrationCoordinator::new(rpc, MigrationConfig::default()));

        let first = {
            let coordinator = coordinator.clone();
            let session = session.clone();
            tokio::spawn(async move { coordinator.migrate_world(&session, 2, "world-addr-2:9100").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = coordinator.migrate_world(&session, 3, "world-addr-3:9100").await;

        assert!(matches!(second, Err(CitadelError::Migration { code: MigrationErrorCode::InProgress, .. })));
        first.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_exceeded_rolls_back() {
        let session = gaming_session(10);

        let rpc = Arc::new(FakeRpc { fail_load: AtomicBool::new(false), sleep_on_save: Some(Duration::from_secs(60)) });
        let config = MigrationConfig { deadline_sec: 1 };
        let coordinator = MigrationCoordinator::new(rpc, config);

        let result = coordinator.migrate_world(&session, 2, "world-addr-2:9100").await;
        assert!(matches!(result, Err(CitadelError::Migration { code: MigrationErrorCode::CoordinatorException, .. })));
        assert_eq!(session.state(), citadel_gate::SessionState::Gaming);
    }
}
