//! Protocol router (spec §4.8): an ordered list of `{protoIdRange, target,
//! requireAuth}` rules with a per-id cache, resolving a target address
//! either from the session's own routing fields or, for stateless
//! global services, from discovery.

use std::ops::RangeInclusive;
use std::sync::Arc;

use citadel_discovery::{Discovery, ServiceStatus};
use dashmap::DashMap;

use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    Login,
    Game,
    World,
    Alliance,
    Local,
}

/// One routing rule. `proto_range` covers the inclusive span of protocol
/// ids this rule answers for; `description` is purely diagnostic.
pub struct RouteRule {
    pub proto_range: RangeInclusive<u16>,
    pub target: RouteTarget,
    pub require_auth: bool,
    pub description: &'static str,
}

#[derive(Debug, Clone)]
pub enum RouteOutcome {
    Success { target: RouteTarget, address: String, message: String },
    AuthRequired,
    Migrating,
    NoTarget,
}

impl RouteOutcome {
    /// The HTTP-flavored status code spec §4.8 assigns to each outcome.
    pub fn code(&self) -> u16 {
        match self {
            RouteOutcome::Success { .. } => 200,
            RouteOutcome::AuthRequired => 401,
            RouteOutcome::Migrating => 503,
            RouteOutcome::NoTarget => 502,
        }
    }
}

/// Holds the ordered rule table plus a per-protoId rule-index cache so a
/// hot path doesn't re-scan the range list on every packet.
pub struct Router {
    rules: Vec<RouteRule>,
    cache: DashMap<u16, usize>,
    discovery: Arc<dyn Discovery>,
}

impl Router {
    pub fn new(rules: Vec<RouteRule>, discovery: Arc<dyn Discovery>) -> Self {
        Self { rules, cache: DashMap::new(), discovery }
    }

    fn rule_for(&self, proto_id: u16) -> Option<&RouteRule> {
        if let Some(index) = self.cache.get(&proto_id) {
            return self.rules.get(*index);
        }
        let found = self.rules.iter().position(|rule| rule.proto_range.contains(&proto_id));
        if let Some(index) = found {
            self.cache.insert(proto_id, index);
        }
        found.map(|index| &self.rules[index])
    }

    /// Resolves `protoId` against `session`'s routing state, per spec
    /// §4.8's five-step algorithm. A rule miss defaults to `Game`, same as
    /// the original.
    pub async fn route(&self, session: &Session, proto_id: u16) -> RouteOutcome {
        let (target, require_auth) = match self.rule_for(proto_id) {
            Some(rule) => (rule.target, rule.require_auth),
            None => (RouteTarget::Game, false),
        };

        if require_auth && session.player_id() <= 0 {
            return RouteOutcome::AuthRequired;
        }
        if session.is_migrating() && target != RouteTarget::Local {
            return RouteOutcome::Migrating;
        }

        let address = match target {
            RouteTarget::Game => session.game_addr(),
            RouteTarget::World => session.world_addr(),
            RouteTarget::Alliance => session.alliance_addr(),
            RouteTarget::Login => self.discover_global("ILoginService").await,
            RouteTarget::Local => Some("local".to_string()),
        };

        match address {
            Some(address) => RouteOutcome::Success { target, address, message: "ok".to_string() },
            None => RouteOutcome::NoTarget,
        }
    }

    async fn discover_global(&self, interface: &str) -> Option<String> {
        let instances = self.discovery.discover(interface, 0).await.ok()?;
        instances.into_iter().find(|i| i.status == ServiceStatus::Up).map(|i| i.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use citadel_discovery::InMemoryDiscovery;

    fn rules() -> Vec<RouteRule> {
        vec![
            RouteRule { proto_range: 1..=99, target: RouteTarget::Login, require_auth: false, description: "login" },
            RouteRule { proto_range: 100..=199, target: RouteTarget::Game, require_auth: true, description: "game" },
            RouteRule { proto_range: 200..=299, target: RouteTarget::World, require_auth: true, description: "world" },
        ]
    }

    #[tokio::test]
    async fn requires_auth_before_routing_to_game() {
        let discovery: Arc<dyn Discovery> = Arc::new(InMemoryDiscovery::new());
        let router = Router::new(rules(), discovery);
        let session = Session::new(1);
        let outcome = router.route(&session, 100).await;
        assert_eq!(outcome.code(), 401);
    }

    #[tokio::test]
    async fn rejects_routing_while_migrating() {
        let discovery: Arc<dyn Discovery> = Arc::new(InMemoryDiscovery::new());
        let router = Router::new(rules(), discovery);
        let session = Session::new(1);
        session.authenticate(7, "acct");
        session.enter_game(1, "10.0.0.1:9000");
        session.start_migration();
        let outcome = router.route(&session, 100).await;
        assert_eq!(outcome.code(), 503);
    }

    #[tokio::test]
    async fn routes_to_game_address_once_authenticated() {
        let discovery: Arc<dyn Discovery> = Arc::new(InMemoryDiscovery::new());
        let router = Router::new(rules(), discovery);
        let session = Session::new(1);
        session.authenticate(7, "acct");
        session.enter_game(1, "10.0.0.1:9000");
        let outcome = router.route(&session, 100).await;
        match outcome {
            RouteOutcome::Success { target, address, .. } => {
                assert_eq!(target, RouteTarget::Game);
                assert_eq!(address, "10.0.0.1:9000");
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_target_address_yields_no_target() {
        let discovery: Arc<dyn Discovery> = Arc::new(InMemoryDiscovery::new());
        let router = Router::new(rules(), discovery);
        let session = Session::new(1);
        session.authenticate(7, "acct");
        session.enter_game(1, "10.0.0.1:9000");
        let outcome = router.route(&session, 200).await;
        assert_eq!(outcome.code(), 502);
    }
}
