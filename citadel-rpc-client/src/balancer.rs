//! Load balancing over a service's candidate addresses (spec §4.5 step 3).
//!
//! Three strategies: uniform random, weight-proportional random, and
//! consistent hashing on the caller-supplied routing key (e.g. a player
//! id), so repeated calls for the same key keep landing on the same
//! instance as long as the candidate set is stable.

use std::collections::{BTreeMap, HashMap, VecDeque};

use citadel_discovery::ServiceInstance;
use parking_lot::Mutex;
use rand::Rng;

/// Virtual nodes hashed onto the ring per real instance, each contributing
/// four ring points (one per 4-byte slice of its MD5 digest) — 160 ring
/// points per instance in total, per spec §4.5.
const VNODES_PER_INSTANCE: usize = 40;
const RING_CACHE_CAP: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalanceStrategy {
    Random,
    WeightedRandom,
    ConsistentHash,
}

/// Ring lookups are cached by routing key so a hot key doesn't re-walk the
/// `BTreeMap` every call. Capped at [`RING_CACHE_CAP`] entries; spec §4.5
/// calls for an "LRU-approximate" cache that evicts half its entries when
/// full rather than a strict one-at-a-time LRU eviction, so a burst of new
/// keys doesn't thrash it back down to capacity+1 repeatedly.
struct RingCache {
    order: VecDeque<String>,
    map: HashMap<String, String>,
}

impl RingCache {
    fn new() -> Self {
        Self { order: VecDeque::new(), map: HashMap::new() }
    }

    fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).cloned()
    }

    fn insert(&mut self, key: String, address: String) {
        if self.map.len() >= RING_CACHE_CAP {
            let evict = RING_CACHE_CAP / 2;
            for _ in 0..evict {
                if let Some(oldest) = self.order.pop_front() {
                    self.map.remove(&oldest);
                } else {
                    break;
                }
            }
        }
        self.order.push_back(key.clone());
        self.map.insert(key, address);
    }

    fn invalidate(&mut self) {
        self.order.clear();
        self.map.clear();
    }
}

/// A hash ring built from the current candidate set, plus the lookup
/// cache layered in front of it.
pub struct ConsistentHashRing {
    ring: BTreeMap<u32, String>,
    cache: Mutex<RingCache>,
}

impl ConsistentHashRing {
    pub fn build(instances: &[ServiceInstance]) -> Self {
        let mut ring = BTreeMap::new();
        for instance in instances {
            for vnode in 0..VNODES_PER_INSTANCE {
                let digest = md5::compute(format!("{}-{}", instance.address, vnode));
                for slice in digest.0.chunks_exact(4) {
                    let point = u32::from_be_bytes(slice.try_into().unwrap());
                    ring.insert(point, instance.address.clone());
                }
            }
        }
        Self { ring, cache: Mutex::new(RingCache::new()) }
    }

    /// Picks the instance whose ring point is the first at or after
    /// `hash(key)`, wrapping around to the smallest point if none is
    /// larger (standard consistent-hash ring walk).
    pub fn route(&self, key: &str) -> Option<String> {
        if let Some(cached) = self.cache.lock().get(key) {
            return Some(cached);
        }
        if self.ring.is_empty() {
            return None;
        }
        let digest = md5::compute(key);
        let point = u32::from_be_bytes(digest.0[0..4].try_into().unwrap());
        let address = self
            .ring
            .range(point..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, addr)| addr.clone())?;
        self.cache.lock().insert(key.to_string(), address.clone());
        Some(address)
    }
}

/// Selects a target address from a candidate list. Holds the consistent
/// hash ring so it can be rebuilt only when the candidate set actually
/// changes (discovery notifies on every change; callers pass the new list
/// straight through).
pub struct LoadBalancer {
    strategy: LoadBalanceStrategy,
    ring: Mutex<Option<(Vec<String>, ConsistentHashRing)>>,
}

impl LoadBalancer {
    pub fn new(strategy: LoadBalanceStrategy) -> Self {
        Self { strategy, ring: Mutex::new(None) }
    }

    /// `routing_key` is only consulted for [`LoadBalanceStrategy::ConsistentHash`]
    /// (e.g. a stringified player id); other strategies ignore it.
    pub fn select<'a>(&self, instances: &'a [ServiceInstance], routing_key: &str) -> Option<&'a ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        match self.strategy {
            LoadBalanceStrategy::Random => {
                let idx = rand::rng().random_range(0..instances.len());
                instances.get(idx)
            }
            LoadBalanceStrategy::WeightedRandom => {
                let total: u32 = instances.iter().map(|i| i.weight.max(1)).sum();
                let mut pick = rand::rng().random_range(0..total);
                for instance in instances {
                    let w = instance.weight.max(1);
                    if pick < w {
                        return Some(instance);
                    }
                    pick -= w;
                }
                instances.last()
            }
            LoadBalanceStrategy::ConsistentHash => {
                let addresses: Vec<String> = instances.iter().map(|i| i.address.clone()).collect();
                let mut guard = self.ring.lock();
                let needs_rebuild = match &*guard {
                    Some((known, _)) => known != &addresses,
                    None => true,
                };
                if needs_rebuild {
                    *guard = Some((addresses.clone(), ConsistentHashRing::build(instances)));
                }
                let (_, ring) = guard.as_ref().unwrap();
                let chosen_addr = ring.route(routing_key)?;
                drop(guard);
                instances.iter().find(|i| i.address == chosen_addr)
            }
        }
    }

    /// Forces a ring rebuild (and cache invalidation) on the next `select`
    /// call, e.g. after a service-offline notification.
    pub fn invalidate(&self) {
        if let Some((_, ring)) = self.ring.lock().as_ref() {
            ring.cache.lock().invalidate();
        }
        *self.ring.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn instance(address: &str, weight: u32) -> ServiceInstance {
        ServiceInstance {
            service_key: format!("IGameService#{address}"),
            address: address.to_string(),
            server_id: 0,
            weight,
            status: citadel_discovery::ServiceStatus::Up,
            metadata: HashMap::new(),
            register_time: 0,
        }
    }

    #[test]
    fn consistent_hash_is_sticky_for_a_fixed_key() {
        let instances = vec![instance("a:1", 1), instance("b:1", 1), instance("c:1", 1)];
        let balancer = LoadBalancer::new(LoadBalanceStrategy::ConsistentHash);
        let first = balancer.select(&instances, "player-42").unwrap().address.clone();
        for _ in 0..1000 {
            let again = balancer.select(&instances, "player-42").unwrap().address.clone();
            assert_eq!(again, first);
        }
    }

    #[test]
    fn weighted_random_never_picks_zero_probability_when_weight_dominates() {
        let instances = vec![instance("a:1", 100), instance("b:1", 1)];
        let balancer = LoadBalancer::new(LoadBalanceStrategy::WeightedRandom);
        let mut a_count = 0;
        for _ in 0..200 {
            if balancer.select(&instances, "x").unwrap().address == "a:1" {
                a_count += 1;
            }
        }
        assert!(a_count > 150, "expected weighted random to favor the heavier instance, got {a_count}/200");
    }

    #[test]
    fn ring_cache_evicts_half_when_full() {
        let instances: Vec<ServiceInstance> = (0..4).map(|i| instance(&format!("addr-{i}"), 1)).collect();
        let ring = ConsistentHashRing::build(&instances);
        for i in 0..1500 {
            ring.route(&format!("key-{i}"));
        }
        let cache = ring.cache.lock();
        assert!(cache.map.len() <= RING_CACHE_CAP);
    }
}
