//! Backend selection strategies.
//!
//! Every strategy chooses among the candidate list it is handed on each call;
//! none of them remembers a backend set of its own. A backend that disappears
//! from the candidates therefore can never be returned again, including by the
//! sticky strategy, which treats a cached backend that is no longer a candidate
//! as a miss.
use std::{
    num::NonZeroUsize,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use lru::LruCache;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default capacity of the sticky load balancer cache.
pub const DEFAULT_STICKY_CACHE_SIZE: usize = 10_000;

/// Errors raised by load balancing strategies
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LoadBalancerError {
    /// The candidate backend set was empty
    #[error("No backend available")]
    NoBackendAvailable,

    /// Unknown strategy name in configuration
    #[error("Unknown load balancer '{0}', expected random, round-robin or sticky")]
    UnknownStrategy(String),
}

/// Trait defining the interface for load balancing strategies
pub trait LoadBalancer: Send + Sync + 'static {
    /// Select a backend from a non-empty candidate list.
    ///
    /// `request_key` identifies the client; only the sticky strategy uses it.
    fn choose(&self, candidates: &[String], request_key: &str)
    -> Result<String, LoadBalancerError>;

    /// Strategy kind, for diagnostics.
    fn kind(&self) -> LoadBalancerKind;

    /// Create a new instance of this strategy as a shared trait object
    fn shared(self) -> Arc<dyn LoadBalancer>
    where
        Self: Sized,
    {
        Arc::new(self)
    }
}

/// Round-robin load balancing strategy
pub struct RoundRobinLoadBalancer {
    counter: AtomicUsize,
}

impl Default for RoundRobinLoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobinLoadBalancer {
    /// Create a new round-robin strategy
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancer for RoundRobinLoadBalancer {
    fn choose(
        &self,
        candidates: &[String],
        _request_key: &str,
    ) -> Result<String, LoadBalancerError> {
        if candidates.is_empty() {
            return Err(LoadBalancerError::NoBackendAvailable);
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(candidates[count % candidates.len()].clone())
    }

    fn kind(&self) -> LoadBalancerKind {
        LoadBalancerKind::RoundRobin
    }
}

/// Random selection load balancing strategy
#[derive(Default)]
pub struct RandomLoadBalancer;

impl RandomLoadBalancer {
    /// Create a new random selection strategy
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for RandomLoadBalancer {
    fn choose(
        &self,
        candidates: &[String],
        _request_key: &str,
    ) -> Result<String, LoadBalancerError> {
        if candidates.is_empty() {
            return Err(LoadBalancerError::NoBackendAvailable);
        }
        let index = rand::rng().random_range(0..candidates.len());
        Ok(candidates[index].clone())
    }

    fn kind(&self) -> LoadBalancerKind {
        LoadBalancerKind::Random
    }
}

/// Sticky strategy: the same request key keeps hitting the same backend while
/// that backend stays a candidate. Misses fall through to round-robin.
pub struct StickyLoadBalancer {
    cache: Mutex<LruCache<String, String>>,
    fallback: RoundRobinLoadBalancer,
}

impl StickyLoadBalancer {
    /// Create a sticky strategy remembering at most `capacity` clients.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            fallback: RoundRobinLoadBalancer::new(),
        }
    }

    /// Number of cached client → backend assignments.
    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.cache.lock().cap().get()
    }
}

impl Default for StickyLoadBalancer {
    fn default() -> Self {
        Self::new(DEFAULT_STICKY_CACHE_SIZE)
    }
}

impl LoadBalancer for StickyLoadBalancer {
    fn choose(
        &self,
        candidates: &[String],
        request_key: &str,
    ) -> Result<String, LoadBalancerError> {
        if candidates.is_empty() {
            return Err(LoadBalancerError::NoBackendAvailable);
        }

        // Held across lookup and insert so two racing misses for the same key
        // agree on one backend.
        let mut cache = self.cache.lock();
        if let Some(cached) = cache.get(request_key) {
            if candidates.contains(cached) {
                return Ok(cached.clone());
            }
            tracing::debug!(
                request_key,
                backend = %cached,
                "Sticky backend is no longer a candidate, re-selecting"
            );
            cache.pop(request_key);
        }

        let chosen = self.fallback.choose(candidates, request_key)?;
        cache.put(request_key.to_string(), chosen.clone());
        Ok(chosen)
    }

    fn kind(&self) -> LoadBalancerKind {
        LoadBalancerKind::Sticky
    }
}

/// Strategy names accepted in configuration.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalancerKind {
    #[serde(rename = "random")]
    Random,
    #[default]
    #[serde(rename = "round-robin", alias = "round_robin", alias = "roundrobin")]
    RoundRobin,
    #[serde(rename = "sticky")]
    Sticky,
}

impl LoadBalancerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancerKind::Random => "random",
            LoadBalancerKind::RoundRobin => "round-robin",
            LoadBalancerKind::Sticky => "sticky",
        }
    }
}

impl FromStr for LoadBalancerKind {
    type Err = LoadBalancerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "random" => Ok(LoadBalancerKind::Random),
            "round-robin" | "round_robin" | "roundrobin" => Ok(LoadBalancerKind::RoundRobin),
            "sticky" => Ok(LoadBalancerKind::Sticky),
            _ => Err(LoadBalancerError::UnknownStrategy(s.to_string())),
        }
    }
}

impl std::fmt::Display for LoadBalancerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Factory creating a fresh strategy instance per backend set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadBalancerFactory {
    kind: LoadBalancerKind,
    sticky_cache_size: usize,
}

impl Default for LoadBalancerFactory {
    fn default() -> Self {
        Self::new(LoadBalancerKind::default(), DEFAULT_STICKY_CACHE_SIZE)
    }
}

impl LoadBalancerFactory {
    pub fn new(kind: LoadBalancerKind, sticky_cache_size: usize) -> Self {
        Self {
            kind,
            sticky_cache_size,
        }
    }

    pub fn kind(&self) -> LoadBalancerKind {
        self.kind
    }

    /// Create a new load balancing strategy based on configuration
    pub fn create(&self) -> Arc<dyn LoadBalancer> {
        match self.kind {
            LoadBalancerKind::Random => RandomLoadBalancer::new().shared(),
            LoadBalancerKind::RoundRobin => RoundRobinLoadBalancer::new().shared(),
            LoadBalancerKind::Sticky => StickyLoadBalancer::new(self.sticky_cache_size).shared(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn servers(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("server{i}")).collect()
    }

    #[test]
    fn test_round_robin_cycles_evenly() {
        let strategy = RoundRobinLoadBalancer::new();
        let targets = servers(3);

        let picks: Vec<String> = (0..6)
            .map(|_| strategy.choose(&targets, "client").unwrap())
            .collect();
        assert_eq!(
            picks,
            vec!["server1", "server2", "server3", "server1", "server2", "server3"]
        );

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for pick in &picks {
            *counts.entry(pick.as_str()).or_default() += 1;
        }
        assert!(counts.values().all(|count| *count == 2));
    }

    #[test]
    fn test_round_robin_survives_shrinking_candidates() {
        let strategy = RoundRobinLoadBalancer::new();
        let targets = servers(3);
        strategy.choose(&targets, "").unwrap();
        strategy.choose(&targets, "").unwrap();

        // counter is 2, not reset: 2 % 2 picks the first of the new set
        let shrunk = servers(2);
        assert_eq!(strategy.choose(&shrunk, "").unwrap(), "server1");
        assert_eq!(strategy.choose(&shrunk, "").unwrap(), "server2");
    }

    #[test]
    fn test_empty_candidates_fail() {
        let empty: Vec<String> = vec![];
        assert_eq!(
            RoundRobinLoadBalancer::new().choose(&empty, "k"),
            Err(LoadBalancerError::NoBackendAvailable)
        );
        assert_eq!(
            RandomLoadBalancer::new().choose(&empty, "k"),
            Err(LoadBalancerError::NoBackendAvailable)
        );
        assert_eq!(
            StickyLoadBalancer::new(4).choose(&empty, "k"),
            Err(LoadBalancerError::NoBackendAvailable)
        );
    }

    #[test]
    fn test_random_returns_a_candidate() {
        let strategy = RandomLoadBalancer::new();
        let targets = servers(3);
        for _ in 0..50 {
            let selected = strategy.choose(&targets, "").unwrap();
            assert!(targets.contains(&selected));
        }
    }

    #[test]
    fn test_sticky_returns_same_backend_for_same_key() {
        let strategy = StickyLoadBalancer::new(16);
        let targets = servers(3);

        let first = strategy.choose(&targets, "10.0.0.1").unwrap();
        let second = strategy.choose(&targets, "10.0.0.1").unwrap();
        assert_eq!(first, second);

        // another client advances the round-robin fallback
        let other = strategy.choose(&targets, "10.0.0.2").unwrap();
        assert_ne!(other, first);
        assert_eq!(strategy.choose(&targets, "10.0.0.1").unwrap(), first);
    }

    #[test]
    fn test_sticky_reselects_when_cached_backend_removed() {
        let strategy = StickyLoadBalancer::new(16);
        let targets = servers(3);
        let first = strategy.choose(&targets, "client").unwrap();

        let remaining: Vec<String> = targets.iter().filter(|t| **t != first).cloned().collect();
        let second = strategy.choose(&remaining, "client").unwrap();
        assert_ne!(second, first);
        assert!(remaining.contains(&second));

        // the new choice is sticky too
        assert_eq!(strategy.choose(&remaining, "client").unwrap(), second);
        assert_eq!(strategy.cached_len(), 1);
    }

    #[test]
    fn test_sticky_evicts_least_recently_used() {
        let strategy = StickyLoadBalancer::new(2);
        let targets = servers(2);

        let a = strategy.choose(&targets, "a").unwrap();
        let _b = strategy.choose(&targets, "b").unwrap();
        // touch "a" so "b" becomes least recently used
        assert_eq!(strategy.choose(&targets, "a").unwrap(), a);
        strategy.choose(&targets, "c").unwrap();

        assert_eq!(strategy.cached_len(), 2);
        let cache = strategy.cache.lock();
        assert!(cache.contains("a"));
        assert!(cache.contains("c"));
        assert!(!cache.contains("b"));
    }

    #[test]
    fn test_sticky_zero_capacity_is_clamped() {
        assert_eq!(StickyLoadBalancer::new(0).capacity(), 1);
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("random".parse::<LoadBalancerKind>(), Ok(LoadBalancerKind::Random));
        assert_eq!(
            "Round-Robin".parse::<LoadBalancerKind>(),
            Ok(LoadBalancerKind::RoundRobin)
        );
        assert_eq!("sticky".parse::<LoadBalancerKind>(), Ok(LoadBalancerKind::Sticky));
        assert!("weighted".parse::<LoadBalancerKind>().is_err());

        let kind: LoadBalancerKind = serde_json::from_str("\"round-robin\"").unwrap();
        assert_eq!(kind, LoadBalancerKind::RoundRobin);
    }

    #[test]
    fn test_factory_creates_independent_instances() {
        let factory = LoadBalancerFactory::new(LoadBalancerKind::RoundRobin, 8);
        let targets = servers(2);
        let first = factory.create();
        let second = factory.create();
        assert_eq!(first.choose(&targets, "").unwrap(), "server1");
        assert_eq!(second.choose(&targets, "").unwrap(), "server1");
        assert_eq!(factory.create().kind(), LoadBalancerKind::RoundRobin);

        let sticky = LoadBalancerFactory::new(LoadBalancerKind::Sticky, 8).create();
        assert_eq!(sticky.kind(), LoadBalancerKind::Sticky);
    }
}
