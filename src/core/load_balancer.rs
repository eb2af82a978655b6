//! Backend selection strategies.
//!
//! Each service owns one [`LoadBalancer`], built from its configured strategy
//! and address pool. Strategies form a closed set so selection is a plain
//! `match`; the [`LoadBalancerRegistry`] hands out one shared selector per
//! service name.
use std::{
    collections::HashMap,
    hash::{DefaultHasher, Hash, Hasher},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use rand::Rng;
use thiserror::Error;

use crate::config::service::{LoadBalanceConfig, LoadBalanceStrategy, ServiceRecord};

/// Virtual nodes per backend on the consistent hash ring.
const HASH_REPLICAS: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("backend pool is empty")]
    EmptyPool,
    #[error("selector state is unavailable")]
    Poisoned,
}

/// Smooth weighted round-robin state, one slot per backend.
#[derive(Debug)]
struct WeightedState {
    weights: Vec<i64>,
    current: Mutex<Vec<i64>>,
}

#[derive(Debug)]
struct HashRing {
    /// Sorted (hash, backend index) pairs.
    nodes: Vec<(u64, usize)>,
}

impl HashRing {
    fn new(addrs: &[String]) -> Self {
        let mut nodes = Vec::with_capacity(addrs.len() * HASH_REPLICAS);
        for (index, addr) in addrs.iter().enumerate() {
            for replica in 0..HASH_REPLICAS {
                nodes.push((hash_key(&format!("{replica}{addr}")), index));
            }
        }
        nodes.sort_unstable();
        Self { nodes }
    }

    fn lookup(&self, key: &str) -> Option<usize> {
        if self.nodes.is_empty() {
            return None;
        }
        let hash = hash_key(key);
        let pos = self.nodes.partition_point(|(node, _)| *node < hash);
        let (_, index) = self.nodes[pos % self.nodes.len()];
        Some(index)
    }
}

fn hash_key(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug)]
enum Strategy {
    Random,
    RoundRobin(AtomicUsize),
    WeightRoundRobin(WeightedState),
    ConsistentHash(HashRing),
}

/// Picks the next backend address of one service.
#[derive(Debug)]
pub struct LoadBalancer {
    addrs: Vec<String>,
    strategy: Strategy,
}

impl LoadBalancer {
    pub fn new(config: &LoadBalanceConfig) -> Self {
        let addrs = config.addrs.clone();
        let strategy = match config.strategy {
            LoadBalanceStrategy::Random => Strategy::Random,
            LoadBalanceStrategy::RoundRobin => Strategy::RoundRobin(AtomicUsize::new(0)),
            LoadBalanceStrategy::WeightRoundRobin => {
                let weights: Vec<i64> = addrs
                    .iter()
                    .enumerate()
                    .map(|(i, _)| i64::from(config.weights.get(i).copied().unwrap_or(1).max(1)))
                    .collect();
                Strategy::WeightRoundRobin(WeightedState {
                    current: Mutex::new(vec![0; weights.len()]),
                    weights,
                })
            }
            LoadBalanceStrategy::ConsistentHash => Strategy::ConsistentHash(HashRing::new(&addrs)),
        };
        Self { addrs, strategy }
    }

    /// Select a backend address. `key` only matters for consistent hashing.
    pub fn get(&self, key: &str) -> Result<String, SelectionError> {
        if self.addrs.is_empty() {
            return Err(SelectionError::EmptyPool);
        }

        let index = match &self.strategy {
            Strategy::Random => rand::rng().random_range(0..self.addrs.len()),
            Strategy::RoundRobin(counter) => {
                counter.fetch_add(1, Ordering::Relaxed) % self.addrs.len()
            }
            Strategy::WeightRoundRobin(state) => {
                let mut current = state.current.lock().map_err(|_| SelectionError::Poisoned)?;
                let total: i64 = state.weights.iter().sum();
                let mut best = 0;
                for (i, weight) in state.weights.iter().enumerate() {
                    current[i] += weight;
                    if current[i] > current[best] {
                        best = i;
                    }
                }
                current[best] -= total;
                best
            }
            Strategy::ConsistentHash(ring) => ring.lookup(key).ok_or(SelectionError::EmptyPool)?,
        };

        Ok(self.addrs[index].clone())
    }

    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }
}

/// One selector per service, created on first use.
#[derive(Debug, Default)]
pub struct LoadBalancerRegistry {
    selectors: RwLock<HashMap<String, Arc<LoadBalancer>>>,
}

impl LoadBalancerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selector for `service`, created from its load-balance section on first call.
    pub fn selector(&self, service: &ServiceRecord) -> Result<Arc<LoadBalancer>, SelectionError> {
        {
            let selectors = self.selectors.read().map_err(|_| SelectionError::Poisoned)?;
            if let Some(lb) = selectors.get(&service.name) {
                return Ok(lb.clone());
            }
        }

        let mut selectors = self.selectors.write().map_err(|_| SelectionError::Poisoned)?;
        let lb = selectors
            .entry(service.name.clone())
            .or_insert_with(|| Arc::new(LoadBalancer::new(&service.load_balance)));
        Ok(lb.clone())
    }
}
