//! The telemetry co-cache: addresses, their observed resolutions, and the
//! shaped eviction that bounds the whole thing.

use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap, VecDeque};

use crate::error::{Error, Result};
use crate::heuristic::Heuristic;

/// One CNAME-chain observation, stored leaf-to-root of the forward lookup.
///
/// Labels are FQDNs with a trailing dot. A `None` label is the reloaded
/// placeholder: a chain reconstructed from the RPZ only knows its terminal
/// label, the interior is padded to preserve depth. Absent labels compare
/// as the empty string.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Chain(Vec<Option<String>>);

impl Chain {
    pub fn live<I>(labels: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Chain(labels.into_iter().map(Some).collect())
    }

    pub fn reloaded(depth: usize, ptr: &str) -> Self {
        let mut labels = vec![None; depth.saturating_sub(1)];
        labels.push(Some(ptr.to_string()));
        Chain(labels)
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// The label the forward observation terminated in; the PTR value.
    pub fn terminal(&self) -> Option<&str> {
        self.0.last().and_then(|l| l.as_deref())
    }

    pub fn labels(&self) -> &[Option<String>] {
        &self.0
    }

    pub fn is_reloaded(&self) -> bool {
        self.0.first().map(|l| l.is_none()).unwrap_or(false)
    }
}

impl Ord for Chain {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.0.iter().map(|l| l.as_deref().unwrap_or(""));
        let rhs = other.0.iter().map(|l| l.as_deref().unwrap_or(""));
        lhs.cmp(rhs)
    }
}

impl PartialOrd for Chain {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", label.as_deref().unwrap_or("-"))?;
        }
        write!(f, ")")
    }
}

/// A single resolution for an address.
#[derive(Clone, Debug)]
pub struct Resolution {
    pub chain: Chain,
    pub first_seen: f64,
    pub last_seen: f64,
    pub query_count: u64,
    pub query_trend: f64,
    /// Set while this resolution only exists because of an AXFR reload and
    /// has not been merged with a live observation.
    pub reload_score: Option<f64>,
}

impl Resolution {
    pub fn new(chain: Chain, now: f64) -> Self {
        Resolution {
            chain,
            first_seen: now,
            last_seen: now,
            query_count: 1,
            query_trend: 0.0,
            reload_score: None,
        }
    }

    /// The trend is a smoothed inter-arrival estimate; it must be updated
    /// before `last_seen` is overwritten.
    pub fn seen(&mut self, now: f64) {
        self.query_trend = 0.9 * self.query_trend + 0.1 * (now - self.last_seen);
        self.last_seen = now;
        self.query_count += 1;
    }
}

/// An IP address, with one or more resolutions.
#[derive(Clone, Debug)]
pub struct Address {
    pub address: String,
    pub resolutions: HashMap<Chain, Resolution>,
    pub last_seen: f64,
    pub best_resolution: Option<Chain>,
    pub best_score: f64,
}

impl Address {
    pub fn new(address: &str, now: f64) -> Self {
        Address {
            address: address.to_string(),
            resolutions: HashMap::new(),
            last_seen: now,
            best_resolution: None,
            best_score: 0.0,
        }
    }

    fn identical_reloaded(resolution: &Resolution, chain: &Chain) -> bool {
        resolution.reload_score.is_some() && Self::identical(resolution, chain)
    }

    fn identical(resolution: &Resolution, chain: &Chain) -> bool {
        resolution.chain.depth() == chain.depth()
            && resolution.chain.terminal() == chain.terminal()
    }

    /// The PTR value for the current best resolution.
    pub fn ptr_value(&self) -> Option<String> {
        let best = self.best_resolution.as_ref()?;
        let terminal = self.resolutions.get(best)?.chain.terminal()?;
        Some(format!("{}.", terminal.trim_end_matches('.')))
    }

    /// Add / merge a resolution. Returns true if added, false if merged
    /// into a reloaded resolution with the same depth and terminal label.
    pub fn add_resolution(&mut self, chain: Chain, now: f64) -> bool {
        let merge_key = self
            .resolutions
            .iter()
            .find(|(_, r)| Self::identical_reloaded(r, &chain))
            .map(|(k, _)| k.clone());

        if let Some(key) = merge_key {
            if let Some(mut resolution) = self.resolutions.remove(&key) {
                resolution.chain = chain.clone();
                // Leave first_seen and the trend alone; the reload numbers
                // are the best information we have.
                resolution.last_seen = now;
                resolution.query_count += 1;
                resolution.reload_score = None;
                self.resolutions.insert(chain, resolution);
            }
            return false;
        }

        self.resolutions
            .insert(chain.clone(), Resolution::new(chain, now));
        true
    }

    /// Delete the resolution, returning true if no more resolutions remain.
    pub fn delete_resolution(&mut self, chain: &Chain) -> bool {
        self.resolutions.remove(chain);
        self.best_resolution = None;
        self.best_score = 0.0;
        self.resolutions.is_empty()
    }

    /// Locate the chain ending in `ptr`: the longest one, preferring a
    /// reloaded chain among equals. Used by the console.
    pub fn match_ptr(&self, ptr: &str) -> Option<&Chain> {
        self.resolutions
            .keys()
            .filter(|chain| chain.terminal() == Some(ptr))
            .max_by(|a, b| {
                a.depth()
                    .cmp(&b.depth())
                    .then(a.is_reloaded().cmp(&b.is_reloaded()))
            })
    }
}

/// Fields of the TXT record a resolution is reconstructed from.
#[derive(Clone, Debug, PartialEq)]
pub struct RpzPackage {
    pub ptr: String,
    pub depth: usize,
    pub first: f64,
    pub last: f64,
    pub count: u64,
    pub trend: f64,
    pub score: f64,
}

/// One scored entry of the eviction candidate pool. Ordered by score, with
/// the insertion index as the tiebreak.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub score: f64,
    pub seq: usize,
    pub address: String,
    pub chain: Chain,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.score.total_cmp(&other.score) == Ordering::Equal && self.seq == other.seq
    }
}

impl Eq for Candidate {}

/// Diagnostic counters for one eviction pass.
#[derive(Clone, Debug, Default)]
pub struct EvictionPass {
    pub timestamp: f64,
    pub overage: usize,
    pub target_pool_size: usize,
    pub working_pool_size: usize,
    pub n_resolutions: usize,
    pub n_addresses: usize,
    pub single_address: Option<usize>,
    pub affected: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
    pub recycled: BTreeSet<String>,
    pub candidates: Vec<Candidate>,
}

/// Ring of the most recent eviction passes, newest last.
#[derive(Debug, Default)]
pub struct EvictionLog {
    passes: VecDeque<EvictionPass>,
}

impl EvictionLog {
    pub const LIMIT: usize = 10;

    fn rotate(&mut self, now: f64) -> &mut EvictionPass {
        if self.passes.len() >= Self::LIMIT {
            self.passes.pop_front();
        }
        self.passes.push_back(EvictionPass {
            timestamp: now,
            ..Default::default()
        });
        self.passes.back_mut().unwrap()
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn last_n(&self, n: usize) -> impl Iterator<Item = &EvictionPass> {
        let skip = self.passes.len().saturating_sub(n);
        self.passes.iter().skip(skip)
    }
}

pub struct Associator {
    cache_size: usize,
    /// Deferred eviction scheduler; never runs an eviction inline.
    cache_eviction: Box<dyn Fn()>,
    heuristic: Heuristic,
    /// Eviction queue: new addresses are prepended, the tail is the victim
    /// pool. Every address appears exactly once.
    pub cache: VecDeque<String>,
    pub n_resolutions: usize,
    pub addresses: HashMap<String, Address>,
    pub log: EvictionLog,
}

impl Associator {
    pub const EVICTION_POOL_BASE_SIZE: usize = 10;
    pub const EVICTION_POOL_MULTIPLIER: f64 = 1.2;

    pub fn new(cache_size: usize, cache_eviction: Box<dyn Fn()>, heuristic: Heuristic) -> Self {
        Associator {
            cache_size,
            cache_eviction,
            heuristic,
            cache: VecDeque::new(),
            n_resolutions: 0,
            addresses: HashMap::new(),
            log: EvictionLog::default(),
        }
    }

    /// Adds an address and the resolution, implicitly updating counters.
    ///
    /// Returns true when the solver should re-evaluate the address: a new
    /// resolution appeared, a reloaded one was merged, or a known one now
    /// outscores the cached best.
    pub fn update_resolution(&mut self, address: &str, chain: Chain, now: f64) -> bool {
        if !self.addresses.contains_key(address) {
            self.addresses
                .insert(address.to_string(), Address::new(address, now));
            self.cache.push_front(address.to_string());
        }
        let heuristic = self.heuristic;
        let entry = self.addresses.get_mut(address).unwrap();
        entry.last_seen = now;

        if !entry.resolutions.contains_key(&chain) {
            if entry.add_resolution(chain, now) {
                self.n_resolutions += 1;
                if self.n_resolutions > self.cache_size {
                    (self.cache_eviction)();
                }
            }
            return true;
        }

        let resolution = entry.resolutions.get_mut(&chain).unwrap();
        resolution.seen(now);

        if let Some(best) = &entry.best_resolution {
            if *best != chain && heuristic(resolution, now) > entry.best_score {
                return true;
            }
        }

        false
    }

    /// Bootstrap path: reconstruct a resolution from a decoded PTR+TXT pair.
    pub fn update_resolution_from_rpz(&mut self, address: &str, package: &RpzPackage, now: f64) {
        if !self.addresses.contains_key(address) {
            self.addresses
                .insert(address.to_string(), Address::new(address, now));
            self.cache.push_front(address.to_string());
        }
        let entry = self.addresses.get_mut(address).unwrap();
        entry.last_seen = entry.last_seen.max(package.last);

        let chain = Chain::reloaded(package.depth, &package.ptr);
        if entry
            .resolutions
            .values()
            .any(|r| Address::identical(r, &chain))
        {
            return;
        }

        entry.add_resolution(chain.clone(), now);
        self.n_resolutions += 1;
        if self.n_resolutions > self.cache_size {
            (self.cache_eviction)();
        }

        let resolution = self
            .addresses
            .get_mut(address)
            .unwrap()
            .resolutions
            .get_mut(&chain)
            .unwrap();
        resolution.first_seen = package.first;
        resolution.last_seen = package.last;
        resolution.query_count = package.count;
        resolution.query_trend = package.trend;
        resolution.reload_score = Some(package.score);
    }

    /// Performs the actual cache eviction on behalf of the deferred task.
    ///
    /// Pops addresses off the eviction-queue tail into a widened candidate
    /// pool (overage * 1.2 + 10 resolutions), drops the `overage` worst
    /// scored resolutions, and recycles the survivors to the head -- except
    /// that a single drawn address which entered with a pool-sized pile of
    /// resolutions stays at the tail for the next pass.
    ///
    /// Returns the affected and recycled address sets.
    pub fn do_cache_eviction(&mut self, now: f64) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
        if self.n_resolutions <= self.cache_size {
            return Ok((BTreeSet::new(), BTreeSet::new()));
        }

        let overage = self.n_resolutions - self.cache_size;
        let target_pool_size =
            (overage as f64 * Self::EVICTION_POOL_MULTIPLIER) as usize + Self::EVICTION_POOL_BASE_SIZE;

        let heuristic = self.heuristic;
        let mut drawn: Vec<String> = Vec::new();
        let mut pool: BinaryHeap<std::cmp::Reverse<Candidate>> = BinaryHeap::new();
        let mut working_pool_size = 0;
        let mut first_drawn_size = 0;
        while working_pool_size < target_pool_size {
            let Some(key) = self.cache.pop_back() else {
                break;
            };
            let address = self
                .addresses
                .get(&key)
                .ok_or_else(|| Error::internal(format!("evicting unknown address {}", key)))?;
            for resolution in address.resolutions.values() {
                pool.push(std::cmp::Reverse(Candidate {
                    score: heuristic(resolution, now),
                    seq: pool.len(),
                    address: key.clone(),
                    chain: resolution.chain.clone(),
                }));
            }
            working_pool_size += address.resolutions.len();
            if drawn.is_empty() {
                first_drawn_size = address.resolutions.len();
            }
            drawn.push(key);
        }

        let mut candidates: Vec<Candidate> =
            pool.iter().map(|r| r.0.clone()).collect();
        candidates.sort();

        let mut affected = BTreeSet::new();
        let mut deleted = BTreeSet::new();
        for _ in 0..overage {
            let Some(std::cmp::Reverse(candidate)) = pool.pop() else {
                break;
            };
            affected.insert(candidate.address.clone());
            let address = self
                .addresses
                .get_mut(&candidate.address)
                .ok_or_else(|| Error::internal(format!("candidate address {} vanished", candidate.address)))?;
            if address.delete_resolution(&candidate.chain) {
                self.addresses.remove(&candidate.address);
                deleted.insert(candidate.address.clone());
            }
            self.n_resolutions -= 1;
        }

        // A single drawn address that entered the pool with more than a
        // pool's worth of resolutions stays the next eviction victim. The
        // branch looks at the pre-eviction count; the log records the
        // post-eviction one.
        let mut recycled = BTreeSet::new();
        let mut single_address = None;
        if drawn.len() == 1 && first_drawn_size >= target_pool_size {
            let key = &drawn[0];
            self.cache.push_back(key.clone());
            single_address = self.addresses.get(key).map(|a| a.resolutions.len());
        } else {
            for key in &drawn {
                if !deleted.contains(key) {
                    recycled.insert(key.clone());
                    self.cache.push_front(key.clone());
                }
            }
        }

        let pass = self.log.rotate(now);
        pass.overage = overage;
        pass.target_pool_size = target_pool_size;
        pass.working_pool_size = working_pool_size;
        pass.n_resolutions = self.n_resolutions;
        pass.n_addresses = drawn.len();
        pass.single_address = single_address;
        pass.affected = affected.clone();
        pass.deleted = deleted.clone();
        pass.recycled = recycled.clone();
        pass.candidates = candidates;

        Ok((affected, recycled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    const TIME_NOW: f64 = 23456789.54321;
    const CACHE_SIZE: usize = 20;

    fn chain(labels: &[&str]) -> Chain {
        Chain::live(labels.iter().map(|l| l.to_string()))
    }

    fn associator() -> (Rc<Cell<usize>>, Associator) {
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let associator = Associator::new(
            CACHE_SIZE,
            Box::new(move || counter.set(counter.get() + 1)),
            crate::heuristic::standard,
        );
        (calls, associator)
    }

    fn count_resolutions(associator: &Associator) -> usize {
        associator
            .addresses
            .values()
            .map(|a| a.resolutions.len())
            .sum()
    }

    #[test]
    fn seen_updates_trend_before_last_seen() {
        let mut resolution = Resolution::new(chain(&["foo.com.", "www.bar.com."]), TIME_NOW - 10.0);
        resolution.last_seen = TIME_NOW - 1.0;

        resolution.seen(TIME_NOW);

        assert_eq!(resolution.first_seen, TIME_NOW - 10.0);
        assert_eq!(resolution.last_seen, TIME_NOW);
        assert_eq!(resolution.query_count, 2);
        assert!((resolution.query_trend - 0.1).abs() < 1e-12);
    }

    #[test]
    fn chains_with_absent_labels_compare_as_empty() {
        let full = chain(&["foo.com.", "bar.com.", "www.bar.com."]);
        let reloaded = Chain::reloaded(3, "www.bar.com.");

        assert_ne!(full, reloaded);
        assert!(full > reloaded);
    }

    #[test]
    fn update_new_address() {
        let (calls, mut associator) = associator();

        let added =
            associator.update_resolution("10.0.0.1", chain(&["foo.example.com.", "www.example.com."]), TIME_NOW);

        assert!(added);
        assert_eq!(associator.n_resolutions, 1);
        assert_eq!(associator.cache.len(), 1);
        let address = &associator.addresses["10.0.0.1"];
        assert_eq!(address.resolutions.len(), 1);
        assert!(address
            .resolutions
            .contains_key(&chain(&["foo.example.com.", "www.example.com."])));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn update_same_resolution_counts_queries() {
        let (calls, mut associator) = associator();
        let observed = chain(&["foo.example.com.", "www.example.com."]);

        assert!(associator.update_resolution("10.0.0.1", observed.clone(), TIME_NOW - 1.0));
        let added = associator.update_resolution("10.0.0.1", observed.clone(), TIME_NOW);

        assert!(!added);
        assert_eq!(associator.n_resolutions, 1);
        assert_eq!(associator.addresses.len(), 1);
        assert_eq!(
            associator.addresses["10.0.0.1"].resolutions[&observed].query_count,
            2
        );
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn update_different_resolution() {
        let (_, mut associator) = associator();

        associator.update_resolution("10.0.0.1", chain(&["foo.example.com.", "www.example.com."]), TIME_NOW);
        let added = associator.update_resolution(
            "10.0.0.1",
            chain(&["foo.example.com.", "cdn.example.com.", "images.example.com."]),
            TIME_NOW,
        );

        assert!(added);
        assert_eq!(associator.n_resolutions, 2);
        assert_eq!(associator.addresses.len(), 1);
        assert_eq!(associator.addresses["10.0.0.1"].resolutions.len(), 2);
    }

    #[test]
    fn update_different_address() {
        let (_, mut associator) = associator();
        let observed = chain(&["foo.example.com.", "www.example.com."]);

        associator.update_resolution("10.0.0.1", observed.clone(), TIME_NOW);
        let added = associator.update_resolution("10.0.0.2", observed, TIME_NOW);

        assert!(added);
        assert_eq!(associator.n_resolutions, 2);
        assert_eq!(associator.addresses.len(), 2);
        assert_eq!(associator.cache.len(), 2);
    }

    #[test]
    fn capacity_boundary_triggers_eviction() {
        let (calls, mut associator) = associator();
        associator.n_resolutions = CACHE_SIZE - 1;

        associator.update_resolution("10.0.0.1", chain(&["www.example.com."]), TIME_NOW);
        assert_eq!(calls.get(), 0, "exactly at capacity must not evict");

        associator.update_resolution("10.0.0.2", chain(&["www.example.com."]), TIME_NOW);
        assert_eq!(calls.get(), 1);
    }

    fn package(ptr: &str, depth: usize) -> RpzPackage {
        RpzPackage {
            ptr: ptr.to_string(),
            depth,
            first: TIME_NOW - 10.0,
            last: TIME_NOW - 1.0,
            count: 3,
            trend: 1.0,
            score: 2.5,
        }
    }

    #[test]
    fn reload_creates_placeholder_resolution() {
        let (calls, mut associator) = associator();

        associator.update_resolution_from_rpz("10.0.0.1", &package("www.example.com.", 2), TIME_NOW);

        assert_eq!(associator.n_resolutions, 1);
        let reloaded = Chain::reloaded(2, "www.example.com.");
        let resolution = &associator.addresses["10.0.0.1"].resolutions[&reloaded];
        assert_eq!(resolution.chain.labels()[0], None);
        assert_eq!(resolution.first_seen, TIME_NOW - 10.0);
        assert_eq!(resolution.last_seen, TIME_NOW - 1.0);
        assert_eq!(resolution.query_count, 3);
        assert_eq!(resolution.query_trend, 1.0);
        assert_eq!(resolution.reload_score, Some(2.5));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn reload_of_equivalent_resolution_is_a_noop() {
        let (_, mut associator) = associator();
        let live = chain(&["foo.example.com.", "www.example.com."]);

        associator.update_resolution("10.0.0.1", live.clone(), TIME_NOW);
        associator.update_resolution_from_rpz("10.0.0.1", &package("www.example.com.", 2), TIME_NOW);

        assert_eq!(associator.addresses.len(), 1);
        assert_eq!(associator.addresses["10.0.0.1"].resolutions.len(), 1);
        assert_eq!(
            associator.addresses["10.0.0.1"].resolutions[&live].first_seen,
            TIME_NOW
        );
        assert_eq!(associator.n_resolutions, 1);
    }

    #[test]
    fn reload_with_new_terminal_adds_resolution() {
        let (_, mut associator) = associator();

        associator.update_resolution("10.0.0.1", chain(&["foo.example.com.", "www.example.com."]), TIME_NOW);
        associator.update_resolution_from_rpz("10.0.0.1", &package("images.example.com.", 3), TIME_NOW);

        assert_eq!(associator.addresses.len(), 1);
        assert_eq!(associator.addresses["10.0.0.1"].resolutions.len(), 2);
        assert_eq!(associator.n_resolutions, 2);
    }

    #[test]
    fn reload_path_also_triggers_eviction() {
        let (calls, mut associator) = associator();
        associator.n_resolutions = CACHE_SIZE - 1;

        associator.update_resolution("10.0.0.1", chain(&["foo.example.com.", "www.example.com."]), TIME_NOW);
        assert_eq!(calls.get(), 0);

        associator.update_resolution_from_rpz("10.0.0.1", &package("images.example.com.", 3), TIME_NOW);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn live_observation_merges_reloaded_resolution() {
        let (_, mut associator) = associator();
        associator.update_resolution_from_rpz("10.0.0.1", &package("www.example.com.", 2), TIME_NOW - 1.0);

        let live = chain(&["foo.example.com.", "www.example.com."]);
        let added = associator.update_resolution("10.0.0.1", live.clone(), TIME_NOW);

        assert!(added, "a merge re-evaluates the solver");
        assert_eq!(associator.n_resolutions, 1, "merge must not grow the cache");
        let address = &associator.addresses["10.0.0.1"];
        assert_eq!(address.resolutions.len(), 1);
        let resolution = &address.resolutions[&live];
        assert_eq!(resolution.reload_score, None);
        assert_eq!(resolution.query_count, 4);
        assert_eq!(resolution.last_seen, TIME_NOW);
        assert_eq!(resolution.query_trend, 1.0, "trend untouched by the merge");
    }

    #[test]
    fn merge_is_idempotent_for_identical_observations() {
        let (_, mut associator) = associator();
        associator.update_resolution_from_rpz("10.0.0.1", &package("www.example.com.", 2), TIME_NOW - 1.0);
        let live = chain(&["foo.example.com.", "www.example.com."]);

        associator.update_resolution("10.0.0.1", live.clone(), TIME_NOW);
        associator.update_resolution("10.0.0.1", live.clone(), TIME_NOW);

        let resolution = &associator.addresses["10.0.0.1"].resolutions[&live];
        assert_eq!(resolution.reload_score, None);
        assert_eq!(resolution.query_count, 5);
        assert_eq!(associator.n_resolutions, 1);
    }

    fn feed_addresses(associator: &mut Associator, n: usize, base: usize) {
        for i in 0..n {
            associator.update_resolution(
                &format!("10.0.1.{}", i + base),
                chain(&["foo.example.com.", "www.example.com."]),
                TIME_NOW,
            );
        }
    }

    fn feed_resolutions(associator: &mut Associator, n: usize) {
        for i in 0..n {
            associator.update_resolution(
                "10.0.0.1",
                chain(&["foo.example.com.", &format!("{}.example.com.", i)]),
                TIME_NOW,
            );
        }
    }

    #[test]
    fn eviction_many_addresses() {
        let (calls, mut associator) = associator();
        feed_addresses(&mut associator, CACHE_SIZE + 10, 0);

        assert!(calls.get() > 0);
        assert_eq!(associator.cache.len(), CACHE_SIZE + 10);

        let (affected, recycled) = associator.do_cache_eviction(TIME_NOW).unwrap();

        assert_eq!(associator.cache.len(), CACHE_SIZE);
        assert_eq!(affected.len(), 10);
        assert_eq!(associator.n_resolutions, CACHE_SIZE);
        assert_eq!(count_resolutions(&associator), CACHE_SIZE);
        // overage 10 -> pool of 22 singletons drawn, 12 survive.
        assert_eq!(recycled.len(), 12);
        let pass = associator.log.last_n(1).next().unwrap();
        assert_eq!(pass.overage, 10);
        assert_eq!(pass.target_pool_size, 22);
        assert_eq!(pass.deleted.len(), 10);
    }

    #[test]
    fn eviction_penalizes_address_with_many_resolutions() {
        let (_, mut associator) = associator();
        feed_addresses(&mut associator, 5, 0);
        feed_resolutions(&mut associator, CACHE_SIZE);
        feed_addresses(&mut associator, 5, 5);

        assert_eq!(associator.addresses["10.0.0.1"].resolutions.len(), CACHE_SIZE);
        assert_eq!(associator.cache.len(), 11);

        let (affected, _) = associator.do_cache_eviction(TIME_NOW).unwrap();

        assert_eq!(affected.len(), 6);
        assert_eq!(associator.cache.len(), 6);
        assert_eq!(associator.n_resolutions, CACHE_SIZE);
        assert_eq!(
            associator.addresses["10.0.0.1"].resolutions.len(),
            CACHE_SIZE - 5
        );
    }

    #[test]
    fn eviction_single_address_stays_at_tail() {
        let (_, mut associator) = associator();
        feed_resolutions(&mut associator, CACHE_SIZE);
        feed_addresses(&mut associator, 2, 0);

        assert_eq!(associator.cache.len(), 3);

        let (affected, recycled) = associator.do_cache_eviction(TIME_NOW).unwrap();

        assert_eq!(affected.len(), 1);
        assert!(recycled.is_empty());
        assert_eq!(associator.cache.len(), 3);
        assert_eq!(associator.n_resolutions, CACHE_SIZE);
        assert_eq!(
            associator.addresses["10.0.0.1"].resolutions.len(),
            CACHE_SIZE - 2
        );
        assert_eq!(associator.cache.back().map(String::as_str), Some("10.0.0.1"));
        let pass = associator.log.last_n(1).next().unwrap();
        assert_eq!(pass.single_address, Some(CACHE_SIZE - 2));
        assert!(pass.recycled.is_empty());
    }

    #[test]
    fn eviction_keeps_counters_consistent() {
        let (_, mut associator) = associator();
        feed_addresses(&mut associator, CACHE_SIZE + 3, 0);
        feed_resolutions(&mut associator, 4);

        associator.do_cache_eviction(TIME_NOW).unwrap();

        assert_eq!(associator.n_resolutions, count_resolutions(&associator));
        assert_eq!(associator.cache.len(), associator.addresses.len());
        let unique: std::collections::HashSet<_> = associator.cache.iter().collect();
        assert_eq!(unique.len(), associator.cache.len());
    }

    #[test]
    fn eviction_log_is_a_ring() {
        let (_, mut associator) = associator();

        for round in 0..EvictionLog::LIMIT + 3 {
            feed_addresses(&mut associator, CACHE_SIZE + 1, round * 100);
            associator.do_cache_eviction(TIME_NOW + round as f64).unwrap();
            for key in associator.cache.drain(..) {
                associator.addresses.remove(&key);
            }
            associator.n_resolutions = 0;
        }

        assert_eq!(associator.log.len(), EvictionLog::LIMIT);
    }

    #[test]
    fn ptr_value_normalizes_trailing_dot() {
        let mut address = Address::new("10.0.0.1", TIME_NOW);
        let observed = chain(&["www.example.com."]);
        address.add_resolution(observed.clone(), TIME_NOW);
        address.best_resolution = Some(observed);

        assert_eq!(address.ptr_value().as_deref(), Some("www.example.com."));
    }
}
