//! The agent: telemetry intake, the two-priority scheduler, the solver and
//! the deferred single-flight cache eviction.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::heuristic::Heuristic;
use crate::rpz::{RefreshCounters, Rpz};
use crate::stats::{unix_now, Collector, StatisticsFactory, Timer};

pub mod associator;

use associator::{Associator, Chain};

pub type Associations = Rc<RefCell<Associator>>;

/// Cooperative stop signal standing in for stopping the event loop:
/// internal defects trip it and `main` exits when it fires.
pub struct Stop {
    flag: Cell<bool>,
    notify: Notify,
}

impl Stop {
    pub fn new() -> Rc<Self> {
        Rc::new(Stop {
            flag: Cell::new(false),
            notify: Notify::new(),
        })
    }

    pub fn trigger(&self) {
        self.flag.set(true);
        self.notify.notify_one();
    }

    pub fn triggered(&self) -> bool {
        self.flag.get()
    }

    pub async fn wait(&self) {
        while !self.flag.get() {
            self.notify.notified().await;
        }
    }
}

/// Single-consumer FIFO for the cooperative scheduler. Everything lives on
/// one executor, so a `RefCell` plus a `Notify` is all it takes.
pub struct TaskQueue<T> {
    items: RefCell<VecDeque<T>>,
    notify: Notify,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        TaskQueue {
            items: RefCell::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn put(&self, item: T) {
        self.items.borrow_mut().push_back(item);
        self.notify.notify_one();
    }

    pub fn try_get(&self) -> Option<T> {
        self.items.borrow_mut().pop_front()
    }

    pub async fn get(&self) -> T {
        loop {
            if let Some(item) = self.try_get() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

const REAP_FREQUENCY: f64 = 60.0;
const STALE_PEER: f64 = 3600.0;

struct PeerEntry {
    /// Next expected sequence id, when ids are tracked at all.
    next: Option<i64>,
    stamp: f64,
}

/// Tracks the last sequence id per telemetry peer, reaping idle peers.
pub struct PeerTable {
    peers: HashMap<SocketAddr, PeerEntry>,
    next_reap: f64,
}

impl PeerTable {
    pub fn new(now: f64) -> Self {
        PeerTable {
            peers: HashMap::new(),
            next_reap: now + REAP_FREQUENCY,
        }
    }

    /// Was the id the expected one? Advances and stamps only on a match.
    pub fn expected(&mut self, peer: SocketAddr, id: i64, now: f64) -> bool {
        let matched = match self.peers.get_mut(&peer) {
            Some(entry) if entry.next == Some(id) => {
                entry.next = Some(id + 1);
                entry.stamp = now;
                true
            }
            _ => false,
        };
        if matched {
            self.reap(now);
        }
        matched
    }

    /// Resynchronize a peer after a gap (or first contact).
    pub fn put(&mut self, peer: SocketAddr, id: i64, now: f64) {
        let entry = self.peers.entry(peer).or_insert(PeerEntry {
            next: None,
            stamp: now,
        });
        entry.next = Some(id + 1);
        entry.stamp = now;
        self.reap(now);
    }

    /// Id-less tracking: returns true when the peer is new.
    pub fn touch(&mut self, peer: SocketAddr, now: f64) -> bool {
        let new = !self.peers.contains_key(&peer);
        let entry = self.peers.entry(peer).or_insert(PeerEntry {
            next: None,
            stamp: now,
        });
        entry.stamp = now;
        self.reap(now);
        new
    }

    /// The last id seen from the peer, if any.
    pub fn last(&self, peer: SocketAddr) -> Option<i64> {
        self.peers.get(&peer).and_then(|e| e.next).map(|n| n - 1)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    fn reap(&mut self, now: f64) {
        if now < self.next_reap {
            return;
        }
        while self.next_reap < now {
            self.next_reap += REAP_FREQUENCY;
        }
        let cutoff = now - STALE_PEER;
        self.peers.retain(|peer, entry| {
            if entry.stamp < cutoff {
                log::info!(target: "telemetry", "reaped: {}", peer);
                false
            } else {
                true
            }
        });
    }
}

/// One validated telemetry datagram.
pub struct Observation {
    pub address: String,
    pub chain: Chain,
    timer: Option<Timer>,
}

enum Work {
    Association(Observation),
    Solve(String, Option<Timer>),
}

struct AgentStats {
    telemetry: Rc<Collector>,
    solve: Rc<Collector>,
    eviction: Rc<Collector>,
}

/// Ties the associator, the scheduler and the RPZ client together.
pub struct Agent {
    pub associations: Associations,
    pub association_queue: TaskQueue<Observation>,
    pub solver_queue: TaskQueue<(String, Option<Timer>)>,
    pub last_id: RefCell<PeerTable>,
    eviction_task: RefCell<Option<JoinHandle<()>>>,
    telemetry_id: Option<String>,
    heuristic: Heuristic,
    pub rpz: Rc<Rpz>,
    pub stop: Rc<Stop>,
    stats: Option<AgentStats>,
    /// Handle on ourselves for the tasks we defer.
    weak: std::rc::Weak<Agent>,
}

impl Agent {
    pub fn new(
        cache_size: usize,
        telemetry_id: Option<String>,
        heuristic: Heuristic,
        rpz: Rc<Rpz>,
        stop: Rc<Stop>,
        statistics: Option<&StatisticsFactory>,
    ) -> Rc<Self> {
        let stats = statistics.map(|factory| AgentStats {
            telemetry: factory.collector("process telemetry"),
            solve: factory.collector("solve"),
            eviction: factory.collector("cache eviction"),
        });

        Rc::new_cyclic(|weak: &std::rc::Weak<Agent>| {
            let scheduler = weak.clone();
            let associations = Rc::new(RefCell::new(Associator::new(
                cache_size,
                Box::new(move || {
                    if let Some(agent) = scheduler.upgrade() {
                        agent.schedule_cache_eviction();
                    }
                }),
                heuristic,
            )));

            Agent {
                associations,
                association_queue: TaskQueue::new(),
                solver_queue: TaskQueue::new(),
                last_id: RefCell::new(PeerTable::new(unix_now())),
                eviction_task: RefCell::new(None),
                telemetry_id,
                heuristic,
                rpz,
                stop,
                stats,
                weak: weak.clone(),
            }
        })
    }

    pub fn heuristic(&self) -> Heuristic {
        self.heuristic
    }

    pub fn eviction_pending(&self) -> bool {
        self.eviction_task.borrow().is_some()
    }

    /// Validate a telemetry datagram and queue it for association.
    /// Malformed datagrams are logged and dropped, never fatal.
    pub fn process_telemetry(&self, datagram: &[u8], peer: SocketAddr) {
        let timer = self.stats.as_ref().map(|s| s.telemetry.clone().start_timer());
        match self.parse_telemetry(datagram, peer) {
            Ok((address, chain)) => self.association_queue.put(Observation {
                address,
                chain,
                timer,
            }),
            Err(e) => log::warn!(target: "telemetry", "dropped datagram from {}: {}", peer, e),
        }
    }

    fn parse_telemetry(&self, datagram: &[u8], peer: SocketAddr) -> Result<(String, Chain)> {
        let value: serde_json::Value = serde_json::from_slice(datagram)?;
        let now = unix_now();

        if let Some(field) = &self.telemetry_id {
            let id = value
                .get(field)
                .and_then(|v| v.as_i64())
                .ok_or_else(|| Error::telemetry(format!("missing sequence field \"{}\"", field)))?;
            let mut last_id = self.last_id.borrow_mut();
            if !last_id.expected(peer, id, now) {
                match last_id.last(peer) {
                    Some(last) => {
                        log::info!(target: "telemetry", "sequence {}: {} -> {}", peer, last, id)
                    }
                    None => log::info!(target: "telemetry", "new peer {}", peer),
                }
                last_id.put(peer, id, now);
            }
        } else if self.last_id.borrow_mut().touch(peer, now) {
            log::info!(target: "telemetry", "new peer {}", peer);
        }

        let address = value
            .get("address")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::telemetry("missing address"))?;
        address
            .parse::<IpAddr>()
            .map_err(|e| Error::telemetry(format!("address \"{}\": {}", address, e)))?;

        let elements = value
            .get("chain")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::telemetry("missing chain"))?;
        let mut labels = Vec::new();
        let mut seen = HashSet::new();
        for element in elements {
            let label = element
                .as_str()
                .ok_or_else(|| Error::telemetry("chain elements must be FQDNs"))?;
            if !label.ends_with('.') {
                return Err(Error::telemetry(format!(
                    "chain element \"{}\" missing trailing \".\"",
                    label
                )));
            }
            // Cyclic chains are truncated at the first repeat.
            if !seen.insert(label.to_string()) {
                break;
            }
            labels.push(label.to_string());
        }
        if labels.is_empty() {
            return Err(Error::telemetry("empty chain"));
        }

        Ok((address.to_string(), Chain::live(labels)))
    }

    fn try_work(&self) -> Option<Work> {
        if let Some(observation) = self.association_queue.try_get() {
            return Some(Work::Association(observation));
        }
        if let Some((address, timer)) = self.solver_queue.try_get() {
            return Some(Work::Solve(address, timer));
        }
        None
    }

    fn dispatch(&self, work: Work) -> Result<()> {
        match work {
            Work::Association(observation) => {
                self.apply_observation(observation);
                Ok(())
            }
            Work::Solve(address, timer) => {
                let result = self.solve(&address);
                if let Some(timer) = timer {
                    timer.stop();
                }
                result
            }
        }
    }

    /// Associations strictly precede solvers: ingress must never starve.
    pub async fn run(self: Rc<Self>) {
        loop {
            let work = match self.try_work() {
                Some(work) => work,
                None => Work::Association(self.association_queue.get().await),
            };
            if let Err(e) = self.dispatch(work) {
                log::error!(target: "solver", "{}", e);
                self.stop.trigger();
                return;
            }
        }
    }

    fn apply_observation(&self, observation: Observation) {
        let now = unix_now();
        let added = self.associations.borrow_mut().update_resolution(
            &observation.address,
            observation.chain,
            now,
        );
        if added {
            self.enqueue_solver(&observation.address);
        }
        if let Some(timer) = observation.timer {
            timer.stop();
        }
    }

    pub fn enqueue_solver(&self, address: &str) {
        let timer = self.stats.as_ref().map(|s| s.solve.clone().start_timer());
        self.solver_queue.put((address.to_string(), timer));
    }

    /// Pick the winning resolution for an address and queue an RPZ write
    /// when the winner changed. An address gone from the associations gets
    /// an RPZ delete instead.
    pub fn solve(&self, address: &str) -> Result<()> {
        let now = unix_now();
        let mut associations = self.associations.borrow_mut();
        if !associations.addresses.contains_key(address) {
            drop(associations);
            self.rpz.enqueue_delete(address);
            return Ok(());
        }
        let entry = associations.addresses.get_mut(address).unwrap();
        if entry.resolutions.is_empty() {
            return Err(Error::internal(format!(
                "solve: no resolutions for address {}",
                address
            )));
        }

        let heuristic = self.heuristic;
        let mut ranked: Vec<(f64, Chain)> = entry
            .resolutions
            .values()
            .map(|r| (heuristic(r, now), r.chain.clone()))
            .collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        let (score, winner) = ranked.into_iter().next().unwrap();

        let need_update = match &entry.best_resolution {
            None => true,
            Some(best) => *best != winner,
        };
        if need_update {
            entry.best_resolution = Some(winner);
            entry.best_score = score;
            drop(associations);
            self.rpz.enqueue_update(address, score);
        }
        Ok(())
    }

    /// Defer a cache eviction; at most one is pending or running. The
    /// handle is the guard -- a drop guard clears it even on failure.
    pub fn schedule_cache_eviction(&self) {
        if self.eviction_task.borrow().is_some() {
            return;
        }
        let Some(agent) = self.weak.upgrade() else {
            return;
        };
        let timer = self.stats.as_ref().map(|s| s.eviction.clone().start_timer());
        let handle = tokio::task::spawn_local(async move {
            let _guard = EvictionGuard(agent.clone());
            agent.do_cache_eviction();
            if let Some(timer) = timer {
                timer.stop();
            }
        });
        *self.eviction_task.borrow_mut() = Some(handle);
    }

    /// Runs the eviction pass, queues solvers for every affected address
    /// and feeds the untouched survivors to the batch refresh.
    fn do_cache_eviction(&self) {
        let now = unix_now();
        let outcome = self.associations.borrow_mut().do_cache_eviction(now);
        let (mut affected, recycled) = match outcome {
            Ok(sets) => sets,
            Err(e) => {
                log::error!(target: "eviction", "{}", e);
                self.stop.trigger();
                return;
            }
        };

        let recycled: BTreeSet<String> = recycled.difference(&affected).cloned().collect();
        let mut counters = RefreshCounters {
            recycled: recycled.len(),
            ..Default::default()
        };
        let mut batch = Vec::new();
        {
            let associations = self.associations.borrow();
            let heuristic = self.heuristic;
            for address in &recycled {
                let Some(entry) = associations.addresses.get(address) else {
                    continue;
                };
                if entry.resolutions.is_empty() {
                    counters.no_resolutions += 1;
                    affected.insert(address.clone());
                    continue;
                }
                let best = entry
                    .best_resolution
                    .as_ref()
                    .and_then(|best| entry.resolutions.get(best));
                let Some(best) = best else {
                    counters.no_best += 1;
                    affected.insert(address.clone());
                    continue;
                };
                counters.good += 1;
                batch.push((address.clone(), heuristic(best, now)));
            }
        }

        for address in &affected {
            self.enqueue_solver(address);
        }
        self.rpz.add_to_batch_refresh(batch, counters);
    }
}

struct EvictionGuard(Rc<Agent>);

impl Drop for EvictionGuard {
    fn drop(&mut self) {
        self.0.eviction_task.borrow_mut().take();
    }
}
