//! The RPZ client: a single lazily-opened TCP channel to the authoritative
//! server, a task queue serializing every write, AXFR bootstrap and the
//! batched TXT refresh.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::rc::Rc;
use std::str::FromStr;

use bytes::Bytes;
use domain::base::iana::{Class, Opcode, Rcode};
use domain::base::message_builder::AuthorityBuilder;
use domain::base::name::Name;
use domain::base::rdata::UnknownRecordData;
use domain::base::{Message, MessageBuilder, ParsedName, Record, Rtype, Ttl};
use domain::rdata::{AllRecordData, Ptr, Txt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::AddressRecord;
use crate::db::associator::Associator;
use crate::db::{Associations, Stop, TaskQueue};
use crate::error::{Error, Result};
use crate::stats::{unix_now, Collector, StatisticsFactory, Timer};

pub mod mirror;

use mirror::{address_to_reverse, is_v4_reverse, reverse_to_address, PackageBuilder, ZoneMirror};

pub const TTL: u32 = 600;

pub type GarbageLogger = Box<dyn Fn(&str)>;
pub type ErrorHook = Box<dyn Fn(&str, Rcode)>;

/// Default garbage logger; pass `None` to drop garbage records silently.
pub fn warn_garbage() -> GarbageLogger {
    Box::new(|message| log::warn!(target: "axfr", "{}", message))
}

fn log_global_error() -> ErrorHook {
    Box::new(|context, rcode| log::error!(target: "rpz", "{}: rcode {}", context, rcode))
}

/// Work items serialized onto the RPZ channel.
pub enum RpzTask {
    LoadAxfr { timer: Option<Timer> },
    Update { address: String, score: f64, timer: Option<Timer> },
    Delete { address: String, timer: Option<Timer> },
    BatchRefresh,
}

/// Manages the TCP channel and the 2-byte length framing.
pub struct Connection {
    server: IpAddr,
    pub keep_open: bool,
    stream: Option<TcpStream>,
    stats: Option<Rc<Collector>>,
}

impl Connection {
    pub fn new(server: IpAddr, stats: Option<Rc<Collector>>) -> Self {
        Connection {
            server,
            keep_open: false,
            stream: None,
            stats,
        }
    }

    pub fn close(&mut self) {
        self.stream = None;
    }

    /// Sends one framed request and returns the framed response. Opens the
    /// connection on demand and closes it again unless `keep_open`.
    pub async fn request(&mut self, wire: &[u8]) -> Result<Vec<u8>> {
        let timer = self.stats.as_ref().map(|c| c.clone().start_timer());
        let result = self.request_(wire).await;
        if result.is_err() {
            self.close();
        } else if !self.keep_open {
            self.close();
        }
        if let Some(timer) = timer {
            timer.stop();
        }
        result
    }

    async fn request_(&mut self, wire: &[u8]) -> Result<Vec<u8>> {
        if wire.len() > u16::MAX as usize {
            return Err(Error::wire("request does not fit a dns message frame"));
        }
        if self.stream.is_none() {
            self.stream = Some(TcpStream::connect((self.server, 53)).await?);
        }
        let stream = self.stream.as_mut().unwrap();
        stream.write_all(&(wire.len() as u16).to_be_bytes()).await?;
        stream.write_all(wire).await?;
        read_frame(stream).await
    }

    /// Reads one more framed response without sending anything; used for
    /// AXFR continuations.
    pub async fn read_more(&mut self) -> Result<Vec<u8>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::wire("connection closed mid-transfer"))?;
        read_frame(stream).await
    }
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut length = [0u8; 2];
    stream.read_exact(&mut length).await?;
    let mut response = vec![0u8; u16::from_be_bytes(length) as usize];
    stream.read_exact(&mut response).await?;
    Ok(response)
}

/// Accounting fed alongside a refresh batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct RefreshCounters {
    pub recycled: usize,
    pub good: usize,
    pub no_best: usize,
    pub no_resolutions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
pub enum BatchPhase {
    Created,
    Accumulating,
    Writing,
    Complete,
}

impl std::fmt::Display for BatchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchPhase::Created => write!(f, "created"),
            BatchPhase::Accumulating => write!(f, "accumulating"),
            BatchPhase::Writing => write!(f, "writing"),
            BatchPhase::Complete => write!(f, "complete"),
        }
    }
}

/// Diagnostics for one refresh batch, from creation to the completed write.
#[derive(Debug, Clone)]
pub struct RefreshBatch {
    pub timestamp: f64,
    pub phase: BatchPhase,
    pub add_calls: usize,
    pub to_process: usize,
    pub batch_size: usize,
    pub recycled: usize,
    pub recycled_good: usize,
    pub recycled_no_best_resolution: usize,
    pub recycled_no_resolutions: usize,
    pub update_rcode: Option<u8>,
    pub wire_req_bytes: usize,
    pub wire_resp_bytes: usize,
    pub threshold_timestamp: f64,
    pub completion_timestamp: f64,
}

impl RefreshBatch {
    fn new(now: f64) -> Self {
        RefreshBatch {
            timestamp: now,
            phase: BatchPhase::Created,
            add_calls: 0,
            to_process: 0,
            batch_size: 0,
            recycled: 0,
            recycled_good: 0,
            recycled_no_best_resolution: 0,
            recycled_no_resolutions: 0,
            update_rcode: None,
            wire_req_bytes: 0,
            wire_resp_bytes: 0,
            threshold_timestamp: 0.0,
            completion_timestamp: 0.0,
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchLog {
    batches: VecDeque<RefreshBatch>,
}

impl BatchLog {
    pub const LIMIT: usize = 10;

    fn rotate(&mut self, now: f64) {
        if self.batches.len() >= Self::LIMIT {
            self.batches.pop_front();
        }
        self.batches.push_back(RefreshBatch::new(now));
    }

    fn current(&mut self) -> Option<&mut RefreshBatch> {
        self.batches.back_mut()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn last_n(&self, n: usize) -> impl Iterator<Item = &RefreshBatch> {
        let skip = self.batches.len().saturating_sub(n);
        self.batches.iter().skip(skip)
    }
}

#[derive(Default)]
struct BatchState {
    pending: Vec<(String, f64)>,
    open: bool,
}

pub struct RpzStats {
    axfr: Rc<Collector>,
    update: Rc<Collector>,
    delete: Rc<Collector>,
    request: Rc<Collector>,
}

/// The RPZ view. Keeps the telemetry view and the zone-as-served in sync.
pub struct Rpz {
    server: IpAddr,
    /// Zone name, lowercase with a trailing dot.
    pub zone: String,
    zone_name: Name<Bytes>,
    pub task_queue: TaskQueue<RpzTask>,
    pub contents: RefCell<ZoneMirror>,
    pub batch_log: RefCell<BatchLog>,
    batch: RefCell<BatchState>,
    address_records: Vec<AddressRecord>,
    garbage_logger: Option<GarbageLogger>,
    global_error: ErrorHook,
    stats: Option<RpzStats>,
    msg_id: Cell<u16>,
}

impl Rpz {
    pub fn new(
        server: IpAddr,
        zone: &str,
        address_records: Vec<AddressRecord>,
        garbage_logger: Option<GarbageLogger>,
        statistics: Option<&StatisticsFactory>,
    ) -> Result<Rc<Self>> {
        let zone = format!("{}.", zone.to_lowercase().trim_end_matches('.'));
        let zone_name = Name::from_str(&zone)?;
        let stats = statistics.map(|factory| RpzStats {
            axfr: factory.collector("rpz axfr"),
            update: factory.collector("rpz update"),
            delete: factory.collector("rpz delete"),
            request: factory.collector("dns request"),
        });

        Ok(Rc::new(Rpz {
            server,
            zone,
            zone_name,
            task_queue: TaskQueue::new(),
            contents: RefCell::new(ZoneMirror::new()),
            batch_log: RefCell::new(BatchLog::default()),
            batch: RefCell::new(BatchState::default()),
            address_records,
            garbage_logger,
            global_error: log_global_error(),
            stats,
            msg_id: Cell::new((unix_now() * 1000.0) as u16),
        }))
    }

    pub fn server(&self) -> IpAddr {
        self.server
    }

    pub fn enqueue(&self, task: RpzTask) {
        self.task_queue.put(task);
    }

    pub fn enqueue_axfr(&self) {
        let timer = self.stats.as_ref().map(|s| s.axfr.clone().start_timer());
        self.enqueue(RpzTask::LoadAxfr { timer });
    }

    pub fn enqueue_update(&self, address: &str, score: f64) {
        let timer = self.stats.as_ref().map(|s| s.update.clone().start_timer());
        self.enqueue(RpzTask::Update {
            address: address.to_string(),
            score,
            timer,
        });
    }

    pub fn enqueue_delete(&self, address: &str) {
        let timer = self.stats.as_ref().map(|s| s.delete.clone().start_timer());
        self.enqueue(RpzTask::Delete {
            address: address.to_string(),
            timer,
        });
    }

    /// Processes the task queue, in coordination with the connection. The
    /// channel stays pinned open while more tasks are waiting.
    pub async fn run(self: Rc<Self>, associations: Associations, stop: Rc<Stop>) {
        let mut conn = Connection::new(
            self.server,
            self.stats.as_ref().map(|s| s.request.clone()),
        );
        loop {
            let task = self.task_queue.get().await;
            conn.keep_open = !self.task_queue.is_empty();

            let result = match task {
                RpzTask::LoadAxfr { timer } => {
                    let result = self.load_axfr(&mut conn, &associations).await;
                    if let Some(timer) = timer {
                        timer.stop();
                    }
                    result
                }
                RpzTask::Update {
                    address,
                    score,
                    timer,
                } => {
                    let result = self.update(&mut conn, &associations, &address, score).await;
                    if let Some(timer) = timer {
                        timer.stop();
                    }
                    result
                }
                RpzTask::Delete { address, timer } => {
                    let result = self.delete(&mut conn, &address).await;
                    if let Some(timer) = timer {
                        timer.stop();
                    }
                    result
                }
                RpzTask::BatchRefresh => self.write_batch(&mut conn, &associations).await,
            };

            if let Err(e) = result {
                if e.is_transport() {
                    log::warn!(target: "rpz", "closing connection: {}", e);
                    conn.close();
                } else {
                    log::error!(target: "rpz", "{}", e);
                    stop.trigger();
                    return;
                }
            }
        }
    }

    fn next_id(&self) -> u16 {
        let id = self.msg_id.get();
        self.msg_id.set(id.wrapping_add(1));
        id
    }

    fn owner_name(&self, qname: &str) -> Result<Name<Bytes>> {
        Ok(Name::from_str(&format!("{}.{}", qname, self.zone))?)
    }

    /// Starts a dynamic-update message with the zone in the question
    /// section; records go into the authority (update) section.
    fn update_builder(&self) -> Result<AuthorityBuilder<Vec<u8>>> {
        let mut builder = MessageBuilder::new_vec();
        builder.header_mut().set_id(self.next_id());
        builder.header_mut().set_opcode(Opcode::UPDATE);
        let mut zone = builder.question();
        zone.push((&self.zone_name, Rtype::SOA))?;
        Ok(zone.answer().authority())
    }

    fn push_delete_owner(
        update: &mut AuthorityBuilder<Vec<u8>>,
        owner: &Name<Bytes>,
    ) -> Result<()> {
        let any = UnknownRecordData::from_octets(Rtype::ANY, Bytes::new())
            .map_err(|e| Error::wire(e.to_string()))?;
        update.push(Record::new(
            owner.clone(),
            Class::ANY,
            Ttl::from_secs(0),
            any,
        ))?;
        Ok(())
    }

    fn push_ptr_txt(
        update: &mut AuthorityBuilder<Vec<u8>>,
        owner: &Name<Bytes>,
        ptr_value: &str,
        txt: &str,
    ) -> Result<()> {
        let ptr_name: Name<Bytes> = Name::from_str(ptr_value)?;
        update.push(Record::new(
            owner.clone(),
            Class::IN,
            Ttl::from_secs(TTL),
            Ptr::new(ptr_name),
        ))?;
        let txt: Txt<Vec<u8>> =
            Txt::build_from_slice(txt.as_bytes()).map_err(|e| Error::wire(e.to_string()))?;
        update.push(Record::new(
            owner.clone(),
            Class::IN,
            Ttl::from_secs(TTL),
            txt,
        ))?;
        Ok(())
    }

    fn txt_payload(resolution: &crate::db::associator::Resolution, score: f64) -> String {
        format!(
            "depth={},first={},last={},count={},trend={},score={}",
            resolution.chain.depth(),
            resolution.first_seen,
            resolution.last_seen,
            resolution.query_count,
            resolution.query_trend,
            score,
        )
    }

    /// Looks up the live best resolution for an address; the update task
    /// deliberately reads the current state, not a solve-time snapshot.
    fn render_address(
        &self,
        associations: &Associator,
        address: &str,
        score: f64,
    ) -> Option<(String, String)> {
        let entry = associations.addresses.get(address)?;
        let best = match &entry.best_resolution {
            Some(best) => best,
            None => {
                log::error!(
                    target: "rpz",
                    "update: best resolution is absent for address {} with {} resolutions",
                    address,
                    entry.resolutions.len()
                );
                return None;
            }
        };
        let resolution = entry.resolutions.get(best)?;
        let ptr_value = entry.ptr_value()?;
        Some((ptr_value, Self::txt_payload(resolution, score)))
    }

    /// Builds the replace-owner UPDATE for an address, mutating the mirror
    /// to the intended post-write state. `None` means nothing to write.
    pub fn prepare_update(
        &self,
        associations: &Associations,
        address: &str,
        score: f64,
    ) -> Result<Option<Vec<u8>>> {
        let now = unix_now();
        let rendered = {
            let associations = associations.borrow();
            self.render_address(&associations, address, score)
        };
        let Some((ptr_value, txt)) = rendered else {
            return Ok(None);
        };

        let qname = address_to_reverse(address);
        if let Some(entry) = self.contents.borrow().get(&qname) {
            if entry.ptr.as_deref() == Some(ptr_value.as_str()) && !entry.needs_refresh(now) {
                return Ok(None);
            }
        }
        self.contents
            .borrow_mut()
            .update_entry(&qname, Rtype::PTR, &ptr_value, now);

        let owner = self.owner_name(&qname)?;
        let mut update = self.update_builder()?;
        Self::push_delete_owner(&mut update, &owner)?;
        Self::push_ptr_txt(&mut update, &owner, &ptr_value, &txt)?;
        Ok(Some(update.additional().finish()))
    }

    async fn update(
        &self,
        conn: &mut Connection,
        associations: &Associations,
        address: &str,
        score: f64,
    ) -> Result<()> {
        let Some(wire) = self.prepare_update(associations, address, score)? else {
            return Ok(());
        };
        let response = conn.request(&wire).await?;
        let rcode = rcode_of(&response)?;
        if rcode != Rcode::NOERROR {
            (self.global_error)("update", rcode);
        }
        Ok(())
    }

    /// Builds the remove-owner UPDATE; no-op when the owner is not mirrored.
    pub fn prepare_delete(&self, address: &str) -> Result<Option<Vec<u8>>> {
        let qname = address_to_reverse(address);
        if self.contents.borrow_mut().remove(&qname).is_none() {
            return Ok(None);
        }

        let owner = self.owner_name(&qname)?;
        let mut update = self.update_builder()?;
        Self::push_delete_owner(&mut update, &owner)?;
        Ok(Some(update.additional().finish()))
    }

    async fn delete(&self, conn: &mut Connection, address: &str) -> Result<()> {
        let Some(wire) = self.prepare_delete(address)? else {
            return Ok(());
        };
        let response = conn.request(&wire).await?;
        let rcode = rcode_of(&response)?;
        if rcode != Rcode::NOERROR {
            (self.global_error)("delete", rcode);
        }
        Ok(())
    }

    /// Accumulates survivors of an eviction pass for a metadata rewrite.
    /// Opening a batch schedules its write behind whatever the queue holds.
    pub fn add_to_batch_refresh(&self, batch: Vec<(String, f64)>, counters: RefreshCounters) {
        if batch.is_empty() && counters.recycled == 0 {
            return;
        }
        let now = unix_now();
        let schedule = {
            let mut state = self.batch.borrow_mut();
            let mut log = self.batch_log.borrow_mut();
            let opened = if !state.open {
                state.open = true;
                log.rotate(now);
                true
            } else {
                false
            };
            if let Some(entry) = log.current() {
                entry.phase = BatchPhase::Accumulating;
                entry.add_calls += 1;
                entry.to_process += batch.len();
                entry.recycled += counters.recycled;
                entry.recycled_good += counters.good;
                entry.recycled_no_best_resolution += counters.no_best;
                entry.recycled_no_resolutions += counters.no_resolutions;
            }
            state.pending.extend(batch);
            opened
        };
        if schedule {
            self.enqueue(RpzTask::BatchRefresh);
        }
    }

    /// One UPDATE rewriting PTR+TXT for every address still carrying its
    /// best resolution; idempotent with respect to the mirror.
    async fn write_batch(&self, conn: &mut Connection, associations: &Associations) -> Result<()> {
        let pending = {
            let mut state = self.batch.borrow_mut();
            state.open = false;
            std::mem::take(&mut state.pending)
        };
        let now = unix_now();
        if let Some(entry) = self.batch_log.borrow_mut().current() {
            entry.phase = BatchPhase::Writing;
            entry.threshold_timestamp = now;
        }

        let mut update = self.update_builder()?;
        let mut written = 0;
        for (address, score) in &pending {
            let rendered = {
                let associations = associations.borrow();
                associations.addresses.get(address).and_then(|entry| {
                    let best = entry.best_resolution.as_ref()?;
                    let resolution = entry.resolutions.get(best)?;
                    let ptr_value = entry.ptr_value()?;
                    Some((ptr_value, Self::txt_payload(resolution, *score)))
                })
            };
            let Some((ptr_value, txt)) = rendered else {
                continue;
            };
            let qname = address_to_reverse(address);
            self.contents
                .borrow_mut()
                .update_entry(&qname, Rtype::PTR, &ptr_value, unix_now());
            let owner = self.owner_name(&qname)?;
            Self::push_delete_owner(&mut update, &owner)?;
            Self::push_ptr_txt(&mut update, &owner, &ptr_value, &txt)?;
            written += 1;
        }

        if let Some(entry) = self.batch_log.borrow_mut().current() {
            entry.batch_size = written;
        }
        if written == 0 {
            if let Some(entry) = self.batch_log.borrow_mut().current() {
                entry.phase = BatchPhase::Complete;
                entry.completion_timestamp = unix_now();
            }
            return Ok(());
        }

        let wire = update.additional().finish();
        let response = conn.request(&wire).await?;
        let rcode = rcode_of(&response)?;
        if let Some(entry) = self.batch_log.borrow_mut().current() {
            entry.phase = BatchPhase::Complete;
            entry.update_rcode = Some(rcode.to_int());
            entry.wire_req_bytes = wire.len();
            entry.wire_resp_bytes = response.len();
            entry.completion_timestamp = unix_now();
        }
        if rcode != Rcode::NOERROR {
            (self.global_error)("batch refresh", rcode);
        }
        Ok(())
    }

    /// Use AXFR to load the RPZ context and seed the associations.
    async fn load_axfr(&self, conn: &mut Connection, associations: &Associations) -> Result<()> {
        let keep_open = conn.keep_open;
        conn.keep_open = true;
        let result = self.load_axfr_(conn, associations).await;
        conn.keep_open = keep_open;
        if !keep_open && self.task_queue.is_empty() {
            conn.close();
        }
        result
    }

    async fn load_axfr_(&self, conn: &mut Connection, associations: &Associations) -> Result<()> {
        let mut builder = MessageBuilder::new_vec();
        builder.header_mut().set_id(self.next_id());
        let mut question = builder.question();
        question.push((&self.zone_name, Rtype::AXFR))?;
        let query = question.additional().finish();

        let mut wire = conn.request(&query).await?;
        let mut cache: HashMap<String, PackageBuilder> = HashMap::new();
        let mut saw_leading_soa = false;

        'transfer: loop {
            let message = Message::from_octets(Bytes::from(wire))?;
            let rcode = message.header().rcode();
            if rcode != Rcode::NOERROR {
                (self.global_error)("axfr - rcode", rcode);
                return Ok(());
            }

            for record in message.answer()? {
                let record = record?;
                let Some(record) =
                    record.to_record::<AllRecordData<Bytes, ParsedName<Bytes>>>()?
                else {
                    continue;
                };
                let qname = name_string(record.owner());

                if !saw_leading_soa {
                    match record.data() {
                        AllRecordData::Soa(_) if qname == self.zone => {
                            saw_leading_soa = true;
                            continue;
                        }
                        AllRecordData::Soa(_) => {
                            (self.global_error)("axfr - wrong soa", rcode);
                            return Ok(());
                        }
                        _ => {
                            (self.global_error)("axfr - no soa", rcode);
                            return Ok(());
                        }
                    }
                }

                let rtype = record.rtype();
                match record.data() {
                    AllRecordData::Soa(_) if qname == self.zone => break 'transfer,
                    AllRecordData::Ptr(ptr) => {
                        let rval = name_string(ptr.ptrdname());
                        self.process_zone_rec(associations, &mut cache, &qname, Rtype::PTR, &rval);
                    }
                    AllRecordData::Txt(txt) => {
                        let Ok(text) = txt.try_text::<Vec<u8>>() else {
                            continue;
                        };
                        let rval = String::from_utf8_lossy(&text).into_owned();
                        self.process_zone_rec(associations, &mut cache, &qname, Rtype::TXT, &rval);
                    }
                    _ => {
                        if let Some(garbage_logger) = &self.garbage_logger {
                            garbage_logger(&format!(
                                "unexpected {} record at {} in zonefile on load",
                                rtype, qname
                            ));
                        }
                    }
                }
            }

            wire = conn.read_more().await?;
        }

        log::info!(
            target: "axfr",
            "loaded {} owners from {}",
            self.contents.borrow().len(),
            self.zone
        );
        Ok(())
    }

    /// Updates the mirror and, once a PTR+TXT pair is complete, the
    /// telemetry view, from one zone record.
    fn process_zone_rec(
        &self,
        associations: &Associations,
        cache: &mut HashMap<String, PackageBuilder>,
        qname: &str,
        rtype: Rtype,
        rval: &str,
    ) {
        if !(self.address_records.contains(&AddressRecord::A) && is_v4_reverse(qname)) {
            if let Some(garbage_logger) = &self.garbage_logger {
                garbage_logger(&format!("unexpected qname {} in zonefile on load", qname));
            }
            return;
        }

        self.contents
            .borrow_mut()
            .update_entry(qname, rtype, rval, unix_now());

        let builder = cache.entry(qname.to_string()).or_default();
        match rtype {
            Rtype::PTR => builder.set_ptr(rval),
            Rtype::TXT => builder.set_txt(rval),
            _ => return,
        }

        if builder.complete() {
            if let Some(package) = builder.build() {
                let address = reverse_to_address(qname);
                associations
                    .borrow_mut()
                    .update_resolution_from_rpz(&address, &package, unix_now());
            }
            cache.remove(qname);
        }
    }
}

fn rcode_of(wire: &[u8]) -> Result<Rcode> {
    let message = Message::from_octets(wire)?;
    Ok(message.header().rcode())
}

/// Lowercase, trailing-dot rendering of any name type.
fn name_string(name: impl std::fmt::Display) -> String {
    let mut s = name.to_string().to_lowercase();
    if !s.ends_with('.') {
        s.push('.');
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::net::Ipv4Addr;

    use crate::db::associator::Chain;
    use crate::heuristic;

    const TIME_NOW: f64 = 23456789.54321;

    fn rpz() -> Rc<Rpz> {
        Rpz::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            "rpz.example.com",
            vec![AddressRecord::A, AddressRecord::Aaaa],
            None,
            None,
        )
        .unwrap()
    }

    fn associations() -> Associations {
        Rc::new(StdRefCell::new(Associator::new(
            20,
            Box::new(|| {}),
            heuristic::standard,
        )))
    }

    fn chain(labels: &[&str]) -> Chain {
        Chain::live(labels.iter().map(|l| l.to_string()))
    }

    fn decoded(wire: &[u8]) -> Message<Bytes> {
        Message::from_octets(Bytes::copy_from_slice(wire)).unwrap()
    }

    fn seed_best(associations: &Associations, address: &str, labels: &[&str]) {
        let mut associations = associations.borrow_mut();
        associations.update_resolution(address, chain(labels), TIME_NOW);
        let entry = associations.addresses.get_mut(address).unwrap();
        entry.best_resolution = Some(chain(labels));
        entry.best_score = 1.5;
    }

    #[test]
    fn update_wire_replaces_the_owner() {
        let rpz = rpz();
        let associations = associations();
        seed_best(&associations, "10.0.0.224", &["sophia.m3047.", "docs.m3047."]);

        let wire = rpz
            .prepare_update(&associations, "10.0.0.224", 2.5)
            .unwrap()
            .expect("an update should be composed");

        let message = decoded(&wire);
        assert_eq!(message.header().opcode(), Opcode::UPDATE);

        let question = message.sole_question().unwrap();
        assert_eq!(question.qtype(), Rtype::SOA);
        assert_eq!(name_string(question.qname()), "rpz.example.com.");

        let mut records = Vec::new();
        for record in message.authority().unwrap() {
            let record = record.unwrap();
            let record = record
                .to_record::<AllRecordData<Bytes, ParsedName<Bytes>>>()
                .unwrap()
                .unwrap();
            records.push(record);
        }
        assert_eq!(records.len(), 3);

        let owner = "224.0.0.10.in-addr.arpa.rpz.example.com.";
        assert_eq!(name_string(records[0].owner()), owner);
        assert_eq!(records[0].class(), Class::ANY);
        assert_eq!(records[0].rtype(), Rtype::ANY);
        assert_eq!(records[0].ttl(), Ttl::from_secs(0));

        assert_eq!(name_string(records[1].owner()), owner);
        assert_eq!(records[1].ttl(), Ttl::from_secs(TTL));
        match records[1].data() {
            AllRecordData::Ptr(ptr) => {
                assert_eq!(name_string(ptr.ptrdname()), "docs.m3047.");
            }
            _ => panic!("expected a PTR"),
        }

        match records[2].data() {
            AllRecordData::Txt(txt) => {
                let text = txt.try_text::<Vec<u8>>().unwrap();
                let text = String::from_utf8(text).unwrap();
                assert!(text.starts_with("depth=2,first="), "{}", text);
                assert!(text.contains(",count=1,"), "{}", text);
                assert!(text.ends_with(",score=2.5"), "{}", text);
            }
            _ => panic!("expected a TXT"),
        }

        // The mirror already reflects the intended post-write state.
        let contents = rpz.contents.borrow();
        let entry = contents.get("224.0.0.10.in-addr.arpa").unwrap();
        assert_eq!(entry.ptr.as_deref(), Some("docs.m3047."));
    }

    #[test]
    fn fresh_identical_update_is_skipped() {
        let rpz = rpz();
        let associations = associations();
        seed_best(&associations, "10.0.0.224", &["sophia.m3047.", "docs.m3047."]);

        let first = rpz.prepare_update(&associations, "10.0.0.224", 2.5).unwrap();
        assert!(first.is_some());
        let second = rpz.prepare_update(&associations, "10.0.0.224", 2.5).unwrap();
        assert!(second.is_none(), "same ptr and fresh mirror entry");
    }

    #[test]
    fn stale_mirror_entry_is_rewritten() {
        let rpz = rpz();
        let associations = associations();
        seed_best(&associations, "10.0.0.224", &["sophia.m3047.", "docs.m3047."]);

        rpz.prepare_update(&associations, "10.0.0.224", 2.5).unwrap();
        rpz.contents
            .borrow_mut()
            .get_mut("224.0.0.10.in-addr.arpa")
            .unwrap()
            .last_refresh = unix_now() - 31.0;

        let wire = rpz.prepare_update(&associations, "10.0.0.224", 2.5).unwrap();
        assert!(wire.is_some());
    }

    #[test]
    fn delete_is_a_noop_for_unmirrored_owners() {
        let rpz = rpz();
        assert!(rpz.prepare_delete("10.0.0.224").unwrap().is_none());
    }

    #[test]
    fn delete_removes_the_mirror_entry_and_composes() {
        let rpz = rpz();
        let associations = associations();
        seed_best(&associations, "10.0.0.224", &["sophia.m3047.", "docs.m3047."]);
        rpz.prepare_update(&associations, "10.0.0.224", 2.5).unwrap();

        let wire = rpz
            .prepare_delete("10.0.0.224")
            .unwrap()
            .expect("mirrored owner should compose a delete");

        assert!(!rpz.contents.borrow().contains("224.0.0.10.in-addr.arpa"));

        let message = decoded(&wire);
        assert_eq!(message.header().opcode(), Opcode::UPDATE);
        let record = message.authority().unwrap().next().unwrap().unwrap();
        assert_eq!(record.class(), Class::ANY);
        assert_eq!(record.rtype(), Rtype::ANY);
    }

    #[test]
    fn zone_rec_pair_seeds_a_reloaded_resolution() {
        let rpz = rpz();
        let associations = associations();
        let mut cache = HashMap::new();
        let qname = "4.3.2.1.in-addr.arpa.rpz.example.com.";

        rpz.process_zone_rec(&associations, &mut cache, qname, Rtype::PTR, "foo.example.com.");
        assert!(associations.borrow().addresses.is_empty());

        rpz.process_zone_rec(
            &associations,
            &mut cache,
            qname,
            Rtype::TXT,
            "depth=2,first=100.5,last=101.5,count=42,trend=2.0,score=4.2",
        );

        assert!(cache.is_empty());
        let associations = associations.borrow();
        let entry = &associations.addresses["1.2.3.4"];
        assert_eq!(entry.resolutions.len(), 1);
        let reloaded = Chain::reloaded(2, "foo.example.com.");
        let resolution = &entry.resolutions[&reloaded];
        assert_eq!(resolution.query_count, 42);
        assert_eq!(resolution.reload_score, Some(4.2));
        assert!(rpz.contents.borrow().contains("4.3.2.1.in-addr.arpa"));
    }

    #[test]
    fn garbage_records_are_routed_to_the_logger() {
        let seen: Rc<StdRefCell<Vec<String>>> = Rc::new(StdRefCell::new(Vec::new()));
        let sink = seen.clone();
        let rpz = Rpz::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            "rpz.example.com",
            vec![AddressRecord::A],
            Some(Box::new(move |message| {
                sink.borrow_mut().push(message.to_string())
            })),
            None,
        )
        .unwrap();
        let associations = associations();
        let mut cache = HashMap::new();

        rpz.process_zone_rec(
            &associations,
            &mut cache,
            "www.example.com.rpz.example.com.",
            Rtype::PTR,
            "foo.example.com.",
        );

        assert_eq!(seen.borrow().len(), 1);
        assert!(seen.borrow()[0].contains("www.example.com"));
        assert!(associations.borrow().addresses.is_empty());
        assert_eq!(rpz.contents.borrow().len(), 0);
    }

    #[test]
    fn batch_refresh_accumulates_and_schedules_once() {
        let rpz = rpz();

        rpz.add_to_batch_refresh(
            vec![("10.0.0.1".to_string(), 1.0)],
            RefreshCounters {
                recycled: 3,
                good: 1,
                no_best: 1,
                no_resolutions: 1,
            },
        );
        rpz.add_to_batch_refresh(
            vec![("10.0.0.2".to_string(), 1.0)],
            RefreshCounters {
                recycled: 1,
                good: 1,
                ..Default::default()
            },
        );

        assert_eq!(rpz.task_queue.len(), 1, "one write scheduled per batch");
        let log = rpz.batch_log.borrow();
        assert_eq!(log.len(), 1);
        let entry = log.last_n(1).next().unwrap();
        assert_eq!(entry.phase, BatchPhase::Accumulating);
        assert_eq!(entry.add_calls, 2);
        assert_eq!(entry.to_process, 2);
        assert_eq!(entry.recycled, 4);
        assert_eq!(entry.recycled_good, 2);
        assert_eq!(entry.recycled_no_best_resolution, 1);
        assert_eq!(entry.recycled_no_resolutions, 1);
    }

    #[test]
    fn empty_batch_with_no_counters_is_ignored() {
        let rpz = rpz();
        rpz.add_to_batch_refresh(Vec::new(), RefreshCounters::default());

        assert_eq!(rpz.task_queue.len(), 0);
        assert_eq!(rpz.batch_log.borrow().len(), 0);
    }

    #[test]
    fn axfr_query_asks_for_the_zone() {
        let rpz = rpz();
        let mut builder = MessageBuilder::new_vec();
        builder.header_mut().set_id(rpz.next_id());
        let mut question = builder.question();
        question.push((&rpz.zone_name, Rtype::AXFR)).unwrap();
        let wire = question.additional().finish();

        let message = decoded(&wire);
        let question = message.sole_question().unwrap();
        assert_eq!(question.qtype(), Rtype::AXFR);
        assert_eq!(name_string(question.qname()), "rpz.example.com.");
    }
}
