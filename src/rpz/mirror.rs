//! In-memory mirror of what the agent believes it has written to the RPZ,
//! plus the reverse-arpa helpers and the TXT telemetry-package parser.

use std::collections::HashMap;

use domain::base::Rtype;

use crate::db::associator::RpzPackage;

const REVERSE_SUFFIX: &str = ".in-addr.arpa";

/// All data for a reverse owner, which means the PTR record.
#[derive(Debug, Clone)]
pub struct ZoneEntry {
    pub ptr: Option<String>,
    pub last_refresh: f64,
}

impl ZoneEntry {
    // The name notwithstanding, needs_refresh() compares this against raw
    // seconds: entries go stale after 30 seconds, not 30 minutes.
    pub const TXT_RECORD_REFRESH_MINUTES: f64 = 30.0;

    fn new(now: f64) -> Self {
        ZoneEntry {
            ptr: None,
            last_refresh: now,
        }
    }

    fn update(&mut self, rtype: Rtype, rval: &str, now: f64) {
        if rtype == Rtype::PTR {
            self.ptr = Some(rval.to_string());
            self.last_refresh = now;
        }
    }

    /// True when the co-located TXT metadata is due for a rewrite.
    pub fn needs_refresh(&self, now: f64) -> bool {
        now - self.last_refresh > Self::TXT_RECORD_REFRESH_MINUTES
    }
}

/// Keyed by the reverse owner with the RPZ suffix and trailing dot
/// stripped: `4.3.2.1.in-addr.arpa`.
#[derive(Debug, Default)]
pub struct ZoneMirror {
    entries: HashMap<String, ZoneEntry>,
}

impl ZoneMirror {
    pub fn new() -> Self {
        Default::default()
    }

    /// Permissive: any qname carrying the reverse suffix is truncated to
    /// it, and the last PTR write wins.
    pub fn update_entry(&mut self, rname: &str, rtype: Rtype, rval: &str, now: f64) {
        let key = match rname.find(REVERSE_SUFFIX) {
            Some(at) => format!("{}{}", &rname[..at], REVERSE_SUFFIX),
            None => rname.trim_end_matches('.').to_string(),
        };
        self.entries
            .entry(key)
            .or_insert_with(|| ZoneEntry::new(now))
            .update(rtype, rval, now);
    }

    pub fn get(&self, key: &str) -> Option<&ZoneEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut ZoneEntry> {
        self.entries.get_mut(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<ZoneEntry> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }
}

/// Take the reverse lookup qname format and extract the address.
pub fn reverse_to_address(reverse_ref: &str) -> String {
    let prefix = match reverse_ref.find(REVERSE_SUFFIX) {
        Some(at) => &reverse_ref[..at],
        None => reverse_ref,
    };
    let mut octets: Vec<&str> = prefix.split('.').collect();
    octets.reverse();
    octets.join(".")
}

/// Take the address and construct the reverse lookup format.
pub fn address_to_reverse(address: &str) -> String {
    let mut octets: Vec<&str> = address.split('.').collect();
    octets.reverse();
    format!("{}{}", octets.join("."), REVERSE_SUFFIX)
}

/// Does the qname start with four octet labels under in-addr.arpa?
pub fn is_v4_reverse(qname: &str) -> bool {
    let Some(at) = qname.find(REVERSE_SUFFIX) else {
        return false;
    };
    let labels: Vec<&str> = qname[..at].split('.').collect();
    labels.len() == 4 && labels.iter().all(|l| !l.is_empty() && l.parse::<u8>().is_ok())
}

/// Accumulates the PTR value and the TXT `k=v` bag for one owner while an
/// AXFR streams by; becomes an [`RpzPackage`] once every field has shown up.
#[derive(Debug, Default)]
pub struct PackageBuilder {
    ptr: Option<String>,
    depth: Option<usize>,
    first: Option<f64>,
    last: Option<f64>,
    count: Option<u64>,
    trend: Option<f64>,
    score: Option<f64>,
}

impl PackageBuilder {
    pub fn set_ptr(&mut self, ptr: &str) {
        self.ptr = Some(ptr.to_string());
    }

    /// Folds one TXT rdata payload in. Keys may come in any order across
    /// several records; unknown keys are ignored.
    pub fn set_txt(&mut self, text: &str) {
        for kv in text.trim_matches('"').split(',') {
            let Some((k, v)) = kv.split_once('=') else {
                continue;
            };
            match k {
                "depth" => self.depth = v.parse().ok(),
                "first" => self.first = v.parse().ok(),
                "last" => self.last = v.parse().ok(),
                "count" => self.count = v.parse().ok(),
                "trend" => self.trend = v.parse().ok(),
                "score" => self.score = v.parse().ok(),
                _ => (),
            }
        }
    }

    pub fn complete(&self) -> bool {
        self.ptr.is_some()
            && self.depth.is_some()
            && self.first.is_some()
            && self.last.is_some()
            && self.count.is_some()
            && self.trend.is_some()
            && self.score.is_some()
    }

    pub fn build(&self) -> Option<RpzPackage> {
        Some(RpzPackage {
            ptr: self.ptr.clone()?,
            depth: self.depth?,
            first: self.first?,
            last: self.last?,
            count: self.count?,
            trend: self.trend?,
            score: self.score?,
        })
    }
}
