//! An interactive console for examining the in-memory structures.
//!
//! Commands run synchronously with respect to the agent (the single
//! executor isn't doing anything else mid-command), which gives a clean
//! snapshot but can slow a busy server down. Every response line carries a
//! status code: 200 single-line success, 210 first line of multi-line
//! output, 212 continuation, 400 user error, 500 not found / internal.

use std::net::IpAddr;
use std::rc::Rc;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use domain::base::iana::Rcode;
use domain::base::name::Name;
use domain::base::{Message, MessageBuilder, ParsedName, Rtype};
use domain::rdata::AllRecordData;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::db::Agent;
use crate::error::{Error, Result};
use crate::rpz::mirror::{address_to_reverse, reverse_to_address};
use crate::rpz::BatchPhase;
use crate::stats::unix_now;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    A2z,
    Address(String),
    Entry(String),
    Qd,
    Cache(char, usize),
    Evictions(usize),
    Refresh(usize),
    Quit,
}

enum Reply {
    Lines(Vec<String>),
    BadRequest(String),
    NotFound(String),
    Quit,
}

/// Expected token counts, verb included.
const COMMANDS: [(&str, usize); 8] = [
    ("a2z", 1),
    ("address", 2),
    ("entry", 2),
    ("qd", 1),
    ("cache", 3),
    ("evictions", 2),
    ("refresh", 2),
    ("quit", 1),
];

/// Verbs of four or more characters may be abbreviated to a prefix.
fn expand(verb: &str) -> String {
    let verb = verb.to_lowercase();
    if verb.len() >= 4 {
        for (name, _) in COMMANDS {
            if name.len() > 4 && name.starts_with(&verb) {
                return name.to_string();
            }
        }
    }
    verb
}

fn parse(line: &str) -> std::result::Result<Option<Command>, String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(first) = tokens.first() else {
        return Ok(None);
    };
    let verb = expand(first);

    let Some((_, expected)) = COMMANDS.iter().find(|(name, _)| *name == verb) else {
        return Err("unrecognized command".to_string());
    };
    if tokens.len() != *expected {
        return Err("improperly formed request".to_string());
    }

    let positive = |token: &str| -> std::result::Result<usize, String> {
        match token.parse::<usize>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err("expected a positive integer value".to_string()),
        }
    };

    let command = match verb.as_str() {
        "a2z" => Command::A2z,
        "address" => Command::Address(tokens[1].to_string()),
        "entry" => Command::Entry(tokens[1].to_string()),
        "qd" => Command::Qd,
        "cache" => {
            let end = tokens[1];
            if end != "<" && end != ">" {
                return Err("expected \"<\" or \">\"".to_string());
            }
            Command::Cache(end.chars().next().unwrap(), positive(tokens[2])?)
        }
        "evictions" => Command::Evictions(positive(tokens[1])?),
        "refresh" => Command::Refresh(positive(tokens[1])?),
        "quit" => Command::Quit,
        _ => unreachable!(),
    };
    Ok(Some(command))
}

fn render(reply: &Reply) -> String {
    match reply {
        Reply::Quit => String::new(),
        Reply::BadRequest(reason) => format!("400 {}\n", reason),
        Reply::NotFound(reason) => format!("500 {}\n", reason),
        Reply::Lines(lines) => match lines.len() {
            0 => "200 ok\n".to_string(),
            1 => format!("200 {}\n", lines[0]),
            _ => {
                let mut out = String::new();
                for (i, line) in lines.iter().enumerate() {
                    out.push_str(if i == 0 { "210 " } else { "212 " });
                    out.push_str(line);
                    out.push('\n');
                }
                out
            }
        },
    }
}

pub struct Console {
    agent: Rc<Agent>,
}

impl Console {
    pub fn new(agent: Rc<Agent>) -> Rc<Self> {
        Rc::new(Console { agent })
    }

    pub async fn run(self: Rc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    log::info!(target: "console", "connection from {}", peer);
                    let console = self.clone();
                    tokio::task::spawn_local(async move {
                        console.handle_requests(stream).await;
                    });
                }
                Err(e) => {
                    log::warn!(target: "console", "accept failed: {}", e);
                }
            }
        }
    }

    async fn handle_requests(&self, stream: TcpStream) {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        loop {
            if writer.write_all(b"# ").await.is_err() {
                break;
            }
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                _ => break,
            };

            let reply = match parse(&line) {
                Ok(Some(command)) => self.dispatch(command).await,
                Ok(None) => continue,
                Err(reason) => Reply::BadRequest(reason),
            };
            if matches!(reply, Reply::Quit) {
                break;
            }
            if Self::send(&mut writer, &render(&reply)).await.is_err() {
                break;
            }
        }
    }

    async fn send(writer: &mut OwnedWriteHalf, response: &str) -> Result<()> {
        writer.write_all(response.as_bytes()).await?;
        Ok(())
    }

    async fn dispatch(&self, command: Command) -> Reply {
        match command {
            Command::A2z => self.a2z(),
            Command::Address(address) => self.address(&address),
            Command::Entry(address) => self.entry(&address).await,
            Command::Qd => self.qd(),
            Command::Cache(end, count) => self.cache(end, count),
            Command::Evictions(count) => self.evictions(count),
            Command::Refresh(count) => self.refresh(count),
            Command::Quit => Reply::Quit,
        }
    }

    /// Crosscheck of association addresses against mirrored zone owners.
    fn a2z(&self) -> Reply {
        let associations = self.agent.associations.borrow();
        let contents = self.agent.rpz.contents.borrow();

        let mut addresses: Vec<&String> = associations.addresses.keys().collect();
        addresses.sort();
        let mut zonekeys: Vec<(String, &String)> = contents
            .keys()
            .map(|zk| (reverse_to_address(zk), zk))
            .collect();
        zonekeys.sort();

        let mut lines = Vec::new();
        let mut addresses = addresses.into_iter().peekable();
        let mut zonekeys = zonekeys.into_iter().peekable();
        loop {
            match (addresses.peek(), zonekeys.peek()) {
                (Some(&address), Some((extracted, zonekey))) => {
                    if address < extracted {
                        lines.push(format!("< {}", address));
                        addresses.next();
                    } else if address > extracted {
                        lines.push(format!("> {}", zonekey));
                        zonekeys.next();
                    } else {
                        addresses.next();
                        zonekeys.next();
                    }
                }
                (Some(&address), None) => {
                    lines.push(format!("< {}", address));
                    addresses.next();
                }
                (None, Some((_, zonekey))) => {
                    lines.push(format!("> {}", zonekey));
                    zonekeys.next();
                }
                (None, None) => break,
            }
        }
        Reply::Lines(lines)
    }

    /// Dump an address' resolutions, its best pick and the mirrored PTR.
    fn address(&self, address: &str) -> Reply {
        let associations = self.agent.associations.borrow();
        let Some(entry) = associations.addresses.get(address) else {
            return Reply::NotFound("not found".to_string());
        };
        let contents = self.agent.rpz.contents.borrow();
        let heuristic = self.agent.heuristic();
        let now = unix_now();

        let zone_key = address_to_reverse(address);
        let mirrored = contents.get(&zone_key).and_then(|e| e.ptr.clone());
        let ptr_chain = mirrored
            .as_deref()
            .and_then(|ptr| entry.match_ptr(ptr));

        let mut lines = Vec::new();
        match &entry.best_resolution {
            None => {
                // A reloaded chain explains the missing best pick.
                if !ptr_chain.map(|c| c.is_reloaded()).unwrap_or(false) {
                    lines.push("! no best resolution".to_string());
                }
            }
            Some(best) => {
                if !entry.resolutions.contains_key(best) {
                    lines.push("! best resolution not in chains".to_string());
                }
            }
        }

        let mut resolutions: Vec<_> = entry.resolutions.values().collect();
        resolutions.sort_by(|a, b| a.chain.cmp(&b.chain));
        for resolution in resolutions {
            let marker = if entry.best_resolution.as_ref() == Some(&resolution.chain) {
                "***"
            } else {
                "   "
            };
            lines.push(format!("{} {}", marker, resolution.chain));
            lines.push(format!(
                "        fs:{:.1} ls:{:.1} qc:{} qt:{:.1} h:{:.1}",
                resolution.first_seen - now,
                resolution.last_seen - now,
                resolution.query_count,
                resolution.query_trend,
                heuristic(resolution, now),
            ));
        }

        match mirrored {
            Some(ptr) => lines.push(format!("-> {}", ptr)),
            None => lines.push("-> MISSING FROM ZONE CONTENTS".to_string()),
        }
        Reply::Lines(lines)
    }

    /// Compare the mirrored PTR against the zone as actually served.
    async fn entry(&self, address: &str) -> Reply {
        let zone_key = address_to_reverse(address);
        let memory_value = {
            let contents = self.agent.rpz.contents.borrow();
            contents
                .get(&zone_key)
                .and_then(|e| e.ptr.clone())
                .unwrap_or_else(|| "** MISSING **".to_string())
        };

        let qname = format!("{}.{}", zone_key, self.agent.rpz.zone);
        let server_value = match query_ptr(self.agent.rpz.server(), &qname).await {
            Ok(value) => value,
            Err(e) => format!("** {} **", e),
        };

        Reply::Lines(vec![format!("{} {}", memory_value, server_value)])
    }

    /// The depths of the processing queues.
    fn qd(&self) -> Reply {
        Reply::Lines(vec![
            format!("association: {}", self.agent.association_queue.len()),
            format!("solver: {}", self.agent.solver_queue.len()),
            format!("eviction: {}", self.agent.eviction_pending()),
            format!("zone updates: {}", self.agent.rpz.task_queue.len()),
        ])
    }

    /// Addresses at the head (<) or tail (>) of the eviction queue.
    fn cache(&self, end: char, count: usize) -> Reply {
        let associations = self.agent.associations.borrow();

        let recount: usize = associations
            .addresses
            .values()
            .map(|a| a.resolutions.len())
            .sum();
        let mut lines = vec![format!(
            "Actual Resolutions in cache: {}  actual: {}",
            associations.n_resolutions, recount
        )];

        let count = count.min(associations.cache.len());
        let slots: Vec<&String> = if end == '<' {
            associations.cache.iter().take(count).collect()
        } else {
            associations.cache.iter().rev().take(count).collect()
        };
        for key in slots {
            let resolutions = associations
                .addresses
                .get(key)
                .map(|a| a.resolutions.len())
                .unwrap_or(0);
            lines.push(format!("{} ({})", key, resolutions));
        }
        Reply::Lines(lines)
    }

    /// Readout of the most recent eviction passes.
    fn evictions(&self, count: usize) -> Reply {
        let associations = self.agent.associations.borrow();
        let now = unix_now();
        let mut lines = Vec::new();

        for pass in associations.log.last_n(count) {
            lines.push(format!("** {:.3} **", pass.timestamp - now));
            lines.push("Resolutions:".to_string());
            lines.push(format!(
                "     Overage:{:>6}      Target:{:>6}      Working:{:>6}      N After:{:>6}",
                pass.overage, pass.target_pool_size, pass.working_pool_size, pass.n_resolutions
            ));
            lines.push("Addresses:".to_string());
            let (label, value) = if pass.n_addresses > 1 {
                ("Recycled", pass.recycled.len())
            } else {
                ("Single", pass.single_address.unwrap_or(0))
            };
            lines.push(format!(
                "    Selected:{:>6}  {:>10}:{:>6}      Affected:{:>6}     Deleted:{:>6}",
                pass.n_addresses,
                label,
                value,
                pass.affected.len(),
                pass.deleted.len()
            ));
            lines.push("Affected:".to_string());
            lines.extend(pass.affected.iter().map(|a| format!("    {}", a)));
            lines.push("Deleted:".to_string());
            lines.extend(pass.deleted.iter().map(|a| format!("    {}", a)));
            if pass.n_addresses > 1 {
                lines.push("Recycled:".to_string());
                lines.extend(pass.recycled.iter().map(|a| format!("    {}", a)));
            }
            lines.push("Candidates:".to_string());
            for candidate in &pass.candidates {
                lines.push(format!(
                    "    {:>8.1}    {:>3}   {}",
                    candidate.score, candidate.seq, candidate.address
                ));
                lines.push(format!("          {}", candidate.chain));
            }
        }
        Reply::Lines(lines)
    }

    /// Readout of the most recent zone refresh batches.
    fn refresh(&self, count: usize) -> Reply {
        let log = self.agent.rpz.batch_log.borrow();
        let now = unix_now();
        let mut lines = Vec::new();

        for batch in log.last_n(count) {
            lines.push(format!(
                "** {:.3} {} **",
                batch.timestamp - now,
                batch.phase.to_string().to_uppercase()
            ));
            if batch.phase >= BatchPhase::Accumulating {
                let size = if batch.phase >= BatchPhase::Complete {
                    format!("Batch Size:{:>4}", batch.batch_size)
                } else {
                    String::new()
                };
                lines.push(format!(
                    "Add Calls:{:>4}    Total to Process:{:>4}    {}",
                    batch.add_calls, batch.to_process, size
                ));
                lines.push(format!(
                    "Recycled   Good:{:>4}   No Best:{:>4}  No Resolutions:{:>4}",
                    batch.recycled_good,
                    batch.recycled_no_best_resolution,
                    batch.recycled_no_resolutions
                ));
            }
            if let Some(rcode) = batch.update_rcode {
                lines.push(format!(
                    "RCode:{:>3}      Wire Size Request:{:>5}   Response:{:>4}",
                    rcode, batch.wire_req_bytes, batch.wire_resp_bytes
                ));
            }
            if batch.phase >= BatchPhase::Writing {
                let processing = if batch.phase >= BatchPhase::Complete {
                    format!(
                        "Processing:{:.3}",
                        batch.completion_timestamp - batch.threshold_timestamp
                    )
                } else {
                    String::new()
                };
                lines.push(format!(
                    "Elapsed   Accumulating:{:.3}  {}",
                    batch.threshold_timestamp - batch.timestamp,
                    processing
                ));
            }
        }
        Reply::Lines(lines)
    }
}

/// One-shot PTR lookup against the authoritative server, outside the RPZ
/// client's TCP channel.
async fn query_ptr(server: IpAddr, qname: &str) -> Result<String> {
    let mut builder = MessageBuilder::new_vec();
    builder.header_mut().set_id((unix_now() * 1000.0) as u16);
    builder.header_mut().set_rd(true);
    let mut question = builder.question();
    let name: Name<Vec<u8>> = Name::from_str(qname)?;
    question.push((&name, Rtype::PTR))?;
    let wire = question.additional().finish();

    let bind_addr: std::net::SocketAddr = if server.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.send_to(&wire, (server, 53)).await?;

    let mut buffer = vec![0u8; 4096];
    let (received, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buffer))
        .await
        .map_err(|_| Error::wire("Timeout"))??;
    buffer.truncate(received);

    let message = Message::from_octets(Bytes::from(buffer))?;
    let rcode = message.header().rcode();
    if rcode == Rcode::NXDOMAIN {
        return Err(Error::wire("NXDOMAIN"));
    }
    if rcode != Rcode::NOERROR {
        return Err(Error::wire(format!("rcode {}", rcode)));
    }
    for record in message.answer()? {
        let record = record?;
        let Some(record) = record.to_record::<AllRecordData<Bytes, ParsedName<Bytes>>>()? else {
            continue;
        };
        if let AllRecordData::Ptr(ptr) = record.data() {
            return Ok(ptr
                .ptrdname()
                .to_string()
                .trim_end_matches('.')
                .to_lowercase());
        }
    }
    Err(Error::wire("no PTR in answer"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_expand_and_validate() {
        assert_eq!(parse("a2z").unwrap(), Some(Command::A2z));
        assert_eq!(
            parse("addr 10.0.0.1").unwrap(),
            Some(Command::Address("10.0.0.1".to_string()))
        );
        assert_eq!(parse("evict 5").unwrap(), Some(Command::Evictions(5)));
        assert_eq!(parse("refr 2").unwrap(), Some(Command::Refresh(2)));
        assert_eq!(parse("cache < 10").unwrap(), Some(Command::Cache('<', 10)));
        assert_eq!(parse("QUIT").unwrap(), Some(Command::Quit));
        assert_eq!(parse("  ").unwrap(), None);
    }

    #[test]
    fn bad_requests_are_reported() {
        assert_eq!(parse("bogus").unwrap_err(), "unrecognized command");
        assert_eq!(parse("a2z extra").unwrap_err(), "improperly formed request");
        assert_eq!(parse("address").unwrap_err(), "improperly formed request");
        assert_eq!(parse("cache ^ 10").unwrap_err(), "expected \"<\" or \">\"");
        assert_eq!(
            parse("evictions zero").unwrap_err(),
            "expected a positive integer value"
        );
        assert_eq!(
            parse("evictions 0").unwrap_err(),
            "expected a positive integer value"
        );
        // Three letters is too short to abbreviate.
        assert_eq!(parse("add 10.0.0.1").unwrap_err(), "unrecognized command");
    }

    #[test]
    fn responses_carry_status_codes() {
        assert_eq!(
            render(&Reply::Lines(vec!["one".to_string()])),
            "200 one\n"
        );
        assert_eq!(
            render(&Reply::Lines(vec!["one".to_string(), "two".to_string()])),
            "210 one\n212 two\n"
        );
        assert_eq!(render(&Reply::BadRequest("nope".to_string())), "400 nope\n");
        assert_eq!(render(&Reply::NotFound("not found".to_string())), "500 not found\n");
        assert_eq!(render(&Reply::Quit), "");
    }
}
