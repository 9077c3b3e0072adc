use std::net::{IpAddr, Ipv4Addr};

use serde::Deserialize;

use crate::error::Result;

pub const BASE_CONFIG_FILE: &str = "rpzr.yml";
pub const CONFIG_ENV: &str = "RPZR_CONFIG";

pub const DEFAULT_CACHE_SIZE: usize = 10_000;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub rpz: RpzConfig,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default = "default_address_records")]
    pub address_records: Vec<AddressRecord>,
    pub listener: ListenerConfig,
    #[serde(default)]
    pub console: Option<ConsoleConfig>,
    /// Statistics reporting period in seconds. Absent disables collection.
    #[serde(default)]
    pub stats: Option<u64>,
    /// Name of the per-datagram sequence id field in the telemetry JSON.
    #[serde(default)]
    pub telemetry_id: Option<String>,
    #[serde(default)]
    pub heuristic: HeuristicChoice,
    #[serde(default)]
    pub log: LogConfig,
}

impl TryFrom<&Vec<u8>> for Config {
    type Error = crate::error::Error;

    fn try_from(value: &Vec<u8>) -> Result<Self> {
        let config: Config = serde_yaml::from_slice(value)?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    pub fn config_file_path() -> String {
        std::env::var(CONFIG_ENV).unwrap_or(BASE_CONFIG_FILE.into())
    }

    fn validate(&self) -> Result<()> {
        match self.listener.address {
            IpAddr::V4(v4) if v4.is_multicast() => {
                if self.listener.interface.is_none() {
                    return Err(crate::error::Error::telemetry(
                        "multicast listener requires an interface",
                    ));
                }
            }
            _ => {
                if self.listener.interface.is_some() {
                    return Err(crate::error::Error::telemetry(
                        "interface specified, but listener address is not multicast",
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpzConfig {
    /// The response policy zone updates are written into.
    pub zone: String,
    #[serde(default = "default_server")]
    pub server: IpAddr,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ListenerConfig {
    pub address: IpAddr,
    pub port: u16,
    /// Local interface for the multicast join. Only valid (and required)
    /// when `address` is a multicast group.
    #[serde(default)]
    pub interface: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleConfig {
    pub host: IpAddr,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressRecord {
    A,
    Aaaa,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeuristicChoice {
    Standard,
    #[default]
    Attenuating,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LogConfig {
    #[serde(deserialize_with = "de_level_filter", default = "default_level")]
    pub level: log::LevelFilter,
    #[serde(default)]
    pub stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_level(),
            stderr: false,
        }
    }
}

fn default_cache_size() -> usize {
    DEFAULT_CACHE_SIZE
}

fn default_address_records() -> Vec<AddressRecord> {
    vec![AddressRecord::A, AddressRecord::Aaaa]
}

fn default_server() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_level() -> log::LevelFilter {
    log::LevelFilter::Info
}

fn de_level_filter<'de, D>(deserializer: D) -> std::result::Result<log::LevelFilter, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: LevelFilter = Deserialize::deserialize(deserializer)?;
    match s {
        LevelFilter::Off => Ok(log::LevelFilter::Off),
        LevelFilter::Error => Ok(log::LevelFilter::Error),
        LevelFilter::Warn => Ok(log::LevelFilter::Warn),
        LevelFilter::Info => Ok(log::LevelFilter::Info),
        LevelFilter::Debug => Ok(log::LevelFilter::Debug),
        LevelFilter::Trace => Ok(log::LevelFilter::Trace),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum LevelFilter {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}
