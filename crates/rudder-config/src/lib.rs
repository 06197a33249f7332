//! Configuration schema and loading for the rudder proxy router.
//!
//! The configuration file is an INI-style document with four recognized
//! sections:
//!
//! ```ini
//! [General]
//! port = 7890
//! socks-port = 7891
//!
//! [Proxy]
//! tunnel-a = ss, server.example.com, 8388, aes-256-gcm, secret
//!
//! [Proxy Group]
//! auto = url-test, tunnel-a, tunnel-b, http://probe.test/, 300
//!
//! [Rule]
//! DOMAIN-SUFFIX,ads.example.com,REJECT
//! GEOIP,CN,DIRECT
//! FINAL,,auto
//! ```
//!
//! `[Rule]` lines are ordered; order is the routing policy. Unknown proxy
//! and group kinds are skipped, unknown rule types are errors.

mod parser;

use std::fs;
use std::path::Path;

use rudder_core::defaults;
use rudder_rules::{RuleDef, RulesError};

pub use parser::parse;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Rule(#[from] RulesError),
    #[error("proxy '{name}': {reason}")]
    Proxy { name: String, reason: String },
    #[error("proxy group '{name}': {reason}")]
    Group { name: String, reason: String },
    #[error("[General]: {0}")]
    General(String),
}

/// `[General]` section.
#[derive(Debug, Clone)]
pub struct General {
    /// HTTP proxy listen port.
    pub port: u16,
    /// SOCKS5 listen port.
    pub socks_port: u16,
    /// Management endpoint address; parsed but not served.
    pub external_controller: Option<String>,
}

impl Default for General {
    fn default() -> Self {
        Self {
            port: defaults::DEFAULT_HTTP_PORT,
            socks_port: defaults::DEFAULT_SOCKS_PORT,
            external_controller: None,
        }
    }
}

/// One `[Proxy]` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDef {
    pub name: String,
    pub kind: ProxyKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyKind {
    /// `name = ss, server, port, cipher, password`
    Shadowsocks {
        server: String,
        port: u16,
        cipher: String,
        password: String,
    },
}

/// One `[Proxy Group]` entry (`url-test` is the only defined kind).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDef {
    pub name: String,
    /// Ordered member adapter names.
    pub members: Vec<String>,
    pub probe_url: String,
    pub interval_secs: u64,
}

/// A parsed configuration document.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub general: General,
    pub proxies: Vec<ProxyDef>,
    pub groups: Vec<GroupDef>,
    /// Ordered rule list; the order is the routing policy.
    pub rules: Vec<RuleDef>,
}

/// Read and parse a configuration file.
pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let text = fs::read_to_string(path)?;
    parse(&text)
}
