//! Rule definitions and matching.

use std::fmt;
use std::sync::Arc;

use ipnet::IpNet;
use rudder_proto::Address;

use crate::error::RulesError;
use crate::geoip::GeoIpDb;

/// Discriminant of a rule, used in match log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
    DomainSuffix,
    DomainKeyword,
    GeoIp,
    IpCidr,
    Final,
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuleType::DomainSuffix => "DomainSuffix",
            RuleType::DomainKeyword => "DomainKeyword",
            RuleType::GeoIp => "GEOIP",
            RuleType::IpCidr => "IPCIDR",
            RuleType::Final => "FINAL",
        };
        f.write_str(s)
    }
}

/// A parsed rule line, not yet bound to runtime state.
///
/// This is what the configuration layer produces from `TYPE,PATTERN,ADAPTER`
/// lines; [`Rule::bind`] turns it into a matchable [`Rule`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleDef {
    DomainSuffix { suffix: String, adapter: String },
    DomainKeyword { keyword: String, adapter: String },
    GeoIp { country: String, adapter: String },
    IpCidr { net: IpNet, adapter: String },
    Final { adapter: String },
}

impl RuleDef {
    /// The adapter name this rule routes to.
    pub fn adapter_name(&self) -> &str {
        match self {
            RuleDef::DomainSuffix { adapter, .. }
            | RuleDef::DomainKeyword { adapter, .. }
            | RuleDef::GeoIp { adapter, .. }
            | RuleDef::IpCidr { adapter, .. }
            | RuleDef::Final { adapter } => adapter,
        }
    }
}

/// Parse a single rule line of the form `TYPE,PATTERN,ADAPTER`.
///
/// `FINAL` carries no pattern; both `FINAL,,X` and `FINAL,X` are accepted.
/// `IP-CIDR` and `IP-CIDR6` parse their prefix here, so an invalid CIDR
/// fails configuration instead of silently never matching.
pub fn parse_rule_line(line: &str) -> Result<RuleDef, RulesError> {
    let mut fields = line.split(',').map(str::trim);
    let rule_type = fields.next().unwrap_or("");
    let first = fields.next();
    let second = fields.next();

    if rule_type == "FINAL" {
        // FINAL,,ADAPTER keeps the empty pattern slot; FINAL,ADAPTER omits it.
        let adapter = match (first, second) {
            (Some(adapter), None) if !adapter.is_empty() => adapter,
            (Some(_), Some(adapter)) if !adapter.is_empty() => adapter,
            _ => return Err(RulesError::Parse(line.to_string())),
        };
        return Ok(RuleDef::Final {
            adapter: adapter.to_string(),
        });
    }

    let (pattern, adapter) = match (first, second) {
        (Some(pattern), Some(adapter)) if !pattern.is_empty() && !adapter.is_empty() => {
            (pattern, adapter)
        }
        _ => return Err(RulesError::Parse(line.to_string())),
    };

    match rule_type {
        // Suffix comparison is ASCII-lowercase; normalize once here.
        "DOMAIN-SUFFIX" => Ok(RuleDef::DomainSuffix {
            suffix: pattern.to_ascii_lowercase(),
            adapter: adapter.to_string(),
        }),
        "DOMAIN-KEYWORD" => Ok(RuleDef::DomainKeyword {
            keyword: pattern.to_string(),
            adapter: adapter.to_string(),
        }),
        "GEOIP" => Ok(RuleDef::GeoIp {
            country: pattern.to_string(),
            adapter: adapter.to_string(),
        }),
        "IP-CIDR" | "IP-CIDR6" => {
            let net = pattern
                .parse()
                .map_err(|e| RulesError::InvalidCidr(format!("{pattern}: {e}")))?;
            Ok(RuleDef::IpCidr {
                net,
                adapter: adapter.to_string(),
            })
        }
        other => Err(RulesError::UnknownRuleType(other.to_string())),
    }
}

impl fmt::Display for RuleDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleDef::DomainSuffix { suffix, adapter } => {
                write!(f, "DOMAIN-SUFFIX,{suffix},{adapter}")
            }
            RuleDef::DomainKeyword { keyword, adapter } => {
                write!(f, "DOMAIN-KEYWORD,{keyword},{adapter}")
            }
            RuleDef::GeoIp { country, adapter } => write!(f, "GEOIP,{country},{adapter}"),
            RuleDef::IpCidr { net, adapter } => match net {
                IpNet::V4(v4) => write!(f, "IP-CIDR,{v4},{adapter}"),
                IpNet::V6(v6) => write!(f, "IP-CIDR6,{v6},{adapter}"),
            },
            RuleDef::Final { adapter } => write!(f, "FINAL,,{adapter}"),
        }
    }
}

/// A matchable rule bound to its runtime dependencies.
///
/// Immutable after construction. `GEOIP` rules hold a shared handle to the
/// in-memory database; their lookups never touch the network.
#[derive(Debug, Clone)]
pub enum Rule {
    DomainSuffix {
        suffix: String,
        adapter: String,
    },
    DomainKeyword {
        keyword: String,
        adapter: String,
    },
    GeoIp {
        country: String,
        db: Arc<GeoIpDb>,
        adapter: String,
    },
    IpCidr {
        net: IpNet,
        adapter: String,
    },
    Final {
        adapter: String,
    },
}

impl Rule {
    /// Bind a parsed rule to runtime state.
    ///
    /// `GEOIP` rules fail here when no database is loaded; a rule that can
    /// never match is a configuration error, not a silent no-op.
    pub fn bind(def: RuleDef, geoip: Option<&Arc<GeoIpDb>>) -> Result<Self, RulesError> {
        Ok(match def {
            RuleDef::DomainSuffix { suffix, adapter } => Rule::DomainSuffix { suffix, adapter },
            RuleDef::DomainKeyword { keyword, adapter } => {
                Rule::DomainKeyword { keyword, adapter }
            }
            RuleDef::GeoIp { country, adapter } => match geoip {
                Some(db) => Rule::GeoIp {
                    country,
                    db: db.clone(),
                    adapter,
                },
                None => return Err(RulesError::GeoIpUnavailable(country)),
            },
            RuleDef::IpCidr { net, adapter } => Rule::IpCidr { net, adapter },
            RuleDef::Final { adapter } => Rule::Final { adapter },
        })
    }

    /// Evaluate this rule against a destination address.
    ///
    /// Pure with respect to the address: no I/O, no DNS. IP-based rules
    /// return false when the address carries no resolved IP.
    pub fn matches(&self, addr: &Address) -> bool {
        match self {
            // Host is compared ASCII-lowercase; the suffix was lowercased at
            // parse time.
            Rule::DomainSuffix { suffix, .. } => {
                let host = addr.host().to_ascii_lowercase();
                host == *suffix
                    || (host.len() > suffix.len()
                        && host.ends_with(suffix.as_str())
                        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
            }
            // Keyword matching is case-sensitive.
            Rule::DomainKeyword { keyword, .. } => addr.host().contains(keyword.as_str()),
            Rule::GeoIp { country, db, .. } => match addr.ip() {
                Some(ip) => db.is_country(ip, country),
                None => false,
            },
            Rule::IpCidr { net, .. } => match addr.ip() {
                Some(ip) => net.contains(&ip),
                None => false,
            },
            Rule::Final { .. } => true,
        }
    }

    pub fn rule_type(&self) -> RuleType {
        match self {
            Rule::DomainSuffix { .. } => RuleType::DomainSuffix,
            Rule::DomainKeyword { .. } => RuleType::DomainKeyword,
            Rule::GeoIp { .. } => RuleType::GeoIp,
            Rule::IpCidr { .. } => RuleType::IpCidr,
            Rule::Final { .. } => RuleType::Final,
        }
    }

    /// The adapter name this rule routes to.
    pub fn adapter_name(&self) -> &str {
        match self {
            Rule::DomainSuffix { adapter, .. }
            | Rule::DomainKeyword { adapter, .. }
            | Rule::GeoIp { adapter, .. }
            | Rule::IpCidr { adapter, .. }
            | Rule::Final { adapter } => adapter,
        }
    }

    /// The rule's pattern, for log records.
    pub fn payload(&self) -> String {
        match self {
            Rule::DomainSuffix { suffix, .. } => suffix.clone(),
            Rule::DomainKeyword { keyword, .. } => keyword.clone(),
            Rule::GeoIp { country, .. } => country.clone(),
            Rule::IpCidr { net, .. } => net.to_string(),
            Rule::Final { .. } => String::new(),
        }
    }
}
