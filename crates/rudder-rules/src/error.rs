//! Error types for rule parsing and construction.

#[derive(Debug, thiserror::Error)]
pub enum RulesError {
    #[error("malformed rule line: {0}")]
    Parse(String),
    #[error("unknown rule type: {0}")]
    UnknownRuleType(String),
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),
    #[error("geoip: {0}")]
    GeoIp(String),
    #[error("GEOIP rule '{0}' requires a loaded GeoIP database")]
    GeoIpUnavailable(String),
}
