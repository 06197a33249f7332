//! Rule predicates for the rudder proxy router.
//!
//! A rule pairs a predicate over a destination [`Address`] with the name of
//! the outbound adapter that should carry matching connections. Rules are
//! evaluated in declared order; the first match wins.
//!
//! [`Address`]: rudder_proto::Address

mod error;
mod geoip;
mod rule;

pub use error::RulesError;
pub use geoip::GeoIpDb;
pub use rule::{parse_rule_line, Rule, RuleDef, RuleType};
