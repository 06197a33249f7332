//! GeoIP lookups backed by a MaxMind DB file.

use std::net::IpAddr;
use std::path::Path;

use maxminddb::Reader;

use crate::error::RulesError;

/// Country-level GeoIP database.
///
/// Wraps a `maxminddb::Reader` opened once at startup. Lookups are pure
/// in-memory reads; the reader is `Send + Sync` and shared freely behind an
/// `Arc`.
pub struct GeoIpDb {
    reader: Reader<Vec<u8>>,
}

impl GeoIpDb {
    /// Load a GeoIP database from a file path.
    pub fn open(path: &Path) -> Result<Self, RulesError> {
        let reader = Reader::open_readfile(path).map_err(|e| {
            RulesError::GeoIp(format!(
                "failed to open GeoIP database {}: {e}",
                path.display()
            ))
        })?;
        Ok(Self { reader })
    }

    /// Load a GeoIP database from raw bytes.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, RulesError> {
        let reader = Reader::from_source(data)
            .map_err(|e| RulesError::GeoIp(format!("failed to parse GeoIP database: {e}")))?;
        Ok(Self { reader })
    }

    /// Look up the ISO-2 country code for an IP address.
    ///
    /// Returns `None` when the IP is not in the database, the record has no
    /// country code, or the lookup errors.
    pub fn country_code(&self, ip: IpAddr) -> Option<String> {
        if let Ok(Some(country)) = self.reader.lookup::<maxminddb::geoip2::Country>(ip)
            && let Some(code) = country.country.and_then(|c| c.iso_code)
        {
            return Some(code.to_string());
        }
        None
    }

    /// Check whether `ip` resolves to the given country code.
    ///
    /// The comparison is exact; MaxMind stores ISO-2 codes uppercase.
    pub fn is_country(&self, ip: IpAddr, code: &str) -> bool {
        self.country_code(ip).as_deref() == Some(code)
    }
}

impl std::fmt::Debug for GeoIpDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoIpDb").finish_non_exhaustive()
    }
}
