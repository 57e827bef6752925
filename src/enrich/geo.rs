//! Optional GeoIP lookups against a local MaxMind database.

use maxminddb::geoip2;
use tracing::warn;

use std::net::IpAddr;
use std::path::Path;

/// A loaded city-level database. Absent databases simply yield empty
/// enrichment fields.
pub struct GeoDb {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl GeoDb {
    /// Load a database, returning `None` (with a warning) when the file is
    /// missing or unreadable.
    pub fn open(path: &Path) -> Option<Self> {
        match maxminddb::Reader::open_readfile(path) {
            Ok(reader) => Some(Self { reader }),
            Err(e) => {
                warn!(path = %path.display(), %e, "geoip database unavailable");
                None
            }
        }
    }

    /// Country ISO code and English city name for `addr`.
    pub fn lookup(&self, addr: IpAddr) -> (Option<String>, Option<String>) {
        let Ok(city) = self.reader.lookup::<geoip2::City>(addr) else {
            return (None, None);
        };
        let country = city
            .country
            .as_ref()
            .and_then(|c| c.iso_code)
            .map(str::to_string);
        let city_name = city
            .city
            .as_ref()
            .and_then(|c| c.names.as_ref())
            .and_then(|names| names.get("en"))
            .map(|name| (*name).to_string());
        (country, city_name)
    }
}
