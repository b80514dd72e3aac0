//! Geo-IP lookups over a GeoLite2-style CSV range database
//!
//! The CSV carries one network per row:
//!
//! ```text
//! network,iso_code,country,city,latitude,longitude
//! 203.0.113.0/24,AU,Australia,Sydney,-33.86,151.20
//! 2001:db8::/32,DE,Germany,Berlin,52.52,13.40
//! ```
//!
//! Networks are expanded to inclusive address ranges and kept sorted per
//! address family; a lookup is one binary search.

use lightengine_common::{EngineError, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::io::Read;
use std::net::IpAddr;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct NetworkRow {
    network: String,
    #[serde(default)]
    iso_code: String,
    #[serde(default)]
    country: String,
    #[serde(default)]
    city: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

/// Location attributes of one network
#[derive(Debug, Clone, PartialEq)]
pub struct GeoLocation {
    pub iso_code: String,
    pub country: String,
    pub city: String,
    pub coordinates: Option<(f64, f64)>,
}

impl GeoLocation {
    pub fn to_attributes(&self) -> Map<String, Value> {
        let mut attributes = Map::new();
        attributes.insert("geo_iso_code".to_string(), Value::String(self.iso_code.clone()));
        attributes.insert("geo_country".to_string(), Value::String(self.country.clone()));
        attributes.insert("geo_city".to_string(), Value::String(self.city.clone()));
        let location = self
            .coordinates
            .map(|(lat, lon)| format!("{},{}", lat, lon))
            .unwrap_or_default();
        attributes.insert("geo_location".to_string(), Value::String(location));
        attributes
    }
}

#[derive(Debug, Clone)]
struct Range<T> {
    start: T,
    end: T,
    location: usize,
}

#[derive(Debug, Default)]
pub struct GeoIpDatabase {
    v4: Vec<Range<u32>>,
    v6: Vec<Range<u128>>,
    locations: Vec<GeoLocation>,
}

impl GeoIpDatabase {
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let database = Self::from_reader(file)?;
        info!(
            path = %path.display(),
            ipv4_ranges = database.v4.len(),
            ipv6_ranges = database.v6.len(),
            "Loaded geo-IP database"
        );
        Ok(database)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut database = Self::default();

        for (index, row) in csv_reader.deserialize::<NetworkRow>().enumerate() {
            let row = row.map_err(|e| {
                EngineError::Config(format!("geo-IP database row {}: {}", index + 1, e))
            })?;

            let location = database.locations.len();
            match parse_network(&row.network) {
                Some(Network::V4(start, end)) => database.v4.push(Range { start, end, location }),
                Some(Network::V6(start, end)) => database.v6.push(Range { start, end, location }),
                None => {
                    warn!(network = %row.network, "Skipping unparseable network");
                    continue;
                }
            }
            database.locations.push(GeoLocation {
                iso_code: row.iso_code,
                country: row.country,
                city: row.city,
                coordinates: row.latitude.zip(row.longitude),
            });
        }

        database.v4.sort_by_key(|r| r.start);
        database.v6.sort_by_key(|r| r.start);
        Ok(database)
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn lookup(&self, raw: &str) -> Option<&GeoLocation> {
        let address: IpAddr = raw.trim().parse().ok()?;
        let location = match address {
            IpAddr::V4(v4) => find(&self.v4, u32::from(v4)),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => find(&self.v4, u32::from(v4)),
                None => find(&self.v6, u128::from(v6)),
            },
        }?;
        self.locations.get(location)
    }
}

fn find<T: Ord + Copy>(ranges: &[Range<T>], address: T) -> Option<usize> {
    let index = ranges.partition_point(|r| r.start <= address);
    let candidate = ranges.get(index.checked_sub(1)?)?;
    (address <= candidate.end).then_some(candidate.location)
}

enum Network {
    V4(u32, u32),
    V6(u128, u128),
}

fn parse_network(raw: &str) -> Option<Network> {
    let (address, prefix) = match raw.split_once('/') {
        Some((address, prefix)) => (address, Some(prefix.parse::<u32>().ok()?)),
        None => (raw, None),
    };

    match address.parse::<IpAddr>().ok()? {
        IpAddr::V4(v4) => {
            let prefix = prefix.unwrap_or(32);
            if prefix > 32 {
                return None;
            }
            let host_bits = 32 - prefix;
            let mask = u32::MAX.checked_shl(host_bits).unwrap_or(0);
            let start = u32::from(v4) & mask;
            Some(Network::V4(start, start | !mask))
        }
        IpAddr::V6(v6) => {
            let prefix = prefix.unwrap_or(128);
            if prefix > 128 {
                return None;
            }
            let host_bits = 128 - prefix;
            let mask = u128::MAX.checked_shl(host_bits).unwrap_or(0);
            let start = u128::from(v6) & mask;
            Some(Network::V6(start, start | !mask))
        }
    }
}
