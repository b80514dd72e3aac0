//! Record enrichment plugins
//!
//! Enrichment is a second pass over normalized records. The plugins a
//! pipeline asks for are intersected with the process allow-list; every
//! selected plugin contributes flat string attributes to one trailing
//! `enrichment` object. A failed lookup contributes nothing.

pub mod geo_ip;
pub mod user_agent;

pub use geo_ip::GeoIpDatabase;

use crate::parser::{NormalizedRecord, SourceType};
use lightengine_common::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentPlugin {
    GeoIp,
    UserAgent,
}

impl EnrichmentPlugin {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentPlugin::GeoIp => "geo_ip",
            EnrichmentPlugin::UserAgent => "user_agent",
        }
    }

    /// Parse a comma separated plugin list.
    pub fn parse_list(raw: &str) -> Result<Vec<EnrichmentPlugin>> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl fmt::Display for EnrichmentPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrichmentPlugin {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "geo_ip" | "geoip" | "geo" => Ok(EnrichmentPlugin::GeoIp),
            "user_agent" | "useragent" | "ua" => Ok(EnrichmentPlugin::UserAgent),
            _ => Err(EngineError::Validation(format!(
                "unknown enrichment plugin: {}",
                s
            ))),
        }
    }
}

/// Applies the allowed plugins to records
#[derive(Debug, Clone, Default)]
pub struct Enricher {
    allowed: BTreeSet<EnrichmentPlugin>,
    geo_ip: Option<Arc<GeoIpDatabase>>,
}

impl Enricher {
    pub fn new(allowed: impl IntoIterator<Item = EnrichmentPlugin>, geo_ip: Option<Arc<GeoIpDatabase>>) -> Self {
        let allowed: BTreeSet<_> = allowed.into_iter().collect();
        if allowed.contains(&EnrichmentPlugin::GeoIp) && geo_ip.is_none() {
            warn!("geo_ip enrichment allowed but no database loaded; lookups will be empty");
        }
        Self { allowed, geo_ip }
    }

    pub fn allowed(&self) -> impl Iterator<Item = &EnrichmentPlugin> {
        self.allowed.iter()
    }

    /// Intersection of the requested plugins with the allow-list.
    pub fn select(&self, requested: &[EnrichmentPlugin]) -> Vec<EnrichmentPlugin> {
        let requested: BTreeSet<_> = requested.iter().copied().collect();
        requested.intersection(&self.allowed).copied().collect()
    }

    /// Annotate one record. With no selected plugins the record is left
    /// without an `enrichment` object.
    pub fn enrich(&self, source: SourceType, plugins: &[EnrichmentPlugin], record: &mut NormalizedRecord) {
        if plugins.is_empty() {
            return;
        }

        let mut attributes = Map::new();
        for plugin in plugins {
            if !self.allowed.contains(plugin) {
                continue;
            }
            match plugin {
                EnrichmentPlugin::GeoIp => {
                    let location = source
                        .client_ip_field()
                        .and_then(|field| record.get_str(field))
                        .zip(self.geo_ip.as_deref())
                        .and_then(|(ip, db)| db.lookup(ip));
                    if let Some(location) = location {
                        attributes.extend(location.to_attributes());
                    }
                }
                EnrichmentPlugin::UserAgent => {
                    let info = source
                        .user_agent_field()
                        .and_then(|field| record.get_str(field))
                        .and_then(user_agent::classify);
                    if let Some(info) = info {
                        attributes.extend(info.to_attributes());
                    }
                }
            }
        }
        record.set_enrichment(attributes);
    }
}
