//! User-agent classification from an ordered rule table.
//!
//! The first matching rule wins in each table, so more specific products
//! (Edge, Opera) are listed ahead of the engines they embed (Chrome, Safari).

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserAgentInfo {
    pub browser: String,
    pub browser_version: String,
    pub os: String,
    pub os_version: String,
    pub device: String,
    pub category: &'static str,
}

impl UserAgentInfo {
    pub fn to_attributes(&self) -> Map<String, Value> {
        let mut attributes = Map::new();
        for (name, value) in [
            ("ua_browser", self.browser.as_str()),
            ("ua_browser_version", self.browser_version.as_str()),
            ("ua_os", self.os.as_str()),
            ("ua_os_version", self.os_version.as_str()),
            ("ua_device", self.device.as_str()),
            ("ua_category", self.category),
        ] {
            attributes.insert(name.to_string(), Value::String(value.to_string()));
        }
        attributes
    }
}

struct Rule {
    name: &'static str,
    pattern: Regex,
}

#[allow(clippy::unwrap_used)]
fn rules(table: &[(&'static str, &str)]) -> Vec<Rule> {
    table
        .iter()
        .map(|&(name, pattern)| Rule {
            name,
            pattern: Regex::new(pattern).unwrap(),
        })
        .collect()
}

static CRAWLERS: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    rules(&[
        ("Googlebot", r"Googlebot(?:-\w+)?/([\d.]+)"),
        ("Bingbot", r"bingbot/([\d.]+)"),
        ("Baiduspider", r"Baiduspider(?:-\w+)?/([\d.]+)"),
        ("YandexBot", r"YandexBot/([\d.]+)"),
        ("DuckDuckBot", r"DuckDuckBot(?:-\w+)?/([\d.]+)"),
        ("Crawler", r"(?i)(?:crawler|spider|bot\b)()"),
    ])
});

static BROWSERS: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    rules(&[
        ("Edge", r"Edg(?:e|A|iOS)?/([\d.]+)"),
        ("Opera", r"OPR/([\d.]+)"),
        ("Samsung Internet", r"SamsungBrowser/([\d.]+)"),
        ("Chrome", r"(?:Chrome|CriOS)/([\d.]+)"),
        ("Firefox", r"(?:Firefox|FxiOS)/([\d.]+)"),
        ("Safari", r"Version/([\d.]+).*Safari/"),
        ("IE", r"(?:MSIE |Trident/.*rv:)([\d.]+)"),
        ("curl", r"^curl/([\d.]+)"),
        ("aws-cli", r"^aws-cli/([\d.]+)"),
        ("aws-sdk", r"^aws-sdk-\w+/([\d.]+)"),
        ("Boto3", r"^Boto3/([\d.]+)"),
    ])
});

static SYSTEMS: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    rules(&[
        ("Windows", r"Windows NT ([\d.]+)"),
        ("iOS", r"(?:iPhone|CPU) OS ([\d_]+)"),
        ("Android", r"Android ([\d.]+)"),
        ("Mac OS X", r"Mac OS X ([\d_.]+)"),
        ("Chrome OS", r"CrOS \w+ ([\d.]+)"),
        ("Linux", r"Linux()"),
    ])
});

static DEVICES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    rules(&[
        ("iPhone", r"iPhone"),
        ("iPad", r"iPad"),
        ("Android Phone", r"Android.*Mobile"),
        ("Android Tablet", r"Android"),
    ])
});

fn first_match(table: &[Rule], agent: &str) -> Option<(&'static str, String)> {
    table.iter().find_map(|rule| {
        rule.pattern.captures(agent).map(|captures| {
            let version = captures
                .get(1)
                .map(|m| m.as_str().replace('_', "."))
                .unwrap_or_default();
            (rule.name, version)
        })
    })
}

/// Classify a raw user-agent string; `None` for empty or placeholder agents.
pub fn classify(agent: &str) -> Option<UserAgentInfo> {
    let agent = agent.trim();
    if agent.is_empty() || agent == "-" {
        return None;
    }

    if let Some((name, version)) = first_match(&CRAWLERS, agent) {
        return Some(UserAgentInfo {
            browser: name.to_string(),
            browser_version: version,
            os: String::new(),
            os_version: String::new(),
            device: "Spider".to_string(),
            category: "crawler",
        });
    }

    let (browser, browser_version) = first_match(&BROWSERS, agent)
        .map(|(name, version)| (name.to_string(), version))
        .unwrap_or_else(|| ("Other".to_string(), String::new()));
    let system = first_match(&SYSTEMS, agent);
    let device = first_match(&DEVICES, agent).map(|(name, _)| name);

    let category = match (device, &system) {
        (Some("iPhone") | Some("Android Phone"), _) => "smartphone",
        (Some(_), _) => "pc",
        (None, Some(_)) => "pc",
        (None, None) => "unknown",
    };

    let (os, os_version) = system
        .map(|(name, version)| (name.to_string(), version))
        .unwrap_or_else(|| ("Other".to_string(), String::new()));

    Some(UserAgentInfo {
        browser,
        browser_version,
        os,
        os_version,
        device: device.unwrap_or("Other").to_string(),
        category,
    })
}
