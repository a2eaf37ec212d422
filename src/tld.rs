//! Registry endpoint catalogue.
//!
//! Two embedded JSON assets drive everything protocol-side: a map of TLD to
//! WHOIS host/port and RDAP base URL, and the pattern lists used by the
//! classifier. Both are parsed once at first use and immutable afterwards.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::Deserialize;

static SERVERS_JSON: &str = include_str!("../assets/servers.json");
static PATTERNS_JSON: &str = include_str!("../assets/patterns.json");

static REGISTRY: Lazy<TldRegistry> =
    Lazy::new(|| TldRegistry::from_embedded().expect("embedded catalogues are valid JSON"));

/// WHOIS endpoint for a TLD.
#[derive(Debug, Clone, Deserialize)]
pub struct WhoisEndpoint {
    pub host: String,
    #[serde(default = "default_whois_port")]
    pub port: u16,
}

fn default_whois_port() -> u16 {
    43
}

/// RDAP endpoint for a TLD.
#[derive(Debug, Clone, Deserialize)]
pub struct RdapEndpoint {
    pub base: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TldEndpoints {
    pub whois: Option<WhoisEndpoint>,
    #[serde(default)]
    pub rdap: Option<RdapEndpoint>,
}

/// Pattern lists matched against lowercased WHOIS bodies.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DetectionPatterns {
    pub available_patterns: Vec<String>,
    pub registered_patterns: Vec<String>,
    pub grace_patterns: Vec<String>,
    pub redemption_patterns: Vec<String>,
    pub pending_delete_patterns: Vec<String>,
    pub expired_patterns: Vec<String>,
    pub hold_patterns: Vec<String>,
    pub transfer_lock_patterns: Vec<String>,
}

pub struct TldRegistry {
    servers: HashMap<String, TldEndpoints>,
    patterns: DetectionPatterns,
}

impl TldRegistry {
    fn from_embedded() -> Result<Self, serde_json::Error> {
        let servers: HashMap<String, TldEndpoints> = serde_json::from_str(SERVERS_JSON)?;
        let patterns: DetectionPatterns = serde_json::from_str(PATTERNS_JSON)?;
        Ok(TldRegistry { servers, patterns })
    }

    /// The process-wide registry instance.
    pub fn global() -> &'static TldRegistry {
        &REGISTRY
    }

    /// Longest-suffix match over the catalogue keys: `co.uk` beats `uk`.
    /// Returns `None` when no configured TLD matches.
    pub fn find_best_tld(&self, domain: &str) -> Option<&str> {
        let domain = domain.to_lowercase();
        let mut best: Option<&str> = None;
        for tld in self.servers.keys() {
            if domain == *tld || domain.ends_with(&format!(".{tld}")) {
                if best.map_or(true, |b| tld.len() > b.len()) {
                    best = Some(tld);
                }
            }
        }
        best
    }

    pub fn whois_endpoint(&self, domain: &str) -> Option<&WhoisEndpoint> {
        let tld = self.find_best_tld(domain)?;
        self.servers.get(tld)?.whois.as_ref()
    }

    pub fn rdap_endpoint(&self, domain: &str) -> Option<&RdapEndpoint> {
        let tld = self.find_best_tld(domain)?;
        self.servers.get(tld)?.rdap.as_ref()
    }

    pub fn patterns(&self) -> &DetectionPatterns {
        &self.patterns
    }

    pub fn supported_tlds(&self) -> Vec<&str> {
        self.servers.keys().map(String::as_str).collect()
    }

    pub fn is_supported(&self, domain: &str) -> bool {
        self.find_best_tld(domain).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_suffix_wins() {
        let reg = TldRegistry::global();
        assert_eq!(reg.find_best_tld("shop.example.co.uk"), Some("co.uk"));
        assert_eq!(reg.find_best_tld("example.uk"), Some("uk"));
        assert_eq!(reg.find_best_tld("example.com.cn"), Some("com.cn"));
    }

    #[test]
    fn bare_tld_matches_itself() {
        let reg = TldRegistry::global();
        assert_eq!(reg.find_best_tld("com"), Some("com"));
    }

    #[test]
    fn unknown_tld_is_unsupported() {
        let reg = TldRegistry::global();
        assert_eq!(reg.find_best_tld("example.invalid"), None);
        assert!(!reg.is_supported("example.invalid"));
    }

    #[test]
    fn com_has_both_protocols() {
        let reg = TldRegistry::global();
        let whois = reg.whois_endpoint("example.com").expect("whois for .com");
        assert_eq!(whois.host, "whois.verisign-grs.com");
        assert_eq!(whois.port, 43);
        assert!(reg.rdap_endpoint("example.com").is_some());
    }

    #[test]
    fn cctld_without_rdap_falls_back_to_whois_only() {
        let reg = TldRegistry::global();
        assert!(reg.whois_endpoint("example.ru").is_some());
        assert!(reg.rdap_endpoint("example.ru").is_none());
    }

    #[test]
    fn pattern_catalogue_is_populated() {
        let patterns = TldRegistry::global().patterns();
        assert!(!patterns.available_patterns.is_empty());
        assert!(!patterns.registered_patterns.is_empty());
        assert!(!patterns.redemption_patterns.is_empty());
        assert!(!patterns.pending_delete_patterns.is_empty());
    }
}
