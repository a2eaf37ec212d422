//! Response classification.
//!
//! Turns a raw WHOIS text body or RDAP document into a [`DomainResult`]:
//! lifecycle state plus registrar, event dates and name servers where the
//! response allows extraction. RDAP is tried first when the TLD has a base
//! URL configured (structured and cheap to classify); any non-404 RDAP
//! failure falls through to WHOIS.
//!
//! Two guard rules protect against false "available" verdicts: a state of
//! `unknown` with registration signals present (registrar, name servers, a
//! parseable date) is promoted to `registered`, and a pattern-derived
//! `available` with the same signals is corrected to `registered`.

use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SharedConfig;
use crate::errors::MonitorError;
use crate::rdap::{RdapClient, RdapDomain, RdapOutcome};
use crate::tld::TldRegistry;
use crate::whois::WhoisClient;
use crate::{display_zone, now_local, DomainResult, LifecycleState, QueryMethod};

/// Placeholder stored when a registry is known not to publish registrar
/// data. Treated as "no registrar" by the signal checks.
pub const REGISTRAR_UNSUPPORTED: &str = "registry does not publish registrar";

/// WHOIS responses at or below this size that classify as `unknown` are
/// treated as transport failures rather than final answers.
const SHORT_RESPONSE_LIMIT: usize = 50;

const MAX_ATTEMPTS: u32 = 3;
const RETRY_STEP: Duration = Duration::from_millis(500);

/// Transport-level failure markers. A body containing any of these is a
/// registry refusing to answer, not an answer.
const FAILURE_MARKERS: &[&str] = &[
    "number of allowed queries exceeded",
    "query limit",
    "rate limit",
    "too many requests",
    "blacklisted",
    "blocked",
    "access denied",
    "service unavailable",
    "temporarily unavailable",
    "server error",
];

pub struct Classifier {
    whois: WhoisClient,
    rdap: RdapClient,
    config: SharedConfig,
}

impl Classifier {
    pub fn new(config: SharedConfig) -> Result<Self, MonitorError> {
        Ok(Classifier {
            whois: WhoisClient::new(),
            rdap: RdapClient::new()?,
            config,
        })
    }

    /// One query cycle for a domain: RDAP first where configured, WHOIS as
    /// the fallback. Never returns an error; failures come back as a
    /// `DomainResult` in the `error` state so the scheduler can persist them.
    pub async fn check_domain(&self, domain: &str) -> DomainResult {
        let domain = domain.trim().to_lowercase();
        let registry = TldRegistry::global();

        if !registry.is_supported(&domain) {
            return DomainResult::error(&domain, "unsupported TLD");
        }

        let timeout = self.config.read().await.timeout;
        let mut rdap_failure: Option<String> = None;

        if let Some(endpoint) = registry.rdap_endpoint(&domain) {
            match self.rdap.query(&domain, &endpoint.base, timeout).await {
                Ok(RdapOutcome::Found(doc, raw)) => {
                    return classify_rdap(&domain, &doc, raw);
                }
                Ok(RdapOutcome::NotFound(raw)) => {
                    return DomainResult {
                        domain: domain.clone(),
                        state: LifecycleState::Available,
                        registrar: String::new(),
                        last_checked: now_local(),
                        query_method: QueryMethod::Rdap,
                        created_at: None,
                        expiry_at: None,
                        updated_at: None,
                        name_servers: Vec::new(),
                        raw,
                        error_message: String::new(),
                    };
                }
                Err(e) => {
                    debug!("RDAP query failed for {domain}: {e}");
                    rdap_failure = Some(format!("RDAP query failed: {e}"));
                }
            }
        }

        let Some(endpoint) = registry.whois_endpoint(&domain) else {
            let message = rdap_failure
                .unwrap_or_else(|| "no WHOIS server configured for TLD".to_string());
            return DomainResult::error(&domain, message);
        };
        let (host, port) = (endpoint.host.clone(), endpoint.port);

        match self.whois.query(&domain, &host, port, timeout).await {
            Ok(response) => self.classify_whois(&domain, &response),
            Err(e) => {
                let message = match rdap_failure {
                    Some(rdap_msg) => format!("{rdap_msg}; WHOIS query failed: {e}"),
                    None => format!("WHOIS query failed: {e}"),
                };
                DomainResult::error(&domain, message)
            }
        }
    }

    /// Retrying wrapper used by workers and force-check: up to three
    /// attempts with a linear backoff, cancellable between attempts.
    /// Distinct failure reasons are collected into the final error message.
    pub async fn check_with_retry(
        &self,
        domain: &str,
        cancel: &CancellationToken,
    ) -> DomainResult {
        let mut failure_reasons: Vec<String> = Vec::new();

        for attempt in 1..=MAX_ATTEMPTS {
            if cancel.is_cancelled() {
                return DomainResult::error(domain, "query cancelled");
            }

            let result = self.check_domain(domain).await;
            if result.state != LifecycleState::Error {
                return result;
            }
            // An unsupported TLD will not improve on a second try.
            if result.error_message == "unsupported TLD" {
                return result;
            }

            if !result.error_message.is_empty() {
                failure_reasons.push(result.error_message.clone());
            }

            if attempt < MAX_ATTEMPTS {
                let wait = RETRY_STEP * attempt;
                debug!("attempt {attempt} failed for {domain}, retrying in {wait:?}");
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = cancel.cancelled() => return result,
                }
            }
        }

        let unique = dedupe_reasons(&failure_reasons);
        let message = if unique.is_empty() {
            "3 consecutive failures: unknown cause".to_string()
        } else {
            format!("3 consecutive failures: {}", unique.join("; "))
        };
        warn!("{domain}: {message}");
        DomainResult::error(domain, message)
    }

    /// Classify a WHOIS text body. Public so force-check diagnostics and
    /// tests can exercise it directly.
    pub fn classify_whois(&self, domain: &str, response: &str) -> DomainResult {
        let mut result = classify_whois_text(domain, response);
        // A tiny body that told us nothing is a network hiccup, not a fact.
        if result.state == LifecycleState::Unknown && response.len() <= SHORT_RESPONSE_LIMIT {
            return DomainResult::error(domain, "WHOIS response too short to classify");
        }
        result.raw = response.to_string();
        result
    }
}

fn dedupe_reasons(reasons: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    reasons
        .iter()
        .filter(|r| !r.is_empty() && seen.insert(r.as_str()))
        .cloned()
        .collect()
}

// ---- WHOIS classification ------------------------------------------------

fn classify_whois_text(domain: &str, response: &str) -> DomainResult {
    let lower = response.to_lowercase();

    let mut result = DomainResult {
        domain: domain.to_string(),
        state: parse_whois_state(&lower, response),
        registrar: extract_registrar(response),
        last_checked: now_local(),
        query_method: QueryMethod::Whois,
        created_at: extract_date(response, DateField::Creation),
        expiry_at: extract_date(response, DateField::Expiration),
        updated_at: extract_date(response, DateField::LastChange),
        name_servers: extract_name_servers(response),
        raw: String::new(),
        error_message: String::new(),
    };

    apply_safety_rails(&mut result);
    result
}

fn parse_whois_state(lower: &str, original: &str) -> LifecycleState {
    for marker in FAILURE_MARKERS {
        if lower.contains(marker) {
            return LifecycleState::Error;
        }
    }

    let patterns = TldRegistry::global().patterns();

    if matches_any(lower, &patterns.available_patterns) {
        return LifecycleState::Available;
    }
    if matches_any(lower, &patterns.grace_patterns) {
        return LifecycleState::Grace;
    }
    if matches_any(lower, &patterns.redemption_patterns) {
        return LifecycleState::Redemption;
    }
    if matches_any(lower, &patterns.pending_delete_patterns) {
        return LifecycleState::PendingDelete;
    }
    // An expiry marker alone is not enough: the date must actually be in
    // the past, otherwise "Expiration Date: 2030-..." would match.
    if matches_any(lower, &patterns.expired_patterns) && expiry_in_past(original) {
        return LifecycleState::Grace;
    }
    if matches_any(lower, &patterns.registered_patterns) {
        return LifecycleState::Registered;
    }

    LifecycleState::Unknown
}

fn matches_any(lower: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| lower.contains(p.as_str()))
}

fn expiry_in_past(response: &str) -> bool {
    match extract_date(response, DateField::Expiration) {
        Some(expiry) => expiry < now_local(),
        None => false,
    }
}

/// Promote `unknown` and demote `available` when the body carries actual
/// registration signals.
fn apply_safety_rails(result: &mut DomainResult) {
    let has_registrar =
        !result.registrar.is_empty() && result.registrar != REGISTRAR_UNSUPPORTED;
    let has_signals = has_registrar
        || !result.name_servers.is_empty()
        || result.expiry_at.is_some()
        || result.created_at.is_some();

    if !has_signals {
        return;
    }
    match result.state {
        LifecycleState::Unknown => {
            result.state = LifecycleState::Registered;
        }
        LifecycleState::Available => {
            warn!(
                "{} classified available despite registration signals, correcting to registered",
                result.domain
            );
            result.state = LifecycleState::Registered;
        }
        _ => {}
    }
}

static REGISTRAR_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // Generic gTLD shapes first.
        r"(?i)registrar:\s*(.+)",
        r"(?i)registrar organization:\s*(.+)",
        r"(?i)sponsoring registrar:\s*(.+)",
        r"(?i)registrar name:\s*(.+)",
        // .jp
        r"(?i)\[name\]\s*(.+)",
        // .kr
        r"(?i)등록대행자\s*:\s*(.+)",
        r"(?i)authorized agency\s*:\s*(.+)",
        // .fi / .ax dotted labels
        r"(?i)registrar\.+:\s*(.+)",
        // .tr
        r"(?i)organization name\s*:\s*(.+)",
        // .kz
        r"(?i)current registar:\s*(.+)",
        // .tg dotted
        r"(?i)registrar:\.+(.+)",
        // .lu
        r"(?i)registrar-name:\s*(.+)",
        // .lv section form
        r"(?i)\[registrar\][\s\S]*?name:\s*(.+)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static registrar pattern compiles"))
    .collect()
});

fn extract_registrar(response: &str) -> String {
    for re in REGISTRAR_PATTERNS.iter() {
        if let Some(caps) = re.captures(response) {
            if let Some(m) = caps.get(1) {
                let mut registrar = m.as_str().trim();
                // Drop trailing parentheticals like "(https://...)"
                if let Some(idx) = registrar.find('(') {
                    registrar = registrar[..idx].trim();
                }
                if !registrar.is_empty() {
                    return registrar.to_string();
                }
            }
        }
    }
    String::new()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DateField {
    Creation,
    Expiration,
    LastChange,
}

/// Keyword labels tried first, shared across most registries.
fn generic_keywords(field: DateField) -> &'static [&'static str] {
    match field {
        DateField::Creation => &["creation date", "created", "registered"],
        DateField::Expiration => &[
            "expiry date",
            "expires",
            "expiration date",
            "registry expiry date",
        ],
        DateField::LastChange => &["updated date", "last updated", "modified"],
    }
}

/// Per-registry label shapes that the generic keyword scan misses.
fn special_patterns(field: DateField) -> &'static [&'static str] {
    match field {
        DateField::Creation => &[
            r"(?i)created:\s*([^\r\n]+)",               // .ru/.is/.pl/.br
            r"(?i)registration time:\s*([^\r\n]+)",     // .cn
            r"(?i)domain name commencement date:\s*([^\r\n]+)", // .hk
            r"(?i)\[登録年月日\]\s*([^\r\n]+)",          // .jp
            r"(?i)등록일\s*:\s*([^\r\n]+)",              // .kr
            r"(?i)registered date\s*:\s*([^\r\n]+)",    // .kr english
            r"(?i)created\.+:\s*([^\r\n]+)",            // .fi/.ax dotted
            r"(?i)record created:\s*([^\r\n]+)",        // .kg
            r"(?i)domain created:\s*([^\r\n]+)",        // .kz
            r"(?i)created on:\s*([^\r\n]+)",            // .pp.ua
            r"(?i)registration date:\s*([^\r\n]+)",     // .rs/.sm
            r"(?i)data de registo:\s*([^\r\n]+)",       // .pt
            r"(?i)registered on\.*:?\s+([^\r\n]+)",     // .ro/.ug/.gg
            r"(?i)date de création:\s*([^\r\n]+)",      // .sn/.ga
            r"(?i)activation:\.+([^\r\n]+)",            // .tg
            r"(?i)created on\.+:\s*([^\r\n]+)",         // .tr
            r"(?i)assigned:\s*([^\r\n]+)",              // .il
            r"(?i)record created on\s+([^\r\n]+)",      // .mo
        ],
        DateField::Expiration => &[
            r"(?i)paid-till:\s*([^\r\n]+)",             // .ru
            r"(?i)free-date:\s*([^\r\n]+)",             // .ru drop date
            r"(?i)expiration time:\s*([^\r\n]+)",       // .cn
            r"(?i)\[有効期限\]\s*([^\r\n]+)",            // .jp
            r"(?i)사용 종료일\s*:\s*([^\r\n]+)",          // .kr
            r"(?i)expiration date\s*:\s*([^\r\n]+)",    // .kr english
            r"(?i)expires\.+:\s*([^\r\n]+)",            // .fi/.ax dotted
            r"(?i)expire:\s*([^\r\n]+)",                // .cr/.ee/.ve
            r"(?i)expire date:\s*([^\r\n]+)",           // .it
            r"(?i)record expires on:?\s+([^\r\n]+)",    // .kg/.mo
            r"(?i)renewal date:\s*([^\r\n]+)",          // .pl/.ac.uk
            r"(?i)data de expiração:\s*([^\r\n]+)",     // .pt
            r"(?i)expires on\.*:?\s*([^\r\n]+)",        // .ro/.ug/.tr
            r"(?i)valid until:\s*([^\r\n]+)",           // .sk
            r"(?i)date d'expiration:\s*([^\r\n]+)",     // .sn/.ga
            r"(?i)expiration:\.+([^\r\n]+)",            // .tg
            r"(?i)expiry:\s*([^\r\n]+)",                // .tm
            r"(?i)validity:\s*([^\r\n]+)",              // .il
        ],
        DateField::LastChange => &[
            r"(?i)\[最終更新\]\s*([^\r\n]+)",            // .jp
            r"(?i)최근 정보 변경일\s*:\s*([^\r\n]+)",     // .kr
            r"(?i)last updated date\s*:\s*([^\r\n]+)",  // .kr english
            r"(?i)changed:\s*([^\r\n]+)",               // .de/.cr/.ee/.br
            r"(?i)last modified\s*:\s*([^\r\n]+)",      // .au/.kz/.qa
            r"(?i)modified\.+:\s*([^\r\n]+)",           // .fi/.ax dotted
            r"(?i)last update:\s*([^\r\n]+)",           // .it
            r"(?i)last updated on:\s*([^\r\n]+)",       // .pp.ua
            r"(?i)modification date:\s*([^\r\n]+)",     // .rs
            r"(?i)updated:\s*([^\r\n]+)",               // .sk/.lv
            r"(?i)dernière modification:\s*([^\r\n]+)", // .sn/.ga
        ],
    }
}

fn extract_date(response: &str, field: DateField) -> Option<DateTime<FixedOffset>> {
    for keyword in generic_keywords(field) {
        let pattern = format!(r"(?i){}:\s*([^\r\n]+)", regex::escape(keyword));
        if let Ok(re) = Regex::new(&pattern) {
            if let Some(caps) = re.captures(response) {
                if let Some(date) = parse_datetime(caps.get(1)?.as_str()) {
                    return Some(date);
                }
            }
        }
    }

    for pattern in special_patterns(field) {
        let re = Regex::new(pattern).ok()?;
        if let Some(caps) = re.captures(response) {
            if let Some(date) = parse_datetime(caps.get(1)?.as_str()) {
                return Some(date);
            }
        }
    }

    None
}

static WHITESPACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("static regex compiles"));
static TRAILING_PAREN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*\([^)]*\)\s*$").expect("static regex compiles"));
static TRAILING_TZ_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s+(utc|gmt[+-]?\d*(:\d+)?|[a-z]{3,4})$").expect("static regex compiles")
});
static ORDINAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(\d{1,2})(st|nd|rd|th)\b").expect("static regex compiles"));

/// Datetime formats with an explicit offset.
const OFFSET_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S %z", "%Y-%m-%dT%H:%M:%S%.f%z"];

/// Naive datetime formats, assumed UTC.
const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%Y.%m.%d %H:%M:%S",
    "%d-%b-%Y %H:%M:%S",
    "%d.%m.%Y %H:%M:%S",
    "%d-%m-%Y %H:%M:%S",
    "%d %B %Y at %H:%M:%S%.f",
    "%a %b %e %H:%M:%S %Y",
];

/// Date-only formats, assumed midnight UTC.
const NAIVE_DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%Y.%m.%d",
    "%Y. %m. %d.",
    "%Y. %m. %d",
    "%d-%b-%Y",
    "%d %b %Y",
    "%d %B %Y",
    "%B %d %Y",
    "%b %d %Y",
    "%d.%m.%Y",
    "%d/%m/%Y",
    "%d-%m-%Y",
    "%Y-%b-%d",
];

/// Try the format table in order; first success wins. Returns the parsed
/// instant in the display zone, or `None` (never an error) so a weird date
/// cannot fail a query.
fn parse_datetime(raw: &str) -> Option<DateTime<FixedOffset>> {
    let mut cleaned = WHITESPACE_RE.replace_all(raw.trim(), " ").into_owned();
    cleaned = TRAILING_PAREN_RE.replace(&cleaned, "").into_owned();
    cleaned = ORDINAL_RE.replace_all(&cleaned, "$1").into_owned();
    // Trailing dot shows up in ".tr" dates ("2026-Jan-02.").
    let cleaned = cleaned.trim().trim_end_matches('.').trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(cleaned) {
        return Some(dt.with_timezone(&display_zone()));
    }
    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(cleaned, format) {
            return Some(dt.with_timezone(&display_zone()));
        }
    }

    // Second pass with the trailing zone abbreviation stripped ("... UTC",
    // "... GMT+1", "... MST").
    let no_tz = TRAILING_TZ_RE.replace(cleaned, "").into_owned();
    for candidate in [cleaned, no_tz.as_str()] {
        for format in NAIVE_DATETIME_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(candidate, format) {
                return Some(utc_to_display(naive));
            }
        }
        for format in NAIVE_DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(candidate, format) {
                let naive = date.and_hms_opt(0, 0, 0)?;
                return Some(utc_to_display(naive));
            }
        }
    }

    debug!("unparseable date: {raw:?}");
    None
}

fn utc_to_display(naive: NaiveDateTime) -> DateTime<FixedOffset> {
    Utc.from_utc_datetime(&naive).with_timezone(&display_zone())
}

static NAME_SERVER_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)name server:\s*([^\r\n]+)",
        r"(?i)nameserver:\s*([^\r\n]+)",
        r"(?i)nserver:\s*([^\r\n]+)",
        r"(?i)nserver\.+:\s*([^\r\n]+)",               // .fi dotted
        r"(?i)dns:\s*([^\r\n]+)",
        r"(?i)(?:primary|secondary) server\.+:\s*([^\r\n]+)", // .kz
        r"(?i)name server \(db\):\.+([^\r\n]+)",        // .tg
        r"(?i)\[nservers\][\s\S]*?nserver:\s*([^\r\n]+)", // .lv section
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static name server pattern compiles"))
    .collect()
});

fn extract_name_servers(response: &str) -> Vec<String> {
    let mut servers = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for re in NAME_SERVER_PATTERNS.iter() {
        for caps in re.captures_iter(response) {
            let Some(m) = caps.get(1) else { continue };
            let mut ns = m.as_str().trim().to_lowercase();
            // Strip trailing IP glue and "[ok]" style markers.
            ns = ns
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .trim_end_matches("[ok]")
                .trim()
                .to_string();
            if !ns.is_empty() && ns.contains('.') && seen.insert(ns.clone()) {
                servers.push(ns);
            }
        }
    }

    servers
}

// ---- RDAP classification -------------------------------------------------

pub fn classify_rdap(domain: &str, doc: &RdapDomain, raw: String) -> DomainResult {
    let mut result = DomainResult {
        domain: domain.to_string(),
        state: rdap_state(&doc.status),
        registrar: rdap_registrar(doc),
        last_checked: now_local(),
        query_method: QueryMethod::Rdap,
        created_at: None,
        expiry_at: None,
        updated_at: None,
        name_servers: rdap_name_servers(doc),
        raw,
        error_message: String::new(),
    };

    for event in &doc.events {
        let Some(action) = event.event_action.as_deref() else { continue };
        let date = event
            .event_date
            .as_deref()
            .and_then(parse_datetime);
        match action.to_lowercase().as_str() {
            "registration" => result.created_at = result.created_at.or(date),
            "expiration" | "soft expiration" => result.expiry_at = result.expiry_at.or(date),
            "last changed" | "last update of rdap database" => {
                result.updated_at = result.updated_at.or(date)
            }
            _ => {}
        }
    }

    // A 200 whose error envelope or description says "not found" is an
    // availability answer some registries prefer over a plain 404.
    if result.state == LifecycleState::Unknown {
        let description = doc.description.join(" ").to_lowercase();
        let title = doc.title.as_deref().unwrap_or_default().to_lowercase();
        if doc.error_code == Some(404)
            || title.contains("not found")
            || description.contains("not found")
            || description.contains("no match")
        {
            result.state = LifecycleState::Available;
        }
    }

    let has_registrar =
        !result.registrar.is_empty() && result.registrar != REGISTRAR_UNSUPPORTED;
    let has_signals = has_registrar
        || result.expiry_at.is_some()
        || result.created_at.is_some()
        || !doc.events.is_empty();

    if result.state == LifecycleState::Available && has_signals {
        warn!("{domain} (RDAP) looked available but carries registration data, correcting");
        result.state = LifecycleState::Registered;
    }

    if result.state == LifecycleState::Unknown {
        if has_signals || !result.name_servers.is_empty() {
            result.state = LifecycleState::Registered;
        } else {
            // 200 with an empty status array and no data at all: the
            // registration does not exist.
            result.state = LifecycleState::Available;
        }
    }

    result
}

fn rdap_state(statuses: &[String]) -> LifecycleState {
    if statuses.is_empty() {
        return LifecycleState::Unknown;
    }

    let lowered: Vec<String> = statuses.iter().map(|s| s.to_lowercase()).collect();
    let has = |needle: &str| lowered.iter().any(|s| s == needle);

    if has("redemption period") || has("redemptionperiod") {
        return LifecycleState::Redemption;
    }
    if has("pending delete") || has("pendingdelete") {
        return LifecycleState::PendingDelete;
    }
    if has("renew period") || has("auto renew period") || has("expired") {
        return LifecycleState::Grace;
    }

    LifecycleState::Registered
}

fn rdap_registrar(doc: &RdapDomain) -> String {
    for entity in &doc.entities {
        let is_registrar = entity
            .roles
            .iter()
            .any(|role| role.eq_ignore_ascii_case("registrar"));
        if !is_registrar {
            continue;
        }
        if let Some(vcard) = &entity.vcard_array {
            if let Some(org) = vcard_text(vcard, "org").or_else(|| vcard_text(vcard, "fn")) {
                return org;
            }
        }
        if let Some(handle) = &entity.handle {
            return handle.clone();
        }
    }
    String::new()
}

/// Pull a text property out of a jCard array:
/// `["vcard", [["org", {}, "text", "Example Inc."], ...]]`.
fn vcard_text(vcard: &serde_json::Value, prop: &str) -> Option<String> {
    let properties = vcard.get(1)?.as_array()?;
    for entry in properties {
        let Some(entry) = entry.as_array() else { continue };
        if entry.len() < 4 {
            continue;
        }
        let Some(name) = entry[0].as_str() else { continue };
        if name.eq_ignore_ascii_case(prop) {
            if let Some(value) = entry[3].as_str() {
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

fn rdap_name_servers(doc: &RdapDomain) -> Vec<String> {
    let mut servers = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for ns in &doc.nameservers {
        if let Some(name) = &ns.ldh_name {
            let lower = name.to_lowercase();
            if !lower.is_empty() && seen.insert(lower.clone()) {
                servers.push(lower);
            }
        }
    }
    servers
}
