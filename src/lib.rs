//! # Domain Sentinel
//!
//! A monitoring engine for the registration lifecycle of Internet domain
//! names. Every watched domain gets its own scheduler which periodically
//! queries the registry over RDAP (HTTPS/JSON) with a WHOIS (TCP) fallback,
//! classifies the response into a lifecycle state, persists the observation,
//! and raises aggregated notifications when a domain moves into a state the
//! user cares about (became available, entered redemption, pending delete).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use domain_sentinel::{config::MonitorConfig, monitor::Monitor, store::Store};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(Store::open("data/sentinel.db")?);
//!     let config = MonitorConfig::load(&store)?;
//!     let monitor = Monitor::new(config, store, Vec::new())?;
//!
//!     monitor.add_domain("example.com", true).await?;
//!     monitor.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     monitor.stop().await;
//!     Ok(())
//! }
//! ```

pub mod aggregator;
pub mod classifier;
pub mod config;
pub mod errors;
pub mod monitor;
pub mod notify;
pub mod rdap;
pub mod store;
pub mod tld;
pub mod whois;
pub mod worker;

// Re-export main types for easy access
pub use classifier::Classifier;
pub use config::MonitorConfig;
pub use errors::MonitorError;
pub use monitor::Monitor;
pub use store::Store;

use chrono::{DateTime, FixedOffset, Utc};

/// All timestamps are normalized to this zone before persisting, so that
/// stored rows and notification bodies agree on wall-clock times.
pub fn display_zone() -> FixedOffset {
    FixedOffset::east_opt(8 * 3600).expect("static offset is in range")
}

/// Current time in the display zone.
pub fn now_local() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&display_zone())
}

/// Registration lifecycle of a domain as observed through WHOIS/RDAP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Not registered; open for registration.
    Available,
    /// Actively registered.
    Registered,
    /// Past expiry but still renewable by the registrant (renew/auto-renew
    /// period). Expired responses collapse into this state.
    Grace,
    /// Redemption period; recoverable only through the registrar at a fee.
    Redemption,
    /// Scheduled for deletion; will drop shortly.
    PendingDelete,
    /// Tag used by pattern catalogues; classification output folds this
    /// into [`LifecycleState::Grace`].
    Expired,
    /// Transient query failure (network, rate limiting, ...).
    Error,
    /// Final response that could not be classified.
    Unknown,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Available => "available",
            LifecycleState::Registered => "registered",
            LifecycleState::Grace => "grace",
            LifecycleState::Redemption => "redemption",
            LifecycleState::PendingDelete => "pending_delete",
            LifecycleState::Expired => "expired",
            LifecycleState::Error => "error",
            LifecycleState::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> LifecycleState {
        match s {
            "available" => LifecycleState::Available,
            "registered" => LifecycleState::Registered,
            "grace" => LifecycleState::Grace,
            "redemption" => LifecycleState::Redemption,
            "pending_delete" => LifecycleState::PendingDelete,
            "expired" => LifecycleState::Expired,
            "error" => LifecycleState::Error,
            _ => LifecycleState::Unknown,
        }
    }

    /// Human-readable label used in notification bodies.
    pub fn label(&self) -> &'static str {
        match self {
            LifecycleState::Available => "available for registration",
            LifecycleState::Registered => "registered",
            LifecycleState::Grace => "in grace period",
            LifecycleState::Redemption => "in redemption period",
            LifecycleState::PendingDelete => "pending delete",
            LifecycleState::Expired => "expired",
            LifecycleState::Error => "query failed",
            LifecycleState::Unknown => "unknown",
        }
    }

    /// Whether a transition *into* this state is user-relevant. Only
    /// states that represent a registration opportunity notify.
    pub fn should_notify(&self) -> bool {
        matches!(
            self,
            LifecycleState::Available
                | LifecycleState::Grace
                | LifecycleState::Redemption
                | LifecycleState::PendingDelete
        )
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which protocol produced the current observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMethod {
    Whois,
    Rdap,
    /// No query has completed yet.
    Pending,
    /// A query is in flight.
    Checking,
}

impl QueryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMethod::Whois => "whois",
            QueryMethod::Rdap => "rdap",
            QueryMethod::Pending => "pending",
            QueryMethod::Checking => "checking",
        }
    }

    pub fn parse(s: &str) -> QueryMethod {
        match s {
            "whois" => QueryMethod::Whois,
            "rdap" => QueryMethod::Rdap,
            "checking" => QueryMethod::Checking,
            _ => QueryMethod::Pending,
        }
    }
}

/// One observation of a domain: the classified state plus whatever metadata
/// the response allowed us to extract. Upserted into the store on every
/// query; the scheduler derives the next check time from `last_checked`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DomainResult {
    pub domain: String,
    pub state: LifecycleState,
    pub registrar: String,
    pub last_checked: DateTime<FixedOffset>,
    pub query_method: QueryMethod,
    pub created_at: Option<DateTime<FixedOffset>>,
    pub expiry_at: Option<DateTime<FixedOffset>>,
    pub updated_at: Option<DateTime<FixedOffset>>,
    /// Ordered, deduplicated, lowercased.
    pub name_servers: Vec<String>,
    /// Original WHOIS text or RDAP JSON body, verbatim.
    pub raw: String,
    pub error_message: String,
}

impl DomainResult {
    /// A failed observation carrying only the error.
    pub fn error(domain: &str, message: impl Into<String>) -> Self {
        DomainResult {
            domain: domain.to_string(),
            state: LifecycleState::Error,
            registrar: String::new(),
            last_checked: now_local(),
            query_method: QueryMethod::Pending,
            created_at: None,
            expiry_at: None,
            updated_at: None,
            name_servers: Vec::new(),
            raw: String::new(),
            error_message: message.into(),
        }
    }
}

/// A user-curated watch entry.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DomainEntry {
    pub id: i64,
    /// Lowercased FQDN, unique.
    pub name: String,
    /// Whether the domain is scheduled for checks.
    pub enabled: bool,
    /// Whether state transitions raise notifications.
    pub notify: bool,
    pub created_at: DateTime<FixedOffset>,
}

/// A state change detected by a worker, en route to the notification
/// aggregator. In-memory only.
#[derive(Debug, Clone)]
pub struct TransitionEvent {
    pub domain: String,
    pub old_state: LifecycleState,
    pub new_state: LifecycleState,
    pub timestamp: DateTime<FixedOffset>,
    pub message: String,
    pub result: Option<DomainResult>,
}

impl TransitionEvent {
    pub fn new(
        domain: &str,
        old_state: LifecycleState,
        new_state: LifecycleState,
        result: Option<DomainResult>,
    ) -> Self {
        TransitionEvent {
            domain: domain.to_string(),
            old_state,
            new_state,
            timestamp: now_local(),
            message: transition_message(domain, old_state, new_state),
            result,
        }
    }
}

/// Human message for a state transition.
pub fn transition_message(domain: &str, old: LifecycleState, new: LifecycleState) -> String {
    match new {
        LifecycleState::Available => format!("{domain} is now available for registration"),
        LifecycleState::Redemption => format!("{domain} entered the redemption period"),
        LifecycleState::PendingDelete => format!("{domain} is pending delete"),
        LifecycleState::Grace => format!("{domain} entered the grace period"),
        _ => format!("{domain} changed from {} to {}", old.label(), new.label()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_str() {
        for state in [
            LifecycleState::Available,
            LifecycleState::Registered,
            LifecycleState::Grace,
            LifecycleState::Redemption,
            LifecycleState::PendingDelete,
            LifecycleState::Expired,
            LifecycleState::Error,
            LifecycleState::Unknown,
        ] {
            assert_eq!(LifecycleState::parse(state.as_str()), state);
        }
    }

    #[test]
    fn only_opportunity_states_notify() {
        assert!(LifecycleState::Available.should_notify());
        assert!(LifecycleState::Grace.should_notify());
        assert!(LifecycleState::Redemption.should_notify());
        assert!(LifecycleState::PendingDelete.should_notify());
        assert!(!LifecycleState::Registered.should_notify());
        assert!(!LifecycleState::Error.should_notify());
        assert!(!LifecycleState::Unknown.should_notify());
        assert!(!LifecycleState::Expired.should_notify());
    }

    #[test]
    fn unrecognized_state_parses_as_unknown() {
        assert_eq!(LifecycleState::parse("serverHold"), LifecycleState::Unknown);
    }
}
