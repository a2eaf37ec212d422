//! Notification fan-out.
//!
//! Sinks implement [`Notifier`]; the manager formats transition events into
//! subject/body pairs and delivers to every enabled sink on its own task.
//! Delivery is fire-and-forget behind a bounded queue: a full queue drops
//! the event with a warning rather than ever blocking a worker.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::MonitorError;
use crate::store::Store;
use crate::{LifecycleState, TransitionEvent};

/// Raw WHOIS/RDAP payloads are capped at this many characters inside a
/// notification body.
const RAW_SNIPPET_LIMIT: usize = 2000;

const QUEUE_CAPACITY: usize = 1000;

/// A notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, subject: &str, body: &str) -> Result<(), MonitorError>;
    fn is_enabled(&self) -> bool;
    fn kind(&self) -> &'static str;
    /// Deliver a probe message to verify the sink configuration.
    async fn test(&self) -> Result<(), MonitorError>;
}

enum Outbound {
    Single(TransitionEvent),
    Batch(Vec<TransitionEvent>),
}

pub struct NotificationManager {
    notifiers: RwLock<Vec<Arc<dyn Notifier>>>,
    tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    consumer: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl NotificationManager {
    /// Build the manager and start its delivery loop.
    pub fn start(notifiers: Vec<Arc<dyn Notifier>>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let manager = Arc::new(NotificationManager {
            notifiers: RwLock::new(notifiers),
            tx,
            cancel: CancellationToken::new(),
            consumer: tokio::sync::Mutex::new(None),
        });

        let task = tokio::spawn(Self::run(manager.clone(), rx));
        if let Ok(mut slot) = manager.consumer.try_lock() {
            *slot = Some(task);
        }
        manager
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Outbound>) {
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(outbound) => self.deliver(outbound),
                    None => return,
                },
                _ = self.cancel.cancelled() => {
                    // Drain whatever is already queued, then exit.
                    while let Ok(outbound) = rx.try_recv() {
                        self.deliver(outbound);
                    }
                    return;
                }
            }
        }
    }

    /// Stop the delivery loop after draining the queue. Already-spawned
    /// sink sends keep running to completion.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.consumer.lock().await.take() {
            let _ = task.await;
        }
    }

    /// Queue one transition for delivery. Never blocks.
    pub fn dispatch_single(&self, event: TransitionEvent) {
        if let Err(e) = self.tx.try_send(Outbound::Single(event)) {
            warn!("notification queue full, dropping event: {e}");
        }
    }

    /// Queue a batched group of transitions for delivery as one message.
    pub fn dispatch_batch(&self, events: Vec<TransitionEvent>) {
        if events.is_empty() {
            return;
        }
        if let Err(e) = self.tx.try_send(Outbound::Batch(events)) {
            warn!("notification queue full, dropping batch: {e}");
        }
    }

    fn deliver(&self, outbound: Outbound) {
        let (subject, body, context) = match &outbound {
            Outbound::Single(event) => (
                format_subject(event),
                format_body(event),
                event.domain.clone(),
            ),
            Outbound::Batch(events) => (
                format_batch_subject(events),
                format_batch_body(events),
                format!("{} domains", events.len()),
            ),
        };

        let notifiers: Vec<Arc<dyn Notifier>> = self
            .notifiers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|n| n.is_enabled())
            .cloned()
            .collect();

        for notifier in notifiers {
            let subject = subject.clone();
            let body = body.clone();
            let context = context.clone();
            tokio::spawn(async move {
                match notifier.send(&subject, &body).await {
                    Ok(()) => info!("{} notification sent ({context})", notifier.kind()),
                    Err(e) => error!("{} notification failed ({context}): {e}", notifier.kind()),
                }
            });
        }
    }

    /// Replace the sink list (config update).
    pub fn set_notifiers(&self, notifiers: Vec<Arc<dyn Notifier>>) {
        *self.notifiers.write().unwrap_or_else(|e| e.into_inner()) = notifiers;
    }

    pub fn enabled_kinds(&self) -> Vec<&'static str> {
        self.notifiers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|n| n.is_enabled())
            .map(|n| n.kind())
            .collect()
    }

    /// Run every sink's probe, returning per-kind outcomes.
    pub async fn test_all(&self) -> Vec<(&'static str, Result<(), MonitorError>)> {
        let notifiers: Vec<Arc<dyn Notifier>> = self
            .notifiers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let mut results = Vec::with_capacity(notifiers.len());
        for notifier in notifiers {
            results.push((notifier.kind(), notifier.test().await));
        }
        results
    }
}

// ---- formatting ----------------------------------------------------------

fn event_kind(event: &TransitionEvent) -> &'static str {
    match event.new_state {
        LifecycleState::Available => "available",
        LifecycleState::Redemption => "redemption",
        LifecycleState::PendingDelete => "pending_delete",
        LifecycleState::Error => "error",
        _ => "status_change",
    }
}

pub fn format_subject(event: &TransitionEvent) -> String {
    match event_kind(event) {
        "available" => format!("{} is available!", event.domain),
        "redemption" => format!("{} entered redemption", event.domain),
        "pending_delete" => format!("{} is pending delete", event.domain),
        "error" => format!("{} query failed", event.domain),
        _ => format!("{} status change", event.domain),
    }
}

pub fn format_body(event: &TransitionEvent) -> String {
    let mut body = String::new();
    body.push_str(&format!("Domain: {}\n", event.domain));
    body.push_str(&format!(
        "Time: {}\n",
        event.timestamp.format("%Y-%m-%d %H:%M:%S")
    ));
    body.push_str(&format!(
        "Status change: {} \u{2192} {}\n",
        event.old_state.label(),
        event.new_state.label()
    ));

    if !event.message.is_empty() {
        body.push_str(&format!("\n{}\n", event.message));
    }

    if let Some(result) = &event.result {
        if !result.raw.is_empty() {
            body.push_str("\n=== WHOIS/RDAP response ===\n");
            if result.raw.chars().count() > RAW_SNIPPET_LIMIT {
                let snippet: String = result.raw.chars().take(RAW_SNIPPET_LIMIT).collect();
                body.push_str(&snippet);
                body.push_str("\n...(truncated)");
            } else {
                body.push_str(&result.raw);
            }
            body.push('\n');
        }
    }

    body.push_str("\n---\nSent automatically by domain-sentinel\n");
    body
}

pub fn format_batch_subject(events: &[TransitionEvent]) -> String {
    format!("Domain status changes ({} domains)", events.len())
}

pub fn format_batch_body(events: &[TransitionEvent]) -> String {
    let mut body = String::new();
    body.push_str(&format!("{} domains changed state\n", events.len()));
    body.push_str(&format!(
        "Time: {}\n\n",
        crate::now_local().format("%Y-%m-%d %H:%M:%S")
    ));

    for (i, event) in events.iter().enumerate() {
        body.push_str(&format!("{}. {}\n", i + 1, event.domain));
        body.push_str(&format!(
            "   {} \u{2192} {}\n",
            event.old_state.label(),
            event.new_state.label()
        ));
        if i + 1 < events.len() {
            body.push('\n');
        }
    }

    body.push_str("\n---\nSent automatically by domain-sentinel\n");
    body
}

// ---- email sink ----------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SmtpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    pub to: String,
}

impl SmtpConfig {
    /// Read the sink settings keys from the store.
    pub fn from_settings(store: &Store) -> Result<Self, MonitorError> {
        Ok(SmtpConfig {
            enabled: flag(store.get_setting("smtp_enabled")?),
            host: store.get_setting("smtp_host")?.unwrap_or_default(),
            port: store
                .get_setting("smtp_port")?
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(587),
            username: store.get_setting("smtp_username")?.unwrap_or_default(),
            password: store.get_setting("smtp_password")?.unwrap_or_default(),
            from: store.get_setting("smtp_from")?.unwrap_or_default(),
            to: store.get_setting("smtp_to")?.unwrap_or_default(),
        })
    }

    fn validate(&self) -> Result<(), MonitorError> {
        if self.host.is_empty() {
            return Err(MonitorError::Notifier("SMTP host not configured".into()));
        }
        if self.port == 0 {
            return Err(MonitorError::Notifier("SMTP port not configured".into()));
        }
        if self.from.is_empty() || self.to.is_empty() {
            return Err(MonitorError::Notifier(
                "SMTP from/to addresses not configured".into(),
            ));
        }
        Ok(())
    }
}

pub struct EmailNotifier {
    config: RwLock<SmtpConfig>,
}

impl EmailNotifier {
    pub fn new(config: SmtpConfig) -> Self {
        EmailNotifier {
            config: RwLock::new(config),
        }
    }

    pub fn update_config(&self, config: SmtpConfig) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
    }

    fn config(&self) -> SmtpConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn send_mail(&self, subject: &str, body: &str) -> Result<(), MonitorError> {
        let cfg = self.config();
        if !cfg.enabled {
            return Err(MonitorError::Notifier("email notifier disabled".into()));
        }
        cfg.validate()?;

        let message = Message::builder()
            .from(parse_mailbox(&cfg.from)?)
            .to(parse_mailbox(&cfg.to)?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| MonitorError::Notifier(format!("failed to build message: {e}")))?;

        // Port 465 is implicit TLS; everything else negotiates STARTTLS.
        let builder = if cfg.port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.host)
        }
        .map_err(|e| MonitorError::Notifier(format!("SMTP transport error: {e}")))?;

        let transport = builder
            .port(cfg.port)
            .credentials(Credentials::new(cfg.username, cfg.password))
            .build();

        match transport.send(message).await {
            Ok(_) => Ok(()),
            // Some SMTP servers accept the message and then cut the
            // connection before finishing the reply. The mail is out; treat
            // the truncated reply as success rather than re-notifying.
            Err(e) if e.to_string().to_lowercase().contains("short response") => Ok(()),
            Err(e) => Err(MonitorError::Notifier(format!("SMTP send failed: {e}"))),
        }
    }
}

fn parse_mailbox(addr: &str) -> Result<lettre::message::Mailbox, MonitorError> {
    addr.parse()
        .map_err(|e| MonitorError::Notifier(format!("invalid address {addr:?}: {e}")))
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn send(&self, subject: &str, body: &str) -> Result<(), MonitorError> {
        self.send_mail(subject, body).await
    }

    fn is_enabled(&self) -> bool {
        self.config().enabled
    }

    fn kind(&self) -> &'static str {
        "email"
    }

    async fn test(&self) -> Result<(), MonitorError> {
        self.send_mail(
            "domain-sentinel test",
            "This is a test message confirming the email notifier is configured correctly.\n",
        )
        .await
    }
}

// ---- telegram sink -------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub bot_token: String,
    pub chat_id: String,
}

impl TelegramConfig {
    pub fn from_settings(store: &Store) -> Result<Self, MonitorError> {
        Ok(TelegramConfig {
            enabled: flag(store.get_setting("telegram_enabled")?),
            bot_token: store.get_setting("telegram_bot_token")?.unwrap_or_default(),
            chat_id: store.get_setting("telegram_chat_id")?.unwrap_or_default(),
        })
    }

    fn validate(&self) -> Result<(), MonitorError> {
        if self.bot_token.is_empty() || self.chat_id.is_empty() {
            return Err(MonitorError::Notifier(
                "Telegram bot token/chat id not configured".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    description: Option<String>,
}

pub struct TelegramNotifier {
    config: RwLock<TelegramConfig>,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Result<Self, MonitorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(TelegramNotifier {
            config: RwLock::new(config),
            client,
        })
    }

    pub fn update_config(&self, config: TelegramConfig) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
    }

    fn config(&self) -> TelegramConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn send_message(&self, subject: &str, body: &str) -> Result<(), MonitorError> {
        let cfg = self.config();
        if !cfg.enabled {
            return Err(MonitorError::Notifier("telegram notifier disabled".into()));
        }
        cfg.validate()?;

        let url = format!("https://api.telegram.org/bot{}/sendMessage", cfg.bot_token);
        let payload = serde_json::json!({
            "chat_id": cfg.chat_id,
            "text": format!("{subject}\n\n{body}"),
        });

        let response = self.client.post(&url).json(&payload).send().await?;
        let parsed: TelegramResponse = response.json().await?;
        if !parsed.ok {
            return Err(MonitorError::Notifier(format!(
                "Telegram API error: {}",
                parsed.description.unwrap_or_else(|| "unknown".into())
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, subject: &str, body: &str) -> Result<(), MonitorError> {
        self.send_message(subject, body).await
    }

    fn is_enabled(&self) -> bool {
        self.config().enabled
    }

    fn kind(&self) -> &'static str {
        "telegram"
    }

    async fn test(&self) -> Result<(), MonitorError> {
        self.send_message(
            "domain-sentinel test",
            "This is a test message confirming the Telegram notifier is configured correctly.",
        )
        .await
    }
}

fn flag(value: Option<String>) -> bool {
    matches!(
        value.as_deref().map(str::trim),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}
