//! Core domain model for Scout: targets, sources, findings, and the
//! registry/telemetry contracts the sweep engine consumes.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "scout-core";

pub const FALLBACK_TITLE: &str = "No Title";
pub const FALLBACK_PRICE: &str = "N/A";
pub const FALLBACK_URL: &str = "#";

/// One item of a provider's result list, in whatever shape the provider sent it.
pub type RawItem = serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("keyword must not be empty")]
    EmptyKeyword,
    #[error("invalid domain {0:?}")]
    InvalidDomain(String),
    #[error("invalid source {0:?}")]
    InvalidSource(String),
}

/// A trimmed, non-empty search keyword.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Keyword(String);

impl Keyword {
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(CoreError::EmptyKeyword);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Keyword {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Keyword> for String {
    fn from(value: Keyword) -> Self {
        value.0
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bare lower-case host name, e.g. `example.com`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Domain(String);

impl Domain {
    /// Accepts pasted URLs too: scheme, path, query and a trailing dot are dropped.
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let lower = input.trim().to_ascii_lowercase();
        let without_scheme = lower
            .strip_prefix("https://")
            .or_else(|| lower.strip_prefix("http://"))
            .unwrap_or(&lower);
        let host = without_scheme
            .split(['/', '?', '#'])
            .next()
            .unwrap_or_default()
            .trim_end_matches('.');

        let valid = !host.is_empty()
            && !host.starts_with('.')
            && !host.starts_with('-')
            && host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
        if !valid {
            return Err(CoreError::InvalidDomain(input.to_string()));
        }
        Ok(Self(host.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Domain {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Domain> for String {
    fn from(value: Domain) -> Self {
        value.0
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A keyword under surveillance. `schedule_hint` is carried as metadata only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub name: Keyword,
    #[serde(default)]
    pub schedule_hint: Option<String>,
}

impl Target {
    pub fn new(name: Keyword) -> Self {
        Self {
            name,
            schedule_hint: None,
        }
    }

    pub fn parse(input: &str) -> Result<Self, CoreError> {
        Ok(Self::new(Keyword::parse(input)?))
    }
}

/// Where a sweep looks: a named provider, or a custom site searched through
/// the generic site-scoped search.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SourceDescriptor {
    Provider(String),
    Site(Domain),
}

impl SourceDescriptor {
    pub const SITE_PREFIX: &'static str = "custom:";

    /// `custom:<domain>` and `site:<domain>` name sites; a token containing a dot
    /// is also taken as a site. Anything else is a provider id.
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(CoreError::InvalidSource(input.to_string()));
        }
        let lower = trimmed.to_ascii_lowercase();
        if let Some(rest) = lower
            .strip_prefix(Self::SITE_PREFIX)
            .or_else(|| lower.strip_prefix("site:"))
        {
            return Ok(Self::Site(Domain::parse(rest)?));
        }
        if lower.contains('.') {
            return Ok(Self::Site(Domain::parse(&lower)?));
        }
        if !lower
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(CoreError::InvalidSource(input.to_string()));
        }
        Ok(Self::Provider(lower))
    }

    pub fn site(domain: Domain) -> Self {
        Self::Site(domain)
    }

    pub fn label(&self) -> String {
        match self {
            Self::Provider(id) => id.clone(),
            Self::Site(domain) => format!("{}{}", Self::SITE_PREFIX, domain),
        }
    }
}

impl TryFrom<String> for SourceDescriptor {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SourceDescriptor> for String {
    fn from(value: SourceDescriptor) -> Self {
        value.label()
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Canonical archived search result. `url` is the dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub target: String,
    pub source_label: String,
    pub title: String,
    pub price: String,
    pub url: String,
    pub discovered_at: DateTime<Utc>,
}

impl Finding {
    /// True when no usable link was found and the URL fell back to the placeholder.
    pub fn has_placeholder_url(&self) -> bool {
        self.url == FALLBACK_URL
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Invalid(#[from] CoreError),
}

/// Supplies the keyword and site lists a sweep can select from.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn list_targets(&self) -> Result<Vec<Target>, RegistryError>;
    async fn list_sources(&self) -> Result<Vec<SourceDescriptor>, RegistryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

/// Append-only diagnostic event log.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, tag: &str, message: &str, severity: Severity);
}

/// Forwards telemetry events into `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn emit(&self, tag: &str, message: &str, severity: Severity) {
        let tag = tag.to_ascii_uppercase();
        match severity {
            Severity::Debug => tracing::debug!(tag = %tag, "{message}"),
            Severity::Info => tracing::info!(tag = %tag, "{message}"),
            Severity::Warn => tracing::warn!(tag = %tag, "{message}"),
            Severity::Error => tracing::error!(tag = %tag, "{message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryEvent {
    pub at: DateTime<Utc>,
    pub tag: String,
    pub message: String,
    pub severity: Severity,
}

/// In-process event log with tail access.
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TelemetryEvent>> {
        match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.lock().clone()
    }

    pub fn tail(&self, n: usize) -> Vec<TelemetryEvent> {
        let events = self.lock();
        let start = events.len().saturating_sub(n);
        events[start..].to_vec()
    }

    pub fn with_tag(&self, tag: &str) -> Vec<TelemetryEvent> {
        self.lock()
            .iter()
            .filter(|e| e.tag.eq_ignore_ascii_case(tag))
            .cloned()
            .collect()
    }
}

impl TelemetrySink for MemoryTelemetry {
    fn emit(&self, tag: &str, message: &str, severity: Severity) {
        self.lock().push(TelemetryEvent {
            at: Utc::now(),
            tag: tag.to_ascii_uppercase(),
            message: message.to_string(),
            severity,
        });
    }
}
