//! Sweep orchestration: runs a target x source cross product through the
//! provider adapters, normalizes every raw item and archives new findings.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use scout_adapters::{
    normalize_with, AdapterSet, MarketplaceSettings, ProviderAdapter, SearchContext, SearchQuery, DEFAULT_TOP_N,
    EBAY_SEARCH_URL, SERPAPI_ENDPOINT,
};
use scout_core::{
    Finding, Keyword, RawItem, Registry, RegistryError, Severity, SourceDescriptor, Target, TelemetrySink, TracingTelemetry,
};
use scout_storage::{
    BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, JitterWindow, ScoutStore, StoreError, MAX_ATTEMPTS,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod notify;

pub use notify::{render_digest, LogNotifier, Notifier, NotifyError};

pub const CRATE_NAME: &str = "scout-sync";

pub const DEFAULT_RETENTION_DAYS: i64 = 90;
pub const MAX_RETENTION_DAYS: i64 = 36_500;

/// Provider calls are bounded to this window.
pub const HTTP_TIMEOUT_SECS: std::ops::RangeInclusive<u64> = 15..=20;

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub database_url: String,
    pub serpapi_key: Option<String>,
    pub serpapi_endpoint: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub top_n: usize,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    pub max_attempts: usize,
    pub source_parallelism: usize,
    pub retention_days: i64,
    pub registry_file: Option<PathBuf>,
}

impl SweepConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let number = |key: &str, default: u64| var(key).and_then(|v| v.parse().ok()).unwrap_or(default);

        Self {
            database_url: var("SCOUT_DATABASE_URL").unwrap_or_else(|| "sqlite://scout.db".to_string()),
            serpapi_key: var("SERPAPI_KEY"),
            serpapi_endpoint: var("SCOUT_SERPAPI_ENDPOINT").unwrap_or_else(|| SERPAPI_ENDPOINT.to_string()),
            user_agent: var("SCOUT_USER_AGENT").unwrap_or_else(|| "scout-bot/0.1".to_string()),
            http_timeout_secs: number("SCOUT_HTTP_TIMEOUT_SECS", 20)
                .clamp(*HTTP_TIMEOUT_SECS.start(), *HTTP_TIMEOUT_SECS.end()),
            top_n: (number("SCOUT_TOP_N", DEFAULT_TOP_N as u64) as usize).clamp(1, DEFAULT_TOP_N),
            jitter_min_ms: number("SCOUT_JITTER_MIN_MS", 1000),
            jitter_max_ms: number("SCOUT_JITTER_MAX_MS", 3500),
            max_attempts: (number("SCOUT_MAX_ATTEMPTS", MAX_ATTEMPTS as u64) as usize).clamp(1, MAX_ATTEMPTS),
            source_parallelism: (number("SCOUT_SOURCE_PARALLELISM", 1) as usize).max(1),
            retention_days: var("SCOUT_RETENTION_DAYS")
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(DEFAULT_RETENTION_DAYS)
                .clamp(1, MAX_RETENTION_DAYS),
            registry_file: var("SCOUT_REGISTRY_FILE").map(PathBuf::from),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_attempts: self.max_attempts,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn jitter(&self) -> JitterWindow {
        JitterWindow::new(
            Duration::from_millis(self.jitter_min_ms),
            Duration::from_millis(self.jitter_max_ms),
        )
    }

    pub fn marketplace_settings(&self) -> MarketplaceSettings {
        MarketplaceSettings {
            api_key: self.serpapi_key.clone(),
            serpapi_endpoint: self.serpapi_endpoint.clone(),
            ebay_search_url: EBAY_SEARCH_URL.to_string(),
            top_n: self.top_n,
            jitter: Some(self.jitter()),
        }
    }

    pub fn retention(&self) -> TimeDelta {
        TimeDelta::try_days(self.retention_days.clamp(1, MAX_RETENTION_DAYS))
            .unwrap_or_else(|| TimeDelta::days(DEFAULT_RETENTION_DAYS))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryFile {
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub sources: Vec<SourceDescriptor>,
}

/// Registry backed by a YAML file, re-read on every call so edits made
/// between sweeps are picked up.
#[derive(Debug, Clone)]
pub struct YamlRegistry {
    path: PathBuf,
}

impl YamlRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn load(&self) -> Result<RegistryFile, RegistryError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| RegistryError::Backend(format!("reading {}: {e}", self.path.display())))?;
        serde_yaml::from_str(&text)
            .map_err(|e| RegistryError::Backend(format!("parsing {}: {e}", self.path.display())))
    }
}

#[async_trait]
impl Registry for YamlRegistry {
    async fn list_targets(&self) -> Result<Vec<Target>, RegistryError> {
        Ok(self.load().await?.targets)
    }

    async fn list_sources(&self) -> Result<Vec<SourceDescriptor>, RegistryError> {
        Ok(self.load().await?.sources)
    }
}

/// The targets and sources one sweep covers. Duplicates are dropped and
/// first-seen order is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepScope {
    targets: Vec<Keyword>,
    sources: Vec<SourceDescriptor>,
}

impl SweepScope {
    pub fn new(
        targets: impl IntoIterator<Item = Keyword>,
        sources: impl IntoIterator<Item = SourceDescriptor>,
    ) -> Self {
        let mut seen_targets = HashSet::new();
        let mut seen_sources = HashSet::new();
        Self {
            targets: targets.into_iter().filter(|t| seen_targets.insert(t.clone())).collect(),
            sources: sources.into_iter().filter(|s| seen_sources.insert(s.clone())).collect(),
        }
    }

    /// Copy the registry's current lists; later registry edits do not affect
    /// the returned scope.
    pub async fn snapshot(registry: &dyn Registry) -> Result<Self, RegistryError> {
        let targets = registry.list_targets().await?;
        let sources = registry.list_sources().await?;
        Ok(Self::new(targets.into_iter().map(|t| t.name), sources))
    }

    /// Explicit lists win; the registry is read only for a list left empty.
    pub async fn with_registry_fallback(
        targets: Vec<Keyword>,
        sources: Vec<SourceDescriptor>,
        registry: &dyn Registry,
    ) -> Result<Self, RegistryError> {
        let targets = if targets.is_empty() {
            registry.list_targets().await?.into_iter().map(|t| t.name).collect()
        } else {
            targets
        };
        let sources = if sources.is_empty() {
            registry.list_sources().await?
        } else {
            sources
        };
        Ok(Self::new(targets, sources))
    }

    pub fn targets(&self) -> &[Keyword] {
        &self.targets
    }

    pub fn sources(&self) -> &[SourceDescriptor] {
        &self.sources
    }

    pub fn pair_count(&self) -> usize {
        self.targets.len() * self.sources.len()
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        if self.targets.is_empty() {
            Some(AbortReason::NoTargets)
        } else if self.sources.is_empty() {
            Some(AbortReason::NoSources)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepPhase {
    Idle,
    Running,
    Complete,
    Cancelled,
    Aborted,
}

impl SweepPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Aborted)
    }

    pub fn can_transition_to(self, next: SweepPhase) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Running)
                | (Self::Idle, Self::Aborted)
                | (Self::Running, Self::Complete)
                | (Self::Running, Self::Cancelled)
                | (Self::Running, Self::Aborted)
        )
    }

    pub fn transition(self, next: SweepPhase) -> Result<SweepPhase, SweepError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(SweepError::InvalidTransition { from: self, to: next })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    NoTargets,
    NoSources,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoTargets => f.write_str("no targets selected; select at least one keyword"),
            Self::NoSources => f.write_str("no sources selected; enable at least one provider or site"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("illegal sweep transition {from:?} -> {to:?}")]
    InvalidTransition { from: SweepPhase, to: SweepPhase },
    #[error("sweep lane failed: {0}")]
    Lane(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary {
    pub sweep_id: Uuid,
    pub phase: SweepPhase,
    pub abort_reason: Option<AbortReason>,
    pub pairs_total: usize,
    pub pairs_attempted: usize,
    pub pairs_failed: usize,
    pub results_returned: usize,
    pub results_inserted: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub newly_discovered: Vec<Finding>,
}

#[derive(Debug, Default)]
struct Tally {
    attempted: usize,
    failed: usize,
    returned: usize,
    inserted: usize,
    newly_discovered: Vec<Finding>,
    cancelled: bool,
}

impl Tally {
    fn merge(&mut self, other: Tally) {
        self.attempted += other.attempted;
        self.failed += other.failed;
        self.returned += other.returned;
        self.inserted += other.inserted;
        self.newly_discovered.extend(other.newly_discovered);
        self.cancelled |= other.cancelled;
    }
}

/// Everything one (target, source) pair needs; cloned into parallel lanes.
#[derive(Clone)]
struct PairRunner {
    store: ScoutStore,
    adapters: AdapterSet,
    telemetry: Arc<dyn TelemetrySink>,
}

impl PairRunner {
    async fn run_pair(
        &self,
        sweep_id: Uuid,
        keyword: &Keyword,
        source: &SourceDescriptor,
        tally: &mut Tally,
    ) -> Result<(), SweepError> {
        tally.attempted += 1;
        let label = source.label();

        let Some((adapter, site)) = self.adapters.resolve(source) else {
            tally.failed += 1;
            warn!(%sweep_id, source = %label, "no adapter for source");
            self.telemetry.emit(
                "SWEEP",
                &format!("no adapter registered for source {label}; skipping {keyword:?}"),
                Severity::Warn,
            );
            return Ok(());
        };

        let ctx = SearchContext {
            sweep_id,
            telemetry: self.telemetry.as_ref(),
        };
        let query = SearchQuery::new(keyword.clone(), site);
        let outcome = adapter.search_outcome(&ctx, &query).await;
        if outcome.failed() {
            tally.failed += 1;
            return Ok(());
        }

        self.archive(sweep_id, adapter.as_ref(), keyword, &label, outcome.items, tally)
            .await
    }

    async fn archive(
        &self,
        sweep_id: Uuid,
        adapter: &dyn ProviderAdapter,
        keyword: &Keyword,
        label: &str,
        items: Vec<RawItem>,
        tally: &mut Tally,
    ) -> Result<(), SweepError> {
        let fields = adapter.field_map();
        for raw in &items {
            let finding = normalize_with(raw, fields, keyword.as_str(), label, Utc::now());
            tally.returned += 1;

            if finding.has_placeholder_url() {
                warn!(%sweep_id, source = label, title = %finding.title, "finding has no link; not archived");
                self.telemetry.emit(
                    "SWEEP",
                    &format!("{label} returned {:?} without a link; not archived", finding.title),
                    Severity::Warn,
                );
                continue;
            }

            match self.store.insert_if_new(&finding).await {
                Ok(true) => {
                    tally.inserted += 1;
                    tally.newly_discovered.push(finding);
                }
                Ok(false) => {}
                Err(err) => {
                    error!(%sweep_id, error = %err, "archive write failed; aborting sweep");
                    self.telemetry
                        .emit("STORE", &format!("archive write failed: {err}"), Severity::Error);
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }
}

pub struct Sweeper {
    runner: PairRunner,
    notifier: Arc<dyn Notifier>,
    parallelism: usize,
}

impl Sweeper {
    pub fn new(store: ScoutStore, adapters: AdapterSet) -> Self {
        Self {
            runner: PairRunner {
                store,
                adapters,
                telemetry: Arc::new(TracingTelemetry),
            },
            notifier: Arc::new(LogNotifier),
            parallelism: 1,
        }
    }

    /// Connect the store and build the standard adapter set from `config`.
    pub async fn from_config(config: &SweepConfig) -> Result<Self, SweepError> {
        let store = ScoutStore::connect(&config.database_url).await?;
        let http = Arc::new(HttpFetcher::new(config.http_config())?);
        let adapters = AdapterSet::standard(http, config.marketplace_settings());
        Ok(Self::new(store, adapters).with_parallelism(config.source_parallelism))
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.runner.telemetry = telemetry;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// 1 runs pairs one at a time; more runs up to that many sources at once.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn store(&self) -> &ScoutStore {
        &self.runner.store
    }

    pub async fn execute_sweep(&self, scope: &SweepScope) -> Result<SweepSummary, SweepError> {
        self.execute_sweep_with_cancel(scope, CancellationToken::new()).await
    }

    /// Run `scope` until done or until `cancel` fires. Cancellation stops
    /// further provider calls; findings already archived stay.
    pub async fn execute_sweep_with_cancel(
        &self,
        scope: &SweepScope,
        cancel: CancellationToken,
    ) -> Result<SweepSummary, SweepError> {
        let sweep_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();
        let telemetry = &self.runner.telemetry;
        let phase = SweepPhase::Idle;

        if let Some(reason) = scope.abort_reason() {
            let phase = phase.transition(SweepPhase::Aborted)?;
            warn!(%sweep_id, %reason, "sweep aborted before start");
            telemetry.emit("SWEEP", &format!("sweep aborted: {reason}"), Severity::Warn);
            return Ok(SweepSummary {
                sweep_id,
                phase,
                abort_reason: Some(reason),
                pairs_total: scope.pair_count(),
                pairs_attempted: 0,
                pairs_failed: 0,
                results_returned: 0,
                results_inserted: 0,
                started_at,
                finished_at: Utc::now(),
                elapsed: clock.elapsed(),
                newly_discovered: Vec::new(),
            });
        }

        let phase = phase.transition(SweepPhase::Running)?;
        info!(
            %sweep_id,
            targets = scope.targets().len(),
            sources = scope.sources().len(),
            parallelism = self.parallelism,
            "sweep started"
        );
        telemetry.emit(
            "SWEEP",
            &format!(
                "sweep {sweep_id} started: {} targets x {} sources",
                scope.targets().len(),
                scope.sources().len()
            ),
            Severity::Info,
        );

        let span = info_span!("sweep", %sweep_id);
        let tally = if self.parallelism > 1 && scope.sources().len() > 1 {
            self.run_lanes(sweep_id, scope, &cancel).instrument(span).await?
        } else {
            self.run_sequential(sweep_id, scope, &cancel).instrument(span).await?
        };

        let phase = phase.transition(if tally.cancelled {
            SweepPhase::Cancelled
        } else {
            SweepPhase::Complete
        })?;

        let summary = SweepSummary {
            sweep_id,
            phase,
            abort_reason: None,
            pairs_total: scope.pair_count(),
            pairs_attempted: tally.attempted,
            pairs_failed: tally.failed,
            results_returned: tally.returned,
            results_inserted: tally.inserted,
            started_at,
            finished_at: Utc::now(),
            elapsed: clock.elapsed(),
            newly_discovered: tally.newly_discovered,
        };

        info!(
            %sweep_id,
            phase = ?summary.phase,
            returned = summary.results_returned,
            inserted = summary.results_inserted,
            failed_pairs = summary.pairs_failed,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "sweep finished"
        );
        telemetry.emit(
            "SWEEP",
            &format!(
                "sweep {sweep_id} {:?}: {} returned, {} new, {}/{} pairs failed",
                summary.phase, summary.results_returned, summary.results_inserted, summary.pairs_failed,
                summary.pairs_attempted
            ),
            Severity::Info,
        );

        self.notify(&summary).await;
        Ok(summary)
    }

    async fn run_sequential(
        &self,
        sweep_id: Uuid,
        scope: &SweepScope,
        cancel: &CancellationToken,
    ) -> Result<Tally, SweepError> {
        let mut tally = Tally::default();
        'targets: for keyword in scope.targets() {
            for source in scope.sources() {
                if cancel.is_cancelled() {
                    tally.cancelled = true;
                    break 'targets;
                }
                self.runner.run_pair(sweep_id, keyword, source, &mut tally).await?;
            }
        }
        Ok(tally)
    }

    /// One lane per source, each sequential over the targets, so a provider
    /// never sees two requests from this sweep at once.
    async fn run_lanes(
        &self,
        sweep_id: Uuid,
        scope: &SweepScope,
        cancel: &CancellationToken,
    ) -> Result<Tally, SweepError> {
        let limit = Arc::new(Semaphore::new(self.parallelism));
        let lanes_cancel = cancel.child_token();
        let targets = Arc::new(scope.targets().to_vec());
        let mut lanes = JoinSet::new();

        for (index, source) in scope.sources().iter().cloned().enumerate() {
            let runner = self.runner.clone();
            let targets = targets.clone();
            let limit = limit.clone();
            let cancel = lanes_cancel.clone();
            lanes.spawn(async move {
                let mut tally = Tally::default();
                let Ok(_permit) = limit.acquire_owned().await else {
                    return Ok((index, tally));
                };
                for keyword in targets.iter() {
                    if cancel.is_cancelled() {
                        tally.cancelled = true;
                        break;
                    }
                    runner.run_pair(sweep_id, keyword, &source, &mut tally).await?;
                }
                Ok::<_, SweepError>((index, tally))
            });
        }

        let mut finished = Vec::new();
        let mut failure = None;
        while let Some(joined) = lanes.join_next().await {
            match joined {
                Ok(Ok(lane)) => finished.push(lane),
                Ok(Err(err)) => {
                    lanes_cancel.cancel();
                    failure.get_or_insert(err);
                }
                Err(join_err) => {
                    lanes_cancel.cancel();
                    failure.get_or_insert(SweepError::Lane(join_err.to_string()));
                }
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }

        finished.sort_by_key(|(index, _)| *index);
        let mut total = Tally::default();
        for (_, lane) in finished {
            total.merge(lane);
        }
        Ok(total)
    }

    async fn notify(&self, summary: &SweepSummary) {
        if summary.newly_discovered.is_empty() {
            return;
        }
        let telemetry = &self.runner.telemetry;
        match self.notifier.notify(summary.sweep_id, &summary.newly_discovered).await {
            Ok(()) => telemetry.emit(
                "NOTIFY",
                &format!("notified {} new findings", summary.newly_discovered.len()),
                Severity::Info,
            ),
            Err(err) => {
                warn!(sweep_id = %summary.sweep_id, error = %err, "notifier failed");
                telemetry.emit("NOTIFY", &format!("notifier failed: {err}"), Severity::Warn);
            }
        }
    }

    /// Archived findings, newest first.
    pub async fn get_archive(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<Finding>, SweepError> {
        Ok(self.runner.store.query(since, limit).await?)
    }

    pub async fn purge_expired(&self, retention: TimeDelta) -> Result<u64, SweepError> {
        let removed = self.runner.store.purge(retention).await?;
        self.runner.telemetry.emit(
            "STORE",
            &format!("purged {removed} findings older than {} days", retention.num_days()),
            Severity::Info,
        );
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scout_adapters::AdapterError;
    use scout_core::MemoryTelemetry;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct FakeAdapter {
        id: String,
        responses: HashMap<String, Result<Vec<RawItem>, String>>,
        calls: AtomicUsize,
        seen_sites: Mutex<Vec<Option<String>>>,
        cancel_on_call: Option<CancellationToken>,
        delay: Duration,
    }

    impl FakeAdapter {
        fn new(id: &str) -> Self {
            Self {
                id: id.to_string(),
                responses: HashMap::new(),
                calls: AtomicUsize::new(0),
                seen_sites: Mutex::new(Vec::new()),
                cancel_on_call: None,
                delay: Duration::ZERO,
            }
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn returns(mut self, keyword: &str, items: Vec<RawItem>) -> Self {
            self.responses.insert(keyword.to_string(), Ok(items));
            self
        }

        fn fails(mut self, keyword: &str, error: &str) -> Self {
            self.responses.insert(keyword.to_string(), Err(error.to_string()));
            self
        }

        fn cancels(mut self, token: CancellationToken) -> Self {
            self.cancel_on_call = Some(token);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderAdapter for FakeAdapter {
        fn provider_id(&self) -> &str {
            &self.id
        }

        async fn fetch_items(
            &self,
            _ctx: &SearchContext<'_>,
            query: &SearchQuery,
        ) -> Result<Vec<RawItem>, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_sites
                .lock()
                .unwrap()
                .push(query.site.as_ref().map(|d| d.to_string()));
            if let Some(token) = &self.cancel_on_call {
                token.cancel();
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.responses.get(query.keyword.as_str()) {
                Some(Ok(items)) => Ok(items.clone()),
                Some(Err(message)) => Err(AdapterError::Message(message.clone())),
                None => Ok(Vec::new()),
            }
        }
    }

    async fn temp_store() -> (TempDir, ScoutStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("scout.db").display());
        let store = ScoutStore::connect(&url).await.unwrap();
        (dir, store)
    }

    fn kw(s: &str) -> Keyword {
        Keyword::parse(s).unwrap()
    }

    fn src(s: &str) -> SourceDescriptor {
        SourceDescriptor::parse(s).unwrap()
    }

    fn item(title: &str, price: serde_json::Value, link: &str) -> RawItem {
        json!({"title": title, "price": price, "link": link})
    }

    #[derive(Default)]
    struct RecordingNotifier {
        batches: Mutex<Vec<Vec<Finding>>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, _sweep_id: Uuid, findings: &[Finding]) -> Result<(), NotifyError> {
            self.batches.lock().unwrap().push(findings.to_vec());
            Ok(())
        }
    }

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn notify(&self, _sweep_id: Uuid, _findings: &[Finding]) -> Result<(), NotifyError> {
            Err(NotifyError::Delivery("smtp unreachable".into()))
        }
    }

    #[test]
    fn config_defaults_and_clamps() {
        let defaults = SweepConfig::from_lookup(|_| None);
        assert_eq!(defaults.database_url, "sqlite://scout.db");
        assert_eq!(defaults.top_n, 20);
        assert_eq!(defaults.max_attempts, 2);
        assert_eq!(defaults.source_parallelism, 1);
        assert_eq!(defaults.retention(), TimeDelta::days(90));
        assert_eq!(defaults.jitter(), JitterWindow::default());
        assert!(defaults.serpapi_key.is_none());

        let env: HashMap<&str, &str> = HashMap::from([
            ("SCOUT_TOP_N", "500"),
            ("SCOUT_MAX_ATTEMPTS", "9"),
            ("SCOUT_SOURCE_PARALLELISM", "0"),
            ("SERPAPI_KEY", "  "),
            ("SCOUT_HTTP_TIMEOUT_SECS", "nope"),
        ]);
        let cfg = SweepConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.top_n, 20);
        assert_eq!(cfg.max_attempts, 2);
        assert_eq!(cfg.source_parallelism, 1);
        assert!(cfg.serpapi_key.is_none());
        assert_eq!(cfg.http_timeout_secs, 20);
        assert_eq!(cfg.marketplace_settings().top_n, 20);
    }

    #[test]
    fn retention_window_stays_positive_and_bounded() {
        let with = |days: &str| {
            let days = days.to_string();
            SweepConfig::from_lookup(move |k| (k == "SCOUT_RETENTION_DAYS").then(|| days.clone()))
        };

        let wrapped = with("18446744073709551615");
        assert_eq!(wrapped.retention_days, DEFAULT_RETENTION_DAYS);
        assert_eq!(wrapped.retention(), TimeDelta::days(90));

        let huge = with("200000000000000");
        assert_eq!(huge.retention_days, MAX_RETENTION_DAYS);
        assert_eq!(huge.retention(), TimeDelta::days(MAX_RETENTION_DAYS));

        assert_eq!(with("-5").retention(), TimeDelta::days(1));
        assert_eq!(with("0").retention(), TimeDelta::days(1));
        assert_eq!(with("30").retention(), TimeDelta::days(30));

        let mut manual = SweepConfig::from_lookup(|_| None);
        manual.retention_days = i64::MAX;
        assert_eq!(manual.retention(), TimeDelta::days(MAX_RETENTION_DAYS));
    }

    #[test]
    fn http_timeout_is_clamped_to_bounded_window() {
        let with = |secs: &'static str| {
            SweepConfig::from_lookup(move |k| (k == "SCOUT_HTTP_TIMEOUT_SECS").then(|| secs.to_string()))
        };
        assert_eq!(with("0").http_timeout_secs, 15);
        assert_eq!(with("86400").http_timeout_secs, 20);
        assert_eq!(with("17").http_timeout_secs, 17);
        assert_eq!(with("0").http_config().timeout, Duration::from_secs(15));
    }

    #[test]
    fn phase_machine_rejects_illegal_transitions() {
        assert_eq!(SweepPhase::Idle.transition(SweepPhase::Running).unwrap(), SweepPhase::Running);
        assert!(SweepPhase::Idle.transition(SweepPhase::Complete).is_err());
        assert!(SweepPhase::Complete.transition(SweepPhase::Running).is_err());
        assert!(SweepPhase::Aborted.is_terminal());
        assert!(!SweepPhase::Running.is_terminal());
    }

    #[test]
    fn scope_dedups_preserving_order() {
        let scope = SweepScope::new(
            [kw("b"), kw("a"), kw("b")],
            [src("ebay"), src("custom:example.com"), src("site:example.com")],
        );
        assert_eq!(scope.targets(), &[kw("b"), kw("a")]);
        assert_eq!(scope.sources().len(), 2);
        assert_eq!(scope.pair_count(), 4);
    }

    #[tokio::test]
    async fn scope_snapshot_ignores_later_registry_edits() {
        let (_dir, store) = temp_store().await;
        store.add_target(&Target::parse("sewing kit").unwrap()).await.unwrap();
        store.add_source(&src("ebay")).await.unwrap();

        let scope = SweepScope::snapshot(&store).await.unwrap();
        store.add_target(&Target::parse("thimble").unwrap()).await.unwrap();

        assert_eq!(scope.targets(), &[kw("sewing kit")]);
        assert_eq!(scope.sources(), &[src("ebay")]);
    }

    #[tokio::test]
    async fn yaml_registry_is_reread_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.yaml");
        std::fs::write(
            &path,
            "targets:\n  - name: sewing kit\n    schedule_hint: daily\nsources:\n  - google_shopping\n  - custom:example.com\n",
        )
        .unwrap();
        let registry = YamlRegistry::new(&path);

        let targets = registry.list_targets().await.unwrap();
        assert_eq!(targets[0].name, kw("sewing kit"));
        assert_eq!(targets[0].schedule_hint.as_deref(), Some("daily"));
        assert_eq!(
            registry.list_sources().await.unwrap(),
            vec![src("google_shopping"), src("custom:example.com")]
        );

        std::fs::write(&path, "targets: []\n").unwrap();
        assert!(registry.list_targets().await.unwrap().is_empty());
        assert!(registry.list_sources().await.unwrap().is_empty());

        let missing = YamlRegistry::new(dir.path().join("absent.yaml"));
        assert!(matches!(missing.list_targets().await, Err(RegistryError::Backend(_))));
    }

    #[tokio::test]
    async fn empty_scope_aborts_without_adapter_calls() {
        let (_dir, store) = temp_store().await;
        let provider = Arc::new(FakeAdapter::new("provider_a").returns("kit", vec![item("a", json!("1"), "https://a.example/1")]));
        let telemetry = Arc::new(MemoryTelemetry::new());
        let sweeper = Sweeper::new(store.clone(), AdapterSet::new().with_provider(provider.clone()))
            .with_telemetry(telemetry.clone());

        let no_targets = sweeper
            .execute_sweep(&SweepScope::new(Vec::<Keyword>::new(), [src("provider_a")]))
            .await
            .unwrap();
        assert_eq!(no_targets.phase, SweepPhase::Aborted);
        assert_eq!(no_targets.abort_reason, Some(AbortReason::NoTargets));

        let no_sources = sweeper
            .execute_sweep(&SweepScope::new([kw("kit")], Vec::<SourceDescriptor>::new()))
            .await
            .unwrap();
        assert_eq!(no_sources.phase, SweepPhase::Aborted);
        assert_eq!(no_sources.abort_reason, Some(AbortReason::NoSources));
        assert_eq!(no_sources.pairs_attempted, 0);

        assert_eq!(provider.calls(), 0);
        assert_eq!(store.count().await.unwrap(), 0);
        let warnings = telemetry.with_tag("SWEEP");
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().all(|e| e.severity == Severity::Warn));
    }

    #[tokio::test]
    async fn end_to_end_sweep_then_idempotent_rerun() {
        let (_dir, store) = temp_store().await;
        let provider_a = Arc::new(FakeAdapter::new("provider_a").returns(
            "sewing kit",
            vec![
                item("Vintage sewing kit", json!({"raw": "$19.99"}), "https://shop-a.example/item/1"),
                item("Travel sewing kit", json!("19.99"), "https://shop-a.example/item/2"),
            ],
        ));
        let site_search = Arc::new(FakeAdapter::new("google").returns(
            "sewing kit",
            vec![item(
                "Antique kit",
                json!(null),
                "https://www.google.com/url?q=https://example.com/listing/42&sa=U",
            )],
        ));
        let adapters = AdapterSet::new()
            .with_provider(provider_a.clone())
            .with_site_search(site_search.clone());
        let sweeper = Sweeper::new(store.clone(), adapters);
        let scope = SweepScope::new([kw("sewing kit")], [src("provider_a"), src("custom:example.com")]);

        let first = sweeper.execute_sweep(&scope).await.unwrap();
        assert_eq!(first.phase, SweepPhase::Complete);
        assert_eq!(first.results_returned, 3);
        assert_eq!(first.results_inserted, 3);
        assert_eq!(first.pairs_total, 2);
        assert_eq!(first.newly_discovered.len(), 3);
        assert_eq!(first.newly_discovered[0].price, "$19.99");
        assert_eq!(first.newly_discovered[1].price, "19.99");

        let site_finding = &first.newly_discovered[2];
        assert_eq!(site_finding.url, "https://example.com/listing/42");
        assert_eq!(site_finding.source_label, "custom:example.com");
        assert_eq!(site_finding.price, "N/A");
        assert_eq!(
            site_search.seen_sites.lock().unwrap().as_slice(),
            &[Some("example.com".to_string())]
        );

        let second = sweeper.execute_sweep(&scope).await.unwrap();
        assert_eq!(second.results_returned, 3);
        assert_eq!(second.results_inserted, 0);
        assert!(second.newly_discovered.is_empty());
        assert_eq!(store.count().await.unwrap(), 3);

        let archive = sweeper.get_archive(None, Some(10)).await.unwrap();
        assert_eq!(archive.len(), 3);
    }

    #[tokio::test]
    async fn failing_pair_does_not_stop_the_sweep() {
        let (_dir, store) = temp_store().await;
        let telemetry = Arc::new(MemoryTelemetry::new());
        let source_a = Arc::new(
            FakeAdapter::new("source_a")
                .fails("t1", "operation timed out")
                .returns("t2", vec![item("a2", json!("2"), "https://a.example/t2")]),
        );
        let source_b = Arc::new(
            FakeAdapter::new("source_b")
                .returns("t1", vec![item("b1", json!("1"), "https://b.example/t1")])
                .returns("t2", vec![item("b2", json!("2"), "https://b.example/t2")]),
        );
        let sweeper = Sweeper::new(
            store.clone(),
            AdapterSet::new().with_provider(source_a.clone()).with_provider(source_b.clone()),
        )
        .with_telemetry(telemetry.clone());

        let summary = sweeper
            .execute_sweep(&SweepScope::new([kw("t1"), kw("t2")], [src("source_a"), src("source_b")]))
            .await
            .unwrap();

        assert_eq!(summary.phase, SweepPhase::Complete);
        assert_eq!(summary.pairs_attempted, 4);
        assert_eq!(summary.pairs_failed, 1);
        assert_eq!(summary.results_returned, 3);
        assert_eq!(summary.results_inserted, 3);
        let urls: Vec<_> = summary.newly_discovered.iter().map(|f| f.url.as_str()).collect();
        assert_eq!(urls, ["https://b.example/t1", "https://a.example/t2", "https://b.example/t2"]);

        let failures = telemetry.with_tag("COLLECTOR");
        let failure = failures.iter().find(|e| e.severity == Severity::Warn).unwrap();
        assert!(failure.message.contains("provider=source_a"));
        assert!(failure.message.contains("t1"));
        assert!(failure.message.contains("operation timed out"));
    }

    #[tokio::test]
    async fn identical_title_and_price_with_distinct_urls_are_both_kept() {
        let (_dir, store) = temp_store().await;
        let provider = Arc::new(FakeAdapter::new("ebay").returns(
            "kit",
            vec![
                item("Sewing kit", json!("$5"), "https://www.ebay.com/itm/1"),
                item("Sewing kit", json!("$5"), "https://www.ebay.com/itm/2"),
                item("Sewing kit", json!("$5"), "https://www.ebay.com/itm/1"),
            ],
        ));
        let sweeper = Sweeper::new(store.clone(), AdapterSet::new().with_provider(provider));

        let summary = sweeper
            .execute_sweep(&SweepScope::new([kw("kit")], [src("ebay")]))
            .await
            .unwrap();
        assert_eq!(summary.results_returned, 3);
        assert_eq!(summary.results_inserted, 2);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn linkless_items_count_as_returned_but_are_not_archived() {
        let (_dir, store) = temp_store().await;
        let telemetry = Arc::new(MemoryTelemetry::new());
        let provider = Arc::new(FakeAdapter::new("ebay").returns(
            "kit",
            vec![json!({"title": "Mystery"}), json!({"title": "Mystery 2"})],
        ));
        let sweeper = Sweeper::new(store.clone(), AdapterSet::new().with_provider(provider))
            .with_telemetry(telemetry.clone());

        let summary = sweeper
            .execute_sweep(&SweepScope::new([kw("kit")], [src("ebay")]))
            .await
            .unwrap();
        assert_eq!(summary.results_returned, 2);
        assert_eq!(summary.results_inserted, 0);
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(telemetry
            .with_tag("SWEEP")
            .iter()
            .any(|e| e.message.contains("without a link")));
    }

    #[tokio::test]
    async fn unknown_source_counts_as_failed_pair() {
        let (_dir, store) = temp_store().await;
        let provider = Arc::new(FakeAdapter::new("ebay").returns("kit", vec![item("a", json!("1"), "https://e.example/1")]));
        let sweeper = Sweeper::new(store, AdapterSet::new().with_provider(provider));

        let summary = sweeper
            .execute_sweep(&SweepScope::new(
                [kw("kit")],
                [src("craigslist"), src("ebay"), src("custom:example.com")],
            ))
            .await
            .unwrap();
        assert_eq!(summary.phase, SweepPhase::Complete);
        assert_eq!(summary.pairs_attempted, 3);
        assert_eq!(summary.pairs_failed, 2);
        assert_eq!(summary.results_inserted, 1);
    }

    #[tokio::test]
    async fn cancellation_stops_further_calls_and_keeps_partial_results() {
        let (_dir, store) = temp_store().await;
        let cancel = CancellationToken::new();
        let provider = Arc::new(
            FakeAdapter::new("ebay")
                .returns("t1", vec![item("a", json!("1"), "https://e.example/1")])
                .returns("t2", vec![item("b", json!("2"), "https://e.example/2")])
                .cancels(cancel.clone()),
        );
        let sweeper = Sweeper::new(store.clone(), AdapterSet::new().with_provider(provider.clone()));

        let summary = sweeper
            .execute_sweep_with_cancel(&SweepScope::new([kw("t1"), kw("t2")], [src("ebay")]), cancel)
            .await
            .unwrap();
        assert_eq!(summary.phase, SweepPhase::Cancelled);
        assert_eq!(provider.calls(), 1);
        assert_eq!(summary.pairs_attempted, 1);
        assert_eq!(summary.results_inserted, 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn parallel_lanes_match_sequential_totals() {
        let (_dir, store) = temp_store().await;
        let build = |id: &str, host: &str| {
            Arc::new(
                FakeAdapter::new(id)
                    .returns("t1", vec![item("x", json!("1"), &format!("https://{host}/1"))])
                    .returns("t2", vec![item("y", json!("2"), &format!("https://{host}/2"))]),
            )
        };
        let a = build("source_a", "a.example");
        let b = build("source_b", "b.example");
        let c = build("source_c", "c.example");
        let sweeper = Sweeper::new(
            store.clone(),
            AdapterSet::new()
                .with_provider(a.clone())
                .with_provider(b.clone())
                .with_provider(c.clone()),
        )
        .with_parallelism(2);

        let summary = sweeper
            .execute_sweep(&SweepScope::new(
                [kw("t1"), kw("t2")],
                [src("source_a"), src("source_b"), src("source_c")],
            ))
            .await
            .unwrap();
        assert_eq!(summary.phase, SweepPhase::Complete);
        assert_eq!(summary.pairs_attempted, 6);
        assert_eq!(summary.results_inserted, 6);
        assert_eq!(a.calls() + b.calls() + c.calls(), 6);
        assert_eq!(summary.newly_discovered[0].url, "https://a.example/1");
        assert_eq!(summary.newly_discovered[5].url, "https://c.example/2");
        assert_eq!(store.count().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn store_failure_aborts_with_persistence_error() {
        let (_dir, store) = temp_store().await;
        let provider = Arc::new(FakeAdapter::new("ebay").returns("kit", vec![item("a", json!("1"), "https://e.example/1")]));
        let sweeper = Sweeper::new(store.clone(), AdapterSet::new().with_provider(provider));
        store.close().await;

        let err = sweeper
            .execute_sweep(&SweepScope::new([kw("kit")], [src("ebay")]))
            .await
            .unwrap_err();
        assert!(matches!(err, SweepError::Persistence(_)));
    }

    #[tokio::test]
    async fn notifier_receives_new_findings_once_and_failures_are_swallowed() {
        let (_dir, store) = temp_store().await;
        let provider = Arc::new(FakeAdapter::new("ebay").returns("kit", vec![item("a", json!("1"), "https://e.example/1")]));
        let notifier = Arc::new(RecordingNotifier::default());
        let sweeper = Sweeper::new(store.clone(), AdapterSet::new().with_provider(provider.clone()))
            .with_notifier(notifier.clone());
        let scope = SweepScope::new([kw("kit")], [src("ebay")]);

        sweeper.execute_sweep(&scope).await.unwrap();
        sweeper.execute_sweep(&scope).await.unwrap();
        let batches = notifier.batches.lock().unwrap().clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].url, "https://e.example/1");

        let (_dir2, fresh) = temp_store().await;
        let telemetry = Arc::new(MemoryTelemetry::new());
        let failing = Sweeper::new(fresh, AdapterSet::new().with_provider(provider))
            .with_notifier(Arc::new(FailingNotifier))
            .with_telemetry(telemetry.clone());
        let summary = failing.execute_sweep(&scope).await.unwrap();
        assert_eq!(summary.phase, SweepPhase::Complete);
        assert!(telemetry.with_tag("NOTIFY")[0].message.contains("smtp unreachable"));
    }

    #[tokio::test]
    async fn purge_expired_drops_old_findings_only() {
        let (_dir, store) = temp_store().await;
        let mut old = Finding {
            target: "kit".into(),
            source_label: "ebay".into(),
            title: "old".into(),
            price: "N/A".into(),
            url: "https://e.example/old".into(),
            discovered_at: Utc::now() - TimeDelta::days(91),
        };
        store.insert_if_new(&old).await.unwrap();
        old.url = "https://e.example/new".into();
        old.discovered_at = Utc::now() - TimeDelta::days(1);
        store.insert_if_new(&old).await.unwrap();

        let sweeper = Sweeper::new(store.clone(), AdapterSet::new());
        assert_eq!(sweeper.purge_expired(TimeDelta::days(90)).await.unwrap(), 1);
        let left = sweeper.get_archive(None, None).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].url, "https://e.example/new");
    }

    #[tokio::test]
    async fn purge_expired_refuses_negative_window() {
        let (_dir, store) = temp_store().await;
        let fresh = Finding {
            target: "kit".into(),
            source_label: "ebay".into(),
            title: "fresh".into(),
            price: "N/A".into(),
            url: "https://e.example/fresh".into(),
            discovered_at: Utc::now(),
        };
        store.insert_if_new(&fresh).await.unwrap();

        let sweeper = Sweeper::new(store.clone(), AdapterSet::new());
        let err = sweeper.purge_expired(TimeDelta::days(-1)).await.unwrap_err();
        assert!(matches!(err, SweepError::Persistence(StoreError::InvalidRetention(_))));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn direct_and_redirected_links_to_one_listing_archive_once() {
        let (_dir, store) = temp_store().await;
        let direct = Arc::new(FakeAdapter::new("ebay").returns(
            "kit",
            vec![item("Kit", json!("$5"), "https://Example.com/listing/42")],
        ));
        let site_search = Arc::new(FakeAdapter::new("google").returns(
            "kit",
            vec![item("Kit", json!("$5"), "https://www.google.com/url?q=https://example.com/listing/42")],
        ));
        let sweeper = Sweeper::new(
            store.clone(),
            AdapterSet::new().with_provider(direct).with_site_search(site_search),
        );

        let summary = sweeper
            .execute_sweep(&SweepScope::new([kw("kit")], [src("ebay"), src("custom:example.com")]))
            .await
            .unwrap();
        assert_eq!(summary.results_returned, 2);
        assert_eq!(summary.results_inserted, 1);
        assert_eq!(summary.newly_discovered[0].url, "https://example.com/listing/42");
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn lane_store_failure_cancels_other_lanes() {
        let (_dir, store) = temp_store().await;
        let failing = Arc::new(FakeAdapter::new("source_a").returns("t1", vec![item("a", json!("1"), "https://a.example/1")]));
        let slow = Arc::new(FakeAdapter::new("source_b").slow(Duration::from_millis(50)));
        let sweeper = Sweeper::new(
            store.clone(),
            AdapterSet::new().with_provider(failing).with_provider(slow.clone()),
        )
        .with_parallelism(2);
        store.close().await;

        let targets = (1..=8).map(|i| kw(&format!("t{i}"))).collect::<Vec<_>>();
        let err = sweeper
            .execute_sweep(&SweepScope::new(targets, [src("source_a"), src("source_b")]))
            .await
            .unwrap_err();
        assert!(matches!(err, SweepError::Persistence(_)));
        assert!(slow.calls() < 8, "slow lane kept running: {} calls", slow.calls());
    }

    #[tokio::test]
    async fn lane_cancellation_keeps_archived_findings() {
        let (_dir, store) = temp_store().await;
        let cancel = CancellationToken::new();
        let a = Arc::new(
            FakeAdapter::new("source_a")
                .returns("t1", vec![item("a1", json!("1"), "https://a.example/1")])
                .returns("t2", vec![item("a2", json!("2"), "https://a.example/2")])
                .cancels(cancel.clone()),
        );
        let b = Arc::new(
            FakeAdapter::new("source_b")
                .returns("t1", vec![item("b1", json!("1"), "https://b.example/1")])
                .returns("t2", vec![item("b2", json!("2"), "https://b.example/2")])
                .slow(Duration::from_millis(30)),
        );
        let sweeper = Sweeper::new(
            store.clone(),
            AdapterSet::new().with_provider(a.clone()).with_provider(b.clone()),
        )
        .with_parallelism(2);

        let summary = sweeper
            .execute_sweep_with_cancel(
                &SweepScope::new([kw("t1"), kw("t2")], [src("source_a"), src("source_b")]),
                cancel,
            )
            .await
            .unwrap();
        assert_eq!(summary.phase, SweepPhase::Cancelled);
        assert_eq!(a.calls(), 1);
        assert!(summary.pairs_attempted < 4);
        assert!(summary.results_inserted >= 1);
        assert_eq!(store.count().await.unwrap(), summary.results_inserted as u64);
        assert!(summary
            .newly_discovered
            .iter()
            .any(|f| f.url == "https://a.example/1"));
    }

    #[tokio::test]
    async fn registry_is_only_read_for_lists_not_given() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.yaml");
        let registry = YamlRegistry::new(&path);

        let scope = SweepScope::with_registry_fallback(vec![kw("kit")], vec![src("ebay")], &registry)
            .await
            .unwrap();
        assert_eq!(scope.pair_count(), 1);

        let err = SweepScope::with_registry_fallback(vec![kw("kit")], Vec::new(), &registry)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Backend(_)));

        std::fs::write(&path, "targets:\n  - name: thimble\nsources: [amazon]\n").unwrap();
        let scope = SweepScope::with_registry_fallback(Vec::new(), vec![src("ebay")], &registry)
            .await
            .unwrap();
        assert_eq!(scope.targets(), &[kw("thimble")]);
        assert_eq!(scope.sources(), &[src("ebay")]);
    }
}
