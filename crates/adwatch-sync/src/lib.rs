//! Watcher execution: tick runner, cron-driven scheduler, status forwarding and configuration.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use adwatch_adapters::{merge_settings, search_with_retry, AdapterError, AdapterRegistry, MarketplaceConfig, SearchRequest};
use adwatch_core::{
    Ad, AdKey, ChannelConfig, EventBus, EventKind, SearchQuery, SubscriptionId, Watcher, WatcherEvent,
};
use adwatch_notify::{AdNotifier, DispatchReport, EmailRelayConfig, NotificationConfig, NotificationDispatcher, NotifyContext};
use adwatch_storage::{AdCache, CacheConfig, HttpClientConfig, HttpFetcher};
use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "adwatch-sync";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub config_path: PathBuf,
    pub scheduler_enabled: bool,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub cache_max_entries: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("./adwatch.yaml"),
            scheduler_enabled: true,
            user_agent: "adwatch-bot/0.1".to_string(),
            http_timeout_secs: 20,
            cache_max_entries: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            config_path: std::env::var("ADWATCH_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.config_path),
            scheduler_enabled: std::env::var("ADWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            user_agent: std::env::var("ADWATCH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("ADWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            cache_max_entries: std::env::var("ADWATCH_CACHE_MAX_ENTRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("watcher id `{0}` is defined more than once")]
    DuplicateWatcher(String),
}

/// Contents of the YAML workspace file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceFile {
    pub default_marketplace: Option<String>,
    pub marketplaces: BTreeMap<String, MarketplaceConfig>,
    pub notifications: NotificationConfig,
    pub email: EmailRelayConfig,
    pub watchers: Vec<Watcher>,
}

impl WorkspaceFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text, &path.display().to_string())
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Self::parse(text, "<inline>")
    }

    fn parse(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let mut workspace: WorkspaceFile = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;

        let mut seen = HashSet::new();
        for watcher in &workspace.watchers {
            if !seen.insert(watcher.id.as_str()) {
                return Err(ConfigError::DuplicateWatcher(watcher.id.clone()));
            }
        }

        if let Some(default) = workspace.default_marketplace.clone() {
            for watcher in &mut workspace.watchers {
                watcher.default_marketplace.get_or_insert_with(|| default.clone());
            }
        }
        Ok(workspace)
    }

    pub fn watcher(&self, id: &str) -> Option<&Watcher> {
        self.watchers.iter().find(|w| w.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub watcher_id: String,
    pub message: String,
}

/// Static checks run before anything is scheduled.
pub fn validate_workspace(workspace: &WorkspaceFile, registry: &AdapterRegistry) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    for watcher in &workspace.watchers {
        let mut report = |message: String| {
            issues.push(ValidationIssue {
                watcher_id: watcher.id.clone(),
                message,
            })
        };

        if let Err(err) = build_schedule_check_job(&watcher.id, &watcher.schedule) {
            report(err.to_string());
        }

        if watcher.enabled_queries().next().is_none() {
            report("no enabled queries".to_string());
        }
        if let (Some(min), Some(max)) = (watcher.min_price, watcher.max_price) {
            if min > max {
                report(format!("min_price {min} is greater than max_price {max}"));
            }
        }

        for query in watcher.enabled_queries() {
            let marketplace = watcher.effective_marketplace(query);
            match registry.get(marketplace) {
                None => report(format!("query \"{}\": unknown marketplace `{marketplace}`", query.text)),
                Some(adapter) => {
                    let settings = merge_settings(adapter.as_ref(), &query.filters);
                    if let Err(err) = adapter.validate_settings(&settings) {
                        report(format!("query \"{}\": {err}", query.text));
                    }
                }
            }
        }

        for channel in &watcher.notifications {
            match channel {
                ChannelConfig::Discord { webhook_url } if !webhook_url.starts_with("https://") => {
                    report(format!("{}: webhook_url must be an https URL", channel.label()))
                }
                ChannelConfig::Email { address } if !address.contains('@') => {
                    report(format!("{}: not an email address", channel.label()))
                }
                _ => {}
            }
        }
    }
    issues
}

/// Accepts 5-field (minute) and 6/7-field (second, optional year) cron expressions.
pub fn normalize_cron(schedule: &str) -> Result<String, String> {
    let fields: Vec<&str> = schedule.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!("0 {}", fields.join(" "))),
        6 | 7 => Ok(fields.join(" ")),
        n => Err(format!("expected 5 or 6 cron fields, got {n}")),
    }
}

fn build_schedule_check_job(watcher_id: &str, schedule: &str) -> Result<Job, SchedulerError> {
    let cron = parse_schedule(watcher_id, schedule)?;
    Job::new_async(cron.as_str(), |_uuid, _l| Box::pin(async {})).map_err(|e| SchedulerError::InvalidSchedule {
        watcher_id: watcher_id.to_string(),
        schedule: schedule.to_string(),
        reason: e.to_string(),
    })
}

fn parse_schedule(watcher_id: &str, schedule: &str) -> Result<String, SchedulerError> {
    normalize_cron(schedule).map_err(|reason| SchedulerError::InvalidSchedule {
        watcher_id: watcher_id.to_string(),
        schedule: schedule.to_string(),
        reason,
    })
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("no adapter registered for marketplace `{0}`")]
    UnknownMarketplace(String),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryFailure {
    pub query: String,
    pub marketplace: String,
    pub error: String,
}

#[derive(Debug, Error)]
pub enum TickError {
    #[error("all {count} enabled queries failed; last error: {last}")]
    AllQueriesFailed { count: usize, last: String },
    #[error("tick panicked: {0}")]
    Panicked(String),
}

impl TickError {
    /// Safe to forward to clients; details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            TickError::AllQueriesFailed { count, .. } => {
                format!("All {count} searches failed; the watcher will try again on its next run")
            }
            TickError::Panicked(_) => "Internal error while running the watcher".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub watcher_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub first_run: bool,
    pub queries_succeeded: usize,
    pub failed_queries: Vec<QueryFailure>,
    /// Unique ads across queries, before the price filter.
    pub fetched: usize,
    pub matched: usize,
    pub seeded: usize,
    pub new_ads: Vec<Ad>,
    pub dispatch: Option<DispatchReport>,
}

impl TickReport {
    fn new(watcher_id: &str, started_at: DateTime<Utc>, first_run: bool) -> Self {
        Self {
            watcher_id: watcher_id.to_string(),
            started_at,
            finished_at: started_at,
            first_run,
            queries_succeeded: 0,
            failed_queries: Vec::new(),
            fetched: 0,
            matched: 0,
            seeded: 0,
            new_ads: Vec::new(),
            dispatch: None,
        }
    }
}

/// First-run flag for one watcher, tagged with the restart that set it.
#[derive(Debug, Clone, Copy)]
struct FirstRunState {
    epoch: u64,
    pending: bool,
}

#[derive(Debug, Default)]
struct FirstRunFlags {
    next_epoch: u64,
    watchers: HashMap<String, FirstRunState>,
}

/// Runs one fetch, dedup, notify, emit cycle for a watcher.
///
/// Shared by the cron jobs and by manual triggers so both observe the same
/// first-run and notification behaviour.
pub struct TickRunner {
    registry: AdapterRegistry,
    http: Arc<HttpFetcher>,
    cache: Arc<AdCache>,
    notifier: Arc<dyn AdNotifier>,
    bus: Arc<EventBus>,
    marketplaces: BTreeMap<String, MarketplaceConfig>,
    first_run: Mutex<FirstRunFlags>,
}

impl TickRunner {
    pub fn new(
        registry: AdapterRegistry,
        http: Arc<HttpFetcher>,
        cache: Arc<AdCache>,
        notifier: Arc<dyn AdNotifier>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            http,
            cache,
            notifier,
            bus,
            marketplaces: BTreeMap::new(),
            first_run: Mutex::new(FirstRunFlags::default()),
        }
    }

    pub fn with_marketplace_configs(mut self, configs: BTreeMap<String, MarketplaceConfig>) -> Self {
        self.marketplaces = configs;
        self
    }

    pub fn cache(&self) -> &Arc<AdCache> {
        &self.cache
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn marketplace_config(&self, marketplace: &str) -> MarketplaceConfig {
        self.marketplaces.get(marketplace).cloned().unwrap_or_default()
    }

    /// Marks the watcher as first run again and starts a new epoch, so a
    /// tick begun before the reset cannot clear the flag when it finishes.
    pub fn reset_first_run(&self, watcher_id: &str) {
        let mut flags = self.first_run_flags();
        flags.next_epoch += 1;
        let epoch = flags.next_epoch;
        flags
            .watchers
            .insert(watcher_id.to_string(), FirstRunState { epoch, pending: true });
    }

    pub fn forget_watcher(&self, watcher_id: &str) {
        self.first_run_flags().watchers.remove(watcher_id);
    }

    /// Watchers never seen by this runner count as first run.
    pub fn is_first_run(&self, watcher_id: &str) -> bool {
        self.first_run_state(watcher_id).pending
    }

    fn first_run_state(&self, watcher_id: &str) -> FirstRunState {
        self.first_run_flags()
            .watchers
            .get(watcher_id)
            .copied()
            .unwrap_or(FirstRunState { epoch: 0, pending: true })
    }

    /// Clears the flag only if no reset happened since the tick read it.
    fn finish_first_run(&self, watcher_id: &str, epoch: u64) {
        let mut flags = self.first_run_flags();
        // Watchers without an entry were never reset and belong to epoch 0.
        let current = flags.watchers.get(watcher_id).map_or(0, |state| state.epoch);
        if current == epoch {
            flags
                .watchers
                .insert(watcher_id.to_string(), FirstRunState { epoch, pending: false });
        } else {
            debug!(watcher_id, "watcher restarted during seeding tick; first run still pending");
        }
    }

    fn first_run_flags(&self) -> std::sync::MutexGuard<'_, FirstRunFlags> {
        self.first_run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn run_tick(&self, watcher: &Watcher) -> Result<TickReport, TickError> {
        let started_at = Utc::now();
        self.bus.emit(&WatcherEvent::JobStarted {
            watcher_id: watcher.id.clone(),
            at: started_at,
        });

        let span = info_span!("tick", watcher_id = %watcher.id);
        let result = match AssertUnwindSafe(self.execute(watcher, started_at))
            .catch_unwind()
            .instrument(span)
            .await
        {
            Ok(result) => result,
            Err(payload) => Err(TickError::Panicked(panic_message(payload.as_ref()))),
        };

        match &result {
            Ok(report) => {
                info!(
                    watcher_id = %watcher.id,
                    first_run = report.first_run,
                    fetched = report.fetched,
                    matched = report.matched,
                    new_ads = report.new_ads.len(),
                    failed_queries = report.failed_queries.len(),
                    "tick completed"
                );
                self.bus.emit(&WatcherEvent::JobCompleted {
                    watcher_id: watcher.id.clone(),
                    new_ads: report.new_ads.clone(),
                    first_run: report.first_run,
                    at: report.finished_at,
                });
            }
            Err(err) => {
                error!(watcher_id = %watcher.id, error = %err, "tick failed");
                self.bus.emit(&WatcherEvent::JobError {
                    watcher_id: watcher.id.clone(),
                    message: err.user_message(),
                    at: Utc::now(),
                });
            }
        }
        result
    }

    async fn execute(&self, watcher: &Watcher, started_at: DateTime<Utc>) -> Result<TickReport, TickError> {
        let FirstRunState { epoch, pending: first_run } = self.first_run_state(&watcher.id);
        let mut report = TickReport::new(&watcher.id, started_at, first_run);
        let queries: Vec<&SearchQuery> = watcher.enabled_queries().collect();

        if queries.is_empty() {
            warn!(watcher_id = %watcher.id, "watcher has no enabled queries");
        } else {
            let outcomes = join_all(queries.iter().map(|query| self.fetch_query(watcher, query))).await;

            // Single writer after every fetch settled; the first query to return a key wins.
            let mut merged: Vec<Ad> = Vec::new();
            let mut seen: HashSet<AdKey> = HashSet::new();
            let mut last_error = String::new();
            for (query, outcome) in queries.iter().zip(outcomes) {
                match outcome {
                    Ok(ads) => {
                        report.queries_succeeded += 1;
                        merged.extend(ads.into_iter().filter(|ad| seen.insert(ad.key())));
                    }
                    Err(err) => {
                        let marketplace = watcher.effective_marketplace(query).to_string();
                        warn!(
                            watcher_id = %watcher.id,
                            marketplace = %marketplace,
                            query = %query.text,
                            error = %err,
                            "query failed; continuing with the other queries"
                        );
                        last_error = err.to_string();
                        report.failed_queries.push(QueryFailure {
                            query: query.text.clone(),
                            marketplace,
                            error: last_error.clone(),
                        });
                    }
                }
            }

            if report.queries_succeeded == 0 {
                return Err(TickError::AllQueriesFailed {
                    count: queries.len(),
                    last: last_error,
                });
            }

            report.fetched = merged.len();
            merged.retain(|ad| watcher.price_in_bounds(ad));
            report.matched = merged.len();

            if first_run {
                report.seeded = merged.len();
                self.cache.set_many(merged);
                info!(watcher_id = %watcher.id, seeded = report.seeded, "first run: cache seeded without notifications");
            } else {
                let new_ads: Vec<Ad> = merged
                    .into_iter()
                    .filter(|ad| !self.cache.contains(&ad.key()))
                    .collect();
                if !new_ads.is_empty() {
                    self.cache.set_many(new_ads.iter().cloned());
                    let ctx = NotifyContext {
                        watcher_id: watcher.id.clone(),
                        watcher_name: watcher.name.clone(),
                        query_summary: watcher.query_summary(),
                    };
                    let dispatch = self.notifier.notify(&new_ads, &watcher.notifications, &ctx).await;
                    if dispatch.messages_failed() > 0 {
                        warn!(watcher_id = %watcher.id, failed = dispatch.messages_failed(), "some notifications were not delivered");
                    }
                    report.dispatch = Some(dispatch);
                }
                report.new_ads = new_ads;
            }
        }

        if first_run {
            self.finish_first_run(&watcher.id, epoch);
        }
        report.finished_at = Utc::now();
        Ok(report)
    }

    async fn fetch_query(&self, watcher: &Watcher, query: &SearchQuery) -> Result<Vec<Ad>, QueryError> {
        let marketplace = watcher.effective_marketplace(query);
        let adapter = self
            .registry
            .get(marketplace)
            .ok_or_else(|| QueryError::UnknownMarketplace(marketplace.to_string()))?;
        let config = self.marketplace_config(marketplace);
        let request = SearchRequest {
            text: query.text.clone(),
            settings: merge_settings(adapter.as_ref(), &query.filters),
            min_price: watcher.min_price,
            max_price: watcher.max_price,
        };

        let page = search_with_retry(adapter.as_ref(), &self.http, &request, &config).await?;
        debug!(
            watcher_id = %watcher.id,
            marketplace,
            query = %query.text,
            ads = page.ads.len(),
            "query fetched"
        );
        let (ads, unkeyed): (Vec<Ad>, Vec<Ad>) =
            page.ads.into_iter().partition(|ad| !ad.external_id.is_empty());
        if !unkeyed.is_empty() {
            warn!(
                watcher_id = %watcher.id,
                marketplace,
                query = %query.text,
                dropped = unkeyed.len(),
                "dropping listings without an id"
            );
        }
        Ok(ads
            .into_iter()
            .map(|mut ad| {
                ad.matched_query.get_or_insert_with(|| query.text.clone());
                ad
            })
            .collect())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("watcher {watcher_id}: invalid schedule `{schedule}`: {reason}")]
    InvalidSchedule {
        watcher_id: String,
        schedule: String,
        reason: String,
    },
    #[error("job scheduler: {0}")]
    Scheduler(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub id: String,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
}

struct ScheduledJob {
    job_id: Uuid,
    watcher: Arc<Watcher>,
}

/// One cron job per active watcher, keyed by watcher id.
pub struct WatcherScheduler {
    sched: JobScheduler,
    runner: Arc<TickRunner>,
    jobs: tokio::sync::Mutex<HashMap<String, ScheduledJob>>,
    ledger: Option<Arc<dyn RunLedger>>,
}

impl WatcherScheduler {
    pub async fn new(runner: Arc<TickRunner>) -> Result<Self, SchedulerError> {
        let sched = JobScheduler::new()
            .await
            .map_err(|e| SchedulerError::Scheduler(e.to_string()))?;
        Ok(Self {
            sched,
            runner,
            jobs: tokio::sync::Mutex::new(HashMap::new()),
            ledger: None,
        })
    }

    /// `job_status` reads last-run times from this ledger when set.
    pub fn with_run_ledger(mut self, ledger: Arc<dyn RunLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn runner(&self) -> &Arc<TickRunner> {
        &self.runner
    }

    pub async fn start(&self) -> Result<(), SchedulerError> {
        self.sched
            .start()
            .await
            .map_err(|e| SchedulerError::Scheduler(e.to_string()))
    }

    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        let mut sched = self.sched.clone();
        sched
            .shutdown()
            .await
            .map_err(|e| SchedulerError::Scheduler(e.to_string()))
    }

    /// Replaces any existing job for the watcher and resets its first-run flag.
    /// A stopped watcher is only unscheduled.
    pub async fn start_watcher(&self, watcher: Watcher) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.lock().await;
        self.stop_locked(&mut jobs, &watcher.id).await?;
        if !watcher.is_active() {
            debug!(watcher_id = %watcher.id, "watcher is stopped; not scheduling");
            return Ok(());
        }
        self.start_locked(&mut jobs, watcher).await
    }

    /// Same transition as [`Self::start_watcher`]; named for schedule or status edits.
    pub async fn update_watcher(&self, watcher: Watcher) -> Result<(), SchedulerError> {
        info!(watcher_id = %watcher.id, schedule = %watcher.schedule, "rescheduling watcher");
        self.start_watcher(watcher).await
    }

    /// Returns whether a job was running. An in-flight tick is left to finish.
    pub async fn stop_watcher(&self, watcher_id: &str) -> Result<bool, SchedulerError> {
        let mut jobs = self.jobs.lock().await;
        self.stop_locked(&mut jobs, watcher_id).await
    }

    /// Stops the watcher and discards its first-run state. Cached ads are shared and stay.
    pub async fn remove_watcher(&self, watcher_id: &str) -> Result<bool, SchedulerError> {
        let was_running = self.stop_watcher(watcher_id).await?;
        self.runner.forget_watcher(watcher_id);
        Ok(was_running)
    }

    /// Starts every active watcher; failures are logged per watcher.
    pub async fn start_all(&self, watchers: &[Watcher]) -> usize {
        let mut started = 0;
        for watcher in watchers.iter().filter(|w| w.is_active()) {
            match self.start_watcher(watcher.clone()).await {
                Ok(()) => started += 1,
                Err(err) => error!(watcher_id = %watcher.id, error = %err, "failed to schedule watcher"),
            }
        }
        started
    }

    async fn start_locked(
        &self,
        jobs: &mut HashMap<String, ScheduledJob>,
        watcher: Watcher,
    ) -> Result<(), SchedulerError> {
        let cron = parse_schedule(&watcher.id, &watcher.schedule)?;
        let snapshot = Arc::new(watcher);
        let runner = self.runner.clone();
        let job_watcher = snapshot.clone();

        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let runner = runner.clone();
            let watcher = job_watcher.clone();
            Box::pin(async move {
                // Failures already reached the bus as JOB_ERROR.
                let _ = runner.run_tick(&watcher).await;
            })
        })
        .map_err(|e| SchedulerError::InvalidSchedule {
            watcher_id: snapshot.id.clone(),
            schedule: snapshot.schedule.clone(),
            reason: e.to_string(),
        })?;

        let job_id = self
            .sched
            .add(job)
            .await
            .map_err(|e| SchedulerError::Scheduler(e.to_string()))?;

        self.runner.reset_first_run(&snapshot.id);
        info!(watcher_id = %snapshot.id, schedule = %cron, %job_id, "watcher scheduled");
        jobs.insert(
            snapshot.id.clone(),
            ScheduledJob {
                job_id,
                watcher: snapshot,
            },
        );
        Ok(())
    }

    async fn stop_locked(
        &self,
        jobs: &mut HashMap<String, ScheduledJob>,
        watcher_id: &str,
    ) -> Result<bool, SchedulerError> {
        let Some(job) = jobs.remove(watcher_id) else {
            return Ok(false);
        };
        self.sched
            .remove(&job.job_id)
            .await
            .map_err(|e| SchedulerError::Scheduler(e.to_string()))?;
        self.runner.reset_first_run(watcher_id);
        info!(watcher_id, job_id = %job.job_id, "watcher unscheduled");
        Ok(true)
    }

    /// Runs the regular tick outside the timer and returns the new ads.
    pub async fn trigger_watcher(&self, watcher: &Watcher) -> Result<Vec<Ad>, TickError> {
        info!(watcher_id = %watcher.id, "manual trigger");
        self.runner.run_tick(watcher).await.map(|report| report.new_ads)
    }

    pub async fn run_watcher_once(&self, watcher: &Watcher) -> Result<TickReport, TickError> {
        self.runner.run_tick(watcher).await
    }

    pub async fn active_watchers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn next_run_time(&self, watcher_id: &str) -> Option<DateTime<Utc>> {
        let job_id = self.jobs.lock().await.get(watcher_id).map(|job| job.job_id)?;
        self.next_tick(job_id).await
    }

    pub async fn job_status(&self) -> Vec<JobStatus> {
        let snapshot: Vec<(String, Uuid, Option<DateTime<Utc>>)> = {
            let jobs = self.jobs.lock().await;
            jobs.iter()
                .map(|(id, job)| (id.clone(), job.job_id, job.watcher.last_run))
                .collect()
        };

        let mut statuses = Vec::with_capacity(snapshot.len());
        for (id, job_id, configured_last_run) in snapshot {
            let last_run = self
                .ledger
                .as_ref()
                .and_then(|ledger| ledger.last_run(&id))
                .or(configured_last_run);
            statuses.push(JobStatus {
                next_run: self.next_tick(job_id).await,
                last_run,
                id,
            });
        }
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    async fn next_tick(&self, job_id: Uuid) -> Option<DateTime<Utc>> {
        let mut sched = self.sched.clone();
        match sched.next_tick_for_job(job_id).await {
            Ok(next) => next,
            Err(err) => {
                warn!(%job_id, error = %err, "could not read next tick");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Idle,
    Error,
}

/// Live status pushed to connected clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub watcher_id: String,
    pub status: RunStatus,
    pub message: String,
    pub last_run: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_ads_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusUpdate {
    pub const KIND: &'static str = "status_update";

    pub fn from_event(event: &WatcherEvent) -> Self {
        let (status, message, new_ads_count, error) = match event {
            WatcherEvent::JobStarted { .. } => (RunStatus::Running, "Checking for new ads".to_string(), None, None),
            WatcherEvent::JobCompleted { new_ads, first_run, .. } => {
                let message = match (first_run, new_ads.len()) {
                    (true, _) => "Initial scan complete".to_string(),
                    (false, 0) => "No new ads".to_string(),
                    (false, 1) => "Found 1 new ad".to_string(),
                    (false, n) => format!("Found {n} new ads"),
                };
                (RunStatus::Idle, message, Some(new_ads.len()), None)
            }
            WatcherEvent::JobError { message, .. } => (
                RunStatus::Error,
                "Watcher run failed".to_string(),
                None,
                Some(message.clone()),
            ),
        };
        Self {
            kind: Self::KIND,
            watcher_id: event.watcher_id().to_string(),
            status,
            message,
            last_run: event.at(),
            new_ads_count,
            error,
        }
    }
}

/// One-way sink for status updates (socket hub, log, ...).
pub trait StatusSink: Send + Sync {
    fn publish(&self, update: StatusUpdate);
}

#[derive(Debug, Clone)]
pub struct BroadcastStatusSink {
    sender: broadcast::Sender<StatusUpdate>,
}

impl BroadcastStatusSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.sender.subscribe()
    }
}

impl StatusSink for BroadcastStatusSink {
    fn publish(&self, update: StatusUpdate) {
        if self.sender.send(update).is_err() {
            debug!("status update dropped: no listeners");
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingStatusSink;

impl StatusSink for LoggingStatusSink {
    fn publish(&self, update: StatusUpdate) {
        match update.status {
            RunStatus::Error => warn!(
                watcher_id = %update.watcher_id,
                error = update.error.as_deref().unwrap_or_default(),
                "{}",
                update.message
            ),
            _ => info!(
                watcher_id = %update.watcher_id,
                status = ?update.status,
                new_ads = update.new_ads_count,
                "{}",
                update.message
            ),
        }
    }
}

pub fn attach_status_sink(bus: &EventBus, sink: Arc<dyn StatusSink>) -> Vec<SubscriptionId> {
    bus.subscribe_many(
        &[EventKind::JobStarted, EventKind::JobCompleted, EventKind::JobError],
        move |event| {
            sink.publish(StatusUpdate::from_event(event));
            Ok(())
        },
    )
}

/// "Last run" bookkeeping driven by completed and failed ticks.
pub trait RunLedger: Send + Sync {
    fn record_run(&self, watcher_id: &str, at: DateTime<Utc>) -> anyhow::Result<()>;
    fn last_run(&self, watcher_id: &str) -> Option<DateTime<Utc>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunRecord {
    pub last_run: DateTime<Utc>,
    pub run_count: u64,
}

#[derive(Debug, Default)]
pub struct InMemoryRunLedger {
    runs: RwLock<HashMap<String, RunRecord>>,
}

impl InMemoryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, watcher_id: &str) -> Option<RunRecord> {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(watcher_id)
            .copied()
    }
}

impl RunLedger for InMemoryRunLedger {
    fn record_run(&self, watcher_id: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        let entry = runs.entry(watcher_id.to_string()).or_insert(RunRecord {
            last_run: at,
            run_count: 0,
        });
        entry.last_run = entry.last_run.max(at);
        entry.run_count += 1;
        Ok(())
    }

    fn last_run(&self, watcher_id: &str) -> Option<DateTime<Utc>> {
        self.record(watcher_id).map(|r| r.last_run)
    }
}

pub fn attach_run_ledger(bus: &EventBus, ledger: Arc<dyn RunLedger>) -> Vec<SubscriptionId> {
    bus.subscribe_many(&[EventKind::JobCompleted, EventKind::JobError], move |event| {
        ledger
            .record_run(event.watcher_id(), event.at())
            .with_context(|| format!("recording run for watcher {}", event.watcher_id()))
    })
}

/// Fully wired engine: shared cache, bus, run ledger and scheduler.
pub struct Engine {
    pub config: EngineConfig,
    pub workspace: WorkspaceFile,
    pub bus: Arc<EventBus>,
    pub cache: Arc<AdCache>,
    pub ledger: Arc<InMemoryRunLedger>,
    pub scheduler: WatcherScheduler,
}

impl Engine {
    pub async fn new(config: EngineConfig, workspace: WorkspaceFile) -> anyhow::Result<Self> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);
        let cache = Arc::new(AdCache::new(CacheConfig {
            max_entries: config.cache_max_entries,
        }));
        let bus = Arc::new(EventBus::new());
        let ledger = Arc::new(InMemoryRunLedger::new());
        attach_run_ledger(&bus, ledger.clone());

        let dispatcher = NotificationDispatcher::new(workspace.notifications.clone(), http.clone(), workspace.email.clone());
        let runner = TickRunner::new(
            AdapterRegistry::with_defaults(),
            http,
            cache.clone(),
            Arc::new(dispatcher),
            bus.clone(),
        )
        .with_marketplace_configs(workspace.marketplaces.clone());

        let scheduler = WatcherScheduler::new(Arc::new(runner))
            .await
            .context("creating watcher scheduler")?
            .with_run_ledger(ledger.clone());

        Ok(Self {
            config,
            workspace,
            bus,
            cache,
            ledger,
            scheduler,
        })
    }

    pub async fn from_env() -> anyhow::Result<Self> {
        let config = EngineConfig::from_env();
        let workspace = WorkspaceFile::load(&config.config_path)
            .with_context(|| format!("loading workspace {}", config.config_path.display()))?;
        Self::new(config, workspace).await
    }

    pub fn watcher(&self, id: &str) -> Option<&Watcher> {
        self.workspace.watcher(id)
    }

    pub fn validate(&self) -> Vec<ValidationIssue> {
        validate_workspace(&self.workspace, self.scheduler.runner().registry())
    }
}
