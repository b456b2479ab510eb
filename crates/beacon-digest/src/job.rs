//! Orchestrates one digest run: recorder -> per-user fetch, filter, dedup,
//! dispatch -> recorder.

use std::sync::Arc;

use beacon_core::{User, DIGEST_JOB};
use beacon_sam::{
    OpportunityFetcher, ReqwestTransport, SearchParams, SearchTransport, SearchWindow,
};
use beacon_storage::DigestStore;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::DigestConfig;
use crate::dedup::DedupGate;
use crate::dispatch::{DigestDispatcher, DispatchMode, EmailSender, ResendSender};
use crate::error::DigestError;
use crate::filter::FilterPipeline;
use crate::recorder::{ActiveRun, RunRecorder, RunTotals};

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub days_back: u32,
    /// Window end date; today (UTC) when unset.
    pub today: Option<NaiveDate>,
}

impl RunOptions {
    pub fn days_back(days_back: u32) -> Self {
        Self {
            days_back,
            today: None,
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::days_back(2)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserFailure {
    pub user_id: i64,
    pub email: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub users_processed: usize,
    pub total_records: i64,
    pub sent_count: i64,
    /// Notices composed but held back by dry mode.
    pub composed_count: i64,
    pub truncated_users: usize,
    pub failed_users: Vec<UserFailure>,
    pub dry_run: bool,
}

#[derive(Debug, Default)]
struct RunProgress {
    users_processed: usize,
    total_records: i64,
    sent_count: i64,
    composed_count: i64,
    truncated_users: usize,
    failed_users: Vec<UserFailure>,
}

impl RunProgress {
    fn totals(&self) -> RunTotals {
        RunTotals {
            total_records: self.total_records,
            sent_count: self.sent_count,
        }
    }

    fn notes(&self, mode: DispatchMode) -> Option<String> {
        let mut notes = Vec::new();
        if mode == DispatchMode::Dry {
            notes.push(format!("dry run: {} notices composed", self.composed_count));
        }
        if self.truncated_users > 0 {
            notes.push(format!(
                "call budget reached for {} user(s)",
                self.truncated_users
            ));
        }
        if !self.failed_users.is_empty() {
            let who = self
                .failed_users
                .iter()
                .map(|f| format!("user {} ({})", f.user_id, f.code))
                .collect::<Vec<_>>()
                .join(", ");
            notes.push(format!("email failed for {who}"));
        }
        if notes.is_empty() {
            None
        } else {
            Some(notes.join("; "))
        }
    }
}

pub struct DigestJob {
    config: DigestConfig,
    store: Arc<dyn DigestStore>,
    fetcher: OpportunityFetcher,
    filters: FilterPipeline,
    dedup: DedupGate,
    dispatcher: DigestDispatcher,
    recorder: RunRecorder,
}

impl DigestJob {
    /// Wires the job from explicit collaborators. `sender` is ignored in dry
    /// mode.
    pub fn new(
        config: &DigestConfig,
        store: Arc<dyn DigestStore>,
        transport: Arc<dyn SearchTransport>,
        sender: Option<Arc<dyn EmailSender>>,
    ) -> Result<Self, DigestError> {
        let fetcher = OpportunityFetcher::new(transport, config.fetch.clone())?;
        let dispatcher = match sender {
            Some(sender) if !config.dry_run => {
                DigestDispatcher::live(sender, config.template.clone())
            }
            _ => DigestDispatcher::dry(config.template.clone()),
        };
        Ok(Self {
            config: config.clone(),
            dedup: DedupGate::new(store.clone()),
            recorder: RunRecorder::new(store.clone(), DIGEST_JOB, config.stale_run_after),
            store,
            fetcher,
            filters: FilterPipeline::standard(),
            dispatcher,
        })
    }

    /// Production wiring: reqwest search transport and the Resend sender.
    pub fn from_config(
        config: &DigestConfig,
        store: Arc<dyn DigestStore>,
    ) -> Result<Self, DigestError> {
        let transport = ReqwestTransport::new(config.http_timeout, Some(&config.user_agent))?;
        let sender = match (&config.email_api_key, config.dry_run) {
            (Some(key), false) => {
                let sender = ResendSender::new(key.clone(), config.http_timeout)
                    .map_err(|err| DigestError::Config(format!("building email client: {err}")))?;
                Some(Arc::new(sender) as Arc<dyn EmailSender>)
            }
            _ => None,
        };
        Self::new(config, store, Arc::new(transport), sender)
    }

    pub fn config(&self) -> &DigestConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn DigestStore> {
        self.store.clone()
    }

    /// Runs the digest once. Every started run ends with exactly one terminal
    /// ledger update; a failure is recorded and then returned to the caller.
    pub async fn run(&self, options: RunOptions) -> Result<RunSummary, DigestError> {
        let run = self.recorder.start().await?;
        let span = info_span!(
            "digest_run",
            run_id = run.id,
            days_back = options.days_back,
            dry_run = self.dispatcher.mode() == DispatchMode::Dry,
        );

        let mut progress = RunProgress::default();
        let result = self
            .execute(&options, &mut progress)
            .instrument(span)
            .await;

        match result {
            Ok(()) => self.finish(&run, progress).await,
            Err(err) => {
                self.record_failure(&run, progress.totals(), &err).await;
                Err(err)
            }
        }
    }

    async fn record_failure(&self, run: &ActiveRun, totals: RunTotals, err: &DigestError) {
        if let Err(store_err) = self.recorder.fail(run, totals, err).await {
            error!(run_id = run.id, error = %store_err, "could not record failed run");
        }
    }

    /// A completion that cannot be written is downgraded to a failure so the
    /// row does not stay `running`.
    async fn finish(
        &self,
        run: &ActiveRun,
        progress: RunProgress,
    ) -> Result<RunSummary, DigestError> {
        let mode = self.dispatcher.mode();
        let totals = progress.totals();
        let completion = match self.recorder.complete(run, totals, progress.notes(mode)).await {
            Ok(completion) => completion,
            Err(store_err) => {
                error!(run_id = run.id, error = %store_err, "could not record completed run");
                let err = DigestError::Store(store_err);
                self.record_failure(run, totals, &err).await;
                return Err(err);
            }
        };
        Ok(RunSummary {
            run_id: run.id,
            started_at: run.started_at,
            finished_at: completion.finished_at,
            duration_ms: completion.duration_ms,
            users_processed: progress.users_processed,
            total_records: progress.total_records,
            sent_count: progress.sent_count,
            composed_count: progress.composed_count,
            truncated_users: progress.truncated_users,
            failed_users: progress.failed_users,
            dry_run: mode == DispatchMode::Dry,
        })
    }

    fn check_ready(&self) -> Result<(), DigestError> {
        self.config.validate()?;
        if !self.config.dry_run && self.dispatcher.mode() == DispatchMode::Dry {
            return Err(DigestError::Config(
                "no email sender configured for live mode".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        options: &RunOptions,
        progress: &mut RunProgress,
    ) -> Result<(), DigestError> {
        self.check_ready()?;
        let today = options.today.unwrap_or_else(|| Utc::now().date_naive());
        let window = SearchWindow::days_back(today, options.days_back)?;

        let users = self.store.active_users().await?;
        info!(users = users.len(), "processing active users");

        for (index, user) in users.iter().enumerate() {
            if index > 0 && !self.config.delay_between_users.is_zero() {
                tokio::time::sleep(self.config.delay_between_users).await;
            }
            let span = info_span!("digest_user", user_id = user.id);
            match self.process_user(user, &window, progress).instrument(span).await {
                Ok(()) => {}
                Err(err @ DigestError::Email { .. }) if self.config.isolate_user_failures => {
                    warn!(
                        user_id = user.id,
                        error = %err,
                        "digest send failed; continuing with next user"
                    );
                    progress.failed_users.push(UserFailure {
                        user_id: user.id,
                        email: user.email.clone(),
                        code: err.code().to_string(),
                        message: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn process_user(
        &self,
        user: &User,
        window: &SearchWindow,
        progress: &mut RunProgress,
    ) -> Result<(), DigestError> {
        progress.users_processed += 1;
        let Some(criteria) = self.store.search_criteria(user.id).await? else {
            debug!("no saved search; skipping");
            return Ok(());
        };

        let params = SearchParams::from_criteria(&criteria);
        let fetched = self.fetcher.fetch_all(window, &params).await?;
        progress.total_records += fetched.records.len() as i64;
        if fetched.truncated {
            progress.truncated_users += 1;
        }

        let report = self.filters.apply(fetched.records, &criteria);
        debug!(
            kept = report.kept.len(),
            dropped = report.dropped_total(),
            "filters applied"
        );
        let fresh = self.dedup.net_new(user.id, report.kept).await?;
        if fresh.is_empty() {
            info!("nothing new for user");
            return Ok(());
        }

        let outcome = self
            .dispatcher
            .dispatch(&user.email, &fresh)
            .await
            .map_err(|source| DigestError::Email {
                recipient: user.email.clone(),
                source,
            })?;
        if outcome.delivered() {
            self.dedup.commit(user.id, &fresh).await?;
            progress.sent_count += fresh.len() as i64;
        } else {
            progress.composed_count += fresh.len() as i64;
        }
        Ok(())
    }
}

/// Runs the digest against Postgres using environment configuration. The
/// pool is closed whether the run succeeds or fails.
pub async fn run_digest_once_from_env(days_back: Option<u32>) -> anyhow::Result<RunSummary> {
    use anyhow::Context;

    let config = DigestConfig::from_env();
    let store = beacon_storage::PgStore::connect(&config.database_url)
        .await
        .context("connecting to the database")?;
    let options = RunOptions::days_back(days_back.unwrap_or(config.days_back));

    let result = match DigestJob::from_config(&config, Arc::new(store.clone())) {
        Ok(job) => job.run(options).await,
        Err(err) => Err(err),
    };
    store.close().await;
    result.context("digest run failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{EmailError, EmailMessage, SendReceipt};
    use async_trait::async_trait;
    use beacon_core::{CronRun, Plan, RunCompletion, RunStatus, SearchCriteria, UserId};
    use beacon_sam::{Backoff, RetryPolicy, TransportError, TransportResponse};
    use beacon_storage::{MemoryStore, StoreError};
    use reqwest::{StatusCode, Url};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    struct PageTransport {
        status: u16,
        retry_after: Option<String>,
        body: String,
        calls: Mutex<Vec<Instant>>,
    }

    impl PageTransport {
        fn new(status: u16, body: String) -> Arc<Self> {
            Arc::new(Self {
                status,
                retry_after: None,
                body,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn rate_limited(retry_after: &str) -> Arc<Self> {
            Arc::new(Self {
                status: 429,
                retry_after: Some(retry_after.to_string()),
                body: String::new(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn offsets_from(&self, start: Instant) -> Vec<Duration> {
            self.calls.lock().unwrap().iter().map(|&at| at - start).collect()
        }
    }

    #[async_trait]
    impl SearchTransport for PageTransport {
        async fn get(&self, _url: &Url) -> Result<TransportResponse, TransportError> {
            self.calls.lock().unwrap().push(Instant::now());
            Ok(TransportResponse {
                status: StatusCode::from_u16(self.status).unwrap(),
                retry_after: self.retry_after.clone(),
                body: self.body.as_bytes().to_vec(),
            })
        }
    }

    /// Delegates to a `MemoryStore` but cannot write a completed run.
    struct CompletionRejectingStore {
        inner: Arc<MemoryStore>,
    }

    #[async_trait]
    impl DigestStore for CompletionRejectingStore {
        async fn active_users(&self) -> Result<Vec<User>, StoreError> {
            self.inner.active_users().await
        }

        async fn search_criteria(
            &self,
            user_id: UserId,
        ) -> Result<Option<SearchCriteria>, StoreError> {
            self.inner.search_criteria(user_id).await
        }

        async fn already_sent(
            &self,
            user_id: UserId,
            notice_ids: &[String],
        ) -> Result<HashSet<String>, StoreError> {
            self.inner.already_sent(user_id, notice_ids).await
        }

        async fn record_sent(
            &self,
            user_id: UserId,
            notice_ids: &[String],
        ) -> Result<u64, StoreError> {
            self.inner.record_sent(user_id, notice_ids).await
        }

        async fn begin_run(
            &self,
            job: &str,
            started_at: DateTime<Utc>,
            active_since: DateTime<Utc>,
        ) -> Result<Option<i64>, StoreError> {
            self.inner.begin_run(job, started_at, active_since).await
        }

        async fn finish_run(
            &self,
            run_id: i64,
            completion: &RunCompletion,
        ) -> Result<(), StoreError> {
            if completion.status == RunStatus::Completed {
                return Err(StoreError::Corrupt("notes column rejected".into()));
            }
            self.inner.finish_run(run_id, completion).await
        }

        async fn latest_run(&self, job: &str) -> Result<Option<CronRun>, StoreError> {
            self.inner.latest_run(job).await
        }

        async fn upsert_user(
            &self,
            email: &str,
            plan: Plan,
            billing_customer_id: Option<&str>,
        ) -> Result<User, StoreError> {
            self.inner.upsert_user(email, plan, billing_customer_id).await
        }

        async fn save_search_criteria(
            &self,
            user_id: UserId,
            criteria: &SearchCriteria,
        ) -> Result<(), StoreError> {
            self.inner.save_search_criteria(user_id, criteria).await
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        fail_for: Option<String>,
        attempts: Mutex<Vec<EmailMessage>>,
    }

    #[async_trait]
    impl EmailSender for RecordingSender {
        async fn send(&self, message: &EmailMessage) -> Result<SendReceipt, EmailError> {
            self.attempts.lock().unwrap().push(message.clone());
            if self.fail_for.as_deref() == message.to.first().map(String::as_str) {
                return Err(EmailError::Rejected {
                    status: 422,
                    body: "invalid recipient".into(),
                });
            }
            Ok(SendReceipt::default())
        }
    }

    impl RecordingSender {
        fn attempts(&self) -> usize {
            self.attempts.lock().unwrap().len()
        }
    }

    fn page() -> String {
        page_reporting(4)
    }

    /// The four-record page, claiming `total` matches upstream.
    fn page_reporting(total: u64) -> String {
        serde_json::json!({
            "totalRecords": total,
            "opportunitiesData": [
                {"noticeId": "A", "title": "Supply of test widgets", "ptype": "o"},
                {"noticeId": "B", "title": "Widgets amendment 1", "ptype": "o"},
                {"noticeId": "C", "title": "Widget award", "ptype": "a"},
                {"noticeId": "D", "title": "Gadget repair widgets", "ptype": "k"}
            ]
        })
        .to_string()
    }

    fn config() -> DigestConfig {
        let mut config = DigestConfig::default();
        config.fetch.api_key = Some("TESTKEY".into());
        config.fetch.delay_between_calls = Duration::ZERO;
        config.fetch.retry = RetryPolicy {
            max_attempts: 2,
            backoff: Backoff::Fixed(Duration::ZERO),
            rate_limit_delay: Duration::ZERO,
            rate_limit_delay_cap: Duration::ZERO,
        };
        config.delay_between_users = Duration::ZERO;
        config.email_api_key = Some("re_test".into());
        config
    }

    fn options() -> RunOptions {
        RunOptions {
            days_back: 2,
            today: NaiveDate::from_ymd_opt(2025, 9, 2),
        }
    }

    async fn store_with_users(emails: &[&str]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for email in emails {
            let user = store.upsert_user(email, Plan::Paid, None).await.unwrap();
            let criteria = SearchCriteria {
                include_keywords: vec!["widgets".into()],
                ..Default::default()
            };
            store.save_search_criteria(user.id, &criteria).await.unwrap();
        }
        store
    }

    fn job(
        config: &DigestConfig,
        store: Arc<MemoryStore>,
        transport: Arc<PageTransport>,
        sender: Arc<RecordingSender>,
    ) -> DigestJob {
        DigestJob::new(config, store, transport, Some(sender as Arc<dyn EmailSender>)).unwrap()
    }

    #[tokio::test]
    async fn completed_run_sends_filtered_notices_and_records_them() {
        let store = store_with_users(&["a@example.com", "b@example.com"]).await;
        let transport = PageTransport::new(200, page());
        let sender = Arc::new(RecordingSender::default());
        let job = job(&config(), store.clone(), transport.clone(), sender.clone());

        let summary = job.run(options()).await.unwrap();
        assert_eq!(summary.users_processed, 2);
        assert_eq!(summary.total_records, 8);
        assert_eq!(summary.sent_count, 4);
        assert!(!summary.dry_run);
        assert_eq!(transport.calls(), 2);
        assert_eq!(sender.attempts(), 2);

        let sent = store.sent_notices().await;
        let pairs = sent
            .iter()
            .map(|s| (s.user_id, s.notice_id.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(pairs, vec![(1, "A"), (1, "D"), (2, "A"), (2, "D")]);

        let runs = store.runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Completed);
        assert_eq!(runs[0].total_records, Some(8));
        assert_eq!(runs[0].sent_count, Some(4));
        assert!(runs[0].duration_ms.is_some());
    }

    #[tokio::test]
    async fn overlapping_windows_never_renotify() {
        let store = store_with_users(&["a@example.com"]).await;
        let transport = PageTransport::new(200, page());
        let sender = Arc::new(RecordingSender::default());
        let job = job(&config(), store.clone(), transport, sender.clone());

        job.run(options()).await.unwrap();
        let second = job.run(options()).await.unwrap();

        assert_eq!(second.sent_count, 0);
        assert_eq!(sender.attempts(), 1);
        assert_eq!(store.sent_notices().await.len(), 2);
        let runs = store.runs().await;
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.status == RunStatus::Completed));
    }

    #[tokio::test]
    async fn fetch_failure_marks_run_failed_and_propagates() {
        let store = store_with_users(&["a@example.com"]).await;
        let transport = PageTransport::new(401, String::new());
        let sender = Arc::new(RecordingSender::default());
        let job = job(&config(), store.clone(), transport.clone(), sender);

        let err = job.run(options()).await.unwrap_err();
        assert_eq!(err.code(), "SAM_UNAUTHORIZED");
        assert_eq!(transport.calls(), 1);

        let runs = store.runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].err_code.as_deref(), Some("SAM_UNAUTHORIZED"));
        assert!(runs[0].notes.is_some());
        assert!(runs[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn persistent_server_errors_fail_the_run() {
        let store = store_with_users(&["a@example.com", "b@example.com"]).await;
        let transport = PageTransport::new(503, "unavailable".into());
        let sender = Arc::new(RecordingSender::default());
        let job = job(&config(), store.clone(), transport.clone(), sender.clone());

        let err = job.run(options()).await.unwrap_err();
        assert_eq!(err.code(), "SAM_RETRIES_EXHAUSTED");
        assert_eq!(transport.calls(), 2);
        assert_eq!(sender.attempts(), 0);

        let runs = store.runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].err_code.as_deref(), Some("SAM_RETRIES_EXHAUSTED"));
        assert!(runs[0].notes.as_deref().unwrap().contains("max retries"));
    }

    #[tokio::test]
    async fn absurd_retry_after_hint_fails_cleanly_and_frees_the_guard() {
        let store = store_with_users(&["a@example.com"]).await;
        let transport = PageTransport::rate_limited("1e20");
        let job = job(&config(), store.clone(), transport.clone(), Arc::default());

        let err = job.run(options()).await.unwrap_err();
        assert_eq!(err.code(), "SAM_RATE_LIMITED");
        assert_eq!(transport.calls(), 2);
        let runs = store.runs().await;
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].err_code.as_deref(), Some("SAM_RATE_LIMITED"));

        // the failed row no longer blocks the next invocation
        let err = job.run(options()).await.unwrap_err();
        assert_eq!(err.code(), "SAM_RATE_LIMITED");
        assert_eq!(store.runs().await.len(), 2);
    }

    #[tokio::test]
    async fn unwritable_completion_is_recorded_as_failure() {
        let memory = store_with_users(&["a@example.com"]).await;
        let store = Arc::new(CompletionRejectingStore {
            inner: memory.clone(),
        });
        let transport = PageTransport::new(200, page());
        let sender = Arc::new(RecordingSender::default());
        let job = DigestJob::new(
            &config(),
            store,
            transport,
            Some(sender.clone() as Arc<dyn EmailSender>),
        )
        .unwrap();

        let err = job.run(options()).await.unwrap_err();
        assert_eq!(err.code(), "STORE_ERROR");
        assert_eq!(sender.attempts(), 1);

        let runs = memory.runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].err_code.as_deref(), Some("STORE_ERROR"));
        assert_eq!(runs[0].sent_count, Some(2));
        assert!(runs[0].finished_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn users_and_pages_are_throttled() {
        let store = store_with_users(&["a@example.com", "b@example.com"]).await;
        let transport = PageTransport::new(200, page_reporting(8));
        let mut config = config();
        config.fetch.delay_between_calls = Duration::from_millis(1500);
        config.delay_between_users = Duration::from_secs(5);
        let job = job(&config, store, transport.clone(), Arc::default());

        let start = Instant::now();
        job.run(options()).await.unwrap();

        let offsets = transport.offsets_from(start);
        assert_eq!(offsets.len(), 4);
        let expected = [0, 1_500, 6_500, 8_000].map(Duration::from_millis);
        for (actual, expected) in offsets.iter().zip(expected) {
            assert!(
                *actual >= expected && *actual <= expected + Duration::from_millis(10),
                "offsets {offsets:?}"
            );
        }
    }

    #[tokio::test]
    async fn email_failure_aborts_remaining_users_by_default() {
        let store = store_with_users(&["bad@example.com", "b@example.com"]).await;
        let transport = PageTransport::new(200, page());
        let sender = Arc::new(RecordingSender {
            fail_for: Some("bad@example.com".into()),
            ..Default::default()
        });
        let job = job(&config(), store.clone(), transport.clone(), sender.clone());

        let err = job.run(options()).await.unwrap_err();
        assert_eq!(err.code(), "EMAIL_SEND_FAILED");
        assert_eq!(sender.attempts(), 1);
        assert_eq!(transport.calls(), 1);
        assert!(store.sent_notices().await.is_empty());

        let runs = store.runs().await;
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].err_code.as_deref(), Some("EMAIL_SEND_FAILED"));
        assert_eq!(runs[0].total_records, Some(4));
    }

    #[tokio::test]
    async fn isolated_email_failure_continues_with_next_user() {
        let store = store_with_users(&["bad@example.com", "b@example.com"]).await;
        let transport = PageTransport::new(200, page());
        let sender = Arc::new(RecordingSender {
            fail_for: Some("bad@example.com".into()),
            ..Default::default()
        });
        let mut config = config();
        config.isolate_user_failures = true;
        let job = job(&config, store.clone(), transport, sender.clone());

        let summary = job.run(options()).await.unwrap();
        assert_eq!(sender.attempts(), 2);
        assert_eq!(summary.sent_count, 2);
        assert_eq!(summary.failed_users.len(), 1);
        assert_eq!(summary.failed_users[0].email, "bad@example.com");

        let sent = store.sent_notices().await;
        assert!(sent.iter().all(|s| s.user_id == 2));
        let runs = store.runs().await;
        assert_eq!(runs[0].status, RunStatus::Completed);
        assert!(runs[0].notes.as_deref().unwrap().contains("email failed"));
    }

    #[tokio::test]
    async fn dry_run_composes_without_sending_or_recording() {
        let store = store_with_users(&["a@example.com"]).await;
        let transport = PageTransport::new(200, page());
        let sender = Arc::new(RecordingSender::default());
        let mut config = config();
        config.dry_run = true;
        config.email_api_key = None;
        let job = job(&config, store.clone(), transport, sender.clone());

        let summary = job.run(options()).await.unwrap();
        assert!(summary.dry_run);
        assert_eq!(summary.sent_count, 0);
        assert_eq!(summary.composed_count, 2);
        assert_eq!(sender.attempts(), 0);
        assert!(store.sent_notices().await.is_empty());
        assert_eq!(store.runs().await[0].status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn missing_api_key_fails_before_any_request() {
        let store = store_with_users(&["a@example.com"]).await;
        let transport = PageTransport::new(200, page());
        let mut config = config();
        config.fetch.api_key = None;
        let job = job(&config, store.clone(), transport.clone(), Arc::default());

        let err = job.run(options()).await.unwrap_err();
        assert!(matches!(err, DigestError::Config(_)));
        assert_eq!(transport.calls(), 0);
        assert_eq!(store.runs().await[0].err_code.as_deref(), Some("CONFIG_INVALID"));
    }

    #[tokio::test]
    async fn overlapping_invocation_is_refused_without_a_row() {
        let store = store_with_users(&["a@example.com"]).await;
        let now = Utc::now();
        store
            .begin_run(DIGEST_JOB, now, now - chrono::Duration::minutes(5))
            .await
            .unwrap();
        let transport = PageTransport::new(200, page());
        let job = job(&config(), store.clone(), transport.clone(), Arc::default());

        let err = job.run(options()).await.unwrap_err();
        assert!(matches!(err, DigestError::RunInProgress));
        assert_eq!(transport.calls(), 0);
        assert_eq!(store.runs().await.len(), 1);
    }

    #[tokio::test]
    async fn users_without_saved_search_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_user("a@example.com", Plan::Trialing, None).await.unwrap();
        let transport = PageTransport::new(200, page());
        let job = job(&config(), store.clone(), transport.clone(), Arc::default());

        let summary = job.run(options()).await.unwrap();
        assert_eq!(summary.users_processed, 1);
        assert_eq!(transport.calls(), 0);
        assert_eq!(summary.total_records, 0);
    }
}
