//! Persistence for users, saved searches, the sent-notice ledger and the run ledger.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use beacon_core::{
    CronRun, Plan, RunCompletion, RunStatus, SearchCriteria, SentNotice, User, UserId,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "beacon-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("running migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("user {0} not found")]
    UnknownUser(UserId),
    #[error("user {user_id} is on plan {plan}; search criteria can only change on an active plan")]
    PlanInactive { user_id: UserId, plan: Plan },
    #[error("run {0} not found")]
    UnknownRun(i64),
    #[error("run {0} already finished")]
    RunAlreadyFinished(i64),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Storage operations the digest job and its triggers depend on.
///
/// `record_sent` is insert-if-absent: a `(user, notice)` pair that already
/// exists is skipped, never reported as an error.
#[async_trait]
pub trait DigestStore: Send + Sync {
    /// Users whose plan is paid or trialing, in id order.
    async fn active_users(&self) -> Result<Vec<User>, StoreError>;

    async fn search_criteria(&self, user_id: UserId) -> Result<Option<SearchCriteria>, StoreError>;

    /// Subset of `notice_ids` already delivered to `user_id`.
    async fn already_sent(
        &self,
        user_id: UserId,
        notice_ids: &[String],
    ) -> Result<HashSet<String>, StoreError>;

    /// Returns how many pairs were newly inserted.
    async fn record_sent(&self, user_id: UserId, notice_ids: &[String]) -> Result<u64, StoreError>;

    /// Opens a `running` ledger row unless another run of `job` is still
    /// running and started after `active_since`; `None` in that case.
    async fn begin_run(
        &self,
        job: &str,
        started_at: DateTime<Utc>,
        active_since: DateTime<Utc>,
    ) -> Result<Option<i64>, StoreError>;

    /// Moves a running row to its terminal state. A row only finishes once.
    async fn finish_run(&self, run_id: i64, completion: &RunCompletion) -> Result<(), StoreError>;

    async fn latest_run(&self, job: &str) -> Result<Option<CronRun>, StoreError>;

    async fn upsert_user(
        &self,
        email: &str,
        plan: Plan,
        billing_customer_id: Option<&str>,
    ) -> Result<User, StoreError>;

    /// Creates or replaces the single saved search of an active user.
    async fn save_search_criteria(
        &self,
        user_id: UserId,
        criteria: &SearchCriteria,
    ) -> Result<(), StoreError>;
}

fn parse_plan(raw: &str) -> Result<Plan, StoreError> {
    raw.parse()
        .map_err(|err| StoreError::Corrupt(format!("users.plan: {err}")))
}

fn parse_status(raw: &str) -> Result<RunStatus, StoreError> {
    raw.parse()
        .map_err(|err| StoreError::Corrupt(format!("cron_runs.status: {err}")))
}

/// `searches` row as stored, including the columns of the first settings
/// form that newer rows leave empty.
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct SearchRow {
    pub q_keywords_include: Option<Vec<String>>,
    pub q_keywords_exclude: Option<Vec<String>>,
    pub ncode: Option<Vec<String>>,
    pub ccode: Option<Vec<String>>,
    pub type_of_set_aside: Option<Vec<String>>,
    pub organization_name: Option<String>,
    pub organization_code: Option<String>,
    pub mute_agencies: Option<Vec<String>>,
    pub mute_terms: Option<Vec<String>>,
    pub q: Option<String>,
    pub include_words: Option<String>,
    pub exclude_words: Option<String>,
    pub naics: Option<Vec<String>>,
    pub psc: Option<Vec<String>>,
    pub setaside: Option<Vec<String>>,
    pub agency: Option<String>,
}

impl SearchRow {
    pub fn into_criteria(self) -> SearchCriteria {
        let include_keywords = first_non_empty_list([self.q_keywords_include])
            .or_else(|| text_keyword(self.include_words))
            .or_else(|| text_keyword(self.q))
            .unwrap_or_default();
        let exclude_keywords = first_non_empty_list([self.q_keywords_exclude])
            .or_else(|| text_keyword(self.exclude_words))
            .unwrap_or_default();

        SearchCriteria {
            include_keywords,
            exclude_keywords,
            naics_codes: first_non_empty_list([self.ncode, self.naics]).unwrap_or_default(),
            psc_codes: first_non_empty_list([self.ccode, self.psc]).unwrap_or_default(),
            set_aside_codes: first_non_empty_list([self.type_of_set_aside, self.setaside])
                .unwrap_or_default(),
            organization_name: non_blank(self.organization_name).or_else(|| non_blank(self.agency)),
            organization_code: non_blank(self.organization_code),
            mute_agencies: self.mute_agencies.unwrap_or_default(),
            mute_terms: self.mute_terms.unwrap_or_default(),
        }
    }
}

fn first_non_empty_list<const N: usize>(lists: [Option<Vec<String>>; N]) -> Option<Vec<String>> {
    lists.into_iter().flatten().find(|list| !list.is_empty())
}

fn text_keyword(value: Option<String>) -> Option<Vec<String>> {
    non_blank(value).map(|v| vec![v])
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn dedup_ids(notice_ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    notice_ids
        .iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn user_from_row(row: &PgRow) -> Result<User, StoreError> {
        let plan: String = row.try_get("plan")?;
        Ok(User {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            plan: parse_plan(&plan)?,
            billing_customer_id: row.try_get("stripe_customer_id")?,
        })
    }

    fn run_from_row(row: &PgRow) -> Result<CronRun, StoreError> {
        let status: String = row.try_get("status")?;
        Ok(CronRun {
            id: row.try_get("id")?,
            job: row.try_get("job")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            duration_ms: row.try_get("duration_ms")?,
            total_records: row.try_get("total_records")?,
            sent_count: row.try_get("sent_count")?,
            status: parse_status(&status)?,
            err_code: row.try_get("err_code")?,
            notes: row.try_get("notes")?,
        })
    }
}

#[async_trait]
impl DigestStore for PgStore {
    async fn active_users(&self) -> Result<Vec<User>, StoreError> {
        let plans = vec![
            Plan::Paid.as_str().to_string(),
            Plan::Trialing.as_str().to_string(),
            "trial".to_string(),
        ];
        let rows = sqlx::query(
            r#"
            SELECT id, email, plan, stripe_customer_id
              FROM users
             WHERE plan = ANY($1)
             ORDER BY id
            "#,
        )
        .bind(plans)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::user_from_row).collect()
    }

    async fn search_criteria(&self, user_id: UserId) -> Result<Option<SearchCriteria>, StoreError> {
        let row: Option<SearchRow> = sqlx::query_as(
            r#"
            SELECT q_keywords_include, q_keywords_exclude, ncode, ccode, type_of_set_aside,
                   organization_name, organization_code, mute_agencies, mute_terms,
                   q, include_words, exclude_words, naics, psc, setaside, agency
              FROM searches
             WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SearchRow::into_criteria))
    }

    async fn already_sent(
        &self,
        user_id: UserId,
        notice_ids: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        if notice_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT notice_id
              FROM sent_notice_ids
             WHERE user_id = $1
               AND notice_id = ANY($2)
            "#,
        )
        .bind(user_id)
        .bind(notice_ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("notice_id").map_err(StoreError::from))
            .collect()
    }

    async fn record_sent(&self, user_id: UserId, notice_ids: &[String]) -> Result<u64, StoreError> {
        let ids = dedup_ids(notice_ids);
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            INSERT INTO sent_notice_ids (user_id, notice_id)
            SELECT $1, notice_id FROM UNNEST($2::text[]) AS t(notice_id)
            ON CONFLICT (user_id, notice_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(&ids)
        .execute(&self.pool)
        .await?;
        let inserted = result.rows_affected();
        if inserted < ids.len() as u64 {
            debug!(
                user_id,
                skipped = ids.len() as u64 - inserted,
                "sent notice ids already recorded"
            );
        }
        Ok(inserted)
    }

    async fn begin_run(
        &self,
        job: &str,
        started_at: DateTime<Utc>,
        active_since: DateTime<Utc>,
    ) -> Result<Option<i64>, StoreError> {
        // The advisory lock serializes concurrent starts of one job, so the
        // NOT EXISTS check below always sees a competing run's committed row.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext('cron_runs:' || $1))")
            .bind(job)
            .execute(&mut *tx)
            .await?;
        let row = sqlx::query(
            r#"
            INSERT INTO cron_runs (job, started_at, status)
            SELECT $1, $2, 'running'
             WHERE NOT EXISTS (
                   SELECT 1
                     FROM cron_runs
                    WHERE job = $1
                      AND status = 'running'
                      AND started_at > $3
             )
            RETURNING id
            "#,
        )
        .bind(job)
        .bind(started_at)
        .bind(active_since)
        .fetch_optional(&mut *tx)
        .await?;
        let id = row.map(|r| r.try_get::<i64, _>("id")).transpose()?;
        tx.commit().await?;
        Ok(id)
    }

    async fn finish_run(&self, run_id: i64, completion: &RunCompletion) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE cron_runs
               SET finished_at = $2,
                   duration_ms = $3,
                   total_records = $4,
                   sent_count = $5,
                   status = $6,
                   err_code = $7,
                   notes = $8
             WHERE id = $1
               AND status = 'running'
            "#,
        )
        .bind(run_id)
        .bind(completion.finished_at)
        .bind(completion.duration_ms)
        .bind(completion.total_records)
        .bind(completion.sent_count)
        .bind(completion.status.as_str())
        .bind(completion.err_code.as_deref())
        .bind(completion.notes.as_deref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }

        let exists = sqlx::query("SELECT 1 FROM cron_runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Err(StoreError::RunAlreadyFinished(run_id)),
            None => Err(StoreError::UnknownRun(run_id)),
        }
    }

    async fn latest_run(&self, job: &str) -> Result<Option<CronRun>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, job, started_at, finished_at, duration_ms, total_records,
                   sent_count, status, err_code, notes
              FROM cron_runs
             WHERE job = $1
             ORDER BY started_at DESC, id DESC
             LIMIT 1
            "#,
        )
        .bind(job)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::run_from_row).transpose()
    }

    async fn upsert_user(
        &self,
        email: &str,
        plan: Plan,
        billing_customer_id: Option<&str>,
    ) -> Result<User, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO users (email, plan, stripe_customer_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (email) DO UPDATE
               SET plan = EXCLUDED.plan,
                   stripe_customer_id =
                       COALESCE(EXCLUDED.stripe_customer_id, users.stripe_customer_id)
            RETURNING id, email, plan, stripe_customer_id
            "#,
        )
        .bind(email)
        .bind(plan.as_str())
        .bind(billing_customer_id)
        .fetch_one(&self.pool)
        .await?;
        Self::user_from_row(&row)
    }

    async fn save_search_criteria(
        &self,
        user_id: UserId,
        criteria: &SearchCriteria,
    ) -> Result<(), StoreError> {
        let plan_row = sqlx::query("SELECT plan FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::UnknownUser(user_id))?;
        let plan = parse_plan(&plan_row.try_get::<String, _>("plan")?)?;
        if !plan.is_active() {
            return Err(StoreError::PlanInactive { user_id, plan });
        }

        sqlx::query(
            r#"
            INSERT INTO searches (user_id, q_keywords_include, q_keywords_exclude, ncode, ccode,
                                  type_of_set_aside, organization_name, organization_code,
                                  mute_agencies, mute_terms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (user_id) DO UPDATE
               SET q_keywords_include = EXCLUDED.q_keywords_include,
                   q_keywords_exclude = EXCLUDED.q_keywords_exclude,
                   ncode = EXCLUDED.ncode,
                   ccode = EXCLUDED.ccode,
                   type_of_set_aside = EXCLUDED.type_of_set_aside,
                   organization_name = EXCLUDED.organization_name,
                   organization_code = EXCLUDED.organization_code,
                   mute_agencies = EXCLUDED.mute_agencies,
                   mute_terms = EXCLUDED.mute_terms,
                   updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(&criteria.include_keywords)
        .bind(&criteria.exclude_keywords)
        .bind(&criteria.naics_codes)
        .bind(&criteria.psc_codes)
        .bind(&criteria.set_aside_codes)
        .bind(criteria.organization_name.as_deref())
        .bind(criteria.organization_code.as_deref())
        .bind(&criteria.mute_agencies)
        .bind(&criteria.mute_terms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-process store with the same constraints as the Postgres schema. Backs
/// tests and local dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    users: BTreeMap<UserId, User>,
    searches: BTreeMap<UserId, SearchCriteria>,
    sent: BTreeMap<(UserId, String), DateTime<Utc>>,
    runs: Vec<CronRun>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent_notices(&self) -> Vec<SentNotice> {
        let state = self.state.lock().await;
        state
            .sent
            .iter()
            .map(|((user_id, notice_id), sent_at)| SentNotice {
                user_id: *user_id,
                notice_id: notice_id.clone(),
                sent_at: *sent_at,
            })
            .collect()
    }

    pub async fn runs(&self) -> Vec<CronRun> {
        self.state.lock().await.runs.clone()
    }

    pub async fn set_plan(&self, user_id: UserId, plan: Plan) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or(StoreError::UnknownUser(user_id))?;
        user.plan = plan;
        Ok(())
    }
}

#[async_trait]
impl DigestStore for MemoryStore {
    async fn active_users(&self) -> Result<Vec<User>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .users
            .values()
            .filter(|u| u.plan.is_active())
            .cloned()
            .collect())
    }

    async fn search_criteria(&self, user_id: UserId) -> Result<Option<SearchCriteria>, StoreError> {
        Ok(self.state.lock().await.searches.get(&user_id).cloned())
    }

    async fn already_sent(
        &self,
        user_id: UserId,
        notice_ids: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(notice_ids
            .iter()
            .filter(|id| state.sent.contains_key(&(user_id, (*id).clone())))
            .cloned()
            .collect())
    }

    async fn record_sent(&self, user_id: UserId, notice_ids: &[String]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut inserted = 0;
        for id in notice_ids {
            let key = (user_id, id.clone());
            if state.sent.contains_key(&key) {
                continue;
            }
            state.sent.insert(key, now);
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn begin_run(
        &self,
        job: &str,
        started_at: DateTime<Utc>,
        active_since: DateTime<Utc>,
    ) -> Result<Option<i64>, StoreError> {
        let mut state = self.state.lock().await;
        let overlapping = state.runs.iter().any(|r| {
            r.job == job && r.status == RunStatus::Running && r.started_at > active_since
        });
        if overlapping {
            return Ok(None);
        }
        let id = state.runs.len() as i64 + 1;
        state.runs.push(CronRun {
            id,
            job: job.to_string(),
            started_at,
            finished_at: None,
            duration_ms: None,
            total_records: None,
            sent_count: None,
            status: RunStatus::Running,
            err_code: None,
            notes: None,
        });
        Ok(Some(id))
    }

    async fn finish_run(&self, run_id: i64, completion: &RunCompletion) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or(StoreError::UnknownRun(run_id))?;
        if run.status.is_terminal() {
            return Err(StoreError::RunAlreadyFinished(run_id));
        }
        run.finished_at = Some(completion.finished_at);
        run.duration_ms = Some(completion.duration_ms);
        run.total_records = Some(completion.total_records);
        run.sent_count = Some(completion.sent_count);
        run.status = completion.status;
        run.err_code = completion.err_code.clone();
        run.notes = completion.notes.clone();
        Ok(())
    }

    async fn latest_run(&self, job: &str) -> Result<Option<CronRun>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .iter()
            .filter(|r| r.job == job)
            .max_by_key(|r| (r.started_at, r.id))
            .cloned())
    }

    async fn upsert_user(
        &self,
        email: &str,
        plan: Plan,
        billing_customer_id: Option<&str>,
    ) -> Result<User, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(user) = state.users.values_mut().find(|u| u.email == email) {
            user.plan = plan;
            if let Some(customer) = billing_customer_id {
                user.billing_customer_id = Some(customer.to_string());
            }
            return Ok(user.clone());
        }
        let id = state.users.keys().next_back().copied().unwrap_or(0) + 1;
        let user = User {
            id,
            email: email.to_string(),
            plan,
            billing_customer_id: billing_customer_id.map(ToString::to_string),
        };
        state.users.insert(id, user.clone());
        Ok(user)
    }

    async fn save_search_criteria(
        &self,
        user_id: UserId,
        criteria: &SearchCriteria,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let plan = state
            .users
            .get(&user_id)
            .map(|u| u.plan)
            .ok_or(StoreError::UnknownUser(user_id))?;
        if !plan.is_active() {
            return Err(StoreError::PlanInactive { user_id, plan });
        }
        state.searches.insert(user_id, criteria.clone());
        Ok(())
    }
}
