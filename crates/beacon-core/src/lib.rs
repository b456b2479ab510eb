//! Core domain model for BidBeacon digests.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "beacon-core";

/// Job name recorded on every ledger row written by the opportunity digest.
pub const DIGEST_JOB: &str = "opps";

pub type UserId = i64;

/// Subscription state of a user. Users are never deleted, only moved to
/// `Canceled` or `Unsubscribed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Unpaid,
    Trialing,
    Paid,
    Canceled,
    Unsubscribed,
}

impl Plan {
    /// Plans that receive digests and may edit their search.
    pub const ACTIVE: [Plan; 2] = [Plan::Paid, Plan::Trialing];

    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Unpaid => "unpaid",
            Plan::Trialing => "trialing",
            Plan::Paid => "paid",
            Plan::Canceled => "canceled",
            Plan::Unsubscribed => "unsubscribed",
        }
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown value {0:?}")]
pub struct UnknownVariant(pub String);

impl FromStr for Plan {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unpaid" => Ok(Plan::Unpaid),
            // older rows were written as "trial"
            "trial" | "trialing" => Ok(Plan::Trialing),
            "paid" => Ok(Plan::Paid),
            "canceled" | "cancelled" => Ok(Plan::Canceled),
            "unsubscribed" => Ok(Plan::Unsubscribed),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub plan: Plan,
    pub billing_customer_id: Option<String>,
}

/// Saved search of one user. Exactly one per user.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SearchCriteria {
    pub include_keywords: Vec<String>,
    pub exclude_keywords: Vec<String>,
    pub naics_codes: Vec<String>,
    pub psc_codes: Vec<String>,
    pub set_aside_codes: Vec<String>,
    pub organization_name: Option<String>,
    pub organization_code: Option<String>,
    pub mute_agencies: Vec<String>,
    pub mute_terms: Vec<String>,
}

impl SearchCriteria {
    /// Include keywords joined into the free-text `q` the search API accepts.
    pub fn include_text(&self) -> Option<String> {
        join_keywords(&self.include_keywords)
    }

    pub fn exclude_text(&self) -> Option<String> {
        join_keywords(&self.exclude_keywords)
    }
}

fn join_keywords(words: &[String]) -> Option<String> {
    let joined = words
        .iter()
        .map(|w| w.trim())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

/// Ledger entry proving a notice was delivered to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentNotice {
    pub user_id: UserId,
    pub notice_id: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" | "ok" => Ok(RunStatus::Completed),
            "failed" | "error" => Ok(RunStatus::Failed),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// One row of the run ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronRun {
    pub id: i64,
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub total_records: Option<i64>,
    pub sent_count: Option<i64>,
    pub status: RunStatus,
    pub err_code: Option<String>,
    pub notes: Option<String>,
}

/// Terminal update applied to a running ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub total_records: i64,
    pub sent_count: i64,
    pub err_code: Option<String>,
    pub notes: Option<String>,
}

/// A notice returned by the opportunity search API. Lives for one fetch,
/// filter and dispatch cycle; only `notice_id` is ever persisted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpportunityRecord {
    pub notice_id: String,
    pub solicitation_number: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub notice_type: Option<String>,
    pub posted_date: Option<String>,
    pub naics_codes: Vec<String>,
    pub psc_codes: Vec<String>,
    pub set_asides: Vec<String>,
    pub ui_link: Option<String>,
    pub full_parent_path_name: Option<String>,
    pub organization_name: Option<String>,
}

impl OpportunityRecord {
    /// Agency display name: the full parent path when present, else the
    /// organization name.
    pub fn agency(&self) -> Option<&str> {
        self.full_parent_path_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.organization_name.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_parsing_accepts_legacy_trial() {
        assert_eq!("trial".parse::<Plan>().unwrap(), Plan::Trialing);
        assert_eq!("Paid".parse::<Plan>().unwrap(), Plan::Paid);
        assert!("gold".parse::<Plan>().is_err());
    }

    #[test]
    fn unknown_values_report_what_was_rejected() {
        let err = "Gold ".parse::<Plan>().unwrap_err();
        assert_eq!(err, UnknownVariant("gold".into()));
        assert_eq!(err.to_string(), "unknown value \"gold\"");

        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(err);
        assert!(boxed.source().is_none());
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn only_paid_and_trialing_are_active() {
        assert!(Plan::Paid.is_active());
        assert!(Plan::Trialing.is_active());
        assert!(!Plan::Unpaid.is_active());
        assert!(!Plan::Canceled.is_active());
        assert!(!Plan::Unsubscribed.is_active());
    }

    #[test]
    fn run_status_serializes_snake_case() {
        let json = serde_json::to_string(&RunStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn include_text_skips_blank_keywords() {
        let criteria = SearchCriteria {
            include_keywords: vec!["cyber".into(), "  ".into(), "cloud".into()],
            ..Default::default()
        };
        assert_eq!(criteria.include_text().as_deref(), Some("cyber cloud"));
        assert_eq!(SearchCriteria::default().include_text(), None);
    }

    #[test]
    fn agency_prefers_full_parent_path() {
        let record = OpportunityRecord {
            notice_id: "N1".into(),
            full_parent_path_name: Some("DEPT OF DEFENSE.ARMY".into()),
            organization_name: Some("Army".into()),
            ..Default::default()
        };
        assert_eq!(record.agency(), Some("DEPT OF DEFENSE.ARMY"));

        let record = OpportunityRecord {
            notice_id: "N2".into(),
            full_parent_path_name: Some(String::new()),
            organization_name: Some("GSA".into()),
            ..Default::default()
        };
        assert_eq!(record.agency(), Some("GSA"));
    }
}
