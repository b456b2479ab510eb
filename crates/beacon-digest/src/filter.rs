//! Per-user record filters.
//!
//! Matching favors recall: every keyword test is a case-insensitive substring
//! test with OR semantics across the configured words.

use std::collections::BTreeMap;

use beacon_core::{OpportunityRecord, SearchCriteria};
use beacon_sam::BASE_NOTICE_TYPES;
use serde::Serialize;

/// Every notice type code the search API documents. Codes outside this list
/// are treated as unknown and pass the base-type check.
const KNOWN_NOTICE_TYPES: [&str; 9] = ["u", "p", "a", "r", "s", "o", "g", "k", "i"];

const AMENDMENT_MARKERS: [&str; 3] = ["amend", "modif", "corrigen"];

pub fn is_base_type(notice_type: Option<&str>) -> bool {
    let Some(code) = notice_type.map(str::trim).filter(|c| !c.is_empty()) else {
        return true;
    };
    let code = code.to_ascii_lowercase();
    BASE_NOTICE_TYPES.contains(&code.as_str()) || !KNOWN_NOTICE_TYPES.contains(&code.as_str())
}

pub fn is_amendment_title(title: Option<&str>) -> bool {
    let Some(title) = title.filter(|t| !t.is_empty()) else {
        return false;
    };
    let title = title.to_lowercase();
    AMENDMENT_MARKERS.iter().any(|marker| title.contains(marker))
}

/// Lowercased `title description` text that keyword and term filters search.
pub fn searchable_text(record: &OpportunityRecord) -> String {
    format!(
        "{} {}",
        record.title.as_deref().unwrap_or_default(),
        record.description.as_deref().unwrap_or_default()
    )
    .to_lowercase()
}

/// Splits configured keywords on commas and whitespace.
pub fn keyword_terms(words: &[String]) -> Vec<String> {
    words
        .iter()
        .flat_map(|w| w.split(|c: char| c == ',' || c.is_whitespace()))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn lowered_phrases(phrases: &[String]) -> Vec<String> {
    phrases
        .iter()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect()
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    needles.iter().any(|n| haystack.contains(n.as_str()))
}

/// Search criteria normalized once per user.
#[derive(Debug, Clone, Default)]
pub struct CompiledCriteria {
    include_terms: Vec<String>,
    exclude_terms: Vec<String>,
    muted_agencies: Vec<String>,
    muted_terms: Vec<String>,
}

impl CompiledCriteria {
    pub fn new(criteria: &SearchCriteria) -> Self {
        Self {
            include_terms: keyword_terms(&criteria.include_keywords),
            exclude_terms: keyword_terms(&criteria.exclude_keywords),
            muted_agencies: lowered_phrases(&criteria.mute_agencies),
            muted_terms: lowered_phrases(&criteria.mute_terms),
        }
    }

    pub fn matches_include(&self, text: &str) -> bool {
        self.include_terms.is_empty() || contains_any(text, &self.include_terms)
    }

    pub fn matches_exclude(&self, text: &str) -> bool {
        contains_any(text, &self.exclude_terms)
    }

    pub fn agency_muted(&self, agency: Option<&str>) -> bool {
        if self.muted_agencies.is_empty() {
            return false;
        }
        let agency = agency.unwrap_or_default().to_lowercase();
        contains_any(&agency, &self.muted_agencies)
    }

    pub fn term_muted(&self, text: &str) -> bool {
        contains_any(text, &self.muted_terms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterStage {
    BaseType,
    Amendment,
    IncludeKeywords,
    ExcludeKeywords,
    MutedAgency,
    MutedTerm,
}

impl FilterStage {
    pub const STANDARD: [FilterStage; 6] = [
        FilterStage::BaseType,
        FilterStage::Amendment,
        FilterStage::IncludeKeywords,
        FilterStage::ExcludeKeywords,
        FilterStage::MutedAgency,
        FilterStage::MutedTerm,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FilterStage::BaseType => "base_type",
            FilterStage::Amendment => "amendment",
            FilterStage::IncludeKeywords => "include_keywords",
            FilterStage::ExcludeKeywords => "exclude_keywords",
            FilterStage::MutedAgency => "muted_agency",
            FilterStage::MutedTerm => "muted_term",
        }
    }

    pub fn passes(
        &self,
        record: &OpportunityRecord,
        text: &str,
        criteria: &CompiledCriteria,
    ) -> bool {
        match self {
            FilterStage::BaseType => is_base_type(record.notice_type.as_deref()),
            FilterStage::Amendment => !is_amendment_title(record.title.as_deref()),
            FilterStage::IncludeKeywords => criteria.matches_include(text),
            FilterStage::ExcludeKeywords => !criteria.matches_exclude(text),
            FilterStage::MutedAgency => !criteria.agency_muted(record.agency()),
            FilterStage::MutedTerm => !criteria.term_muted(text),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Drop(FilterStage),
}

#[derive(Debug, Clone, Default)]
pub struct FilterReport {
    pub kept: Vec<OpportunityRecord>,
    pub dropped: BTreeMap<FilterStage, usize>,
}

impl FilterReport {
    pub fn dropped_total(&self) -> usize {
        self.dropped.values().sum()
    }
}

/// Ordered predicate chain; evaluation stops at the first failing stage.
#[derive(Debug, Clone)]
pub struct FilterPipeline {
    stages: Vec<FilterStage>,
}

impl Default for FilterPipeline {
    fn default() -> Self {
        Self::standard()
    }
}

impl FilterPipeline {
    pub fn standard() -> Self {
        Self::new(FilterStage::STANDARD.to_vec())
    }

    pub fn new(stages: Vec<FilterStage>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[FilterStage] {
        &self.stages
    }

    pub fn evaluate(&self, record: &OpportunityRecord, criteria: &CompiledCriteria) -> Verdict {
        let text = searchable_text(record);
        self.stages
            .iter()
            .find(|stage| !stage.passes(record, &text, criteria))
            .map_or(Verdict::Keep, |stage| Verdict::Drop(*stage))
    }

    pub fn apply(
        &self,
        records: Vec<OpportunityRecord>,
        criteria: &SearchCriteria,
    ) -> FilterReport {
        let compiled = CompiledCriteria::new(criteria);
        let mut report = FilterReport::default();
        for record in records {
            match self.evaluate(&record, &compiled) {
                Verdict::Keep => report.kept.push(record),
                Verdict::Drop(stage) => *report.dropped.entry(stage).or_default() += 1,
            }
        }
        report
    }
}
