//! Digest composition and the email sender seam.

use std::sync::Arc;
use std::time::Duration;

use askama::Template;
use async_trait::async_trait;
use beacon_core::OpportunityRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";
pub const DEFAULT_FROM: &str = "onboarding@resend.dev";
pub const DEFAULT_SUBJECT: &str = "Your SAM.gov daily digest";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SendReceipt {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("email provider rejected the message with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("email transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rendering digest: {0}")]
    Render(#[from] askama::Error),
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<SendReceipt, EmailError>;
}

/// Resend HTTP API client.
#[derive(Debug, Clone)]
pub struct ResendSender {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl ResendSender {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, EmailError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            endpoint: RESEND_ENDPOINT.to_string(),
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl EmailSender for ResendSender {
    async fn send(&self, message: &EmailMessage) -> Result<SendReceipt, EmailError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(message)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EmailError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body).unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
pub struct DigestTemplate {
    pub from: String,
    pub subject: String,
    pub base_url: String,
}

impl Default for DigestTemplate {
    fn default() -> Self {
        Self {
            from: DEFAULT_FROM.to_string(),
            subject: DEFAULT_SUBJECT.to_string(),
            base_url: "https://bidbeacon.ai".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    Dry,
    Live,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent { receipt: SendReceipt },
    /// Dry mode: composed and logged, nothing left the process.
    Composed,
}

impl DispatchOutcome {
    pub fn delivered(&self) -> bool {
        matches!(self, DispatchOutcome::Sent { .. })
    }
}

pub struct DigestDispatcher {
    sender: Option<Arc<dyn EmailSender>>,
    template: DigestTemplate,
}

impl DigestDispatcher {
    pub fn dry(template: DigestTemplate) -> Self {
        Self {
            sender: None,
            template,
        }
    }

    pub fn live(sender: Arc<dyn EmailSender>, template: DigestTemplate) -> Self {
        Self {
            sender: Some(sender),
            template,
        }
    }

    pub fn mode(&self) -> DispatchMode {
        if self.sender.is_some() {
            DispatchMode::Live
        } else {
            DispatchMode::Dry
        }
    }

    pub fn compose(
        &self,
        recipient: &str,
        records: &[OpportunityRecord],
    ) -> Result<EmailMessage, EmailError> {
        Ok(EmailMessage {
            from: self.template.from.clone(),
            to: vec![recipient.to_string()],
            subject: self.template.subject.clone(),
            html: render_digest_html(records, &self.template.base_url)?,
        })
    }

    pub async fn dispatch(
        &self,
        recipient: &str,
        records: &[OpportunityRecord],
    ) -> Result<DispatchOutcome, EmailError> {
        let message = self.compose(recipient, records)?;
        match &self.sender {
            None => {
                info!(
                    recipient,
                    notices = records.len(),
                    bytes = message.html.len(),
                    "dry run; digest composed but not sent"
                );
                Ok(DispatchOutcome::Composed)
            }
            Some(sender) => {
                let receipt = sender.send(&message).await?;
                info!(recipient, notices = records.len(), id = ?receipt.id, "digest sent");
                Ok(DispatchOutcome::Sent { receipt })
            }
        }
    }
}

struct DigestItem<'a> {
    title: &'a str,
    link: Option<&'a str>,
    notice_id: &'a str,
    notice_type: Option<&'a str>,
    posted: Option<&'a str>,
    agency: Option<&'a str>,
}

impl<'a> DigestItem<'a> {
    fn new(record: &'a OpportunityRecord) -> Self {
        Self {
            title: record.title.as_deref().unwrap_or("(untitled)"),
            link: record.ui_link.as_deref().filter(|l| !l.is_empty()),
            notice_id: &record.notice_id,
            notice_type: record.notice_type.as_deref(),
            posted: record.posted_date.as_deref(),
            agency: record.agency(),
        }
    }
}

#[derive(Template)]
#[template(path = "digest.html")]
struct DigestEmailHtml<'a> {
    items: Vec<DigestItem<'a>>,
    settings_url: String,
    unsubscribe_url: String,
}

/// Renders the digest body. Every interpolated field is HTML-escaped.
pub fn render_digest_html(
    records: &[OpportunityRecord],
    base_url: &str,
) -> Result<String, askama::Error> {
    let base = base_url.trim_end_matches('/');
    DigestEmailHtml {
        items: records.iter().map(DigestItem::new).collect(),
        settings_url: format!("{base}/settings"),
        unsubscribe_url: format!("{base}/unsubscribe"),
    }
    .render()
}
