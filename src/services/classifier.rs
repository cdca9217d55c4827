use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::models::verdict::{AddressTask, Verdict, VerificationSource};
use crate::services::ledger::{CreditLedger, Debit, LedgerError};

/// Result of classifying one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Verified { verdict: Verdict, credits_used: i32 },
    /// The ledger refused the debit; the provider was not contacted.
    InsufficientCredits,
}

/// Per-address classification contract.
///
/// One credit is debited before the provider is contacted. A provider failure
/// after that point keeps the credit spent and reports it through
/// [`ClassifyError::credits_used`], so callers can keep their tally equal to
/// the ledger's actual spend.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        task: &AddressTask,
        workspace_id: Uuid,
        source: VerificationSource,
    ) -> Result<Classification, ClassifyError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProviderRequest<'a> {
    email: &'a str,
    workspace_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    lead_id: Option<Uuid>,
    source: VerificationSource,
}

#[derive(Deserialize)]
struct ProviderResponse {
    success: bool,
    result: Option<ProviderResult>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct ProviderResult {
    status: Verdict,
}

/// Client for the external address verification provider.
pub struct HttpClassifier {
    http: Client,
    endpoint: String,
    api_token: String,
    ledger: Arc<dyn CreditLedger>,
}

impl HttpClassifier {
    pub fn new(
        endpoint: &str,
        api_token: &str,
        timeout: Duration,
        ledger: Arc<dyn CreditLedger>,
    ) -> Result<Self, ClassifyError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| ClassifyError::Http {
                source,
                credits_used: 0,
            })?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            api_token: api_token.to_string(),
            ledger,
        })
    }

    async fn call_provider(
        &self,
        task: &AddressTask,
        workspace_id: Uuid,
        source: VerificationSource,
    ) -> Result<Verdict, ClassifyError> {
        let http_err = |source| ClassifyError::Http {
            source,
            credits_used: 1,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_token)
            .json(&ProviderRequest {
                email: &task.email,
                workspace_id,
                lead_id: task.lead_id,
                source,
            })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(http_err)?;

        let body: ProviderResponse = response.json().await.map_err(http_err)?;
        match body {
            ProviderResponse {
                success: true,
                result: Some(result),
                ..
            } => Ok(result.status),
            ProviderResponse { error, .. } => Err(ClassifyError::Provider {
                message: error.unwrap_or_else(|| "provider returned no result".to_string()),
                credits_used: 1,
            }),
        }
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(
        &self,
        task: &AddressTask,
        workspace_id: Uuid,
        source: VerificationSource,
    ) -> Result<Classification, ClassifyError> {
        match self.ledger.debit(workspace_id, 1).await? {
            Debit::Insufficient => return Ok(Classification::InsufficientCredits),
            Debit::Applied { remaining } => {
                tracing::trace!(%workspace_id, remaining, "Credit debited");
            }
        }

        let verdict = self.call_provider(task, workspace_id, source).await?;
        Ok(Classification::Verified {
            verdict,
            credits_used: 1,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("Credit ledger unavailable: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Provider request failed: {source}")]
    Http {
        #[source]
        source: reqwest::Error,
        credits_used: i32,
    },

    #[error("Provider error: {message}")]
    Provider { message: String, credits_used: i32 },
}

impl ClassifyError {
    /// Credits already spent on the address when the error occurred.
    pub fn credits_used(&self) -> i32 {
        match self {
            ClassifyError::Ledger(_) => 0,
            ClassifyError::Http { credits_used, .. } | ClassifyError::Provider { credits_used, .. } => {
                *credits_used
            }
        }
    }
}
