// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Client for the remote attestation verifier.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tpm_quote::TpmQuote;
use tracing::debug;

use crate::identity::AccessTokenSource;

/// The well-known confidential-computing verifier endpoint.
pub const DEFAULT_VERIFIER_ENDPOINT: &str = "https://confidentialcomputing.googleapis.com";

/// A verifier-issued challenge binding the attestation exchange.
#[derive(Debug, Clone)]
pub struct Challenge {
    /// Resource name; doubles as the audience of the minted token.
    pub name: String,
    /// Nonce to quote over.
    pub nonce: Vec<u8>,
}

/// Everything the verifier needs to appraise this machine and workload.
#[derive(Debug, Clone)]
pub struct AttestationRequest {
    pub challenge: Challenge,
    pub quote: TpmQuote,
    /// Serialized canonical event log of the workload claims.
    pub canonical_event_log: Vec<u8>,
    /// Principal identity tokens bound to the challenge audience.
    pub principal_id_tokens: Vec<Vec<u8>>,
}

#[derive(Debug, Error)]
pub enum VerifierError {
    /// The verifier could not be reached; worth retrying.
    #[error("attestation service transport failure")]
    Transport(#[source] anyhow::Error),
    /// The verifier rejected the request; permanent.
    #[error("attestation service rejected the request: {status} {message}")]
    Rejected { status: u16, message: String },
    /// The verifier answered with something unusable; permanent.
    #[error("malformed attestation service response")]
    Malformed(#[source] anyhow::Error),
}

impl VerifierError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

#[async_trait]
pub trait VerifierClient: Send + Sync {
    async fn create_challenge(&self) -> Result<Challenge, VerifierError>;

    /// Transport the attestation request; returns the signed JWT bytes
    /// unchanged.
    async fn verify_attestation(
        &self,
        request: AttestationRequest,
    ) -> Result<Vec<u8>, VerifierError>;
}

/// REST client for the verifier.
pub struct RestVerifierClient {
    http: reqwest::Client,
    endpoint: String,
    project_id: String,
    region: String,
    token_source: std::sync::Arc<dyn AccessTokenSource>,
}

impl RestVerifierClient {
    /// An empty `endpoint` selects the default verifier.
    pub fn new(
        endpoint: &str,
        project_id: &str,
        region: &str,
        token_source: std::sync::Arc<dyn AccessTokenSource>,
    ) -> Self {
        let endpoint = if endpoint.is_empty() {
            DEFAULT_VERIFIER_ENDPOINT
        } else {
            endpoint
        };
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            project_id: project_id.to_string(),
            region: region.to_string(),
            token_source,
        }
    }

    async fn post(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, VerifierError> {
        let bearer = self
            .token_source
            .token()
            .await
            .map_err(VerifierError::Transport)?;
        let response = self
            .http
            .post(url)
            .bearer_auth(bearer)
            .json(&body)
            .send()
            .await
            .map_err(|e| VerifierError::Transport(e.into()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(VerifierError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json()
            .await
            .map_err(|e| VerifierError::Malformed(e.into()))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChallengeResponse {
    name: String,
    tpm_nonce: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyAttestationBody {
    gcp_credentials: GcpCredentials,
    tpm_attestation: TpmAttestationBody,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GcpCredentials {
    id_tokens: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TpmAttestationBody {
    quotes: Vec<QuoteBody>,
    canonical_event_log: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QuoteBody {
    hash_algo: String,
    quote: String,
    raw_sig: String,
    pcrs: BTreeMap<u32, String>,
}

impl From<&TpmQuote> for QuoteBody {
    fn from(quote: &TpmQuote) -> Self {
        let bank = quote
            .pcr_values
            .first()
            .map(|p| p.algorithm.clone())
            .unwrap_or_else(|| "sha256".to_string());
        Self {
            hash_algo: bank,
            quote: BASE64.encode(&quote.message),
            raw_sig: BASE64.encode(&quote.signature),
            pcrs: quote
                .pcr_values
                .iter()
                .map(|p| (p.index, BASE64.encode(&p.value)))
                .collect(),
        }
    }
}

#[async_trait]
impl VerifierClient for RestVerifierClient {
    async fn create_challenge(&self) -> Result<Challenge, VerifierError> {
        let url = format!(
            "{}/v1/projects/{}/locations/{}/challenges",
            self.endpoint, self.project_id, self.region
        );
        let value = self.post(&url, serde_json::json!({})).await?;
        let response: ChallengeResponse =
            serde_json::from_value(value).map_err(|e| VerifierError::Malformed(e.into()))?;
        let nonce = BASE64
            .decode(&response.tpm_nonce)
            .map_err(|e| VerifierError::Malformed(e.into()))?;
        debug!("created attestation challenge {}", response.name);
        Ok(Challenge {
            name: response.name,
            nonce,
        })
    }

    async fn verify_attestation(
        &self,
        request: AttestationRequest,
    ) -> Result<Vec<u8>, VerifierError> {
        let body = VerifyAttestationBody {
            gcp_credentials: GcpCredentials {
                id_tokens: request
                    .principal_id_tokens
                    .iter()
                    .map(|t| String::from_utf8_lossy(t).into_owned())
                    .collect(),
            },
            tpm_attestation: TpmAttestationBody {
                quotes: vec![QuoteBody::from(&request.quote)],
                canonical_event_log: BASE64.encode(&request.canonical_event_log),
            },
        };

        let url = format!("{}/v1/{}:verifyAttestation", self.endpoint, request.challenge.name);
        let body = serde_json::to_value(body).map_err(|e| VerifierError::Malformed(e.into()))?;
        let value = self.post(&url, body).await?;

        let token = value
            .get("oidcClaimsToken")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                VerifierError::Malformed(anyhow::anyhow!("response has no oidcClaimsToken"))
            })?;
        Ok(token.as_bytes().to_vec())
    }
}
