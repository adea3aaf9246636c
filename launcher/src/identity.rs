// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Principal identity tokens for the attestation exchange.
//!
//! Every attestation request carries the instance's own identity token plus
//! one impersonated token per configured service account, all bound to the
//! verifier-issued audience. Fetching is injected into the attestation agent
//! as a capability so the agent stays testable without the metadata service.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

/// GCE metadata service base URL.
pub const METADATA_BASE_URL: &str = "http://metadata.google.internal/computeMetadata/v1";
/// IAM credentials API base URL for impersonated tokens.
pub const IAM_CREDENTIALS_BASE_URL: &str = "https://iamcredentials.googleapis.com";

/// Capability for fetching principal identity tokens bound to an audience.
#[async_trait]
pub trait PrincipalFetcher: Send + Sync {
    /// One instance identity token plus one impersonated token per
    /// configured service account. Fetching is sequential; the first
    /// failure aborts the attestation attempt.
    async fn fetch(&self, audience: &str) -> Result<Vec<Vec<u8>>>;
}

/// Source of OAuth2 access tokens for authenticated API calls.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn token(&self) -> Result<String>;
}

/// Access tokens of the VM's default service account, from the metadata
/// service.
pub struct MetadataTokenSource {
    http: reqwest::Client,
    base_url: String,
}

impl MetadataTokenSource {
    pub fn new() -> Self {
        Self::with_base_url(METADATA_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl Default for MetadataTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct AccessTokenResponse {
    access_token: String,
}

#[async_trait]
impl AccessTokenSource for MetadataTokenSource {
    async fn token(&self) -> Result<String> {
        let url = format!(
            "{}/instance/service-accounts/default/token",
            self.base_url
        );
        let response = self
            .http
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .context("failed to reach metadata server")?
            .error_for_status()
            .context("metadata server refused the token request")?;
        let token: AccessTokenResponse = response
            .json()
            .await
            .context("malformed access token response")?;
        Ok(token.access_token)
    }
}

/// Principal fetcher backed by the metadata service and the IAM credentials
/// API.
pub struct GcePrincipalFetcher {
    http: reqwest::Client,
    metadata_base_url: String,
    iam_base_url: String,
    impersonate_service_accounts: Vec<String>,
    token_source: std::sync::Arc<dyn AccessTokenSource>,
}

impl GcePrincipalFetcher {
    pub fn new(
        impersonate_service_accounts: Vec<String>,
        token_source: std::sync::Arc<dyn AccessTokenSource>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            metadata_base_url: METADATA_BASE_URL.to_string(),
            iam_base_url: IAM_CREDENTIALS_BASE_URL.to_string(),
            impersonate_service_accounts,
            token_source,
        }
    }

    async fn instance_identity_token(&self, audience: &str) -> Result<Vec<u8>> {
        let url = format!(
            "{}/instance/service-accounts/default/identity",
            self.metadata_base_url
        );
        let response = self
            .http
            .get(&url)
            .query(&[("audience", audience), ("format", "full")])
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .context("failed to reach metadata server")?
            .error_for_status()
            .context("metadata server refused the identity request")?;
        let token = response
            .text()
            .await
            .context("malformed identity token response")?;
        Ok(token.into_bytes())
    }

    async fn impersonated_token(&self, service_account: &str, audience: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        #[serde(rename_all = "camelCase")]
        struct GenerateIdTokenRequest<'a> {
            audience: &'a str,
            include_email: bool,
        }

        #[derive(Deserialize)]
        struct GenerateIdTokenResponse {
            token: String,
        }

        let bearer = self.token_source.token().await?;
        let url = format!(
            "{}/v1/projects/-/serviceAccounts/{}:generateIdToken",
            self.iam_base_url, service_account
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(bearer)
            .json(&GenerateIdTokenRequest {
                audience,
                include_email: true,
            })
            .send()
            .await
            .context("failed to reach IAM credentials API")?
            .error_for_status()
            .with_context(|| format!("cannot impersonate {service_account}"))?;
        let token: GenerateIdTokenResponse = response
            .json()
            .await
            .context("malformed impersonated token response")?;
        Ok(token.token.into_bytes())
    }
}

#[async_trait]
impl PrincipalFetcher for GcePrincipalFetcher {
    async fn fetch(&self, audience: &str) -> Result<Vec<Vec<u8>>> {
        let mut tokens = vec![self.instance_identity_token(audience).await?];
        for service_account in &self.impersonate_service_accounts {
            debug!("fetching impersonated token for {service_account}");
            let token = self
                .impersonated_token(service_account, audience)
                .await
                .with_context(|| {
                    format!("failed to get impersonated token for {service_account}")
                })?;
            tokens.push(token);
        }
        Ok(tokens)
    }
}
