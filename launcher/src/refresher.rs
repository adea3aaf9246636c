// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Background attestation token refresh.
//!
//! One synchronous refresh runs before the workload starts so the first
//! token is already on disk; after that a background activity refreshes the
//! token shortly before it expires, retrying transient failures with
//! exponential backoff until the run's cancellation token fires.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::AttestationAgent;
use crate::error::LauncherError;

/// Host directory the tokens are written to; bind-mounted read-only into
/// the workload.
pub const HOST_TOKEN_DIR: &str = "/tmp/container_launcher";
/// Token file name inside the token directory.
pub const TOKEN_FILE: &str = "attestation_verifier_claims_token";

/// Multiplier on the token lifetime at which the next refresh runs.
/// REFRESH_MULTIPLIER + REFRESH_JITTER must be < 1 so the refresh always
/// starts before the token expires.
const REFRESH_MULTIPLIER: f64 = 0.8;
/// Random component applied additively to the refresh multiplier.
const REFRESH_JITTER: f64 = 0.1;

/// Exponential backoff for failed refresh attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub randomization_factor: f64,
    pub multiplier: f64,
    pub max_interval: Duration,
    /// Total elapsed time after which retries stop; `None` never stops.
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(60),
            randomization_factor: 0.5,
            multiplier: 2.0,
            max_interval: Duration::from_secs(3600),
            max_elapsed: None,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            current_interval: self.initial_interval,
            elapsed: Duration::ZERO,
        }
    }
}

/// Backoff state for one failure streak.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    current_interval: Duration,
    elapsed: Duration,
}

impl Backoff {
    /// The next randomized pause, drawn from
    /// `current * [1 - randomization_factor, 1 + randomization_factor]`,
    /// or `None` once the maximum elapsed time is exceeded.
    pub fn next_interval(&mut self, random: f64) -> Option<Duration> {
        if let Some(max_elapsed) = self.policy.max_elapsed {
            if self.elapsed >= max_elapsed {
                return None;
            }
        }
        let current = self.current_interval.as_secs_f64();
        let delta = self.policy.randomization_factor * current;
        let interval = Duration::from_secs_f64((current - delta) + random * 2.0 * delta);

        self.elapsed += interval;
        self.current_interval = std::cmp::min(
            Duration::from_secs_f64(current * self.policy.multiplier),
            self.policy.max_interval,
        );
        Some(interval)
    }
}

/// The wait before the next refresh, given the remaining token lifetime and
/// a uniform random draw in `[0, 1)`. Always in `[0.7, 0.9)` of the
/// lifetime, so strictly before expiry.
pub fn next_refresh_delay(lifetime: Duration, random: f64) -> Duration {
    let lifetime = lifetime.as_secs_f64();
    let jitter = REFRESH_JITTER * lifetime;
    let center = REFRESH_MULTIPLIER * lifetime;
    Duration::from_secs_f64((center - jitter) + random * 2.0 * jitter)
}

/// Parse the claims of a JWT without verifying its signature; trust in the
/// token is established by the verifier exchange, not locally.
fn parse_claims(token: &[u8]) -> Result<serde_json::Value> {
    let token = std::str::from_utf8(token).context("token is not UTF-8")?;
    let header = jsonwebtoken::decode_header(token).context("failed to parse token header")?;
    let mut validation = jsonwebtoken::Validation::new(header.alg);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    let data = jsonwebtoken::decode::<serde_json::Value>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(&[]),
        &validation,
    )
    .context("failed to parse token")?;
    Ok(data.claims)
}

/// Refreshes the verifier token and persists it for the workload.
#[derive(Clone)]
pub struct TokenRefresher {
    agent: Arc<AttestationAgent>,
    token_dir: PathBuf,
    retry: RetryPolicy,
}

impl TokenRefresher {
    pub fn new(agent: Arc<AttestationAgent>, token_dir: PathBuf) -> Self {
        Self {
            agent,
            token_dir,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Perform one synchronous refresh, then keep refreshing in the
    /// background until `cancel` fires. The first refresh runs without
    /// backoff: if the verifier is unusable at startup, fail fast.
    pub async fn fetch_and_write(&self, cancel: CancellationToken) -> Result<(), LauncherError> {
        fs_err::create_dir_all(&self.token_dir)
            .and_then(|()| {
                fs_err::set_permissions(
                    &self.token_dir,
                    std::fs::Permissions::from_mode(0o744),
                )
            })
            .map_err(|e| LauncherError::Retryable(e.into()))?;

        let delay = self.refresh_once().await?;

        let refresher = self.clone();
        tokio::spawn(refresher.run_loop(delay, cancel));
        Ok(())
    }

    /// One refresh: attest, validate expiry, persist atomically, and report
    /// how long to wait before the next refresh.
    async fn refresh_once(&self) -> Result<Duration, LauncherError> {
        info!("refreshing attestation verifier OIDC token");
        let token = self
            .agent
            .attest()
            .await
            .map_err(LauncherError::Attestation)?;

        let claims = parse_claims(&token).map_err(LauncherError::Attestation)?;
        let exp = claims
            .get("exp")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| {
                LauncherError::Attestation(anyhow::anyhow!("token has no exp claim"))
            })?;
        let expires_at = UNIX_EPOCH + Duration::from_secs(exp);
        let lifetime = expires_at
            .duration_since(SystemTime::now())
            .map_err(|_| LauncherError::TokenExpired)?;
        if lifetime.is_zero() {
            return Err(LauncherError::TokenExpired);
        }

        self.write_token(&token)
            .map_err(LauncherError::Retryable)?;

        match serde_json::to_string_pretty(&claims) {
            Ok(pretty) => info!("token claims:\n{pretty}"),
            Err(err) => warn!("failed to format token claims: {err}"),
        }

        Ok(next_refresh_delay(lifetime, rand::thread_rng().gen()))
    }

    /// Write the token next to its final path, then rename it into place so
    /// workload readers never observe a torn file.
    fn write_token(&self, token: &[u8]) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.token_dir)
            .context("failed to create token temp file")?;
        tmp.write_all(token).context("failed to write token")?;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))
            .context("failed to set token file mode")?;
        tmp.persist(self.token_dir.join(TOKEN_FILE))
            .context("failed to move token into place")?;
        Ok(())
    }

    async fn run_loop(self, first_delay: Duration, cancel: CancellationToken) {
        let mut delay = first_delay;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("token refreshing stopped");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let mut backoff = self.retry.backoff();
            delay = loop {
                match self.refresh_once().await {
                    Ok(next) => break next,
                    Err(err) => {
                        let Some(pause) = backoff.next_interval(rand::thread_rng().gen()) else {
                            warn!("failed all attempts to refresh attestation token, stopping refresher: {err}");
                            return;
                        };
                        warn!("failed to refresh attestation token, retrying in {pause:?}: {err}");
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                info!("token refreshing stopped");
                                return;
                            }
                            _ = tokio::time::sleep(pause) => {}
                        }
                    }
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_delay_stays_within_bounds() {
        for lifetime_secs in [1u64, 30, 600, 3600, 86400] {
            let lifetime = Duration::from_secs(lifetime_secs);
            for random in [0.0, 0.25, 0.5, 0.75, 0.999_999] {
                let delay = next_refresh_delay(lifetime, random);
                let lower = lifetime.mul_f64(0.7);
                let upper = lifetime.mul_f64(0.9);
                assert!(delay >= lower, "delay {delay:?} below 0.7L for L={lifetime:?}");
                assert!(delay < upper, "delay {delay:?} not below 0.9L for L={lifetime:?}");
                assert!(delay < lifetime);
            }
        }
    }

    #[test]
    fn backoff_follows_the_documented_schedule() {
        // Base intervals double from 60s and clip at 3600s; randomization
        // spreads each draw over [0.5, 1.5] of the base.
        let policy = RetryPolicy::default();
        let mut low = policy.backoff();
        let mut high = policy.backoff();

        let bases = [60u64, 120, 240, 480, 960, 1920, 3600, 3600];
        for base in bases {
            let lo = low.next_interval(0.0).unwrap();
            let hi = high.next_interval(0.999_999).unwrap();
            assert_eq!(lo, Duration::from_secs_f64(base as f64 * 0.5));
            assert!(hi < Duration::from_secs_f64(base as f64 * 1.5));
            assert!(hi >= Duration::from_secs_f64(base as f64 * 1.49));
        }
    }

    #[test]
    fn backoff_is_unbounded_by_default() {
        let mut backoff = RetryPolicy::default().backoff();
        for _ in 0..1000 {
            assert!(backoff.next_interval(0.5).is_some());
        }
    }

    #[test]
    fn backoff_stops_after_max_elapsed() {
        let policy = RetryPolicy {
            initial_interval: Duration::from_secs(10),
            max_elapsed: Some(Duration::from_secs(15)),
            ..Default::default()
        };
        let mut backoff = policy.backoff();
        assert!(backoff.next_interval(1.0).is_some());
        assert!(backoff.next_interval(1.0).is_none());
    }

    #[test]
    fn parse_claims_reads_exp_without_a_valid_signature() {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;

        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let claims = URL_SAFE_NO_PAD.encode(br#"{"exp":1893456000,"aud":"verifier"}"#);
        let token = format!("{header}.{claims}.bm90LWEtc2lnbmF0dXJl");

        let parsed = parse_claims(token.as_bytes()).unwrap();
        assert_eq!(parsed.get("exp").and_then(|v| v.as_u64()), Some(1893456000));
    }

    #[test]
    fn parse_claims_rejects_garbage() {
        assert!(parse_claims(b"not-a-jwt").is_err());
    }
}
