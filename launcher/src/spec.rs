// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Operator-provided launch configuration.
//!
//! A launch spec arrives as a flat map of VM metadata attributes. Recognized
//! keys are listed below; unrecognized keys are ignored so that unrelated
//! instance attributes do not break the launch.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

const IMAGE_REF_KEY: &str = "tee-image-reference";
const RESTART_POLICY_KEY: &str = "tee-restart-policy";
const CMD_KEY: &str = "tee-cmd";
const ENV_KEY_PREFIX: &str = "tee-env-";
const IMPERSONATE_KEY: &str = "tee-impersonate-service-accounts";
const ATTESTATION_SERVICE_KEY: &str = "tee-attestation-service-endpoint";
const LOG_REDIRECT_KEY: &str = "tee-container-log-redirect";

/// What to do when the workload exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    Never,
    OnFailure,
    Always,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::OnFailure => "on-failure",
            Self::Always => "always",
        }
    }
}

impl FromStr for RestartPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "never" => Ok(Self::Never),
            "on-failure" => Ok(Self::OnFailure),
            "always" => Ok(Self::Always),
            other => bail!("invalid restart policy: {other}"),
        }
    }
}

/// An operator environment variable override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Operator-provided run configuration.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub image_ref: String,
    pub cmd: Vec<String>,
    pub envs: Vec<EnvVar>,
    pub restart_policy: RestartPolicy,
    pub impersonate_service_accounts: Vec<String>,
    /// Verifier endpoint override; empty means the default endpoint.
    pub attestation_service_addr: String,
    pub project_id: String,
    pub region: String,
    pub log_redirect: bool,
    /// Memoized registry credential (an OAuth2 access token), if any.
    pub registry_token: Option<String>,
}

impl LaunchSpec {
    /// Build a spec from the VM metadata attribute map.
    pub fn from_attributes(attrs: &HashMap<String, String>) -> Result<Self> {
        let mut spec = LaunchSpec::default();

        // Env attributes are keyed individually; collect them in name order
        // so the override sequence is deterministic.
        let mut envs = BTreeMap::new();

        for (key, value) in attrs {
            match key.as_str() {
                IMAGE_REF_KEY => spec.image_ref = value.clone(),
                RESTART_POLICY_KEY => {
                    spec.restart_policy = value.parse().context("bad restart policy attribute")?
                }
                CMD_KEY => {
                    spec.cmd = serde_json::from_str(value)
                        .context("Cmd override must be a JSON string array")?
                }
                IMPERSONATE_KEY => {
                    spec.impersonate_service_accounts = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                }
                ATTESTATION_SERVICE_KEY => spec.attestation_service_addr = value.clone(),
                LOG_REDIRECT_KEY => {
                    spec.log_redirect = value
                        .parse()
                        .context("log redirect attribute must be a bool")?
                }
                _ if key.starts_with(ENV_KEY_PREFIX) => {
                    let name = &key[ENV_KEY_PREFIX.len()..];
                    if name.is_empty() {
                        bail!("env var name must not be empty");
                    }
                    if name.contains('=') {
                        bail!("env var name {name:?} must not contain '='");
                    }
                    envs.insert(name.to_string(), value.clone());
                }
                // Unrecognized attributes are ignored.
                _ => {}
            }
        }

        spec.envs = envs
            .into_iter()
            .map(|(name, value)| EnvVar { name, value })
            .collect();

        if spec.image_ref.is_empty() {
            bail!("missing required attribute {IMAGE_REF_KEY}");
        }
        Ok(spec)
    }

    /// Build a spec from a JSON-encoded attribute map.
    pub fn from_json(json: &str) -> Result<Self> {
        let attrs: HashMap<String, String> =
            serde_json::from_str(json).context("launch spec must be a JSON string map")?;
        Self::from_attributes(&attrs)
    }
}
