// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Launch policy embedded in image config labels.
//!
//! An image author constrains which parts of the launch the operator may
//! override. Missing labels mean default-deny for the corresponding
//! override.

use std::collections::HashMap;

use thiserror::Error;

use crate::spec::LaunchSpec;

/// Image label: whether the operator may override the command arguments.
pub const ALLOW_CMD_OVERRIDE_LABEL: &str = "tee.launch_policy.allow_cmd_override";
/// Image label: comma-separated env var names the operator may override.
/// A `*` entry allows all names.
pub const ALLOW_ENV_OVERRIDE_LABEL: &str = "tee.launch_policy.allow_env_override";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyViolation {
    #[error("operator Cmd override is not allowed by the image launch policy")]
    CmdOverrideDenied,
    #[error("operator env override {name:?} is not allowed by the image launch policy")]
    EnvOverrideDenied { name: String },
    #[error("malformed launch policy label {label}: {value:?}")]
    MalformedLabel { label: String, value: String },
}

/// Overrides the image permits the operator to make.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchPolicy {
    pub allow_cmd_override: bool,
    allowed_env_names: Vec<String>,
    allow_all_envs: bool,
}

impl LaunchPolicy {
    /// Derive the policy from image config labels. Unrecognized labels are
    /// ignored; a malformed value for a recognized label is an error.
    pub fn from_labels(labels: &HashMap<String, String>) -> Result<Self, PolicyViolation> {
        let mut policy = LaunchPolicy::default();

        if let Some(value) = labels.get(ALLOW_CMD_OVERRIDE_LABEL) {
            policy.allow_cmd_override = match value.trim().to_lowercase().as_str() {
                "true" => true,
                "false" => false,
                _ => {
                    return Err(PolicyViolation::MalformedLabel {
                        label: ALLOW_CMD_OVERRIDE_LABEL.to_string(),
                        value: value.clone(),
                    })
                }
            };
        }

        if let Some(value) = labels.get(ALLOW_ENV_OVERRIDE_LABEL) {
            for name in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                if name == "*" {
                    policy.allow_all_envs = true;
                } else {
                    policy.allowed_env_names.push(name.to_string());
                }
            }
        }

        Ok(policy)
    }

    pub fn env_override_allowed(&self, name: &str) -> bool {
        self.allow_all_envs || self.allowed_env_names.iter().any(|n| n == name)
    }

    /// Check the operator's overrides against this policy.
    pub fn verify(&self, spec: &LaunchSpec) -> Result<(), PolicyViolation> {
        if !spec.cmd.is_empty() && !self.allow_cmd_override {
            return Err(PolicyViolation::CmdOverrideDenied);
        }
        for env in &spec.envs {
            if !self.env_override_allowed(&env.name) {
                return Err(PolicyViolation::EnvOverrideDenied {
                    name: env.name.clone(),
                });
            }
        }
        Ok(())
    }
}
