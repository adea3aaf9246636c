// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the launcher.
//!
//! The outer supervisor branches on the error kind: `Retryable` failures may
//! be answered by re-invoking the whole run, everything else is permanent
//! for this launch spec and image.

use thiserror::Error;

use crate::{image::ImageError, policy::PolicyViolation};

#[derive(Debug, Error)]
pub enum LauncherError {
    /// Transient infrastructure failure (image pull, hostname lookup,
    /// container or task operations). The run may be retried as a whole.
    #[error("retryable failure: {0}")]
    Retryable(#[source] anyhow::Error),

    /// The launch spec itself is malformed.
    #[error("invalid launch spec")]
    Spec(#[source] anyhow::Error),

    /// The operator supplied an override the image forbids.
    #[error(transparent)]
    PolicyViolation(#[from] PolicyViolation),

    /// The image config is unreadable or its media type unsupported.
    #[error(transparent)]
    Image(#[from] ImageError),

    /// The image has no entrypoint for a Cmd override to extend.
    #[error("image has no entrypoint: generated args length {args} is not longer than the Cmd override length {cmd}")]
    EntrypointMissing { args: usize, cmd: usize },

    /// Attestation failed: TPM IO, principal token fetching, or the verifier
    /// exchange. Retried with backoff inside the refresher; fatal only when
    /// the initial synchronous refresh fails.
    #[error("attestation failure: {0}")]
    Attestation(#[source] anyhow::Error),

    /// The verifier returned a token that is already expired.
    #[error("attestation token is already expired")]
    TokenExpired,

    /// The workload task exited non-zero.
    #[error("workload exited with code {code}")]
    Workload { code: i64 },
}

impl LauncherError {
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(err.into())
    }

    /// Whether the outer supervisor may re-invoke the run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// The workload exit code, when the workload itself failed.
    pub fn workload_exit_code(&self) -> Option<i64> {
        match self {
            Self::Workload { code } => Some(*code),
            _ => None,
        }
    }
}
