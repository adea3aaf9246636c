// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Launcher for a single measured workload container on a trusted VM.
//!
//! The launcher pulls the operator-requested OCI image, checks operator
//! overrides against the policy embedded in the image labels, measures the
//! workload's identifying claims into a canonical event log backed by a TPM
//! PCR, and supervises the container task. While the workload runs, a
//! background refresher keeps a verifiable OIDC token from the remote
//! attestation verifier fresh on a shared mount the workload can read.

pub mod agent;
pub mod docker;
pub mod error;
pub mod image;
pub mod identity;
pub mod policy;
pub mod refresher;
pub mod runner;
pub mod runtime;
pub mod spec;
pub mod verifier;

pub use agent::AttestationAgent;
pub use error::LauncherError;
pub use refresher::TokenRefresher;
pub use runner::{ContainerRunner, RunnerOptions};
pub use spec::LaunchSpec;
pub use verifier::AttestationRequest;
