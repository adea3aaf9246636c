// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Attestation agent: measures workload claims and exchanges quotes for
//! verifier tokens.

use std::sync::Mutex;

use anyhow::{Context, Result};
use cos_eventlog::{CosEvent, EventLog, COS_EVENT_PCR};
use tpm_quote::{PcrSelection, Quoter};
use tracing::debug;

use crate::verifier::{AttestationRequest, VerifierClient};
use crate::identity::PrincipalFetcher;

pub use crate::verifier::Challenge;

/// Assembles quote + event log + principal tokens into attestation requests.
///
/// The agent is the only holder of the TPM handle. The event log and the
/// quoter are mutated during measurement; after the launch separator event
/// both are only read.
pub struct AttestationAgent {
    quoter: Mutex<Box<dyn Quoter>>,
    verifier: Box<dyn VerifierClient>,
    principals: Box<dyn PrincipalFetcher>,
    event_log: Mutex<EventLog>,
}

impl AttestationAgent {
    pub fn new(
        quoter: Box<dyn Quoter>,
        verifier: Box<dyn VerifierClient>,
        principals: Box<dyn PrincipalFetcher>,
    ) -> Self {
        Self {
            quoter: Mutex::new(quoter),
            verifier,
            principals,
            event_log: Mutex::new(EventLog::new()),
        }
    }

    /// Measure one event: append it to the canonical event log and extend
    /// the measurement PCR with its digest. A TPM IO failure here is fatal
    /// for the current run.
    pub fn measure_event(&self, event: CosEvent) -> Result<()> {
        let digest = self
            .event_log
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?
            .append(COS_EVENT_PCR, event);
        self.quoter
            .lock()
            .map_err(|_| anyhow::anyhow!("quoter lock poisoned"))?
            .extend_pcr(COS_EVENT_PCR, &digest)
            .context("failed to extend measurement PCR")
    }

    /// Request a fresh token from the verifier: create a challenge, gather
    /// principal tokens bound to it, quote over the challenge nonce, and
    /// post the assembled request. Returns the verifier's bytes unchanged.
    pub async fn attest(&self) -> Result<Vec<u8>> {
        let challenge = self
            .verifier
            .create_challenge()
            .await
            .context("failed to create attestation challenge")?;

        let principal_id_tokens = self
            .principals
            .fetch(&challenge.name)
            .await
            .context("failed to get principal tokens")?;

        let (quote, canonical_event_log) = {
            let mut quoter = self
                .quoter
                .lock()
                .map_err(|_| anyhow::anyhow!("quoter lock poisoned"))?;
            let quote = quoter
                .quote(&PcrSelection::full_sha256(), &challenge.nonce)
                .context("failed to generate TPM quote")?;
            let log = self
                .event_log
                .lock()
                .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
            (quote, log.encode())
        };
        debug!(
            "attesting with {} principal tokens and {} event log bytes",
            principal_id_tokens.len(),
            canonical_event_log.len()
        );

        let token = self
            .verifier
            .verify_attestation(AttestationRequest {
                challenge,
                quote,
                canonical_event_log,
                principal_id_tokens,
            })
            .await
            .context("attestation verifier request failed")?;
        Ok(token)
    }
}
