// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 quoting for attested workloads.
//!
//! This crate defines the data model for TPM quotes, the [`Quoter`] seam the
//! launcher drives the TPM device through, and a pure Rust implementation of
//! quote verification. Quote generation on a real device is provided by the
//! [`tools`] module, which wraps the `tpm2-tools` command-line utilities.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_human_bytes as hex_bytes;

pub mod tools;
pub mod verify;

pub use tools::TpmDevice;
pub use verify::{verify_quote, AkPublicKey};

/// Structured TPM quote containing all verification materials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TpmQuote {
    /// TPM quote message (TPMS_ATTEST structure)
    #[serde(with = "hex_bytes")]
    pub message: Vec<u8>,
    /// Quote signature by the Attestation Key (TPMT_SIGNATURE structure)
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
    /// PCR values at the time of quote generation
    pub pcr_values: Vec<PcrValue>,
    /// Qualifying data (nonce) used in the quote
    #[serde(with = "hex_bytes")]
    pub qualifying_data: Vec<u8>,
}

/// PCR value for a specific PCR register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcrValue {
    /// PCR index
    pub index: u32,
    /// Hash algorithm (e.g., "sha256")
    pub algorithm: String,
    /// PCR value (hash)
    #[serde(with = "hex_bytes")]
    pub value: Vec<u8>,
}

/// PCR selection for quoting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcrSelection {
    pub bank: String,
    pub pcrs: Vec<u32>,
}

impl PcrSelection {
    pub fn new(bank: &str, pcrs: &[u32]) -> Self {
        Self {
            bank: bank.to_string(),
            pcrs: pcrs.to_vec(),
        }
    }

    pub fn sha256(pcrs: &[u32]) -> Self {
        Self::new("sha256", pcrs)
    }

    /// The full SHA-256 bank, the selection attestation quotes are taken
    /// over. Always includes the workload measurement PCR.
    pub fn full_sha256() -> Self {
        Self::sha256(&(0..24).collect::<Vec<u32>>())
    }

    pub fn contains(&self, pcr: u32) -> bool {
        self.pcrs.contains(&pcr)
    }

    /// Render as a `bank:pcr,pcr,...` argument for tpm2-tools.
    pub fn to_arg(&self) -> String {
        let pcr_list: Vec<String> = self.pcrs.iter().map(|p| p.to_string()).collect();
        format!("{}:{}", self.bank, pcr_list.join(","))
    }
}

impl Default for PcrSelection {
    fn default() -> Self {
        Self::full_sha256()
    }
}

/// Attestation key algorithm selector.
///
/// On GCE vTPMs a pre-provisioned AK certificate is stored in NV; the
/// indices below come from the platform's fixed layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AkAlgo {
    /// ECC P-256 AK (the default for attestation)
    #[default]
    Ecc,
    /// RSA 2048 AK
    Rsa,
}

impl AkAlgo {
    /// NV index holding the AK certificate (DER).
    pub fn cert_nv_index(&self) -> u32 {
        match self {
            Self::Rsa => 0x01c10000,
            Self::Ecc => 0x01c10002,
        }
    }

    /// NV index holding the AK template (TPM2B_PUBLIC).
    pub fn template_nv_index(&self) -> u32 {
        match self {
            Self::Rsa => 0x01c10001,
            Self::Ecc => 0x01c10003,
        }
    }

    /// Key algorithm argument for tpm2-tools.
    pub fn to_arg(&self) -> &'static str {
        match self {
            Self::Ecc => "ecc",
            Self::Rsa => "rsa",
        }
    }
}

/// Seam for the TPM device. A quoter is a single-owner resource: it must not
/// be shared across activities without external serialization.
pub trait Quoter: Send {
    /// Generate a quote over `selection` with `extra_data` as the qualifying
    /// data. The returned quote carries the raw PCR values of the selection.
    fn quote(&mut self, selection: &PcrSelection, extra_data: &[u8]) -> Result<TpmQuote>;

    /// Extend a PCR in the SHA-256 bank with a digest.
    fn extend_pcr(&mut self, pcr: u32, digest: &[u8; 32]) -> Result<()>;

    /// Read the current PCR values for a selection.
    fn read_pcrs(&mut self, selection: &PcrSelection) -> Result<Vec<PcrValue>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcr_selection_to_arg() {
        let sel = PcrSelection::sha256(&[0, 1, 2, 13]);
        assert_eq!(sel.to_arg(), "sha256:0,1,2,13");
    }

    #[test]
    fn full_selection_covers_measurement_pcr() {
        let sel = PcrSelection::full_sha256();
        assert_eq!(sel.pcrs.len(), 24);
        assert!(sel.contains(13));
    }

    #[test]
    fn ak_nv_indices() {
        assert_eq!(AkAlgo::Ecc.cert_nv_index(), 0x01c10002);
        assert_eq!(AkAlgo::Rsa.cert_nv_index(), 0x01c10000);
        assert_eq!(AkAlgo::default().to_arg(), "ecc");
    }
}
