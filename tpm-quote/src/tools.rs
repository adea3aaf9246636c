// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM device access via the `tpm2-tools` command-line utilities.
//!
//! The launcher only needs three operations from the device: PCR extension,
//! PCR reads, and quote generation with the attestation key. Wrapping the
//! command-line tools keeps the crate free of native TSS library
//! dependencies.

use std::{
    io::ErrorKind,
    path::Path,
    process::{Command, Output},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use tempfile::TempDir;
use tracing::info;

use crate::{AkAlgo, PcrSelection, PcrValue, Quoter, TpmQuote};

/// Handle to a TPM device, addressed by a TCTI string.
#[derive(Debug)]
pub struct TpmDevice {
    tcti: String,
    ak_algo: AkAlgo,
    work_dir: Arc<TempDir>,
}

struct ToolOutput {
    success: bool,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl ToolOutput {
    fn from_output(output: Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }

    fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

impl TpmDevice {
    /// Open a TPM device with an optional TCTI string (auto-detect if None).
    pub fn open(tcti: Option<&str>, ak_algo: AkAlgo) -> Result<Self> {
        match tcti {
            Some(t) => Self::new(t, ak_algo),
            None => Self::detect(ak_algo),
        }
    }

    /// Detect and connect to an available TPM device.
    pub fn detect(ak_algo: AkAlgo) -> Result<Self> {
        let tcti = if Path::new("/dev/tpmrm0").exists() {
            "device:/dev/tpmrm0"
        } else if Path::new("/dev/tpm0").exists() {
            "device:/dev/tpm0"
        } else {
            bail!("TPM device not found");
        };
        Self::new(tcti, ak_algo)
    }

    pub fn new(tcti: &str, ak_algo: AkAlgo) -> Result<Self> {
        let work_dir = TempDir::new().context("failed to create TPM work directory")?;
        Ok(Self {
            tcti: tcti.to_string(),
            ak_algo,
            work_dir: Arc::new(work_dir),
        })
    }

    fn work_dir(&self) -> &Path {
        self.work_dir.path()
    }

    fn run_cmd(&self, cmd: &str, args: &[&str]) -> Result<ToolOutput> {
        let mut command = Command::new(cmd);
        command.env("TPM2TOOLS_TCTI", &self.tcti).args(args);
        match command.output() {
            Ok(output) => Ok(ToolOutput::from_output(output)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                bail!("{cmd} not found; is tpm2-tools installed?")
            }
            Err(err) => Err(err).context("failed to run tpm2 command"),
        }
    }

    /// Create the attestation key under the endorsement hierarchy and leave
    /// its context file in the work directory. Returns the context path.
    fn create_ak(&self) -> Result<std::path::PathBuf> {
        let work_dir = self.work_dir();
        let ek_ctx = work_dir.join("ek.ctx");
        let ak_ctx = work_dir.join("ak.ctx");
        let ak_pub = work_dir.join("ak.pub");
        let ek_ctx_str = ek_ctx.to_string_lossy();
        let ak_ctx_str = ak_ctx.to_string_lossy();
        let ak_pub_str = ak_pub.to_string_lossy();
        let algo = self.ak_algo.to_arg();

        let output = self.run_cmd("tpm2_createek", &["-c", &ek_ctx_str, "-G", algo])?;
        if !output.success {
            bail!("tpm2_createek failed: {}", output.stderr_string());
        }

        let output = self.run_cmd(
            "tpm2_createak",
            &[
                "-C",
                &ek_ctx_str,
                "-c",
                &ak_ctx_str,
                "-u",
                &ak_pub_str,
                "-G",
                algo,
                "-g",
                "sha256",
            ],
        )?;
        if !output.success {
            bail!("tpm2_createak failed: {}", output.stderr_string());
        }

        Ok(ak_ctx)
    }
}

impl Quoter for TpmDevice {
    fn quote(&mut self, selection: &PcrSelection, extra_data: &[u8]) -> Result<TpmQuote> {
        let ak_ctx = self.create_ak()?;

        // Read PCR values before generating the quote.
        let pcr_values = self.read_pcrs(selection)?;

        let work_dir = self.work_dir();
        let quote_msg = work_dir.join("quote.msg");
        let quote_sig = work_dir.join("quote.sig");
        let qual_data = work_dir.join("qual_data.bin");
        std::fs::write(&qual_data, extra_data).context("failed to write qualifying data")?;

        let ak_ctx_str = ak_ctx.to_string_lossy();
        let quote_msg_str = quote_msg.to_string_lossy();
        let quote_sig_str = quote_sig.to_string_lossy();
        let qual_data_str = qual_data.to_string_lossy();
        let sel_str = selection.to_arg();

        let output = self.run_cmd(
            "tpm2_quote",
            &[
                "-c",
                &ak_ctx_str,
                "-l",
                &sel_str,
                "-m",
                &quote_msg_str,
                "-s",
                &quote_sig_str,
                "-q",
                &qual_data_str,
            ],
        )?;
        if !output.success {
            bail!("tpm2_quote failed: {}", output.stderr_string());
        }

        let message = std::fs::read(&quote_msg).context("failed to read quote message")?;
        let signature = std::fs::read(&quote_sig).context("failed to read quote signature")?;

        info!("generated TPM quote over {}", sel_str);
        Ok(TpmQuote {
            message,
            signature,
            pcr_values,
            qualifying_data: extra_data.to_vec(),
        })
    }

    fn extend_pcr(&mut self, pcr: u32, digest: &[u8; 32]) -> Result<()> {
        let pcr_arg = format!("{}:sha256={}", pcr, hex::encode(digest));
        let output = self.run_cmd("tpm2_pcrextend", &[&pcr_arg])?;
        if !output.success {
            bail!(
                "tpm2_pcrextend PCR {pcr} failed: {}",
                output.stderr_string()
            );
        }
        Ok(())
    }

    fn read_pcrs(&mut self, selection: &PcrSelection) -> Result<Vec<PcrValue>> {
        let pcr_output = self.work_dir().join("pcr_values.bin");
        let pcr_output_str = pcr_output.to_string_lossy();
        let sel_str = selection.to_arg();

        let output = self.run_cmd("tpm2_pcrread", &["-o", &pcr_output_str, &sel_str])?;
        if !output.success {
            bail!("tpm2_pcrread failed: {}", output.stderr_string());
        }

        // Binary output is the concatenation of the selected PCR values.
        let pcr_data = std::fs::read(&pcr_output).context("failed to read PCR output")?;
        let hash_size = 32;
        let mut pcr_values = Vec::new();
        for (i, pcr_idx) in selection.pcrs.iter().enumerate() {
            let offset = i * hash_size;
            if offset + hash_size > pcr_data.len() {
                bail!(
                    "short PCR read: want {} values, got {} bytes",
                    selection.pcrs.len(),
                    pcr_data.len()
                );
            }
            pcr_values.push(PcrValue {
                index: *pcr_idx,
                algorithm: selection.bank.clone(),
                value: pcr_data[offset..offset + hash_size].to_vec(),
            });
        }
        Ok(pcr_values)
    }
}
