// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Canonical Event Log (CEL) for measured container workloads.
//!
//! Workload claims (image reference, digest, args, env vars, operator
//! overrides) are appended to an ordered log of typed records. Each append
//! produces a canonical byte form whose SHA-256 digest is extended into a
//! dedicated PCR, so that replaying the log from zero reproduces the PCR
//! value presented in a TPM quote.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_human_bytes as hex_bytes;
use sha2::{Digest, Sha256};

/// PCR the workload claims are measured into.
pub const COS_EVENT_PCR: u32 = 13;

/// CEL field types (CEL spec 5.1).
const RECNUM_TYPE: u8 = 0;
const PCR_TYPE: u8 = 1;
const DIGESTS_TYPE: u8 = 3;
/// Content type for container launch events.
const COS_CONTENT_TYPE: u8 = 80;
/// TPM_ALG_SHA256, used as the digest TLV type.
const TPM_ALG_SHA256: u8 = 0x0b;

/// Typed container launch events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CosEventType {
    ImageRef = 0,
    ImageDigest = 1,
    RestartPolicy = 2,
    ImageId = 3,
    EnvVar = 4,
    Arg = 5,
    OverrideEnv = 6,
    OverrideArg = 7,
    LaunchSeparator = 8,
}

impl TryFrom<u8> for CosEventType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::ImageRef,
            1 => Self::ImageDigest,
            2 => Self::RestartPolicy,
            3 => Self::ImageId,
            4 => Self::EnvVar,
            5 => Self::Arg,
            6 => Self::OverrideEnv,
            7 => Self::OverrideArg,
            8 => Self::LaunchSeparator,
            other => bail!("unknown COS event type {other}"),
        })
    }
}

/// A single workload claim: an event type plus its content bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CosEvent {
    pub event_type: CosEventType,
    #[serde(with = "hex_bytes")]
    pub content: Vec<u8>,
}

impl CosEvent {
    pub fn new(event_type: CosEventType, content: impl Into<Vec<u8>>) -> Self {
        Self {
            event_type,
            content: content.into(),
        }
    }

    /// The "measurements complete, workload about to start" marker.
    pub fn launch_separator() -> Self {
        Self::new(CosEventType::LaunchSeparator, Vec::new())
    }

    /// Canonical byte form of the event: a TLV with the event type as the
    /// type byte. This is what gets hashed into the PCR.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        encode_tlv(self.event_type as u8, &self.content)
    }

    /// SHA-256 digest of the canonical form.
    pub fn sha256_digest(&self) -> [u8; 32] {
        Sha256::digest(self.canonical_bytes()).into()
    }
}

/// One CEL record: sequence number, target PCR, digest, and content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub recnum: u64,
    pub pcr: u32,
    #[serde(with = "hex_bytes")]
    pub digest: Vec<u8>,
    pub event: CosEvent,
}

/// An ordered, append-only event log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLog {
    records: Vec<Record>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event measured into `pcr`, assigning the next sequence
    /// number. Returns the digest the caller must extend the PCR with.
    pub fn append(&mut self, pcr: u32, event: CosEvent) -> [u8; 32] {
        let digest = event.sha256_digest();
        self.records.push(Record {
            recnum: self.records.len() as u64,
            pcr,
            digest: digest.to_vec(),
            event,
        });
        digest
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Serialize the whole log into its canonical byte stream.
    ///
    /// Each record is a TLV sequence: recnum (8 bytes BE), PCR index
    /// (1 byte), nested digest TLVs, then the content TLV wrapping the
    /// event's canonical form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for record in &self.records {
            out.extend(encode_tlv(RECNUM_TYPE, &record.recnum.to_be_bytes()));
            out.extend(encode_tlv(PCR_TYPE, &[record.pcr as u8]));
            let digests = encode_tlv(TPM_ALG_SHA256, &record.digest);
            out.extend(encode_tlv(DIGESTS_TYPE, &digests));
            out.extend(encode_tlv(COS_CONTENT_TYPE, &record.event.canonical_bytes()));
        }
        out
    }

    /// Decode a canonical byte stream back into a log.
    pub fn decode(mut input: &[u8]) -> Result<Self> {
        let mut records = Vec::new();
        while !input.is_empty() {
            let (ty, value, rest) = decode_tlv(input).context("truncated CEL record")?;
            if ty != RECNUM_TYPE {
                bail!("expected recnum field, got type {ty}");
            }
            let recnum = u64::from_be_bytes(
                value
                    .try_into()
                    .ok()
                    .context("recnum field must be 8 bytes")?,
            );

            let (ty, value, rest) = decode_tlv(rest).context("missing PCR field")?;
            if ty != PCR_TYPE || value.len() != 1 {
                bail!("malformed PCR field");
            }
            let pcr = value[0] as u32;

            let (ty, value, rest) = decode_tlv(rest).context("missing digests field")?;
            if ty != DIGESTS_TYPE {
                bail!("expected digests field, got type {ty}");
            }
            let (alg, digest, trailing) = decode_tlv(value).context("missing digest entry")?;
            if alg != TPM_ALG_SHA256 || !trailing.is_empty() {
                bail!("expected a single SHA-256 digest");
            }

            let (ty, value, rest) = decode_tlv(rest).context("missing content field")?;
            if ty != COS_CONTENT_TYPE {
                bail!("expected COS content field, got type {ty}");
            }
            let (event_type, content, trailing) =
                decode_tlv(value).context("missing event TLV")?;
            if !trailing.is_empty() {
                bail!("trailing bytes after event content");
            }

            records.push(Record {
                recnum,
                pcr,
                digest: digest.to_vec(),
                event: CosEvent::new(CosEventType::try_from(event_type)?, content),
            });
            input = rest;
        }
        Ok(Self { records })
    }

    /// Replay the log from a zeroed PCR: PCR ← H(PCR || digest) per record.
    /// The result must equal the live PCR value for a log that has not been
    /// tampered with.
    pub fn replay(&self) -> [u8; 32] {
        let mut pcr = [0u8; 32];
        for record in &self.records {
            let mut hasher = Sha256::new();
            hasher.update(pcr);
            hasher.update(&record.digest);
            pcr = hasher.finalize().into();
        }
        pcr
    }
}

/// Format an environment variable into the `KEY=VALUE` OCI form.
///
/// The name must be non-empty and must not contain `=`.
pub fn format_env_var(name: &str, value: &str) -> Result<String> {
    if name.is_empty() {
        bail!("env var name must not be empty");
    }
    if name.contains('=') {
        bail!("env var name {name:?} must not contain '='");
    }
    Ok(format!("{name}={value}"))
}

fn encode_tlv(ty: u8, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + value.len());
    out.push(ty);
    out.extend((value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
    out
}

fn decode_tlv(input: &[u8]) -> Result<(u8, &[u8], &[u8])> {
    if input.len() < 5 {
        bail!("TLV header truncated");
    }
    let ty = input[0];
    let len = u32::from_be_bytes(input[1..5].try_into().expect("4 bytes")) as usize;
    let rest = &input[5..];
    if rest.len() < len {
        bail!("TLV value truncated: want {len} bytes, have {}", rest.len());
    }
    Ok((ty, &rest[..len], &rest[len..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_over_canonical_form() {
        let event = CosEvent::new(CosEventType::ImageRef, b"gcr.io/x/app:latest".to_vec());
        let mut expected = vec![0u8, 0, 0, 0, 19];
        expected.extend_from_slice(b"gcr.io/x/app:latest");
        assert_eq!(event.canonical_bytes(), expected);
        assert_eq!(
            event.sha256_digest().to_vec(),
            Sha256::digest(&expected).to_vec()
        );
    }

    #[test]
    fn append_assigns_sequential_recnums() {
        let mut log = EventLog::new();
        log.append(COS_EVENT_PCR, CosEvent::new(CosEventType::Arg, b"./run".to_vec()));
        log.append(COS_EVENT_PCR, CosEvent::new(CosEventType::Arg, b"--flag".to_vec()));
        log.append(COS_EVENT_PCR, CosEvent::launch_separator());
        let recnums: Vec<u64> = log.records().iter().map(|r| r.recnum).collect();
        assert_eq!(recnums, vec![0, 1, 2]);
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut log = EventLog::new();
        log.append(
            COS_EVENT_PCR,
            CosEvent::new(CosEventType::ImageRef, b"docker.io/library/nginx".to_vec()),
        );
        log.append(
            COS_EVENT_PCR,
            CosEvent::new(CosEventType::EnvVar, b"PATH=/usr/bin".to_vec()),
        );
        log.append(COS_EVENT_PCR, CosEvent::launch_separator());

        let decoded = EventLog::decode(&log.encode()).unwrap();
        assert_eq!(decoded, log);
    }

    #[test]
    fn decode_rejects_truncated_stream() {
        let mut log = EventLog::new();
        log.append(COS_EVENT_PCR, CosEvent::launch_separator());
        let bytes = log.encode();
        assert!(EventLog::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn replay_folds_digests_in_order() {
        let mut log = EventLog::new();
        let d1 = log.append(COS_EVENT_PCR, CosEvent::new(CosEventType::Arg, b"a".to_vec()));
        let d2 = log.append(COS_EVENT_PCR, CosEvent::new(CosEventType::Arg, b"b".to_vec()));

        let mut pcr = [0u8; 32];
        for d in [d1, d2] {
            let mut hasher = Sha256::new();
            hasher.update(pcr);
            hasher.update(d);
            pcr = hasher.finalize().into();
        }
        assert_eq!(log.replay(), pcr);
    }

    #[test]
    fn replay_of_empty_log_is_zero() {
        assert_eq!(EventLog::new().replay(), [0u8; 32]);
    }

    #[test]
    fn format_env_var_validates_name() {
        assert_eq!(format_env_var("FOO", "bar").unwrap(), "FOO=bar");
        assert_eq!(format_env_var("FOO", "").unwrap(), "FOO=");
        assert!(format_env_var("", "bar").is_err());
        assert!(format_env_var("FOO=BAR", "baz").is_err());
    }
}
