// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM quote verification.
//!
//! Validates that a quote was generated by a trusted attestation key over
//! the claimed PCR values and qualifying data. The caller must have already
//! established trust in the provided public key; certificate chain checking
//! is out of scope here.

use anyhow::{bail, Context, Result};
use p256::ecdsa::{signature::hazmat::PrehashVerifier, Signature, VerifyingKey};
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256, Sha384};
use subtle::ConstantTimeEq;

/// TPM_GENERATED_VALUE magic prefix of attestation structures.
const TPM_GENERATED_VALUE: u32 = 0xff54_4347;
/// TPM_ST_ATTEST_QUOTE tag.
const TPM_ST_ATTEST_QUOTE: u16 = 0x8018;

const TPM_ALG_RSASSA: u16 = 0x0014;
const TPM_ALG_ECDSA: u16 = 0x0018;
const TPM_ALG_SHA256: u16 = 0x000b;
const TPM_ALG_SHA384: u16 = 0x000c;

use crate::TpmQuote;

/// Trusted attestation key public key.
#[derive(Debug, Clone)]
pub enum AkPublicKey {
    Ecc(VerifyingKey),
    Rsa(RsaPublicKey),
}

/// Verify a quote against a trusted AK public key and expected extra data.
///
/// Checks performed:
/// - the signature is by the trusted key and signs the quote message,
///   with the signature algorithm matching the key type
/// - the message starts with TPM_GENERATED_VALUE and carries the quote tag
/// - quote info is present
/// - `extraData` equals `extra_data` (constant time)
/// - the PCR selection in the message matches the quote's PCR values
/// - the PCR digest matches the digest of the concatenated PCR values under
///   the signature's hash algorithm (constant time)
pub fn verify_quote(quote: &TpmQuote, trusted_pub: &AkPublicKey, extra_data: &[u8]) -> Result<()> {
    let sig = parse_signature(&quote.signature).context("signature decoding failed")?;

    let hash_alg = match (&sig, trusted_pub) {
        (TpmtSignature::Ecdsa { hash_alg, .. }, AkPublicKey::Ecc(_)) => *hash_alg,
        (TpmtSignature::Rsassa { hash_alg, .. }, AkPublicKey::Rsa(_)) => *hash_alg,
        (TpmtSignature::Ecdsa { .. }, AkPublicKey::Rsa(_)) => {
            bail!("ECDSA signature does not match RSA public key")
        }
        (TpmtSignature::Rsassa { .. }, AkPublicKey::Ecc(_)) => {
            bail!("RSASSA signature does not match ECC public key")
        }
    };

    let digest = hash_with(hash_alg, &quote.message)?;
    match (&sig, trusted_pub) {
        (TpmtSignature::Ecdsa { r, s, .. }, AkPublicKey::Ecc(key)) => {
            let signature = Signature::from_scalars(to_field_bytes(r)?, to_field_bytes(s)?)
                .map_err(|e| anyhow::anyhow!("malformed ECDSA scalars: {e}"))?;
            key.verify_prehash(&digest, &signature)
                .map_err(|_| anyhow::anyhow!("ECDSA signature verification failed"))?;
        }
        (TpmtSignature::Rsassa { signature, .. }, AkPublicKey::Rsa(key)) => {
            let scheme = match hash_alg {
                TPM_ALG_SHA256 => Pkcs1v15Sign::new::<Sha256>(),
                TPM_ALG_SHA384 => Pkcs1v15Sign::new::<Sha384>(),
                other => bail!("unsupported RSASSA hash algorithm 0x{other:04x}"),
            };
            key.verify(scheme, &digest, signature)
                .map_err(|_| anyhow::anyhow!("RSASSA signature verification failed"))?;
        }
        _ => unreachable!("algorithm/key mismatch rejected above"),
    }

    let attest = parse_tpms_attest(&quote.message).context("decoding attestation data failed")?;

    if !bool::from(attest.extra_data.ct_eq(extra_data)) {
        bail!("quote extraData did not match expected extraData");
    }

    let attested_pcrs = parse_pcr_selection(&attest.pcr_select)?;
    let provided_pcrs: Vec<u32> = quote.pcr_values.iter().map(|p| p.index).collect();
    if attested_pcrs != provided_pcrs {
        bail!(
            "given PCRs and quote do not have the same PCR selection: {:?} vs {:?}",
            attested_pcrs,
            provided_pcrs
        );
    }

    let mut concatenated = Vec::new();
    for pcr in &quote.pcr_values {
        concatenated.extend_from_slice(&pcr.value);
    }
    let pcr_digest = hash_with(hash_alg, &concatenated)?;
    if !bool::from(attest.pcr_digest.ct_eq(&pcr_digest)) {
        bail!("given PCRs digest not matching");
    }

    Ok(())
}

fn hash_with(alg: u16, data: &[u8]) -> Result<Vec<u8>> {
    Ok(match alg {
        TPM_ALG_SHA256 => Sha256::digest(data).to_vec(),
        TPM_ALG_SHA384 => Sha384::digest(data).to_vec(),
        other => bail!("unsupported hash algorithm 0x{other:04x}"),
    })
}

fn to_field_bytes(scalar: &[u8]) -> Result<[u8; 32]> {
    if scalar.len() > 32 {
        let (lead, rest) = scalar.split_at(scalar.len() - 32);
        if lead.iter().any(|&b| b != 0) {
            bail!("ECDSA scalar exceeds field size");
        }
        Ok(rest.try_into().expect("32 bytes"))
    } else {
        let mut out = [0u8; 32];
        out[32 - scalar.len()..].copy_from_slice(scalar);
        Ok(out)
    }
}

/// Parsed TPMT_SIGNATURE.
#[derive(Debug)]
enum TpmtSignature {
    Ecdsa {
        hash_alg: u16,
        r: Vec<u8>,
        s: Vec<u8>,
    },
    Rsassa {
        hash_alg: u16,
        signature: Vec<u8>,
    },
}

/// Parse TPMT_SIGNATURE (TPM 2.0 Part 2, Section 11.3.4).
fn parse_signature(data: &[u8]) -> Result<TpmtSignature> {
    use nom::number::complete::be_u16;

    let (rest, sig_alg) =
        be_u16::<_, nom::error::Error<&[u8]>>(data).map_err(|e| anyhow::anyhow!("{e}"))?;
    let (rest, hash_alg) =
        be_u16::<_, nom::error::Error<&[u8]>>(rest).map_err(|e| anyhow::anyhow!("{e}"))?;

    match sig_alg {
        TPM_ALG_ECDSA => {
            let (rest, r) = sized_buffer(rest)?;
            let (_, s) = sized_buffer(rest)?;
            Ok(TpmtSignature::Ecdsa { hash_alg, r, s })
        }
        TPM_ALG_RSASSA => {
            let (_, signature) = sized_buffer(rest)?;
            Ok(TpmtSignature::Rsassa {
                hash_alg,
                signature,
            })
        }
        other => bail!("signature scheme 0x{other:04x} is not supported"),
    }
}

fn sized_buffer(input: &[u8]) -> Result<(&[u8], Vec<u8>)> {
    use nom::bytes::complete::take;
    use nom::number::complete::be_u16;

    let (input, size) =
        be_u16::<_, nom::error::Error<&[u8]>>(input).map_err(|e| anyhow::anyhow!("{e}"))?;
    let (input, data) =
        take::<_, _, nom::error::Error<&[u8]>>(size)(input).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok((input, data.to_vec()))
}

/// Parsed TPMS_ATTEST fields the verification needs.
#[derive(Debug)]
struct TpmsAttest {
    extra_data: Vec<u8>,
    /// Raw TPML_PCR_SELECTION bytes.
    pcr_select: Vec<u8>,
    pcr_digest: Vec<u8>,
}

/// Parse TPMS_ATTEST (TPM 2.0 Part 2, Section 10.12.8).
fn parse_tpms_attest(data: &[u8]) -> Result<TpmsAttest> {
    use nom::bytes::complete::take;
    use nom::number::complete::{be_u16, be_u32, be_u64, be_u8};
    use nom::IResult;

    fn parse_sized(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
        let (input, size) = be_u16(input)?;
        let (input, data) = take(size)(input)?;
        Ok((input, data.to_vec()))
    }

    fn parse_attest(input: &[u8]) -> IResult<&[u8], (u32, u16, TpmsAttest)> {
        let (input, magic) = be_u32(input)?;
        let (input, type_) = be_u16(input)?;
        let (input, _qualified_signer) = parse_sized(input)?;
        let (input, extra_data) = parse_sized(input)?;

        // Clock info + firmware version
        let (input, _clock) = be_u64(input)?;
        let (input, _reset_count) = be_u32(input)?;
        let (input, _restart_count) = be_u32(input)?;
        let (input, _safe) = be_u8(input)?;
        let (input, _firmware_version) = be_u64(input)?;

        // TPMS_QUOTE_INFO: TPML_PCR_SELECTION (no size prefix) + pcrDigest
        let (input, pcr_select_count) = be_u32(input)?;
        let mut pcr_select = Vec::new();
        pcr_select.extend_from_slice(&pcr_select_count.to_be_bytes());

        let mut current = input;
        for _ in 0..pcr_select_count {
            let (input, hash_alg) = be_u16(current)?;
            let (input, sizeof_select) = be_u8(input)?;
            let (input, bitmap) = take(sizeof_select)(input)?;
            pcr_select.extend_from_slice(&hash_alg.to_be_bytes());
            pcr_select.push(sizeof_select);
            pcr_select.extend_from_slice(bitmap);
            current = input;
        }

        let (input, pcr_digest) = parse_sized(current)?;

        Ok((
            input,
            (
                magic,
                type_,
                TpmsAttest {
                    extra_data,
                    pcr_select,
                    pcr_digest,
                },
            ),
        ))
    }

    let (_, (magic, type_, attest)) =
        parse_attest(data).map_err(|e| anyhow::anyhow!("parse error: {e}"))?;

    if magic != TPM_GENERATED_VALUE {
        bail!("invalid magic number: 0x{magic:08x}");
    }
    if type_ != TPM_ST_ATTEST_QUOTE {
        bail!("expected quote tag, got: 0x{type_:04x}");
    }
    if attest.pcr_select.len() <= 4 || attest.pcr_digest.is_empty() {
        bail!("attestation data does not contain quote info");
    }

    Ok(attest)
}

/// Parse TPML_PCR_SELECTION into sorted PCR indices.
fn parse_pcr_selection(data: &[u8]) -> Result<Vec<u32>> {
    use nom::bytes::complete::take;
    use nom::number::complete::{be_u16, be_u32, be_u8};
    use nom::IResult;

    fn parse_selection(input: &[u8]) -> IResult<&[u8], Vec<u32>> {
        let (input, count) = be_u32(input)?;

        let mut all_pcrs = Vec::new();
        let mut current = input;
        for _ in 0..count {
            let (input, _hash_alg) = be_u16(current)?;
            let (input, sizeof_select) = be_u8(input)?;
            let (input, bitmap) = take(sizeof_select)(input)?;
            for (byte_idx, &byte) in bitmap.iter().enumerate() {
                for bit_idx in 0..8 {
                    if (byte & (1 << bit_idx)) != 0 {
                        all_pcrs.push((byte_idx * 8 + bit_idx) as u32);
                    }
                }
            }
            current = input;
        }
        Ok((current, all_pcrs))
    }

    let (_, mut pcrs) =
        parse_selection(data).map_err(|e| anyhow::anyhow!("failed to parse PCR selection: {e}"))?;
    pcrs.sort_unstable();
    Ok(pcrs)
}
