//! TPM 2.0 structure marshalling.
//!
//! Covers the subset the attestation protocol exchanges: ECC P-256 signing
//! key public areas, `TPMS_ATTEST` for quotes and certifications, ECDSA
//! `TPMT_SIGNATURE`, and the quote blob carried in the wire payload.
//! Everything is big-endian, as on the TPM command interface.

use p256::ecdsa::{Signature, VerifyingKey};
use p256::{EncodedPoint, FieldBytes};
use sha2::{Digest, Sha256};

use crate::error::StructureError;
use crate::tpm::PcrValue;

pub const TPM_GENERATED_VALUE: u32 = 0xff54_4347;
pub const TPM_ST_ATTEST_CERTIFY: u16 = 0x8017;
pub const TPM_ST_ATTEST_QUOTE: u16 = 0x8018;
pub const TPM_ALG_ECC: u16 = 0x0023;
pub const TPM_ALG_SHA256: u16 = 0x000b;
pub const TPM_ALG_ECDSA: u16 = 0x0018;
pub const TPM_ALG_NULL: u16 = 0x0010;
pub const TPM_ECC_NIST_P256: u16 = 0x0003;

/// fixedTPM | fixedParent | sensitiveDataOrigin | userWithAuth | restricted | sign
pub const ATTESTATION_KEY_ATTRIBUTES: u32 = 0x0005_0072;
/// fixedTPM | fixedParent | sensitiveDataOrigin | userWithAuth | sign
pub const APP_KEY_ATTRIBUTES: u32 = 0x0004_0072;

const PCR_SELECT_BYTES: usize = 3;

type CodecResult<T> = Result<T, StructureError>;

/// Cursor over a marshalled TPM structure.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        let remaining = self.buf.len() - self.pos;
        if n > remaining {
            return Err(StructureError::Truncated {
                needed: n,
                remaining,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> CodecResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> CodecResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> CodecResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> CodecResult<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    /// Size-prefixed byte buffer.
    pub fn tpm2b(&mut self) -> CodecResult<Vec<u8>> {
        let len = self.u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Fails unless every byte was consumed.
    pub fn finish(self) -> CodecResult<()> {
        let trailing = self.buf.len() - self.pos;
        if trailing != 0 {
            return Err(StructureError::TrailingBytes(trailing));
        }
        Ok(())
    }
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_tpm2b(out: &mut Vec<u8>, data: &[u8]) -> CodecResult<()> {
    let len = u16::try_from(data.len()).map_err(|_| StructureError::TooLarge(data.len()))?;
    put_u16(out, len);
    out.extend_from_slice(data);
    Ok(())
}

/// Strips leading zeros then left-pads to 32 bytes.
fn to_scalar_bytes(raw: &[u8]) -> CodecResult<[u8; 32]> {
    let start = raw.iter().position(|&b| b != 0).unwrap_or(raw.len());
    let trimmed = &raw[start..];
    if trimmed.len() > 32 {
        return Err(StructureError::Unsupported(format!(
            "{}-byte P-256 scalar",
            trimmed.len()
        )));
    }
    let mut out = [0u8; 32];
    out[32 - trimmed.len()..].copy_from_slice(trimmed);
    Ok(out)
}

/// TPM object name: `nameAlg || SHA-256(TPMT_PUBLIC)`.
pub fn name_of(public_area: &[u8]) -> Vec<u8> {
    let mut name = Vec::with_capacity(34);
    put_u16(&mut name, TPM_ALG_SHA256);
    name.extend_from_slice(&Sha256::digest(public_area));
    name
}

/// SHA-256 over the selected PCR values concatenated in ascending index order.
pub fn pcr_digest(values: &[PcrValue]) -> [u8; 32] {
    let mut sorted: Vec<&PcrValue> = values.iter().collect();
    sorted.sort_by_key(|pcr| pcr.index);
    let mut hasher = Sha256::new();
    for pcr in sorted {
        hasher.update(&pcr.value);
    }
    hasher.finalize().into()
}

/// Symmetric definition of a storage parent; `None` for signing keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymmetricDef {
    pub algorithm: u16,
    pub key_bits: u16,
    pub mode: u16,
}

/// `TPMT_PUBLIC` for an ECC key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EccPublic {
    pub name_alg: u16,
    pub object_attributes: u32,
    pub auth_policy: Vec<u8>,
    pub symmetric: Option<SymmetricDef>,
    /// Signing scheme hash when the scheme is ECDSA.
    pub scheme_hash: Option<u16>,
    pub curve_id: u16,
    pub x: Vec<u8>,
    pub y: Vec<u8>,
}

impl EccPublic {
    /// Public area of a P-256 ECDSA/SHA-256 signing key.
    pub fn signing_key(key: &VerifyingKey, object_attributes: u32) -> Self {
        let point = key.to_encoded_point(false);
        Self {
            name_alg: TPM_ALG_SHA256,
            object_attributes,
            auth_policy: Vec::new(),
            symmetric: None,
            scheme_hash: Some(TPM_ALG_SHA256),
            curve_id: TPM_ECC_NIST_P256,
            x: point.x().map(|x| x.to_vec()).unwrap_or_default(),
            y: point.y().map(|y| y.to_vec()).unwrap_or_default(),
        }
    }

    pub fn marshal(&self) -> CodecResult<Vec<u8>> {
        let mut out = Vec::with_capacity(96);
        put_u16(&mut out, TPM_ALG_ECC);
        put_u16(&mut out, self.name_alg);
        put_u32(&mut out, self.object_attributes);
        put_tpm2b(&mut out, &self.auth_policy)?;
        match self.symmetric {
            Some(sym) => {
                put_u16(&mut out, sym.algorithm);
                put_u16(&mut out, sym.key_bits);
                put_u16(&mut out, sym.mode);
            }
            None => put_u16(&mut out, TPM_ALG_NULL),
        }
        match self.scheme_hash {
            Some(hash) => {
                put_u16(&mut out, TPM_ALG_ECDSA);
                put_u16(&mut out, hash);
            }
            None => put_u16(&mut out, TPM_ALG_NULL),
        }
        put_u16(&mut out, self.curve_id);
        put_u16(&mut out, TPM_ALG_NULL); // kdf
        put_tpm2b(&mut out, &self.x)?;
        put_tpm2b(&mut out, &self.y)?;
        Ok(out)
    }

    pub fn unmarshal(bytes: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(bytes);
        let kind = r.u16()?;
        if kind != TPM_ALG_ECC {
            return Err(StructureError::UnexpectedTag {
                expected: TPM_ALG_ECC,
                found: kind,
            });
        }
        let name_alg = r.u16()?;
        let object_attributes = r.u32()?;
        let auth_policy = r.tpm2b()?;
        let symmetric = match r.u16()? {
            TPM_ALG_NULL => None,
            algorithm => Some(SymmetricDef {
                algorithm,
                key_bits: r.u16()?,
                mode: r.u16()?,
            }),
        };
        let scheme_hash = match r.u16()? {
            TPM_ALG_NULL => None,
            TPM_ALG_ECDSA => Some(r.u16()?),
            other => {
                return Err(StructureError::Unsupported(format!(
                    "ECC scheme 0x{other:04x}"
                )))
            }
        };
        let curve_id = r.u16()?;
        match r.u16()? {
            TPM_ALG_NULL => {}
            other => {
                return Err(StructureError::Unsupported(format!("KDF 0x{other:04x}")));
            }
        }
        let x = r.tpm2b()?;
        let y = r.tpm2b()?;
        r.finish()?;
        Ok(Self {
            name_alg,
            object_attributes,
            auth_policy,
            symmetric,
            scheme_hash,
            curve_id,
            x,
            y,
        })
    }

    /// Verifying key for a P-256 public area.
    pub fn verifying_key(&self) -> CodecResult<VerifyingKey> {
        if self.curve_id != TPM_ECC_NIST_P256 {
            return Err(StructureError::Unsupported(format!(
                "curve 0x{:04x}",
                self.curve_id
            )));
        }
        let x = to_scalar_bytes(&self.x)?;
        let y = to_scalar_bytes(&self.y)?;
        let point = EncodedPoint::from_affine_coordinates(
            &FieldBytes::clone_from_slice(&x),
            &FieldBytes::clone_from_slice(&y),
            false,
        );
        VerifyingKey::from_encoded_point(&point)
            .map_err(|_| StructureError::Unsupported("point not on P-256".into()))
    }
}

/// `TPMS_CLOCK_INFO`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockInfo {
    pub clock: u64,
    pub reset_count: u32,
    pub restart_count: u32,
    pub safe: bool,
}

/// Type-specific body of a `TPMS_ATTEST`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attested {
    Quote {
        /// PCR indices of the single SHA-256 bank.
        pcr_selection: Vec<u8>,
        pcr_digest: Vec<u8>,
    },
    Certify {
        name: Vec<u8>,
        qualified_name: Vec<u8>,
    },
}

/// `TPMS_ATTEST`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attest {
    pub qualified_signer: Vec<u8>,
    pub extra_data: Vec<u8>,
    pub clock_info: ClockInfo,
    pub firmware_version: u64,
    pub attested: Attested,
}

impl Attest {
    pub fn marshal(&self) -> CodecResult<Vec<u8>> {
        let mut out = Vec::with_capacity(128);
        put_u32(&mut out, TPM_GENERATED_VALUE);
        let tag = match self.attested {
            Attested::Quote { .. } => TPM_ST_ATTEST_QUOTE,
            Attested::Certify { .. } => TPM_ST_ATTEST_CERTIFY,
        };
        put_u16(&mut out, tag);
        put_tpm2b(&mut out, &self.qualified_signer)?;
        put_tpm2b(&mut out, &self.extra_data)?;
        put_u64(&mut out, self.clock_info.clock);
        put_u32(&mut out, self.clock_info.reset_count);
        put_u32(&mut out, self.clock_info.restart_count);
        out.push(u8::from(self.clock_info.safe));
        put_u64(&mut out, self.firmware_version);
        match &self.attested {
            Attested::Quote {
                pcr_selection,
                pcr_digest,
            } => {
                put_u32(&mut out, 1);
                put_u16(&mut out, TPM_ALG_SHA256);
                out.push(PCR_SELECT_BYTES as u8);
                out.extend_from_slice(&selection_bitmap(pcr_selection)?);
                put_tpm2b(&mut out, pcr_digest)?;
            }
            Attested::Certify {
                name,
                qualified_name,
            } => {
                put_tpm2b(&mut out, name)?;
                put_tpm2b(&mut out, qualified_name)?;
            }
        }
        Ok(out)
    }

    pub fn unmarshal(bytes: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(bytes);
        let magic = r.u32()?;
        if magic != TPM_GENERATED_VALUE {
            return Err(StructureError::BadMagic(magic));
        }
        let tag = r.u16()?;
        let qualified_signer = r.tpm2b()?;
        let extra_data = r.tpm2b()?;
        let clock_info = ClockInfo {
            clock: r.u64()?,
            reset_count: r.u32()?,
            restart_count: r.u32()?,
            safe: r.u8()? != 0,
        };
        let firmware_version = r.u64()?;
        let attested = match tag {
            TPM_ST_ATTEST_QUOTE => {
                let banks = r.u32()?;
                let mut pcr_selection = Vec::new();
                for _ in 0..banks {
                    let hash = r.u16()?;
                    let size = r.u8()? as usize;
                    let bitmap = r.take(size)?;
                    let indices = selection_indices(bitmap);
                    if indices.is_empty() {
                        continue;
                    }
                    if hash != TPM_ALG_SHA256 || !pcr_selection.is_empty() {
                        return Err(StructureError::Unsupported(format!(
                            "PCR bank 0x{hash:04x}"
                        )));
                    }
                    pcr_selection = indices;
                }
                Attested::Quote {
                    pcr_selection,
                    pcr_digest: r.tpm2b()?,
                }
            }
            TPM_ST_ATTEST_CERTIFY => Attested::Certify {
                name: r.tpm2b()?,
                qualified_name: r.tpm2b()?,
            },
            found => {
                return Err(StructureError::UnexpectedTag {
                    expected: TPM_ST_ATTEST_QUOTE,
                    found,
                })
            }
        };
        r.finish()?;
        Ok(Self {
            qualified_signer,
            extra_data,
            clock_info,
            firmware_version,
            attested,
        })
    }
}

fn selection_bitmap(indices: &[u8]) -> CodecResult<[u8; PCR_SELECT_BYTES]> {
    let mut bitmap = [0u8; PCR_SELECT_BYTES];
    for &index in indices {
        let byte = (index / 8) as usize;
        if byte >= PCR_SELECT_BYTES {
            return Err(StructureError::Unsupported(format!("PCR {index}")));
        }
        bitmap[byte] |= 1 << (index % 8);
    }
    Ok(bitmap)
}

fn selection_indices(bitmap: &[u8]) -> Vec<u8> {
    let mut indices = Vec::new();
    for (byte_idx, byte) in bitmap.iter().enumerate() {
        for bit in 0..8u8 {
            if byte & (1 << bit) != 0 {
                indices.push(byte_idx as u8 * 8 + bit);
            }
        }
    }
    indices
}

/// ECDSA `TPMT_SIGNATURE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcdsaSignature {
    pub hash: u16,
    pub r: Vec<u8>,
    pub s: Vec<u8>,
}

impl EcdsaSignature {
    pub fn from_p256(signature: &Signature) -> Self {
        let bytes = signature.to_bytes();
        let (r, s) = bytes.split_at(32);
        Self {
            hash: TPM_ALG_SHA256,
            r: r.to_vec(),
            s: s.to_vec(),
        }
    }

    pub fn to_p256(&self) -> CodecResult<Signature> {
        if self.hash != TPM_ALG_SHA256 {
            return Err(StructureError::Unsupported(format!(
                "signature hash 0x{:04x}",
                self.hash
            )));
        }
        let mut raw = [0u8; 64];
        raw[..32].copy_from_slice(&to_scalar_bytes(&self.r)?);
        raw[32..].copy_from_slice(&to_scalar_bytes(&self.s)?);
        Signature::from_slice(&raw)
            .map_err(|_| StructureError::Unsupported("ECDSA scalar out of range".into()))
    }

    pub fn marshal(&self) -> CodecResult<Vec<u8>> {
        let mut out = Vec::with_capacity(72);
        put_u16(&mut out, TPM_ALG_ECDSA);
        put_u16(&mut out, self.hash);
        put_tpm2b(&mut out, &self.r)?;
        put_tpm2b(&mut out, &self.s)?;
        Ok(out)
    }

    pub fn unmarshal(bytes: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(bytes);
        let alg = r.u16()?;
        if alg != TPM_ALG_ECDSA {
            return Err(StructureError::UnexpectedTag {
                expected: TPM_ALG_ECDSA,
                found: alg,
            });
        }
        let sig = Self {
            hash: r.u16()?,
            r: r.tpm2b()?,
            s: r.tpm2b()?,
        };
        r.finish()?;
        Ok(sig)
    }
}

/// Quote as carried in the attestation payload: signed attest, signature,
/// and the PCR values the digest was computed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteBlob {
    pub attest: Vec<u8>,
    pub signature: Vec<u8>,
    pub pcr_values: Vec<PcrValue>,
}

impl QuoteBlob {
    pub fn marshal(&self) -> CodecResult<Vec<u8>> {
        let mut out = Vec::new();
        put_tpm2b(&mut out, &self.attest)?;
        put_tpm2b(&mut out, &self.signature)?;
        put_u32(&mut out, self.pcr_values.len() as u32);
        for pcr in &self.pcr_values {
            out.push(pcr.index);
            put_tpm2b(&mut out, &pcr.value)?;
        }
        Ok(out)
    }

    pub fn unmarshal(bytes: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(bytes);
        let attest = r.tpm2b()?;
        let signature = r.tpm2b()?;
        let count = r.u32()?;
        // Each entry is at least three bytes.
        if count as usize > bytes.len() / 3 {
            return Err(StructureError::Truncated {
                needed: count as usize * 3,
                remaining: bytes.len(),
            });
        }
        let mut pcr_values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            pcr_values.push(PcrValue {
                index: r.u8()?,
                value: r.tpm2b()?,
            });
        }
        r.finish()?;
        Ok(Self {
            attest,
            signature,
            pcr_values,
        })
    }
}
