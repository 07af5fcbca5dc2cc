//! Hardware TPM 2.0 backend over the TSS Enhanced System API.
//!
//! Opens the TCTI named by `TCTI` / `TPM2TOOLS_TCTI` (for the kernel
//! resource manager: `device:/dev/tpmrm0`). The EK is regenerated from the
//! default ECC P-256 template; the AK is either loaded from a persistent
//! handle or created under the EK; Application Keys are created under an
//! owner storage primary and never persisted.
//!
//! There is no fallback: when the device cannot be opened the manager fails
//! to start.

use std::convert::TryFrom;

use tracing::{info, warn};
use tss_esapi::{
    abstraction::{
        ak::{create_ak, load_ak},
        ek::create_ek_public_from_default_template,
        pcr, AsymmetricAlgorithmSelection,
    },
    attributes::{ObjectAttributesBuilder, SessionAttributesBuilder},
    constants::SessionType,
    handles::{AuthHandle, KeyHandle, PersistentTpmHandle, TpmHandle},
    interface_types::{
        algorithm::{HashingAlgorithm, PublicAlgorithm, SignatureSchemeAlgorithm},
        ecc::EccCurve,
        reserved_handles::Hierarchy,
        session_handles::{AuthSession, PolicySession},
    },
    structures::{
        Data, Digest, EccPoint, EccScheme, HashScheme, PcrSelectionListBuilder, PcrSlot,
        PublicBuilder, PublicEccParametersBuilder, Signature, SignatureScheme,
        SymmetricCipherParameters, SymmetricDefinition, SymmetricDefinitionObject,
    },
    traits::Marshall,
    Context, TctiNameConf,
};

use crate::device::{CertifyOutput, TpmDevice};
use crate::error::{IdentityError, IdentityResult, TpmError};
use crate::structures::{EcdsaSignature, QuoteBlob, TPM_ALG_SHA256};
use crate::tpm::PcrValue;

/// TPM_RC_RETRY, TPM_RC_YIELDED, TPM_RC_TESTING
const BUSY_CODES: [u32; 3] = [0x922, 0x908, 0x90a];

fn map_tss(err: tss_esapi::Error) -> TpmError {
    if let tss_esapi::Error::TssError(code) = &err {
        let raw: u32 = (*code).into();
        if BUSY_CODES.contains(&(raw & 0xffff)) {
            return TpmError::DeviceBusy;
        }
    }
    TpmError::DeviceUnavailable(err.to_string())
}

fn marshal_err(err: tss_esapi::Error) -> TpmError {
    TpmError::MalformedResponse(err.to_string())
}

fn ecdsa_scheme() -> SignatureScheme {
    SignatureScheme::EcDsa {
        scheme: HashScheme::new(HashingAlgorithm::Sha256),
    }
}

/// Kernel-backed TPM.
pub struct HardwareTpm {
    context: Context,
    ek: KeyHandle,
    ak: Option<KeyHandle>,
    ak_persistent: Option<u32>,
    storage_primary: Option<KeyHandle>,
    app_key: Option<KeyHandle>,
}

impl HardwareTpm {
    pub fn open(ak_persistent: Option<u32>) -> IdentityResult<Self> {
        let tcti = TctiNameConf::from_environment_variable()
            .map_err(|e| IdentityError::Config(format!("TCTI: {e}")))?;
        let mut context =
            Context::new(tcti).map_err(|e| IdentityError::Tpm(map_tss(e)))?;

        let ek_template = create_ek_public_from_default_template(
            AsymmetricAlgorithmSelection::Ecc(EccCurve::NistP256),
            None,
        )
        .map_err(|e| IdentityError::Tpm(map_tss(e)))?;
        let ek = context
            .execute_with_nullauth_session(|ctx| {
                ctx.create_primary(Hierarchy::Endorsement, ek_template, None, None, None, None)
            })
            .map_err(|e| IdentityError::Tpm(map_tss(e)))?
            .key_handle;

        info!("STATUS: HardwareTpm :: Hardware Root of Trust :: ACTIVE");
        Ok(Self {
            context,
            ek,
            ak: None,
            ak_persistent,
            storage_primary: None,
            app_key: None,
        })
    }

    fn read_public(&mut self, handle: KeyHandle) -> Result<Vec<u8>, TpmError> {
        let (public, _, _) = self
            .context
            .execute_with_nullauth_session(|ctx| ctx.read_public(handle))
            .map_err(map_tss)?;
        public.marshall().map_err(marshal_err)
    }

    fn ak_handle(&mut self) -> Result<KeyHandle, TpmError> {
        if let Some(handle) = self.ak {
            return Ok(handle);
        }
        let handle = match self.ak_persistent {
            Some(raw) => {
                let persistent = PersistentTpmHandle::new(raw)
                    .map_err(|e| TpmError::DeviceUnavailable(e.to_string()))?;
                let object = self
                    .context
                    .tr_from_tpm_public(TpmHandle::Persistent(persistent))
                    .map_err(map_tss)?;
                KeyHandle::from(object)
            }
            None => {
                warn!("No persistent AK handle configured; creating a transient AK");
                let created = create_ak(
                    &mut self.context,
                    self.ek,
                    HashingAlgorithm::Sha256,
                    AsymmetricAlgorithmSelection::Ecc(EccCurve::NistP256),
                    SignatureSchemeAlgorithm::EcDsa,
                    None,
                    None,
                )
                .map_err(map_tss)?;
                load_ak(
                    &mut self.context,
                    self.ek,
                    None,
                    created.out_private,
                    created.out_public,
                )
                .map_err(map_tss)?
            }
        };
        self.ak = Some(handle);
        Ok(handle)
    }

    fn storage_primary(&mut self) -> Result<KeyHandle, TpmError> {
        if let Some(handle) = self.storage_primary {
            return Ok(handle);
        }
        let attributes = ObjectAttributesBuilder::new()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_sensitive_data_origin(true)
            .with_user_with_auth(true)
            .with_decrypt(true)
            .with_restricted(true)
            .build()
            .map_err(marshal_err)?;
        let template = PublicBuilder::new()
            .with_public_algorithm(PublicAlgorithm::SymCipher)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(attributes)
            .with_symmetric_cipher_parameters(SymmetricCipherParameters::new(
                SymmetricDefinitionObject::AES_128_CFB,
            ))
            .with_symmetric_cipher_unique_identifier(Digest::default())
            .build()
            .map_err(marshal_err)?;
        let handle = self
            .context
            .execute_with_nullauth_session(|ctx| {
                ctx.create_primary(Hierarchy::Owner, template, None, None, None, None)
            })
            .map_err(map_tss)?
            .key_handle;
        self.storage_primary = Some(handle);
        Ok(handle)
    }

    /// HMAC session for the certified object plus an endorsement policy
    /// session for the EK-parented AK.
    fn certify_sessions(&mut self) -> Result<(AuthSession, AuthSession), TpmError> {
        let hmac = self
            .context
            .start_auth_session(
                None,
                None,
                None,
                SessionType::Hmac,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )
            .map_err(map_tss)?
            .ok_or_else(|| TpmError::MalformedResponse("no HMAC session".into()))?;
        let (attrs, mask) = SessionAttributesBuilder::new()
            .with_decrypt(true)
            .with_encrypt(true)
            .build();
        self.context
            .tr_sess_set_attributes(hmac, attrs, mask)
            .map_err(map_tss)?;

        let policy = self
            .context
            .start_auth_session(
                None,
                None,
                None,
                SessionType::Policy,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )
            .map_err(map_tss)?
            .ok_or_else(|| TpmError::MalformedResponse("no policy session".into()))?;
        let (attrs, mask) = SessionAttributesBuilder::new().build();
        self.context
            .tr_sess_set_attributes(policy, attrs, mask)
            .map_err(map_tss)?;
        let policy_session = PolicySession::try_from(policy).map_err(marshal_err)?;
        self.context
            .execute_with_nullauth_session(|ctx| {
                ctx.policy_secret(
                    policy_session,
                    AuthHandle::Endorsement,
                    Default::default(),
                    Default::default(),
                    Default::default(),
                    None,
                )
            })
            .map_err(map_tss)?;
        Ok((hmac, policy))
    }
}

fn pcr_slot(index: u8) -> Result<PcrSlot, TpmError> {
    if u32::from(index) >= 24 {
        return Err(TpmError::UnknownKey(format!("PCR {index}")));
    }
    PcrSlot::try_from(1u32 << index).map_err(marshal_err)
}

fn to_ecdsa(signature: Signature) -> Result<Vec<u8>, TpmError> {
    match signature {
        Signature::EcDsa(sig) => EcdsaSignature {
            hash: TPM_ALG_SHA256,
            r: sig.signature_r().value().to_vec(),
            s: sig.signature_s().value().to_vec(),
        }
        .marshal()
        .map_err(|e| TpmError::MalformedResponse(e.to_string())),
        other => Err(TpmError::MalformedResponse(format!(
            "unexpected signature algorithm {:?}",
            other.algorithm()
        ))),
    }
}

impl TpmDevice for HardwareTpm {
    fn describe(&self) -> String {
        "hardware-tpm".to_string()
    }

    fn ek_public(&mut self) -> Result<Vec<u8>, TpmError> {
        let ek = self.ek;
        self.read_public(ek)
    }

    fn load_or_create_ak(&mut self) -> Result<Vec<u8>, TpmError> {
        let ak = self.ak_handle()?;
        self.read_public(ak)
    }

    fn create_app_key(&mut self) -> Result<Vec<u8>, TpmError> {
        self.flush_app_key()?;
        let parent = self.storage_primary()?;
        let attributes = ObjectAttributesBuilder::new()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_sensitive_data_origin(true)
            .with_user_with_auth(true)
            .with_sign_encrypt(true)
            .build()
            .map_err(marshal_err)?;
        let params = PublicEccParametersBuilder::new_unrestricted_signing_key(
            EccScheme::EcDsa(HashScheme::new(HashingAlgorithm::Sha256)),
            EccCurve::NistP256,
        )
        .build()
        .map_err(marshal_err)?;
        let template = PublicBuilder::new()
            .with_public_algorithm(PublicAlgorithm::Ecc)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(attributes)
            .with_ecc_parameters(params)
            .with_ecc_unique_identifier(EccPoint::default())
            .build()
            .map_err(marshal_err)?;

        let handle = self
            .context
            .execute_with_nullauth_session(|ctx| {
                let created = ctx.create(parent, template, None, None, None, None)?;
                ctx.load(parent, created.out_private, created.out_public)
            })
            .map_err(map_tss)?;
        self.app_key = Some(handle);
        self.read_public(handle)
    }

    fn flush_app_key(&mut self) -> Result<(), TpmError> {
        if let Some(handle) = self.app_key.take() {
            self.context.flush_context(handle.into()).map_err(map_tss)?;
        }
        Ok(())
    }

    fn certify_app_key(&mut self, qualifying_data: &[u8]) -> Result<CertifyOutput, TpmError> {
        let ak = self.ak_handle()?;
        let app_key = self
            .app_key
            .ok_or_else(|| TpmError::UnknownKey("no application key loaded".into()))?;
        let data = Data::try_from(qualifying_data.to_vec()).map_err(marshal_err)?;
        let (hmac, policy) = self.certify_sessions()?;

        let result = self
            .context
            .execute_with_sessions((Some(hmac), Some(policy), None), |ctx| {
                ctx.certify(app_key.into(), ak, data, ecdsa_scheme())
            });
        self.context.clear_sessions();
        let (attest, signature) = result.map_err(map_tss)?;

        Ok(CertifyOutput {
            certify_info: attest.marshall().map_err(marshal_err)?,
            signature: to_ecdsa(signature)?,
        })
    }

    fn quote(
        &mut self,
        qualifying_data: &[u8],
        pcr_selection: &[u8],
    ) -> Result<QuoteBlob, TpmError> {
        let app_key = self
            .app_key
            .ok_or_else(|| TpmError::UnknownKey("no application key loaded".into()))?;
        let mut indices = pcr_selection.to_vec();
        indices.sort_unstable();
        indices.dedup();
        let slots = indices
            .iter()
            .map(|&index| pcr_slot(index))
            .collect::<Result<Vec<_>, _>>()?;
        let selection = PcrSelectionListBuilder::new()
            .with_selection(HashingAlgorithm::Sha256, &slots)
            .build()
            .map_err(marshal_err)?;
        let data = Data::try_from(qualifying_data.to_vec()).map_err(marshal_err)?;

        let (attest, signature) = self
            .context
            .execute_with_nullauth_session(|ctx| {
                ctx.quote(app_key, data, ecdsa_scheme(), selection.clone())
            })
            .map_err(map_tss)?;
        let pcr_data = self
            .context
            .execute_without_session(|ctx| pcr::read_all(ctx, selection))
            .map_err(map_tss)?;
        let bank = pcr_data
            .pcr_bank(HashingAlgorithm::Sha256)
            .ok_or_else(|| TpmError::MalformedResponse("no SHA-256 PCR bank".into()))?;

        let mut pcr_values = Vec::with_capacity(indices.len());
        for (&index, &slot) in indices.iter().zip(slots.iter()) {
            let digest = bank
                .get_digest(slot)
                .ok_or_else(|| TpmError::MalformedResponse(format!("PCR {index} not returned")))?;
            pcr_values.push(PcrValue {
                index,
                value: digest.value().to_vec(),
            });
        }

        Ok(QuoteBlob {
            attest: attest.marshall().map_err(marshal_err)?,
            signature: to_ecdsa(signature)?,
            pcr_values,
        })
    }
}

impl Drop for HardwareTpm {
    fn drop(&mut self) {
        let handles = [self.app_key.take(), self.storage_primary.take(), Some(self.ek)];
        for handle in handles.into_iter().flatten() {
            let _ = self.context.flush_context(handle.into());
        }
        // A persistent AK stays in NV; only transient AKs are flushed.
        if self.ak_persistent.is_none() {
            if let Some(ak) = self.ak.take() {
                let _ = self.context.flush_context(ak.into());
            }
        }
    }
}
