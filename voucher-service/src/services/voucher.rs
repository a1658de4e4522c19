//! RFC 8366 ownership vouchers carried in CMS SignedData (RFC 5652).
//!
//! The JSON voucher is the encapsulated content (`id-ct-animaJSONVoucher`).
//! The signer is identified by issuer and serial number of the signing
//! certificate, which travels in the `certificates` set. Signed attributes
//! carry the content type and the SHA-256 message digest; the RSA
//! PKCS#1 v1.5 signature covers their DER encoding.

use chrono::{DateTime, Utc};
use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
use cms::content_info::{CmsVersion, ContentInfo};
use cms::signed_data::{
    CertificateSet, EncapsulatedContentInfo, SignedAttributes, SignedData, SignerIdentifier,
    SignerInfo, SignerInfos,
};
use der::asn1::{ObjectIdentifier, OctetString, SetOfVec};
use der::{Any, Decode, Encode, Tag, Tagged};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;
use x509_cert::attr::Attribute;
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_cert::Certificate;

pub const ID_SIGNED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");
pub const ID_CT_ANIMA_JSON_VOUCHER: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.16.1.40");
const ID_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");
const ID_SHA256_WITH_RSA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
const ID_CONTENT_TYPE: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.3");
const ID_MESSAGE_DIGEST: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.4");

#[derive(Debug, Error)]
pub enum VoucherError {
    #[error("invalid signing key: {0}")]
    Key(String),

    #[error("invalid certificate: {0}")]
    Certificate(String),

    #[error("DER encoding error: {0}")]
    Encoding(#[from] der::Error),

    #[error("voucher JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("signature error: {0}")]
    Signature(String),

    #[error("malformed voucher: {0}")]
    Malformed(String),
}

/// The `ietf-voucher:voucher` container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OwnershipVoucher {
    pub created_on: DateTime<Utc>,
    pub expires_on: DateTime<Utc>,
    pub assertion: String,
    pub serial_number: String,
    /// DER of the domain certificate the device must trust.
    #[serde(with = "base64_der")]
    pub pinned_domain_cert: Vec<u8>,
    pub domain_cert_revocation_checks: bool,
    /// DER SubjectPublicKeyInfo of the device.
    #[serde(with = "base64_der")]
    pub device_public_key: Vec<u8>,
}

impl OwnershipVoucher {
    pub fn new(
        serial_number: impl Into<String>,
        pinned_domain_cert: Vec<u8>,
        domain_cert_revocation_checks: bool,
        device_public_key: Vec<u8>,
        expires_on: DateTime<Utc>,
    ) -> Self {
        Self {
            created_on: Utc::now(),
            expires_on,
            assertion: "verified".to_string(),
            serial_number: serial_number.into(),
            pinned_domain_cert,
            domain_cert_revocation_checks,
            device_public_key,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "ietf-voucher:voucher")]
    voucher: T,
}

mod base64_der {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Signs vouchers with the service's MASA key.
pub struct VoucherSigner {
    signing_key: SigningKey<Sha256>,
    verifying_key: VerifyingKey<Sha256>,
    certificate: Certificate,
}

impl std::fmt::Debug for VoucherSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoucherSigner")
            .field("subject", &self.certificate.tbs_certificate.subject.to_string())
            .finish_non_exhaustive()
    }
}

impl VoucherSigner {
    /// Build from a PKCS#8 PEM RSA key and the matching PEM certificate.
    pub fn from_pem(key_pem: &str, cert_pem: &[u8]) -> Result<Self, VoucherError> {
        let private_key =
            RsaPrivateKey::from_pkcs8_pem(key_pem).map_err(|e| VoucherError::Key(e.to_string()))?;
        let (label, cert_der) = der::pem::decode_vec(cert_pem)
            .map_err(|e| VoucherError::Certificate(e.to_string()))?;
        if label != "CERTIFICATE" {
            return Err(VoucherError::Certificate(format!(
                "expected a CERTIFICATE PEM block, found {}",
                label
            )));
        }
        let certificate = Certificate::from_der(&cert_der)
            .map_err(|e| VoucherError::Certificate(e.to_string()))?;

        let cert_key = RsaPublicKey::from_public_key_der(
            &certificate.tbs_certificate.subject_public_key_info.to_der()?,
        )
        .map_err(|e| VoucherError::Certificate(e.to_string()))?;
        let public_key = private_key.to_public_key();
        if cert_key != public_key {
            return Err(VoucherError::Certificate(
                "certificate does not match signing key".to_string(),
            ));
        }

        Ok(Self {
            signing_key: SigningKey::<Sha256>::new(private_key),
            verifying_key: VerifyingKey::<Sha256>::new(public_key),
            certificate,
        })
    }

    pub fn from_files(key_path: &Path, cert_path: &Path) -> Result<Self, AppError> {
        let key_pem = std::fs::read_to_string(key_path).map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!(
                "Failed to read signing key {}: {}",
                key_path.display(),
                e
            ))
        })?;
        let cert_pem = std::fs::read(cert_path).map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!(
                "Failed to read signing certificate {}: {}",
                cert_path.display(),
                e
            ))
        })?;
        Self::from_pem(&key_pem, &cert_pem)
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("{}", e)))
    }

    /// Encode `voucher` as a DER ContentInfo wrapping SignedData.
    pub fn sign(&self, voucher: &OwnershipVoucher) -> Result<Vec<u8>, VoucherError> {
        let payload = serde_json::to_vec(&Envelope { voucher })?;
        let digest = Sha256::digest(&payload);

        let signed_attrs: SignedAttributes = SetOfVec::try_from(vec![
            Attribute {
                oid: ID_CONTENT_TYPE,
                values: SetOfVec::try_from(vec![Any::encode_from(&ID_CT_ANIMA_JSON_VOUCHER)?])?,
            },
            Attribute {
                oid: ID_MESSAGE_DIGEST,
                values: SetOfVec::try_from(vec![Any::new(Tag::OctetString, digest.to_vec())?])?,
            },
        ])?;

        let signature = self
            .signing_key
            .try_sign(&signed_attrs.to_der()?)
            .map_err(|e| VoucherError::Signature(e.to_string()))?;

        let signer_info = SignerInfo {
            version: CmsVersion::V1,
            sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
                issuer: self.certificate.tbs_certificate.issuer.clone(),
                serial_number: self.certificate.tbs_certificate.serial_number.clone(),
            }),
            digest_alg: sha256_algorithm(),
            signed_attrs: Some(signed_attrs),
            signature_algorithm: AlgorithmIdentifierOwned {
                oid: ID_SHA256_WITH_RSA,
                parameters: Some(Any::new(Tag::Null, Vec::<u8>::new())?),
            },
            signature: OctetString::new(signature.to_vec())?,
            unsigned_attrs: None,
        };

        let signed_data = SignedData {
            version: CmsVersion::V3,
            digest_algorithms: SetOfVec::try_from(vec![sha256_algorithm()])?,
            encap_content_info: EncapsulatedContentInfo {
                econtent_type: ID_CT_ANIMA_JSON_VOUCHER,
                econtent: Some(Any::new(Tag::OctetString, payload)?),
            },
            certificates: Some(CertificateSet(SetOfVec::try_from(vec![
                CertificateChoices::Certificate(self.certificate.clone()),
            ])?)),
            crls: None,
            signer_infos: SignerInfos(SetOfVec::try_from(vec![signer_info])?),
        };

        let content_info = ContentInfo {
            content_type: ID_SIGNED_DATA,
            content: Any::encode_from(&signed_data)?,
        };

        Ok(content_info.to_der()?)
    }

    /// Check a voucher produced by this signer and return its payload.
    pub fn verify(&self, cms_der: &[u8]) -> Result<OwnershipVoucher, VoucherError> {
        let content_info = ContentInfo::from_der(cms_der)?;
        if content_info.content_type != ID_SIGNED_DATA {
            return Err(VoucherError::Malformed("not SignedData".to_string()));
        }
        let signed_data = SignedData::from_der(&content_info.content.to_der()?)?;

        let encap = &signed_data.encap_content_info;
        if encap.econtent_type != ID_CT_ANIMA_JSON_VOUCHER {
            return Err(VoucherError::Malformed(format!(
                "unexpected content type {}",
                encap.econtent_type
            )));
        }
        let payload = match &encap.econtent {
            Some(content) if content.tag() == Tag::OctetString => content.value(),
            _ => return Err(VoucherError::Malformed("missing content".to_string())),
        };

        let signer_cert = signed_data
            .certificates
            .as_ref()
            .and_then(|set| {
                set.0.iter().find_map(|choice| match choice {
                    CertificateChoices::Certificate(cert) => Some(cert),
                    _ => None,
                })
            })
            .ok_or_else(|| VoucherError::Malformed("no signer certificate".to_string()))?;
        if signer_cert != &self.certificate {
            return Err(VoucherError::Signature("untrusted signer".to_string()));
        }

        let signer_info = signed_data
            .signer_infos
            .0
            .iter()
            .next()
            .ok_or_else(|| VoucherError::Malformed("no signer info".to_string()))?;
        let signed_attrs = signer_info
            .signed_attrs
            .as_ref()
            .ok_or_else(|| VoucherError::Malformed("no signed attributes".to_string()))?;

        let message_digest = signed_attrs
            .iter()
            .find(|attr| attr.oid == ID_MESSAGE_DIGEST)
            .and_then(|attr| attr.values.iter().next())
            .ok_or_else(|| VoucherError::Malformed("no message digest".to_string()))?;
        if message_digest.value() != Sha256::digest(payload).as_slice() {
            return Err(VoucherError::Signature("message digest mismatch".to_string()));
        }

        let signature = Signature::try_from(signer_info.signature.as_bytes())
            .map_err(|e| VoucherError::Signature(e.to_string()))?;
        self.verifying_key
            .verify(&signed_attrs.to_der()?, &signature)
            .map_err(|e| VoucherError::Signature(e.to_string()))?;

        let envelope: Envelope<OwnershipVoucher> = serde_json::from_slice(payload)?;
        Ok(envelope.voucher)
    }
}

fn sha256_algorithm() -> AlgorithmIdentifierOwned {
    AlgorithmIdentifierOwned {
        oid: ID_SHA256,
        parameters: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const MASA_KEY: &str = include_str!("../../tests/fixtures/masa_key.pem");
    const MASA_CERT: &[u8] = include_bytes!("../../tests/fixtures/masa_cert.pem");
    const DOMAIN_CERT: &[u8] = include_bytes!("../../tests/fixtures/domain_cert_a.der");
    const DEVICE_KEY: &[u8] = include_bytes!("../../tests/fixtures/device_pubkey.der");

    fn signer() -> VoucherSigner {
        VoucherSigner::from_pem(MASA_KEY, MASA_CERT).unwrap()
    }

    fn voucher() -> OwnershipVoucher {
        OwnershipVoucher::new(
            "SN123",
            DOMAIN_CERT.to_vec(),
            true,
            DEVICE_KEY.to_vec(),
            Utc::now() + Duration::days(1),
        )
    }

    #[test]
    fn signed_voucher_verifies() {
        let signer = signer();
        let original = voucher();

        let cms = signer.sign(&original).unwrap();
        let decoded = signer.verify(&cms).unwrap();

        assert_eq!(decoded, original);
        assert_eq!(decoded.assertion, "verified");
    }

    #[test]
    fn envelope_structure() {
        let signer = signer();
        let cms = signer.sign(&voucher()).unwrap();

        let content_info = ContentInfo::from_der(&cms).unwrap();
        assert_eq!(content_info.content_type, ID_SIGNED_DATA);
        let signed_data = SignedData::from_der(&content_info.content.to_der().unwrap()).unwrap();
        assert_eq!(signed_data.version, CmsVersion::V3);
        assert_eq!(
            signed_data.encap_content_info.econtent_type,
            ID_CT_ANIMA_JSON_VOUCHER
        );
        assert_eq!(signed_data.signer_infos.0.len(), 1);

        let payload = signed_data.encap_content_info.econtent.unwrap();
        let json: serde_json::Value = serde_json::from_slice(payload.value()).unwrap();
        let inner = &json["ietf-voucher:voucher"];
        assert_eq!(inner["serial-number"], "SN123");
        assert_eq!(inner["domain-cert-revocation-checks"], true);
        assert!(inner["pinned-domain-cert"].is_string());
    }

    #[test]
    fn tampered_voucher_is_rejected() {
        let signer = signer();
        let mut cms = signer.sign(&voucher()).unwrap();

        // Flip a byte inside the JSON payload.
        let needle = b"SN123";
        let at = cms
            .windows(needle.len())
            .position(|w| w == needle)
            .unwrap();
        cms[at] = b'X';

        assert!(signer.verify(&cms).is_err());
    }

    #[test]
    fn mismatched_certificate_is_rejected() {
        // Well-formed certificate whose key is not the MASA key.
        let other_cert =
            der::pem::encode_string("CERTIFICATE", der::pem::LineEnding::LF, DOMAIN_CERT)
                .unwrap();
        let err = VoucherSigner::from_pem(MASA_KEY, other_cert.as_bytes()).unwrap_err();
        assert!(matches!(err, VoucherError::Certificate(_)));

        assert!(matches!(
            VoucherSigner::from_pem("not a key", MASA_CERT).unwrap_err(),
            VoucherError::Key(_)
        ));
    }

    #[test]
    fn wrong_pem_label_is_rejected() {
        let key_block = MASA_KEY.as_bytes();
        let err = VoucherSigner::from_pem(MASA_KEY, key_block).unwrap_err();
        assert!(matches!(err, VoucherError::Certificate(_)));
    }

    #[test]
    fn truncated_certificate_pem_fails_promptly() {
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let truncated = b"-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";
            let _ = done_tx.send(VoucherSigner::from_pem(MASA_KEY, truncated).is_err());
        });

        let rejected = done_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("decoding a truncated certificate did not return");
        assert!(rejected);
    }
}
