use std::ops::Range;

use aws_lc_rs::{agreement, hmac, rand::SystemRandom};
use log::debug;

use super::crypto::{
    AuthInput, Capability, ChildKeyInput, CryptoError, CryptoRegistry, IkeKeyInput, KeyExchange,
    KeyMaterial, Role, TransformParameters,
};
use super::proposal::TransformId;

const SHARED_KEY_PAD: &[u8] = b"Key Pad for IKEv2";
const AES_KEY_LENGTHS: &[u16] = &[128, 192, 256];
// AES-GCM and ChaCha20-Poly1305 keys are followed by a 4-byte salt (RFC 4106, RFC 7634).
const AEAD_SALT_LENGTH: usize = 4;

/// Registry of transforms implemented with aws-lc-rs.
#[derive(Default)]
pub struct AwsLcRegistry {}

impl AwsLcRegistry {
    pub fn new() -> AwsLcRegistry {
        AwsLcRegistry {}
    }
}

impl CryptoRegistry for AwsLcRegistry {
    fn resolve(&self, id: TransformId) -> Option<Capability> {
        match id {
            TransformId::ENCR_AES_CBC => Some(Capability::Encryption {
                key_lengths: AES_KEY_LENGTHS,
                aead: false,
            }),
            TransformId::ENCR_AES_GCM_8
            | TransformId::ENCR_AES_GCM_12
            | TransformId::ENCR_AES_GCM_16 => Some(Capability::Encryption {
                key_lengths: AES_KEY_LENGTHS,
                aead: true,
            }),
            TransformId::ENCR_CHACHA20_POLY1305 => Some(Capability::Encryption {
                key_lengths: &[],
                aead: true,
            }),
            TransformId::PRF_HMAC_SHA2_256 => Some(Capability::Pseudorandom { output_length: 32 }),
            TransformId::PRF_HMAC_SHA2_384 => Some(Capability::Pseudorandom { output_length: 48 }),
            TransformId::PRF_HMAC_SHA2_512 => Some(Capability::Pseudorandom { output_length: 64 }),
            TransformId::AUTH_HMAC_SHA2_256_128 => Some(Capability::Integrity { key_length: 32 }),
            TransformId::AUTH_HMAC_SHA2_384_192 => Some(Capability::Integrity { key_length: 48 }),
            TransformId::AUTH_HMAC_SHA2_512_256 => Some(Capability::Integrity { key_length: 64 }),
            TransformId::DH_256_ECP => Some(Capability::KeyExchange { group: 19 }),
            TransformId::DH_CURVE25519 => Some(Capability::KeyExchange { group: 31 }),
            TransformId::NO_ESN | TransformId::ESN => Some(Capability::ExtendedSequenceNumbers),
            _ => None,
        }
    }

    fn key_exchange(&self, group: u16) -> Result<Box<dyn KeyExchange>, CryptoError> {
        let algorithm = match group {
            19 => &agreement::ECDH_P256,
            31 => &agreement::X25519,
            _ => {
                debug!("Unsupported DH group {}", group);
                return Err("Unsupported DH group".into());
            }
        };
        Ok(Box::new(AgreementKeyExchange::new(group, algorithm)?))
    }

    fn derive_ike_keys(
        &self,
        params: &TransformParameters,
        input: &IkeKeyInput,
    ) -> Result<KeyMaterial, CryptoError> {
        let prf = prf_algorithm(params)?;
        let layout = IkeKeyLayout::new(params)?;
        let nonces = [input.nonce_initiator, input.nonce_responder].concat();
        let skeyseed = hmac::sign(
            &hmac::Key::new(prf, &nonces),
            input.shared_secret.as_slice(),
        );
        let seed = [
            input.nonce_initiator,
            input.nonce_responder,
            &input.spi_initiator.to_be_bytes(),
            &input.spi_responder.to_be_bytes(),
        ]
        .concat();
        let keys = prf_plus(prf, skeyseed.as_ref(), &seed, layout.full_length())?;
        Ok(KeyMaterial::new(keys))
    }

    fn derive_child_keys(
        &self,
        ike_params: &TransformParameters,
        ike_keys: &KeyMaterial,
        child_params: &TransformParameters,
        input: &ChildKeyInput,
    ) -> Result<KeyMaterial, CryptoError> {
        let prf = prf_algorithm(ike_params)?;
        let layout = IkeKeyLayout::new(ike_params)?;
        let sk_d = layout.key(ike_keys, layout.derive())?;
        // Each direction gets an encryption and an integrity key.
        let length = 2 * (enc_key_length(child_params)? + integ_key_length(child_params)?);
        let shared_secret = input.shared_secret.map(|secret| secret.as_slice()).unwrap_or(&[]);
        let seed = [shared_secret, input.nonce_initiator, input.nonce_responder].concat();
        Ok(KeyMaterial::new(prf_plus(prf, sk_d, &seed, length)?))
    }

    fn sign_auth(
        &self,
        params: &TransformParameters,
        ike_keys: &KeyMaterial,
        signer: Role,
        shared_key: &[u8],
        input: &AuthInput,
    ) -> Result<Vec<u8>, CryptoError> {
        let prf = prf_algorithm(params)?;
        let signed_octets = signed_octets(params, ike_keys, signer, input)?;
        let auth_key = hmac::sign(&hmac::Key::new(prf, shared_key), SHARED_KEY_PAD);
        let auth = hmac::sign(&hmac::Key::new(prf, auth_key.as_ref()), &signed_octets);
        Ok(auth.as_ref().to_vec())
    }

    fn verify_auth(
        &self,
        params: &TransformParameters,
        ike_keys: &KeyMaterial,
        signer: Role,
        shared_key: &[u8],
        input: &AuthInput,
        auth: &[u8],
    ) -> Result<bool, CryptoError> {
        let prf = prf_algorithm(params)?;
        let signed_octets = signed_octets(params, ike_keys, signer, input)?;
        let auth_key = hmac::sign(&hmac::Key::new(prf, shared_key), SHARED_KEY_PAD);
        let auth_key = hmac::Key::new(prf, auth_key.as_ref());
        Ok(hmac::verify(&auth_key, &signed_octets, auth).is_ok())
    }
}

struct AgreementKeyExchange {
    group: u16,
    algorithm: &'static agreement::Algorithm,
    private_key: agreement::EphemeralPrivateKey,
    public_key: Vec<u8>,
}

impl AgreementKeyExchange {
    fn new(
        group: u16,
        algorithm: &'static agreement::Algorithm,
    ) -> Result<AgreementKeyExchange, CryptoError> {
        let rng = SystemRandom::new();
        let private_key = agreement::EphemeralPrivateKey::generate(algorithm, &rng)
            .map_err(|_| CryptoError::from("Failed to generate private key"))?;
        let public_key = private_key
            .compute_public_key()
            .map_err(|_| CryptoError::from("Failed to compute public key"))?;
        let public_key = public_key.as_ref();
        // IKEv2 ECP public keys are encoded as x | y, without the uncompressed point tag.
        let public_key = if group == 19 {
            public_key.get(1..).unwrap_or_default()
        } else {
            public_key
        };
        Ok(AgreementKeyExchange {
            group,
            algorithm,
            private_key,
            public_key: public_key.to_vec(),
        })
    }
}

impl KeyExchange for AgreementKeyExchange {
    fn group(&self) -> u16 {
        self.group
    }

    fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    fn compute_shared_secret(
        self: Box<Self>,
        peer_public_key: &[u8],
    ) -> Result<KeyMaterial, CryptoError> {
        let key_exchange = *self;
        let peer_public_key = if key_exchange.group == 19 {
            if peer_public_key.len() != 64 {
                debug!("Unexpected ECP256 public key length {}", peer_public_key.len());
                return Err("Unexpected ECP256 public key length".into());
            }
            [&[0x04u8][..], peer_public_key].concat()
        } else {
            peer_public_key.to_vec()
        };
        let peer_public_key =
            agreement::UnparsedPublicKey::new(key_exchange.algorithm, peer_public_key);
        agreement::agree_ephemeral(
            key_exchange.private_key,
            &peer_public_key,
            CryptoError::from("Key agreement failed"),
            |shared_secret| Ok(KeyMaterial::new(shared_secret.to_vec())),
        )
    }
}

fn prf_algorithm(params: &TransformParameters) -> Result<hmac::Algorithm, CryptoError> {
    match params.prf().map(|prf| prf.id) {
        Some(TransformId::PRF_HMAC_SHA2_256) => Ok(hmac::HMAC_SHA256),
        Some(TransformId::PRF_HMAC_SHA2_384) => Ok(hmac::HMAC_SHA384),
        Some(TransformId::PRF_HMAC_SHA2_512) => Ok(hmac::HMAC_SHA512),
        _ => Err("Unsupported PRF".into()),
    }
}

fn prf_key_length(params: &TransformParameters) -> Result<usize, CryptoError> {
    match params.prf().map(|prf| prf.id) {
        Some(TransformId::PRF_HMAC_SHA2_256) => Ok(32),
        Some(TransformId::PRF_HMAC_SHA2_384) => Ok(48),
        Some(TransformId::PRF_HMAC_SHA2_512) => Ok(64),
        _ => Err("Unsupported PRF".into()),
    }
}

fn integ_key_length(params: &TransformParameters) -> Result<usize, CryptoError> {
    match params.integ().map(|integ| integ.id) {
        None | Some(TransformId::AUTH_NONE) => Ok(0),
        Some(TransformId::AUTH_HMAC_SHA2_256_128) => Ok(32),
        Some(TransformId::AUTH_HMAC_SHA2_384_192) => Ok(48),
        Some(TransformId::AUTH_HMAC_SHA2_512_256) => Ok(64),
        _ => Err("Unsupported integrity algorithm".into()),
    }
}

fn enc_key_length(params: &TransformParameters) -> Result<usize, CryptoError> {
    let enc = match params.enc() {
        Some(enc) => enc,
        None => return Ok(0),
    };
    let key_bytes = enc.key_length.map(|key_length| key_length as usize / 8);
    match (enc.id, key_bytes) {
        (TransformId::ENCR_AES_CBC, Some(key_bytes)) => Ok(key_bytes),
        (
            TransformId::ENCR_AES_GCM_8 | TransformId::ENCR_AES_GCM_12 | TransformId::ENCR_AES_GCM_16,
            Some(key_bytes),
        ) => Ok(key_bytes + AEAD_SALT_LENGTH),
        (TransformId::ENCR_CHACHA20_POLY1305, None) => Ok(32 + AEAD_SALT_LENGTH),
        _ => Err("Unsupported encryption algorithm".into()),
    }
}

/// Positions of SK_d | SK_ai | SK_ar | SK_ei | SK_er | SK_pi | SK_pr in the keystream.
struct IkeKeyLayout {
    prf_length: usize,
    integ_length: usize,
    enc_length: usize,
}

impl IkeKeyLayout {
    fn new(params: &TransformParameters) -> Result<IkeKeyLayout, CryptoError> {
        Ok(IkeKeyLayout {
            prf_length: prf_key_length(params)?,
            integ_length: integ_key_length(params)?,
            enc_length: enc_key_length(params)?,
        })
    }

    fn full_length(&self) -> usize {
        self.prf_length * 3 + self.integ_length * 2 + self.enc_length * 2
    }

    fn derive(&self) -> Range<usize> {
        0..self.prf_length
    }

    fn auth(&self, role: Role) -> Range<usize> {
        let start = match role {
            Role::Initiator => self.prf_length + self.integ_length * 2 + self.enc_length * 2,
            Role::Responder => self.prf_length * 2 + self.integ_length * 2 + self.enc_length * 2,
        };
        start..start + self.prf_length
    }

    fn key<'a>(&self, keys: &'a KeyMaterial, range: Range<usize>) -> Result<&'a [u8], CryptoError> {
        if keys.len() != self.full_length() {
            return Err("Key material doesn't match negotiated transforms".into());
        }
        keys.as_slice()
            .get(range)
            .ok_or_else(|| "Key material is too short".into())
    }
}

fn signed_octets(
    params: &TransformParameters,
    ike_keys: &KeyMaterial,
    signer: Role,
    input: &AuthInput,
) -> Result<Vec<u8>, CryptoError> {
    let prf = prf_algorithm(params)?;
    let layout = IkeKeyLayout::new(params)?;
    let sk_p = layout.key(ike_keys, layout.auth(signer))?;
    let maced_id = hmac::sign(&hmac::Key::new(prf, sk_p), input.id);
    Ok([input.message, input.peer_nonce, maced_id.as_ref()].concat())
}

/// prf+ from RFC 7296, Section 2.13.
fn prf_plus(
    prf: hmac::Algorithm,
    key: &[u8],
    seed: &[u8],
    length: usize,
) -> Result<Vec<u8>, CryptoError> {
    let key = hmac::Key::new(prf, key);
    let mut result = Vec::with_capacity(length);
    let mut previous: Vec<u8> = vec![];
    let mut counter = 1u8;
    while result.len() < length {
        let mut ctx = hmac::Context::with_key(&key);
        ctx.update(&previous);
        ctx.update(seed);
        ctx.update(&[counter]);
        previous = ctx.sign().as_ref().to_vec();
        result.extend_from_slice(&previous);
        counter = counter
            .checked_add(1)
            .ok_or_else(|| CryptoError::from("Requested too much key material"))?;
    }
    result.truncate(length);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::super::crypto::{PolicyTransform, ProposalPolicy};
    use super::super::proposal::IPSecProtocolID;
    use super::*;

    fn select(protocol_id: IPSecProtocolID, transforms: Vec<PolicyTransform>) -> TransformParameters {
        let policy = ProposalPolicy::new(protocol_id, transforms);
        let spi: &[u8] = if protocol_id == IPSecProtocolID::IKE {
            &[]
        } else {
            &[0, 0, 1, 0]
        };
        policy
            .select(&policy.to_proposal(1, spi), &AwsLcRegistry::new())
            .unwrap()
    }

    fn ike_params() -> TransformParameters {
        select(
            IPSecProtocolID::IKE,
            vec![
                PolicyTransform::with_key_length(TransformId::ENCR_AES_CBC, 256),
                PolicyTransform::new(TransformId::PRF_HMAC_SHA2_256),
                PolicyTransform::new(TransformId::AUTH_HMAC_SHA2_256_128),
                PolicyTransform::new(TransformId::DH_CURVE25519),
            ],
        )
    }

    fn ike_keys(params: &TransformParameters) -> KeyMaterial {
        let registry = AwsLcRegistry::new();
        registry
            .derive_ike_keys(
                params,
                &IkeKeyInput {
                    shared_secret: &KeyMaterial::new(vec![0x42; 32]),
                    nonce_initiator: &[1; 32],
                    nonce_responder: &[2; 32],
                    spi_initiator: 0x1111,
                    spi_responder: 0x2222,
                },
            )
            .unwrap()
    }

    #[test]
    fn resolves_supported_transforms() {
        let registry = AwsLcRegistry::new();
        assert_eq!(
            registry.resolve(TransformId::DH_256_ECP),
            Some(Capability::KeyExchange { group: 19 })
        );
        assert!(registry.resolve(TransformId::ENCR_3DES).is_none());
        assert!(registry.resolve(TransformId::DH_1024_MODP).is_none());
    }

    #[test]
    fn key_exchange_agrees() {
        let registry = AwsLcRegistry::new();
        for group in [19, 31] {
            let initiator = registry.key_exchange(group).unwrap();
            let responder = registry.key_exchange(group).unwrap();
            assert_eq!(initiator.group(), group);
            let expected_length = if group == 19 { 64 } else { 32 };
            assert_eq!(initiator.public_key().len(), expected_length);
            let initiator_public = initiator.public_key().to_vec();
            let responder_public = responder.public_key().to_vec();
            let initiator_secret = initiator.compute_shared_secret(&responder_public).unwrap();
            let responder_secret = responder.compute_shared_secret(&initiator_public).unwrap();
            assert_eq!(initiator_secret, responder_secret);
            assert_eq!(initiator_secret.len(), 32);
        }
    }

    #[test]
    fn rejects_bad_public_key() {
        let registry = AwsLcRegistry::new();
        let dh = registry.key_exchange(19).unwrap();
        assert!(dh.compute_shared_secret(&[0x01; 10]).is_err());
        assert!(registry.key_exchange(2).is_err());
    }

    #[test]
    fn prf_plus_starts_with_first_block() {
        let key = hmac::Key::new(hmac::HMAC_SHA256, b"key");
        let first = hmac::sign(&key, b"seed\x01");
        let keystream = prf_plus(hmac::HMAC_SHA256, b"key", b"seed", 80).unwrap();
        assert_eq!(keystream.len(), 80);
        assert_eq!(&keystream[..32], first.as_ref());
        assert!(prf_plus(hmac::HMAC_SHA256, b"key", b"seed", 32 * 256).is_err());
    }

    #[test]
    fn derives_ike_keys() {
        let params = ike_params();
        let keys = ike_keys(&params);
        // SK_d, SK_pi, SK_pr + 2 HMAC-SHA256 keys + 2 AES-256 keys.
        assert_eq!(keys.len(), 32 * 3 + 32 * 2 + 32 * 2);
        assert_eq!(keys, ike_keys(&params));
    }

    #[test]
    fn shared_key_auth() {
        let registry = AwsLcRegistry::new();
        let params = ike_params();
        let keys = ike_keys(&params);
        let input = AuthInput {
            message: b"first message",
            peer_nonce: &[2; 32],
            id: &[2, 0, 0, 0, b'a'],
        };
        let auth = registry
            .sign_auth(&params, &keys, Role::Initiator, b"secret", &input)
            .unwrap();
        assert!(registry
            .verify_auth(&params, &keys, Role::Initiator, b"secret", &input, &auth)
            .unwrap());
        assert!(!registry
            .verify_auth(&params, &keys, Role::Initiator, b"wrong", &input, &auth)
            .unwrap());
        assert!(!registry
            .verify_auth(&params, &keys, Role::Responder, b"secret", &input, &auth)
            .unwrap());
    }

    #[test]
    fn derives_child_keys() {
        let registry = AwsLcRegistry::new();
        let params = ike_params();
        let keys = ike_keys(&params);
        let child = select(
            IPSecProtocolID::ESP,
            vec![
                PolicyTransform::with_key_length(TransformId::ENCR_AES_GCM_16, 256),
                PolicyTransform::new(TransformId::NO_ESN),
            ],
        );
        let input = ChildKeyInput {
            shared_secret: None,
            nonce_initiator: &[3; 32],
            nonce_responder: &[4; 32],
        };
        let child_keys = registry
            .derive_child_keys(&params, &keys, &child, &input)
            .unwrap();
        assert_eq!(child_keys.len(), 2 * (32 + 4));
        let pfs_secret = KeyMaterial::new(vec![9; 32]);
        let pfs_keys = registry
            .derive_child_keys(
                &params,
                &keys,
                &child,
                &ChildKeyInput {
                    shared_secret: Some(&pfs_secret),
                    ..input
                },
            )
            .unwrap();
        assert_ne!(child_keys, pfs_keys);
    }
}
