use std::{error, fmt};

use aws_lc_rs::digest;
use log::{debug, trace};

use super::message::Spi;
use super::proposal::{IPSecProtocolID, Proposal, Transform, TransformId, TransformType};

/// What a registry knows about a transform identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    /// Encryption algorithm; an empty list means the transform has no key length attribute.
    Encryption {
        key_lengths: &'static [u16],
        aead: bool,
    },
    Pseudorandom {
        output_length: usize,
    },
    Integrity {
        key_length: usize,
    },
    KeyExchange {
        group: u16,
    },
    ExtendedSequenceNumbers,
}

impl Capability {
    fn accepts_key_length(&self, key_length: Option<u16>) -> bool {
        match (self, key_length) {
            (Capability::Encryption { key_lengths, .. }, Some(key_length)) => {
                key_lengths.contains(&key_length)
            }
            (Capability::Encryption { key_lengths, .. }, None) => key_lengths.is_empty(),
            (_, key_length) => key_length.is_none(),
        }
    }
}

/// An in-progress Diffie-Hellman exchange, owning the local private key.
pub trait KeyExchange: Send {
    fn group(&self) -> u16;

    fn public_key(&self) -> &[u8];

    fn compute_shared_secret(
        self: Box<Self>,
        peer_public_key: &[u8],
    ) -> Result<KeyMaterial, CryptoError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

/// Inputs for an IKE SA key derivation.
pub struct IkeKeyInput<'a> {
    pub shared_secret: &'a KeyMaterial,
    pub nonce_initiator: &'a [u8],
    pub nonce_responder: &'a [u8],
    pub spi_initiator: u64,
    pub spi_responder: u64,
}

/// Inputs for a child SA key derivation.
pub struct ChildKeyInput<'a> {
    pub shared_secret: Option<&'a KeyMaterial>,
    pub nonce_initiator: &'a [u8],
    pub nonce_responder: &'a [u8],
}

/// Octets signed by one side during IKE_AUTH.
pub struct AuthInput<'a> {
    /// The first message sent by the signer.
    pub message: &'a [u8],
    /// Nonce received from the other side.
    pub peer_nonce: &'a [u8],
    /// Identification payload body of the signer.
    pub id: &'a [u8],
}

/// Pluggable provider of cryptographic algorithms, selected by negotiated transform identifiers.
pub trait CryptoRegistry: Send + Sync {
    fn resolve(&self, id: TransformId) -> Option<Capability>;

    fn key_exchange(&self, group: u16) -> Result<Box<dyn KeyExchange>, CryptoError>;

    fn derive_ike_keys(
        &self,
        params: &TransformParameters,
        input: &IkeKeyInput,
    ) -> Result<KeyMaterial, CryptoError>;

    fn derive_child_keys(
        &self,
        ike_params: &TransformParameters,
        ike_keys: &KeyMaterial,
        child_params: &TransformParameters,
        input: &ChildKeyInput,
    ) -> Result<KeyMaterial, CryptoError>;

    fn sign_auth(
        &self,
        params: &TransformParameters,
        ike_keys: &KeyMaterial,
        signer: Role,
        shared_key: &[u8],
        input: &AuthInput,
    ) -> Result<Vec<u8>, CryptoError>;

    fn verify_auth(
        &self,
        params: &TransformParameters,
        ike_keys: &KeyMaterial,
        signer: Role,
        shared_key: &[u8],
        input: &AuthInput,
        auth: &[u8],
    ) -> Result<bool, CryptoError>;
}

/// Opaque key material, only interpreted by the registry that produced it.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    data: Vec<u8>,
}

impl KeyMaterial {
    pub fn new(data: Vec<u8>) -> KeyMaterial {
        KeyMaterial { data }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial({} bytes)", self.data.len())
    }
}

/// A transform which is acceptable for the local side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PolicyTransform {
    pub id: TransformId,
    pub key_length: Option<u16>,
}

impl PolicyTransform {
    pub fn new(id: TransformId) -> PolicyTransform {
        PolicyTransform {
            id,
            key_length: None,
        }
    }

    pub fn with_key_length(id: TransformId, key_length: u16) -> PolicyTransform {
        PolicyTransform {
            id,
            key_length: Some(key_length),
        }
    }

    fn matches(&self, transform: &Transform) -> bool {
        self.id == transform.id && self.key_length == transform.key_length()
    }
}

/// Locally acceptable proposal; every transform type listed here must be negotiated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProposalPolicy {
    pub protocol_id: IPSecProtocolID,
    pub transforms: Vec<PolicyTransform>,
}

impl ProposalPolicy {
    pub fn new(protocol_id: IPSecProtocolID, transforms: Vec<PolicyTransform>) -> ProposalPolicy {
        ProposalPolicy {
            protocol_id,
            transforms,
        }
    }

    fn required_types(&self) -> Vec<TransformType> {
        let mut types = self
            .transforms
            .iter()
            .map(|tf| tf.id.transform_type())
            .collect::<Vec<_>>();
        types.sort();
        types.dedup();
        types
    }

    /// Returns the negotiated parameters if the offered proposal satisfies this policy.
    pub fn select(
        &self,
        proposal: &Proposal,
        registry: &dyn CryptoRegistry,
    ) -> Option<TransformParameters> {
        if proposal.protocol_id != self.protocol_id {
            return None;
        }
        let remote_spi = match Spi::from_slice(proposal.spi) {
            Ok(spi) => spi,
            Err(err) => {
                debug!("Proposal {} has invalid SPI: {}", proposal.proposal_num, err);
                return None;
            }
        };
        let mut params =
            TransformParameters::new(proposal.proposal_num, proposal.protocol_id, remote_spi);
        for transform_type in self.required_types() {
            let selected = proposal.transforms_of(transform_type).find(|tf| {
                self.transforms.iter().any(|policy| policy.matches(tf))
                    && registry
                        .resolve(tf.id)
                        .map(|capability| capability.accepts_key_length(tf.key_length()))
                        .unwrap_or(false)
            });
            let selected = match selected {
                Some(selected) => selected,
                None => {
                    trace!(
                        "Proposal {} has no acceptable {} transform",
                        proposal.proposal_num,
                        transform_type
                    );
                    return None;
                }
            };
            params.transforms.push(SelectedTransform {
                id: selected.id,
                key_length: selected.key_length(),
            });
        }
        Some(params)
    }

    /// Builds an offer for this policy, listing every acceptable transform.
    pub fn to_proposal<'a>(&self, proposal_num: u8, spi: &'a [u8]) -> Proposal<'a> {
        let mut transforms = self.transforms.clone();
        transforms.sort_by_key(|tf| tf.id.transform_type());
        Proposal {
            proposal_num,
            protocol_id: self.protocol_id,
            spi,
            transforms: transforms
                .iter()
                .map(|tf| match tf.key_length {
                    Some(key_length) => Transform::with_key_length(tf.id, key_length),
                    None => Transform::new(tf.id),
                })
                .collect(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SelectedTransform {
    pub id: TransformId,
    pub key_length: Option<u16>,
}

/// Negotiated transforms of one IKE or child SA.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransformParameters {
    proposal_num: u8,
    protocol_id: IPSecProtocolID,
    local_spi: Spi,
    remote_spi: Spi,
    transforms: Vec<SelectedTransform>,
}

impl TransformParameters {
    fn new(proposal_num: u8, protocol_id: IPSecProtocolID, remote_spi: Spi) -> TransformParameters {
        TransformParameters {
            proposal_num,
            protocol_id,
            local_spi: Spi::None,
            remote_spi,
            transforms: vec![],
        }
    }

    pub fn proposal_num(&self) -> u8 {
        self.proposal_num
    }

    pub fn protocol_id(&self) -> IPSecProtocolID {
        self.protocol_id
    }

    pub fn local_spi(&self) -> Spi {
        self.local_spi
    }

    pub fn set_local_spi(&mut self, local_spi: Spi) {
        self.local_spi = local_spi
    }

    pub fn remote_spi(&self) -> Spi {
        self.remote_spi
    }

    pub fn set_remote_spi(&mut self, remote_spi: Spi) {
        self.remote_spi = remote_spi
    }

    fn get(&self, transform_type: TransformType) -> Option<&SelectedTransform> {
        self.transforms
            .iter()
            .find(|tf| tf.id.transform_type() == transform_type)
    }

    pub fn enc(&self) -> Option<&SelectedTransform> {
        self.get(TransformType::ENCRYPTION_ALGORITHM)
    }

    pub fn prf(&self) -> Option<&SelectedTransform> {
        self.get(TransformType::PSEUDORANDOM_FUNCTION)
    }

    pub fn integ(&self) -> Option<&SelectedTransform> {
        self.get(TransformType::INTEGRITY_ALGORITHM)
    }

    pub fn dh(&self) -> Option<&SelectedTransform> {
        self.get(TransformType::DIFFIE_HELLMAN_GROUP)
    }

    pub fn esn(&self) -> Option<&SelectedTransform> {
        self.get(TransformType::EXTENDED_SEQUENCE_NUMBERS)
    }

    /// DH group, unless the policy negotiated none.
    pub fn dh_group(&self) -> Option<u16> {
        self.dh()
            .map(|dh| dh.id)
            .filter(|id| *id != TransformId::DH_NONE)
            .map(|id| id.id())
    }

    pub fn iter_parameters(&self) -> impl Iterator<Item = &SelectedTransform> {
        self.transforms.iter()
    }

    /// The selected proposal, as sent back in a response.
    pub fn to_proposal<'a>(&self, spi: &'a [u8]) -> Proposal<'a> {
        Proposal {
            proposal_num: self.proposal_num,
            protocol_id: self.protocol_id,
            spi,
            transforms: self
                .transforms
                .iter()
                .map(|tf| match tf.key_length {
                    Some(key_length) => Transform::with_key_length(tf.id, key_length),
                    None => Transform::new(tf.id),
                })
                .collect(),
        }
    }
}

impl fmt::Display for TransformParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} proposal {}", self.protocol_id, self.proposal_num)?;
        for tf in self.transforms.iter() {
            match tf.key_length {
                Some(key_length) => write!(f, " {}-{}", tf.id, key_length)?,
                None => write!(f, " {}", tf.id)?,
            }
        }
        Ok(())
    }
}

/// Picks the first offered proposal which satisfies any of the local policies.
pub fn choose_sa_parameters(
    proposals: &[Proposal],
    policies: &[ProposalPolicy],
    registry: &dyn CryptoRegistry,
) -> Option<TransformParameters> {
    proposals.iter().find_map(|prop| {
        policies
            .iter()
            .find_map(|policy| policy.select(prop, registry))
    })
}

/// Validates a responder's choice against the offer made from the policies.
///
/// The response must contain exactly one proposal, numbered after the offered policy,
/// with exactly one transform for every type required by that policy.
pub fn verify_chosen_parameters(
    proposals: &[Proposal],
    policies: &[ProposalPolicy],
    registry: &dyn CryptoRegistry,
) -> Option<TransformParameters> {
    let prop = match proposals {
        [prop] => prop,
        _ => {
            debug!("Response contains {} proposals", proposals.len());
            return None;
        }
    };
    let policy = policies.get((prop.proposal_num as usize).checked_sub(1)?)?;
    let required_types = policy.required_types();
    let mut offered_types = prop
        .transforms
        .iter()
        .map(|tf| tf.id.transform_type())
        .collect::<Vec<_>>();
    offered_types.sort();
    if offered_types != required_types {
        debug!("Response proposal {} doesn't match the offer", prop.proposal_num);
        return None;
    }
    policy.select(prop, registry)
}

pub fn hash_sha256(data: &[u8]) -> [u8; 32] {
    let mut result = [0u8; 32];
    result.copy_from_slice(digest::digest(&digest::SHA256, data).as_ref());
    result
}

pub struct CryptoError {
    msg: &'static str,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl fmt::Debug for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl error::Error for CryptoError {}

impl From<&'static str> for CryptoError {
    fn from(msg: &'static str) -> CryptoError {
        CryptoError { msg }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Knows about GCM, PRF-SHA256 and a few DH groups, nothing else.
    struct StubRegistry {}

    impl CryptoRegistry for StubRegistry {
        fn resolve(&self, id: TransformId) -> Option<Capability> {
            match id {
                TransformId::ENCR_AES_GCM_16 => Some(Capability::Encryption {
                    key_lengths: &[128, 256],
                    aead: true,
                }),
                TransformId::ENCR_AES_CBC => Some(Capability::Encryption {
                    key_lengths: &[256],
                    aead: false,
                }),
                TransformId::PRF_HMAC_SHA2_256 => {
                    Some(Capability::Pseudorandom { output_length: 32 })
                }
                TransformId::DH_256_ECP => Some(Capability::KeyExchange { group: 19 }),
                TransformId::DH_CURVE25519 => Some(Capability::KeyExchange { group: 31 }),
                _ => None,
            }
        }

        fn key_exchange(&self, _group: u16) -> Result<Box<dyn KeyExchange>, CryptoError> {
            Err("Not implemented".into())
        }

        fn derive_ike_keys(
            &self,
            _params: &TransformParameters,
            _input: &IkeKeyInput,
        ) -> Result<KeyMaterial, CryptoError> {
            Err("Not implemented".into())
        }

        fn derive_child_keys(
            &self,
            _ike_params: &TransformParameters,
            _ike_keys: &KeyMaterial,
            _child_params: &TransformParameters,
            _input: &ChildKeyInput,
        ) -> Result<KeyMaterial, CryptoError> {
            Err("Not implemented".into())
        }

        fn sign_auth(
            &self,
            _params: &TransformParameters,
            _ike_keys: &KeyMaterial,
            _signer: Role,
            _shared_key: &[u8],
            _input: &AuthInput,
        ) -> Result<Vec<u8>, CryptoError> {
            Err("Not implemented".into())
        }

        fn verify_auth(
            &self,
            _params: &TransformParameters,
            _ike_keys: &KeyMaterial,
            _signer: Role,
            _shared_key: &[u8],
            _input: &AuthInput,
            _auth: &[u8],
        ) -> Result<bool, CryptoError> {
            Err("Not implemented".into())
        }
    }

    fn local_policy() -> Vec<ProposalPolicy> {
        vec![ProposalPolicy::new(
            IPSecProtocolID::IKE,
            vec![
                PolicyTransform::with_key_length(TransformId::ENCR_AES_GCM_16, 256),
                PolicyTransform::new(TransformId::PRF_HMAC_SHA2_256),
                PolicyTransform::new(TransformId::DH_256_ECP),
            ],
        )]
    }

    fn proposal_a() -> Proposal<'static> {
        Proposal {
            proposal_num: 1,
            protocol_id: IPSecProtocolID::IKE,
            spi: &[],
            transforms: vec![
                Transform::new(TransformId::ENCR_3DES),
                Transform::new(TransformId::PRF_HMAC_SHA2_256),
                Transform::new(TransformId::DH_256_ECP),
            ],
        }
    }

    fn proposal_b() -> Proposal<'static> {
        Proposal {
            proposal_num: 2,
            protocol_id: IPSecProtocolID::IKE,
            spi: &[],
            transforms: vec![
                Transform::with_key_length(TransformId::ENCR_AES_GCM_16, 256),
                Transform::new(TransformId::PRF_HMAC_SHA2_256),
                Transform::new(TransformId::DH_256_ECP),
            ],
        }
    }

    #[test]
    fn picks_first_satisfying_proposal() {
        let params =
            choose_sa_parameters(&[proposal_a(), proposal_b()], &local_policy(), &StubRegistry {})
                .unwrap();
        assert_eq!(params.proposal_num(), 2);
        assert_eq!(
            params.enc(),
            Some(&SelectedTransform {
                id: TransformId::ENCR_AES_GCM_16,
                key_length: Some(256)
            })
        );
        assert_eq!(params.dh_group(), Some(19));
        assert!(params.integ().is_none());
    }

    #[test]
    fn selection_follows_offer_order() {
        let mut first = proposal_b();
        first.proposal_num = 1;
        first.transforms[2] = Transform::new(TransformId::DH_CURVE25519);
        first.transforms.push(Transform::new(TransformId::DH_256_ECP));
        let params =
            choose_sa_parameters(&[first, proposal_b()], &local_policy(), &StubRegistry {})
                .unwrap();
        assert_eq!(params.proposal_num(), 1);
        // DH_CURVE25519 is resolvable but not in policy, so the next offered group is used.
        assert_eq!(params.dh_group(), Some(19));
    }

    #[test]
    fn no_acceptable_proposal() {
        assert!(
            choose_sa_parameters(&[proposal_a()], &local_policy(), &StubRegistry {}).is_none()
        );
        let mut wrong_key_length = proposal_b();
        wrong_key_length.transforms[0] =
            Transform::with_key_length(TransformId::ENCR_AES_GCM_16, 128);
        assert!(
            choose_sa_parameters(&[wrong_key_length], &local_policy(), &StubRegistry {})
                .is_none()
        );
        let mut wrong_protocol = proposal_b();
        wrong_protocol.protocol_id = IPSecProtocolID::ESP;
        wrong_protocol.spi = &[1, 2, 3, 4];
        assert!(
            choose_sa_parameters(&[wrong_protocol], &local_policy(), &StubRegistry {}).is_none()
        );
    }

    #[test]
    fn policy_transform_must_be_resolvable() {
        let policy = vec![ProposalPolicy::new(
            IPSecProtocolID::IKE,
            vec![
                PolicyTransform::new(TransformId::ENCR_3DES),
                PolicyTransform::new(TransformId::PRF_HMAC_SHA2_256),
                PolicyTransform::new(TransformId::DH_256_ECP),
            ],
        )];
        assert!(choose_sa_parameters(&[proposal_a()], &policy, &StubRegistry {}).is_none());
    }

    #[test]
    fn selected_proposal_is_echoed_back() {
        let params =
            choose_sa_parameters(&[proposal_a(), proposal_b()], &local_policy(), &StubRegistry {})
                .unwrap();
        assert_eq!(params.to_proposal(&[]), proposal_b());
    }

    #[test]
    fn verifies_responder_choice() {
        let policies = local_policy();
        let offer = policies[0].to_proposal(1, &[]);
        let params = verify_chosen_parameters(&[offer.clone()], &policies, &StubRegistry {});
        assert_eq!(params.map(|params| params.proposal_num()), Some(1));
        assert!(
            verify_chosen_parameters(&[offer.clone(), offer.clone()], &policies, &StubRegistry {})
                .is_none()
        );
        let mut extra = offer;
        extra.transforms.push(Transform::new(TransformId::DH_CURVE25519));
        assert!(verify_chosen_parameters(&[extra], &policies, &StubRegistry {}).is_none());
    }

    #[test]
    fn sha256_hash() {
        let hash = hash_sha256(b"abc");
        assert_eq!(
            hash[..4],
            [0xba, 0x78, 0x16, 0xbf],
        );
    }
}
