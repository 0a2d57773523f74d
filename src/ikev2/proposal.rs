use std::fmt;

use log::debug;

use super::message::{FormatError, NotEnoughSpaceError};
use super::octets::Octets;

const SUBSTRUCTURE_LAST: u8 = 0;
const SUBSTRUCTURE_MORE_PROPOSALS: u8 = 2;
const SUBSTRUCTURE_MORE_TRANSFORMS: u8 = 3;

const PROPOSAL_HEADER_LENGTH: usize = 8;
const TRANSFORM_HEADER_LENGTH: usize = 8;
const ATTRIBUTE_HEADER_LENGTH: usize = 4;

const ATTRIBUTE_FORMAT_TV: u16 = 1 << 15;
const ATTRIBUTE_TYPE_MASK: u16 = !ATTRIBUTE_FORMAT_TV;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IPSecProtocolID(u8);

impl IPSecProtocolID {
    pub const IKE: IPSecProtocolID = IPSecProtocolID(1);
    pub const AH: IPSecProtocolID = IPSecProtocolID(2);
    pub const ESP: IPSecProtocolID = IPSecProtocolID(3);

    pub fn from_u8(value: u8) -> IPSecProtocolID {
        IPSecProtocolID(value)
    }

    pub fn protocol_id(&self) -> u8 {
        self.0
    }

    pub fn is_known(&self) -> bool {
        (Self::IKE.0..=Self::ESP.0).contains(&self.0)
    }
}

impl fmt::Display for IPSecProtocolID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::IKE => write!(f, "IKE"),
            Self::AH => write!(f, "AH"),
            Self::ESP => write!(f, "ESP"),
            _ => write!(f, "Unknown IPSec Protocol ID {}", self.0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransformType(u8);

impl TransformType {
    pub const ENCRYPTION_ALGORITHM: TransformType = TransformType(1);
    pub const PSEUDORANDOM_FUNCTION: TransformType = TransformType(2);
    pub const INTEGRITY_ALGORITHM: TransformType = TransformType(3);
    pub const DIFFIE_HELLMAN_GROUP: TransformType = TransformType(4);
    pub const EXTENDED_SEQUENCE_NUMBERS: TransformType = TransformType(5);

    pub fn from_u8(value: u8) -> TransformType {
        TransformType(value)
    }

    pub fn type_id(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for TransformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ENCRYPTION_ALGORITHM => write!(f, "ENCR"),
            Self::PSEUDORANDOM_FUNCTION => write!(f, "PRF"),
            Self::INTEGRITY_ALGORITHM => write!(f, "INTEG"),
            Self::DIFFIE_HELLMAN_GROUP => write!(f, "D-H"),
            Self::EXTENDED_SEQUENCE_NUMBERS => write!(f, "ESN"),
            _ => write!(f, "Unknown transform type {}", self.0),
        }
    }
}

/// Transform type and algorithm number pair.
// See http://www.iana.org/assignments/ikev2-parameters/ for additional values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransformId(TransformType, u16);

impl TransformId {
    pub const ENCR_DES: TransformId = TransformId(TransformType::ENCRYPTION_ALGORITHM, 2);
    pub const ENCR_3DES: TransformId = TransformId(TransformType::ENCRYPTION_ALGORITHM, 3);
    pub const ENCR_NULL: TransformId = TransformId(TransformType::ENCRYPTION_ALGORITHM, 11);
    pub const ENCR_AES_CBC: TransformId = TransformId(TransformType::ENCRYPTION_ALGORITHM, 12);
    pub const ENCR_AES_CTR: TransformId = TransformId(TransformType::ENCRYPTION_ALGORITHM, 13);
    pub const ENCR_AES_GCM_8: TransformId = TransformId(TransformType::ENCRYPTION_ALGORITHM, 18);
    pub const ENCR_AES_GCM_12: TransformId = TransformId(TransformType::ENCRYPTION_ALGORITHM, 19);
    pub const ENCR_AES_GCM_16: TransformId = TransformId(TransformType::ENCRYPTION_ALGORITHM, 20);
    pub const ENCR_CHACHA20_POLY1305: TransformId =
        TransformId(TransformType::ENCRYPTION_ALGORITHM, 28);

    pub const PRF_HMAC_MD5: TransformId = TransformId(TransformType::PSEUDORANDOM_FUNCTION, 1);
    pub const PRF_HMAC_SHA1: TransformId = TransformId(TransformType::PSEUDORANDOM_FUNCTION, 2);
    pub const PRF_HMAC_SHA2_256: TransformId =
        TransformId(TransformType::PSEUDORANDOM_FUNCTION, 5);
    pub const PRF_HMAC_SHA2_384: TransformId =
        TransformId(TransformType::PSEUDORANDOM_FUNCTION, 6);
    pub const PRF_HMAC_SHA2_512: TransformId =
        TransformId(TransformType::PSEUDORANDOM_FUNCTION, 7);

    pub const AUTH_NONE: TransformId = TransformId(TransformType::INTEGRITY_ALGORITHM, 0);
    pub const AUTH_HMAC_MD5_96: TransformId = TransformId(TransformType::INTEGRITY_ALGORITHM, 1);
    pub const AUTH_HMAC_SHA1_96: TransformId = TransformId(TransformType::INTEGRITY_ALGORITHM, 2);
    pub const AUTH_HMAC_SHA2_256_128: TransformId =
        TransformId(TransformType::INTEGRITY_ALGORITHM, 12);
    pub const AUTH_HMAC_SHA2_384_192: TransformId =
        TransformId(TransformType::INTEGRITY_ALGORITHM, 13);
    pub const AUTH_HMAC_SHA2_512_256: TransformId =
        TransformId(TransformType::INTEGRITY_ALGORITHM, 14);

    pub const DH_NONE: TransformId = TransformId(TransformType::DIFFIE_HELLMAN_GROUP, 0);
    pub const DH_1024_MODP: TransformId = TransformId(TransformType::DIFFIE_HELLMAN_GROUP, 2);
    pub const DH_2048_MODP: TransformId = TransformId(TransformType::DIFFIE_HELLMAN_GROUP, 14);
    pub const DH_256_ECP: TransformId = TransformId(TransformType::DIFFIE_HELLMAN_GROUP, 19);
    pub const DH_384_ECP: TransformId = TransformId(TransformType::DIFFIE_HELLMAN_GROUP, 20);
    pub const DH_CURVE25519: TransformId = TransformId(TransformType::DIFFIE_HELLMAN_GROUP, 31);

    pub const NO_ESN: TransformId = TransformId(TransformType::EXTENDED_SEQUENCE_NUMBERS, 0);
    pub const ESN: TransformId = TransformId(TransformType::EXTENDED_SEQUENCE_NUMBERS, 1);

    pub fn new(transform_type: TransformType, id: u16) -> TransformId {
        TransformId(transform_type, id)
    }

    pub fn transform_type(&self) -> TransformType {
        self.0
    }

    pub fn id(&self) -> u16 {
        self.1
    }
}

impl fmt::Display for TransformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ENCR_DES => write!(f, "ENCR_DES"),
            Self::ENCR_3DES => write!(f, "ENCR_3DES"),
            Self::ENCR_NULL => write!(f, "ENCR_NULL"),
            Self::ENCR_AES_CBC => write!(f, "ENCR_AES_CBC"),
            Self::ENCR_AES_CTR => write!(f, "ENCR_AES_CTR"),
            Self::ENCR_AES_GCM_8 => write!(f, "ENCR_AES_GCM_8"),
            Self::ENCR_AES_GCM_12 => write!(f, "ENCR_AES_GCM_12"),
            Self::ENCR_AES_GCM_16 => write!(f, "ENCR_AES_GCM_16"),
            Self::ENCR_CHACHA20_POLY1305 => write!(f, "ENCR_CHACHA20_POLY1305"),
            Self::PRF_HMAC_MD5 => write!(f, "PRF_HMAC_MD5"),
            Self::PRF_HMAC_SHA1 => write!(f, "PRF_HMAC_SHA1"),
            Self::PRF_HMAC_SHA2_256 => write!(f, "PRF_HMAC_SHA2_256"),
            Self::PRF_HMAC_SHA2_384 => write!(f, "PRF_HMAC_SHA2_384"),
            Self::PRF_HMAC_SHA2_512 => write!(f, "PRF_HMAC_SHA2_512"),
            Self::AUTH_NONE => write!(f, "AUTH_NONE"),
            Self::AUTH_HMAC_MD5_96 => write!(f, "AUTH_HMAC_MD5_96"),
            Self::AUTH_HMAC_SHA1_96 => write!(f, "AUTH_HMAC_SHA1_96"),
            Self::AUTH_HMAC_SHA2_256_128 => write!(f, "AUTH_HMAC_SHA2_256_128"),
            Self::AUTH_HMAC_SHA2_384_192 => write!(f, "AUTH_HMAC_SHA2_384_192"),
            Self::AUTH_HMAC_SHA2_512_256 => write!(f, "AUTH_HMAC_SHA2_512_256"),
            Self::DH_NONE => write!(f, "DH_NONE"),
            Self::DH_1024_MODP => write!(f, "DH_1024_MODP"),
            Self::DH_2048_MODP => write!(f, "DH_2048_MODP"),
            Self::DH_256_ECP => write!(f, "DH_256_ECP"),
            Self::DH_384_ECP => write!(f, "DH_384_ECP"),
            Self::DH_CURVE25519 => write!(f, "DH_CURVE25519"),
            Self::NO_ESN => write!(f, "NO_ESN"),
            Self::ESN => write!(f, "ESN"),
            _ => write!(f, "{} transform ID {}", self.0, self.1),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransformAttributeType(u16);

impl TransformAttributeType {
    pub const KEY_LENGTH: TransformAttributeType = TransformAttributeType(14);

    pub fn from_u16(value: u16) -> TransformAttributeType {
        TransformAttributeType(value & ATTRIBUTE_TYPE_MASK)
    }

    pub fn type_id(&self) -> u16 {
        self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttributeValue<'a> {
    /// Type/Value format, the value is stored inline.
    Short(u16),
    /// Type/Length/Value format.
    Variable(&'a [u8]),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransformAttribute<'a> {
    pub attribute_type: TransformAttributeType,
    pub value: AttributeValue<'a>,
}

impl TransformAttribute<'_> {
    pub fn key_length(key_length: u16) -> TransformAttribute<'static> {
        TransformAttribute {
            attribute_type: TransformAttributeType::KEY_LENGTH,
            value: AttributeValue::Short(key_length),
        }
    }

    fn encoded_length(&self) -> usize {
        match self.value {
            AttributeValue::Short(_) => ATTRIBUTE_HEADER_LENGTH,
            AttributeValue::Variable(value) => ATTRIBUTE_HEADER_LENGTH + value.len(),
        }
    }

    fn write(&self, dest: &mut [u8]) -> usize {
        match self.value {
            AttributeValue::Short(value) => {
                let attribute_type = self.attribute_type.0 | ATTRIBUTE_FORMAT_TV;
                dest[0..2].copy_from_slice(&attribute_type.to_be_bytes());
                dest[2..4].copy_from_slice(&value.to_be_bytes());
                ATTRIBUTE_HEADER_LENGTH
            }
            AttributeValue::Variable(value) => {
                dest[0..2].copy_from_slice(&self.attribute_type.0.to_be_bytes());
                dest[2..4].copy_from_slice(&(value.len() as u16).to_be_bytes());
                dest[4..4 + value.len()].copy_from_slice(value);
                ATTRIBUTE_HEADER_LENGTH + value.len()
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transform<'a> {
    pub id: TransformId,
    pub attributes: Vec<TransformAttribute<'a>>,
}

impl<'a> Transform<'a> {
    pub fn new(id: TransformId) -> Transform<'a> {
        Transform {
            id,
            attributes: vec![],
        }
    }

    pub fn with_key_length(id: TransformId, key_length: u16) -> Transform<'a> {
        Transform {
            id,
            attributes: vec![TransformAttribute::key_length(key_length)],
        }
    }

    pub fn key_length(&self) -> Option<u16> {
        self.attributes.iter().find_map(|attr| {
            match (attr.attribute_type, attr.value) {
                (TransformAttributeType::KEY_LENGTH, AttributeValue::Short(key_length)) => {
                    Some(key_length)
                }
                _ => None,
            }
        })
    }

    fn encoded_length(&self) -> usize {
        TRANSFORM_HEADER_LENGTH
            + self
                .attributes
                .iter()
                .map(|attr| attr.encoded_length())
                .sum::<usize>()
    }

    fn write(&self, dest: &mut [u8], last: bool) -> usize {
        let length = self.encoded_length();
        dest[0] = if last {
            SUBSTRUCTURE_LAST
        } else {
            SUBSTRUCTURE_MORE_TRANSFORMS
        };
        dest[1] = 0;
        dest[2..4].copy_from_slice(&(length as u16).to_be_bytes());
        dest[4] = self.id.transform_type().type_id();
        dest[5] = 0;
        dest[6..8].copy_from_slice(&self.id.id().to_be_bytes());
        let mut offset = TRANSFORM_HEADER_LENGTH;
        for attr in self.attributes.iter() {
            offset += attr.write(&mut dest[offset..]);
        }
        offset
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proposal<'a> {
    pub proposal_num: u8,
    pub protocol_id: IPSecProtocolID,
    pub spi: &'a [u8],
    pub transforms: Vec<Transform<'a>>,
}

impl<'a> Proposal<'a> {
    pub fn transforms_of(
        &self,
        transform_type: TransformType,
    ) -> impl Iterator<Item = &Transform<'a>> + '_ {
        self.transforms
            .iter()
            .filter(move |tf| tf.id.transform_type() == transform_type)
    }

    fn encoded_length(&self) -> usize {
        PROPOSAL_HEADER_LENGTH
            + self.spi.len()
            + self
                .transforms
                .iter()
                .map(|tf| tf.encoded_length())
                .sum::<usize>()
    }

    fn write(&self, dest: &mut [u8], last: bool) -> usize {
        let length = self.encoded_length();
        dest[0] = if last {
            SUBSTRUCTURE_LAST
        } else {
            SUBSTRUCTURE_MORE_PROPOSALS
        };
        dest[1] = 0;
        dest[2..4].copy_from_slice(&(length as u16).to_be_bytes());
        dest[4] = self.proposal_num;
        dest[5] = self.protocol_id.0;
        dest[6] = self.spi.len() as u8;
        dest[7] = self.transforms.len() as u8;
        dest[8..8 + self.spi.len()].copy_from_slice(self.spi);
        let mut offset = PROPOSAL_HEADER_LENGTH + self.spi.len();
        for (i, tf) in self.transforms.iter().enumerate() {
            offset += tf.write(&mut dest[offset..], i + 1 == self.transforms.len());
        }
        offset
    }

    fn validate_encoding(&self) -> Result<(), NotEnoughSpaceError> {
        if self.spi.len() > u8::MAX as usize || self.transforms.len() > u8::MAX as usize {
            return Err(NotEnoughSpaceError {});
        }
        let attributes_fit = self.transforms.iter().all(|tf| {
            tf.attributes.iter().all(|attr| match attr.value {
                AttributeValue::Short(_) => true,
                AttributeValue::Variable(value) => value.len() <= u16::MAX as usize,
            }) && tf.encoded_length() <= u16::MAX as usize
        });
        if !attributes_fit || self.encoded_length() > u16::MAX as usize {
            return Err(NotEnoughSpaceError {});
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityAssociation<'a> {
    pub proposals: Vec<Proposal<'a>>,
}

impl<'a> SecurityAssociation<'a> {
    pub fn from_payload(data: Octets<'a>) -> Result<SecurityAssociation<'a>, FormatError> {
        Ok(SecurityAssociation {
            proposals: decode_proposals(data)?,
        })
    }
}

/// Total encoded length of a proposal list, as it would appear in an SA payload body.
pub fn proposals_length(proposals: &[Proposal]) -> Result<usize, NotEnoughSpaceError> {
    proposals.iter().try_fold(0usize, |acc, prop| {
        prop.validate_encoding()?;
        Ok(acc + prop.encoded_length())
    })
}

/// Writes proposals into dest, returning the number of bytes written.
pub fn write_proposals(dest: &mut [u8], proposals: &[Proposal]) -> Result<usize, NotEnoughSpaceError> {
    let length = proposals_length(proposals)?;
    if dest.len() < length {
        return Err(NotEnoughSpaceError {});
    }
    let mut offset = 0;
    for (i, prop) in proposals.iter().enumerate() {
        offset += prop.write(&mut dest[offset..], i + 1 == proposals.len());
    }
    Ok(offset)
}

struct SubstructureHeader {
    more: bool,
    length: usize,
}

impl SubstructureHeader {
    fn read(
        data: Octets,
        more_value: u8,
        header_length: usize,
        err: FormatError,
    ) -> Result<SubstructureHeader, FormatError> {
        let last_substruct = data.read_u8(0).map_err(|_| err)?;
        let length = data.read_u16(2).map_err(|_| err)? as usize;
        if data.len() < header_length {
            debug!("Not enough data in substructure header");
            return Err(err);
        }
        if length < header_length {
            debug!("Substructure length {} is shorter than its header", length);
            return Err(err);
        }
        if length > data.len() {
            debug!(
                "Substructure length {} overflows the remaining {} bytes",
                length,
                data.len()
            );
            return Err(err);
        }
        if last_substruct != SUBSTRUCTURE_LAST && last_substruct != more_value {
            debug!("Unexpected last substruc value {}", last_substruct);
        }
        Ok(SubstructureHeader {
            more: last_substruct != SUBSTRUCTURE_LAST,
            length,
        })
    }
}

/// Decodes one attribute, returning it together with the number of bytes it occupies.
pub fn decode_attribute(data: Octets) -> Result<(TransformAttribute, usize), FormatError> {
    let raw_type = data
        .read_u16(0)
        .map_err(|_| FormatError::MalformedTransform)?;
    let value_field = data
        .read_u16(2)
        .map_err(|_| FormatError::MalformedTransform)?;
    let attribute_type = TransformAttributeType::from_u16(raw_type);
    if raw_type & ATTRIBUTE_FORMAT_TV != 0 {
        let attr = TransformAttribute {
            attribute_type,
            value: AttributeValue::Short(value_field),
        };
        return Ok((attr, ATTRIBUTE_HEADER_LENGTH));
    }
    let value_length = value_field as usize;
    let value = data
        .slice(ATTRIBUTE_HEADER_LENGTH..ATTRIBUTE_HEADER_LENGTH + value_length)
        .map_err(|_| {
            debug!("Transform attribute overflow");
            FormatError::MalformedTransform
        })?;
    let attr = TransformAttribute {
        attribute_type,
        value: AttributeValue::Variable(value.as_slice()),
    };
    Ok((attr, ATTRIBUTE_HEADER_LENGTH + value_length))
}

/// Decodes all attributes filling the range.
pub fn decode_attributes(data: Octets) -> Result<Vec<TransformAttribute>, FormatError> {
    let mut attributes = vec![];
    let mut rest = data;
    while !rest.is_empty() {
        let (attr, consumed) = decode_attribute(rest)?;
        attributes.push(attr);
        rest = rest
            .skip(consumed)
            .map_err(|_| FormatError::MalformedTransform)?;
    }
    Ok(attributes)
}

/// Decodes a transform substructure, returning it together with its declared length.
pub fn decode_transform(data: Octets) -> Result<(Transform, usize), FormatError> {
    let header = SubstructureHeader::read(
        data,
        SUBSTRUCTURE_MORE_TRANSFORMS,
        TRANSFORM_HEADER_LENGTH,
        FormatError::MalformedTransform,
    )?;
    let transform_type = data
        .read_u8(4)
        .map_err(|_| FormatError::MalformedTransform)?;
    let transform_id = data
        .read_u16(6)
        .map_err(|_| FormatError::MalformedTransform)?;
    let attributes = data
        .slice(TRANSFORM_HEADER_LENGTH..header.length)
        .map_err(|_| FormatError::MalformedTransform)?;
    let transform = Transform {
        id: TransformId::new(TransformType::from_u8(transform_type), transform_id),
        attributes: decode_attributes(attributes)?,
    };
    Ok((transform, header.length))
}

/// Decodes a transform sequence, stopping at the last substructure or at the end of the range.
pub fn decode_transforms(data: Octets) -> Result<Vec<Transform>, FormatError> {
    let mut transforms = vec![];
    let mut rest = data;
    while !rest.is_empty() {
        let header = SubstructureHeader::read(
            rest,
            SUBSTRUCTURE_MORE_TRANSFORMS,
            TRANSFORM_HEADER_LENGTH,
            FormatError::MalformedTransform,
        )?;
        let (transform, consumed) = decode_transform(rest)?;
        transforms.push(transform);
        rest = rest
            .skip(consumed)
            .map_err(|_| FormatError::MalformedTransform)?;
        if !header.more {
            if !rest.is_empty() {
                debug!("Unaccounted {} bytes after last transform", rest.len());
            }
            break;
        }
    }
    Ok(transforms)
}

/// Decodes a proposal substructure, returning it together with its declared length.
pub fn decode_proposal(data: Octets) -> Result<(Proposal, usize), FormatError> {
    let header = SubstructureHeader::read(
        data,
        SUBSTRUCTURE_MORE_PROPOSALS,
        PROPOSAL_HEADER_LENGTH,
        FormatError::MalformedProposal,
    )?;
    let proposal_data = data
        .slice(0..header.length)
        .map_err(|_| FormatError::MalformedProposal)?;
    let proposal_num = proposal_data
        .read_u8(4)
        .map_err(|_| FormatError::MalformedProposal)?;
    let protocol_id = proposal_data
        .read_u8(5)
        .map_err(|_| FormatError::MalformedProposal)?;
    let spi_size = proposal_data
        .read_u8(6)
        .map_err(|_| FormatError::MalformedProposal)? as usize;
    let num_transforms = proposal_data
        .read_u8(7)
        .map_err(|_| FormatError::MalformedProposal)? as usize;
    let spi = proposal_data
        .slice(PROPOSAL_HEADER_LENGTH..PROPOSAL_HEADER_LENGTH + spi_size)
        .map_err(|_| {
            debug!("Proposal SPI overflow");
            FormatError::MalformedProposal
        })?;
    let transforms = proposal_data
        .skip(PROPOSAL_HEADER_LENGTH + spi_size)
        .map_err(|_| FormatError::MalformedProposal)?;
    let transforms = decode_transforms(transforms)?;
    if transforms.len() != num_transforms {
        debug!(
            "Proposal {} declares {} transforms, found {}",
            proposal_num,
            num_transforms,
            transforms.len()
        );
    }
    let proposal = Proposal {
        proposal_num,
        protocol_id: IPSecProtocolID::from_u8(protocol_id),
        spi: spi.as_slice(),
        transforms,
    };
    Ok((proposal, header.length))
}

/// Decodes a proposal sequence, stopping at the last substructure or at the end of the range.
pub fn decode_proposals(data: Octets) -> Result<Vec<Proposal>, FormatError> {
    let mut proposals = vec![];
    let mut rest = data;
    while !rest.is_empty() {
        let header = SubstructureHeader::read(
            rest,
            SUBSTRUCTURE_MORE_PROPOSALS,
            PROPOSAL_HEADER_LENGTH,
            FormatError::MalformedProposal,
        )?;
        let (proposal, consumed) = decode_proposal(rest)?;
        proposals.push(proposal);
        rest = rest
            .skip(consumed)
            .map_err(|_| FormatError::MalformedProposal)?;
        if !header.more {
            if !rest.is_empty() {
                debug!("Unaccounted {} bytes after last proposal", rest.len());
            }
            break;
        }
    }
    Ok(proposals)
}
