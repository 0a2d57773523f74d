use std::{
    error, fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    ops::RangeInclusive,
};

use log::debug;

use super::octets::{Octets, OutOfBounds};
use super::proposal::{self, IPSecProtocolID, Proposal, SecurityAssociation};

pub const HEADER_LENGTH: usize = 28;
const PAYLOAD_HEADER_LENGTH: usize = 4;
const CRITICAL_BIT: u8 = 1 << 7;
const IKEV2_VERSION: u8 = 0x20;

pub const MIN_NONCE_LENGTH: usize = 16;
pub const MAX_NONCE_LENGTH: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExchangeType(u8);

impl ExchangeType {
    pub const IKE_SA_INIT: ExchangeType = ExchangeType(34);
    pub const IKE_AUTH: ExchangeType = ExchangeType(35);
    pub const CREATE_CHILD_SA: ExchangeType = ExchangeType(36);
    pub const INFORMATIONAL: ExchangeType = ExchangeType(37);

    pub fn from_u8(value: u8) -> ExchangeType {
        ExchangeType(value)
    }

    pub fn is_known(&self) -> bool {
        (Self::IKE_SA_INIT.0..=Self::INFORMATIONAL.0).contains(&self.0)
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::IKE_SA_INIT => write!(f, "IKE_SA_INIT"),
            Self::IKE_AUTH => write!(f, "IKE_AUTH"),
            Self::CREATE_CHILD_SA => write!(f, "CREATE_CHILD_SA"),
            Self::INFORMATIONAL => write!(f, "INFORMATIONAL"),
            _ => write!(f, "Unknown exchange type {}", self.0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const INITIATOR: Flags = Flags(1 << 3);
    pub const VERSION: Flags = Flags(1 << 4);
    pub const RESPONSE: Flags = Flags(1 << 5);

    fn from_u8(value: u8) -> Flags {
        const RESERVED_MASK: u8 =
            0xff & !Flags::INITIATOR.0 & !Flags::VERSION.0 & !Flags::RESPONSE.0;
        if value & RESERVED_MASK != 0x00 {
            debug!("IKEv2 reserved flags are set {}", value & RESERVED_MASK);
        }
        Flags(value & !RESERVED_MASK)
    }

    pub fn has(&self, flag: Flags) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn with(self, flag: Flags) -> Flags {
        Flags(self.0 | flag.0)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has(Flags::INITIATOR) {
            f.write_str("Initiator ")?;
        }
        if self.has(Flags::VERSION) {
            f.write_str("Version ")?;
        }
        if self.has(Flags::RESPONSE) {
            f.write_str("Response")?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PayloadType(u8);

impl PayloadType {
    pub const NONE: PayloadType = PayloadType(0);
    pub const SECURITY_ASSOCIATION: PayloadType = PayloadType(33);
    pub const KEY_EXCHANGE: PayloadType = PayloadType(34);
    pub const ID_INITIATOR: PayloadType = PayloadType(35);
    pub const ID_RESPONDER: PayloadType = PayloadType(36);
    pub const CERTIFICATE: PayloadType = PayloadType(37);
    pub const CERTIFICATE_REQUEST: PayloadType = PayloadType(38);
    pub const AUTHENTICATION: PayloadType = PayloadType(39);
    pub const NONCE: PayloadType = PayloadType(40);
    pub const NOTIFY: PayloadType = PayloadType(41);
    pub const DELETE: PayloadType = PayloadType(42);
    pub const VENDOR_ID: PayloadType = PayloadType(43);
    pub const TRAFFIC_SELECTOR_INITIATOR: PayloadType = PayloadType(44);
    pub const TRAFFIC_SELECTOR_RESPONDER: PayloadType = PayloadType(45);
    pub const ENCRYPTED_AND_AUTHENTICATED: PayloadType = PayloadType(46);
    pub const CONFIGURATION: PayloadType = PayloadType(47);
    pub const EXTENSIBLE_AUTHENTICATION: PayloadType = PayloadType(48);

    pub fn from_u8(value: u8) -> PayloadType {
        PayloadType(value)
    }

    pub fn type_id(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => write!(f, "No Next Payload"),
            Self::SECURITY_ASSOCIATION => write!(f, "Security Association"),
            Self::KEY_EXCHANGE => write!(f, "Key Exchange"),
            Self::ID_INITIATOR => write!(f, "Identification - Initiator"),
            Self::ID_RESPONDER => write!(f, "Identification - Responder"),
            Self::CERTIFICATE => write!(f, "Certificate"),
            Self::CERTIFICATE_REQUEST => write!(f, "Certificate Request"),
            Self::AUTHENTICATION => write!(f, "Authentication"),
            Self::NONCE => write!(f, "Nonce"),
            Self::NOTIFY => write!(f, "Notify"),
            Self::DELETE => write!(f, "Delete"),
            Self::VENDOR_ID => write!(f, "Vendor ID"),
            Self::TRAFFIC_SELECTOR_INITIATOR => write!(f, "Traffic Selector - Initiator"),
            Self::TRAFFIC_SELECTOR_RESPONDER => write!(f, "Traffic Selector - Responder"),
            Self::ENCRYPTED_AND_AUTHENTICATED => write!(f, "Encrypted and Authenticated"),
            Self::CONFIGURATION => write!(f, "Configuration"),
            Self::EXTENSIBLE_AUTHENTICATION => write!(f, "Extensible Authentication"),
            _ => write!(f, "Unknown payload type {}", self.0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NotifyMessageType(u16);

impl NotifyMessageType {
    pub const UNSUPPORTED_CRITICAL_PAYLOAD: NotifyMessageType = NotifyMessageType(1);
    pub const INVALID_IKE_SPI: NotifyMessageType = NotifyMessageType(4);
    pub const INVALID_MAJOR_VERSION: NotifyMessageType = NotifyMessageType(5);
    pub const INVALID_SYNTAX: NotifyMessageType = NotifyMessageType(7);
    pub const INVALID_MESSAGE_ID: NotifyMessageType = NotifyMessageType(9);
    pub const INVALID_SPI: NotifyMessageType = NotifyMessageType(11);
    pub const NO_PROPOSAL_CHOSEN: NotifyMessageType = NotifyMessageType(14);
    pub const INVALID_KE_PAYLOAD: NotifyMessageType = NotifyMessageType(17);
    pub const AUTHENTICATION_FAILED: NotifyMessageType = NotifyMessageType(24);
    pub const SINGLE_PAIR_REQUIRED: NotifyMessageType = NotifyMessageType(34);
    pub const NO_ADDITIONAL_SAS: NotifyMessageType = NotifyMessageType(35);
    pub const TS_UNACCEPTABLE: NotifyMessageType = NotifyMessageType(38);
    pub const INVALID_SELECTORS: NotifyMessageType = NotifyMessageType(39);
    pub const TEMPORARY_FAILURE: NotifyMessageType = NotifyMessageType(43);
    pub const CHILD_SA_NOT_FOUND: NotifyMessageType = NotifyMessageType(44);

    pub const INITIAL_CONTACT: NotifyMessageType = NotifyMessageType(16384);
    pub const SET_WINDOW_SIZE: NotifyMessageType = NotifyMessageType(16385);
    pub const NAT_DETECTION_SOURCE_IP: NotifyMessageType = NotifyMessageType(16388);
    pub const NAT_DETECTION_DESTINATION_IP: NotifyMessageType = NotifyMessageType(16389);
    pub const COOKIE: NotifyMessageType = NotifyMessageType(16390);
    pub const USE_TRANSPORT_MODE: NotifyMessageType = NotifyMessageType(16391);
    pub const REKEY_SA: NotifyMessageType = NotifyMessageType(16393);
    pub const ESP_TFC_PADDING_NOT_SUPPORTED: NotifyMessageType = NotifyMessageType(16394);
    pub const NON_FIRST_FRAGMENTS_ALSO: NotifyMessageType = NotifyMessageType(16395);

    pub fn from_u16(value: u16) -> NotifyMessageType {
        NotifyMessageType(value)
    }

    pub fn type_id(&self) -> u16 {
        self.0
    }

    /// Values below 16384 report errors, everything else is a status.
    pub fn is_error(&self) -> bool {
        self.0 < 16384
    }
}

impl fmt::Display for NotifyMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::UNSUPPORTED_CRITICAL_PAYLOAD => write!(f, "UNSUPPORTED_CRITICAL_PAYLOAD"),
            Self::INVALID_IKE_SPI => write!(f, "INVALID_IKE_SPI"),
            Self::INVALID_MAJOR_VERSION => write!(f, "INVALID_MAJOR_VERSION"),
            Self::INVALID_SYNTAX => write!(f, "INVALID_SYNTAX"),
            Self::INVALID_MESSAGE_ID => write!(f, "INVALID_MESSAGE_ID"),
            Self::INVALID_SPI => write!(f, "INVALID_SPI"),
            Self::NO_PROPOSAL_CHOSEN => write!(f, "NO_PROPOSAL_CHOSEN"),
            Self::INVALID_KE_PAYLOAD => write!(f, "INVALID_KE_PAYLOAD"),
            Self::AUTHENTICATION_FAILED => write!(f, "AUTHENTICATION_FAILED"),
            Self::SINGLE_PAIR_REQUIRED => write!(f, "SINGLE_PAIR_REQUIRED"),
            Self::NO_ADDITIONAL_SAS => write!(f, "NO_ADDITIONAL_SAS"),
            Self::TS_UNACCEPTABLE => write!(f, "TS_UNACCEPTABLE"),
            Self::INVALID_SELECTORS => write!(f, "INVALID_SELECTORS"),
            Self::TEMPORARY_FAILURE => write!(f, "TEMPORARY_FAILURE"),
            Self::CHILD_SA_NOT_FOUND => write!(f, "CHILD_SA_NOT_FOUND"),
            Self::INITIAL_CONTACT => write!(f, "INITIAL_CONTACT"),
            Self::SET_WINDOW_SIZE => write!(f, "SET_WINDOW_SIZE"),
            Self::NAT_DETECTION_SOURCE_IP => write!(f, "NAT_DETECTION_SOURCE_IP"),
            Self::NAT_DETECTION_DESTINATION_IP => write!(f, "NAT_DETECTION_DESTINATION_IP"),
            Self::COOKIE => write!(f, "COOKIE"),
            Self::USE_TRANSPORT_MODE => write!(f, "USE_TRANSPORT_MODE"),
            Self::REKEY_SA => write!(f, "REKEY_SA"),
            Self::ESP_TFC_PADDING_NOT_SUPPORTED => write!(f, "ESP_TFC_PADDING_NOT_SUPPORTED"),
            Self::NON_FIRST_FRAGMENTS_ALSO => write!(f, "NON_FIRST_FRAGMENTS_ALSO"),
            _ => write!(f, "Unknown Notify Message Type {}", self.0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IdentificationType(u8);

impl IdentificationType {
    pub const ID_IPV4_ADDR: IdentificationType = IdentificationType(1);
    pub const ID_FQDN: IdentificationType = IdentificationType(2);
    pub const ID_RFC822_ADDR: IdentificationType = IdentificationType(3);
    pub const ID_IPV6_ADDR: IdentificationType = IdentificationType(5);
    pub const ID_DER_ASN1_DN: IdentificationType = IdentificationType(9);
    pub const ID_DER_ASN1_GN: IdentificationType = IdentificationType(10);
    pub const ID_KEY_ID: IdentificationType = IdentificationType(11);

    pub fn from_u8(value: u8) -> IdentificationType {
        IdentificationType(value)
    }

    pub fn type_id(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for IdentificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ID_IPV4_ADDR => write!(f, "ID_IPV4_ADDR"),
            Self::ID_FQDN => write!(f, "ID_FQDN"),
            Self::ID_RFC822_ADDR => write!(f, "ID_RFC822_ADDR"),
            Self::ID_IPV6_ADDR => write!(f, "ID_IPV6_ADDR"),
            Self::ID_DER_ASN1_DN => write!(f, "ID_DER_ASN1_DN"),
            Self::ID_DER_ASN1_GN => write!(f, "ID_DER_ASN1_GN"),
            Self::ID_KEY_ID => write!(f, "ID_KEY_ID"),
            _ => write!(f, "Unknown ID type {}", self.0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthMethod(u8);

impl AuthMethod {
    pub const RSA_DIGITAL_SIGNATURE: AuthMethod = AuthMethod(1);
    pub const SHARED_KEY_MESSAGE_INTEGRITY_CODE: AuthMethod = AuthMethod(2);
    pub const DSS_DIGITAL_SIGNATURE: AuthMethod = AuthMethod(3);
    pub const ECDSA_SHA256_P256: AuthMethod = AuthMethod(9);
    pub const ECDSA_SHA384_P384: AuthMethod = AuthMethod(10);
    pub const ECDSA_SHA512_P521: AuthMethod = AuthMethod(11);
    pub const DIGITAL_SIGNATURE: AuthMethod = AuthMethod(14);

    pub fn from_u8(value: u8) -> AuthMethod {
        AuthMethod(value)
    }

    pub fn method_id(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::RSA_DIGITAL_SIGNATURE => write!(f, "RSA Digital Signature"),
            Self::SHARED_KEY_MESSAGE_INTEGRITY_CODE => {
                write!(f, "Shared Key Message Integrity Code")
            }
            Self::DSS_DIGITAL_SIGNATURE => write!(f, "DSS Digital Signature"),
            Self::ECDSA_SHA256_P256 => write!(f, "ECDSA with SHA-256 on the P-256 curve"),
            Self::ECDSA_SHA384_P384 => write!(f, "ECDSA with SHA-384 on the P-384 curve"),
            Self::ECDSA_SHA512_P521 => write!(f, "ECDSA with SHA-512 on the P-521 curve"),
            Self::DIGITAL_SIGNATURE => write!(f, "Digital Signature"),
            _ => write!(f, "Unknown authentication method {}", self.0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Spi {
    None,
    U32(u32),
    U64(u64),
}

impl Spi {
    pub fn from_slice(spi: &[u8]) -> Result<Spi, FormatError> {
        let spi = Octets::new(spi);
        match spi.len() {
            0 => Ok(Spi::None),
            4 => Ok(Spi::U32(spi.read_u32(0)?)),
            8 => Ok(Spi::U64(spi.read_u64(0)?)),
            _ => {
                debug!("Unsupported SPI length {}", spi.len());
                Err("Unsupported SPI length".into())
            }
        }
    }

    pub fn length(&self) -> usize {
        match self {
            Spi::None => 0,
            Spi::U32(_) => 4,
            Spi::U64(_) => 8,
        }
    }

    pub fn write_to(&self, dest: &mut [u8]) {
        match self {
            Spi::None => {}
            Spi::U32(spi) => dest[..4].copy_from_slice(&spi.to_be_bytes()),
            Spi::U64(spi) => dest[..8].copy_from_slice(&spi.to_be_bytes()),
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut result = vec![0u8; self.length()];
        self.write_to(&mut result);
        result
    }
}

impl fmt::Display for Spi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Spi::None => write!(f, "None"),
            Spi::U32(spi) => write!(f, "{:08x}", spi),
            Spi::U64(spi) => write!(f, "{:016x}", spi),
        }
    }
}

/// Fixed IKEv2 header, as described in RFC 7296, Section 3.1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub initiator_spi: u64,
    pub responder_spi: u64,
    pub next_payload: PayloadType,
    pub version: u8,
    pub exchange_type: ExchangeType,
    pub flags: Flags,
    pub message_id: u32,
    pub length: u32,
}

impl Header {
    fn read(data: Octets) -> Result<Header, FormatError> {
        if data.len() < HEADER_LENGTH {
            debug!("Not enough data in message header: {} bytes", data.len());
            return Err(FormatError::TruncatedHeader);
        }
        let header_err = |_: OutOfBounds| FormatError::TruncatedHeader;
        Ok(Header {
            initiator_spi: data.read_u64(0).map_err(header_err)?,
            responder_spi: data.read_u64(8).map_err(header_err)?,
            next_payload: PayloadType::from_u8(data.read_u8(16).map_err(header_err)?),
            version: data.read_u8(17).map_err(header_err)?,
            exchange_type: ExchangeType::from_u8(data.read_u8(18).map_err(header_err)?),
            flags: Flags::from_u8(data.read_u8(19).map_err(header_err)?),
            message_id: data.read_u32(20).map_err(header_err)?,
            length: data.read_u32(24).map_err(header_err)?,
        })
    }

    pub fn major_version(&self) -> u8 {
        self.version >> 4 & 0x0f
    }

    pub fn minor_version(&self) -> u8 {
        self.version & 0x0f
    }
}

pub struct Message<'a> {
    header: Header,
    data: Octets<'a>,
}

// Parse and validate as described in RFC 7296, Section 3.
impl<'a> Message<'a> {
    pub fn decode(buffer: &'a [u8]) -> Result<Message<'a>, FormatError> {
        let buffer = Octets::new(buffer);
        let header = Header::read(buffer)?;
        let length = header.length as usize;
        if length < HEADER_LENGTH {
            debug!("Declared message length {} is shorter than header", length);
            return Err(FormatError::InvalidSyntax(
                "Declared message length is shorter than header",
            ));
        }
        let data = buffer.slice(0..length).map_err(|_| {
            debug!(
                "Declared message length {} exceeds received {} bytes",
                length,
                buffer.len()
            );
            FormatError::DeclaredLengthExceedsBuffer
        })?;
        if buffer.len() > length {
            debug!(
                "Ignoring {} bytes after end of message",
                buffer.len() - length
            );
        }
        if header.major_version() != 2 {
            debug!(
                "Unsupported major version {}.{}",
                header.major_version(),
                header.minor_version()
            );
        }
        Ok(Message { header, data })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn read_initiator_spi(&self) -> u64 {
        self.header.initiator_spi
    }

    pub fn read_responder_spi(&self) -> u64 {
        self.header.responder_spi
    }

    pub fn read_exchange_type(&self) -> ExchangeType {
        self.header.exchange_type
    }

    pub fn read_flags(&self) -> Flags {
        self.header.flags
    }

    pub fn read_message_id(&self) -> u32 {
        self.header.message_id
    }

    pub fn is_response(&self) -> bool {
        self.header.flags.has(Flags::RESPONSE)
    }

    /// Message bytes, limited to the declared length.
    pub fn raw_data(&self) -> &'a [u8] {
        self.data.as_slice()
    }

    pub fn iter_payloads(&self) -> PayloadIter<'a> {
        PayloadIter {
            next_payload: self.header.next_payload,
            data: self.data.skip(HEADER_LENGTH).unwrap_or(Octets::new(&[])),
            failed: false,
        }
    }
}

/// Generic payload header, as described in RFC 7296, Section 3.2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GenericPayloadHeader {
    pub next_payload: PayloadType,
    pub critical: bool,
    pub length: u16,
}

impl GenericPayloadHeader {
    pub fn read(data: Octets) -> Result<GenericPayloadHeader, FormatError> {
        if data.len() < PAYLOAD_HEADER_LENGTH {
            debug!("Not enough data in payload header");
            return Err(FormatError::TruncatedHeader);
        }
        let next_payload = data.read_u8(0)?;
        let flags = data.read_u8(1)?;
        let length = data.read_u16(2)?;
        if flags & !CRITICAL_BIT != 0 {
            debug!("Payload reserved flags are set {}", flags & !CRITICAL_BIT);
        }
        Ok(GenericPayloadHeader {
            next_payload: PayloadType::from_u8(next_payload),
            critical: flags & CRITICAL_BIT != 0,
            length,
        })
    }

    /// Returns the payload body, the data view must start at this payload's header.
    pub fn body<'a>(&self, data: Octets<'a>) -> Result<Octets<'a>, FormatError> {
        let length = self.length as usize;
        if length < PAYLOAD_HEADER_LENGTH {
            debug!("Payload length {} is shorter than its header", length);
            return Err(FormatError::InvalidSyntax(
                "Payload length is shorter than its header",
            ));
        }
        data.slice(PAYLOAD_HEADER_LENGTH..length).map_err(|_| {
            debug!(
                "Payload length {} overflows the remaining {} bytes",
                length,
                data.len()
            );
            FormatError::DeclaredLengthExceedsBuffer
        })
    }
}

pub struct PayloadIter<'a> {
    next_payload: PayloadType,
    data: Octets<'a>,
    failed: bool,
}

impl PayloadIter<'_> {
    fn fail<T>(&mut self, err: FormatError) -> Option<Result<T, FormatError>> {
        self.failed = true;
        Some(Err(err))
    }
}

impl<'a> Iterator for PayloadIter<'a> {
    type Item = Result<RawPayload<'a>, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.next_payload == PayloadType::NONE {
            if !self.data.is_empty() {
                debug!("Packet has {} bytes of unaccounted data", self.data.len());
            }
            return None;
        }
        if self.data.is_empty() {
            debug!(
                "Next payload is {}, but message has no more data",
                self.next_payload
            );
            return None;
        }
        let header = match GenericPayloadHeader::read(self.data) {
            Ok(header) => header,
            Err(err) => return self.fail(err),
        };
        let body = match header.body(self.data) {
            Ok(body) => body,
            Err(err) => return self.fail(err),
        };
        let rest = match self.data.skip(header.length as usize) {
            Ok(rest) => rest,
            Err(err) => return self.fail(err.into()),
        };
        let item = RawPayload {
            payload_type: self.next_payload,
            critical: header.critical,
            data: body,
        };
        self.next_payload = header.next_payload;
        self.data = rest;
        Some(Ok(item))
    }
}

/// A framed payload which hasn't been decoded yet.
#[derive(Clone, Copy)]
pub struct RawPayload<'a> {
    payload_type: PayloadType,
    critical: bool,
    data: Octets<'a>,
}

impl<'a> RawPayload<'a> {
    pub fn new(payload_type: PayloadType, critical: bool, data: &'a [u8]) -> RawPayload<'a> {
        RawPayload {
            payload_type,
            critical,
            data: Octets::new(data),
        }
    }

    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    pub fn is_critical(&self) -> bool {
        self.critical
    }

    pub fn raw_data(&self) -> &'a [u8] {
        self.data.as_slice()
    }

    /// Decodes the payload through the decoder table; unknown payload types return None.
    pub fn dispatch(&self) -> Result<Option<Payload<'a>>, FormatError> {
        PAYLOAD_DECODERS
            .iter()
            .find(|(payload_type, _)| *payload_type == self.payload_type)
            .map(|(_, decoder)| decoder(self.data))
            .transpose()
    }

    /// Same as dispatch, but an unknown payload with the critical bit set is an error.
    pub fn decode(&self) -> Result<Option<Payload<'a>>, FormatError> {
        match self.dispatch()? {
            Some(payload) => Ok(Some(payload)),
            None if self.critical => {
                debug!("Unsupported critical payload {}", self.payload_type);
                Err(FormatError::UnsupportedPayloadType(self.payload_type.0))
            }
            None => {
                debug!("Skipping unsupported payload {}", self.payload_type);
                Ok(None)
            }
        }
    }
}

pub enum Payload<'a> {
    SecurityAssociation(SecurityAssociation<'a>),
    KeyExchange(PayloadKeyExchange<'a>),
    IdentificationInitiator(PayloadIdentification<'a>),
    IdentificationResponder(PayloadIdentification<'a>),
    Authentication(PayloadAuthentication<'a>),
    Nonce(PayloadNonce<'a>),
    Notify(PayloadNotify<'a>),
    Delete(PayloadDelete<'a>),
    TrafficSelectorInitiator(PayloadTrafficSelector),
    TrafficSelectorResponder(PayloadTrafficSelector),
    VendorID(PayloadVendorID<'a>),
}

pub type PayloadDecoder = for<'a> fn(Octets<'a>) -> Result<Payload<'a>, FormatError>;

/// Decoders for every supported payload type.
pub static PAYLOAD_DECODERS: &[(PayloadType, PayloadDecoder)] = &[
    (PayloadType::SECURITY_ASSOCIATION, decode_security_association),
    (PayloadType::KEY_EXCHANGE, decode_key_exchange),
    (PayloadType::ID_INITIATOR, decode_id_initiator),
    (PayloadType::ID_RESPONDER, decode_id_responder),
    (PayloadType::AUTHENTICATION, decode_authentication),
    (PayloadType::NONCE, decode_nonce),
    (PayloadType::NOTIFY, decode_notify),
    (PayloadType::DELETE, decode_delete),
    (PayloadType::TRAFFIC_SELECTOR_INITIATOR, decode_ts_initiator),
    (PayloadType::TRAFFIC_SELECTOR_RESPONDER, decode_ts_responder),
    (PayloadType::VENDOR_ID, decode_vendor_id),
];

fn decode_security_association(data: Octets) -> Result<Payload, FormatError> {
    Ok(Payload::SecurityAssociation(
        SecurityAssociation::from_payload(data)?,
    ))
}

fn decode_key_exchange(data: Octets) -> Result<Payload, FormatError> {
    Ok(Payload::KeyExchange(PayloadKeyExchange::from_payload(data)?))
}

fn decode_id_initiator(data: Octets) -> Result<Payload, FormatError> {
    Ok(Payload::IdentificationInitiator(
        PayloadIdentification::from_payload(data)?,
    ))
}

fn decode_id_responder(data: Octets) -> Result<Payload, FormatError> {
    Ok(Payload::IdentificationResponder(
        PayloadIdentification::from_payload(data)?,
    ))
}

fn decode_authentication(data: Octets) -> Result<Payload, FormatError> {
    Ok(Payload::Authentication(PayloadAuthentication::from_payload(
        data,
    )?))
}

fn decode_nonce(data: Octets) -> Result<Payload, FormatError> {
    Ok(Payload::Nonce(PayloadNonce::from_payload(data)?))
}

fn decode_notify(data: Octets) -> Result<Payload, FormatError> {
    Ok(Payload::Notify(PayloadNotify::from_payload(data)?))
}

fn decode_delete(data: Octets) -> Result<Payload, FormatError> {
    Ok(Payload::Delete(PayloadDelete::from_payload(data)?))
}

fn decode_ts_initiator(data: Octets) -> Result<Payload, FormatError> {
    Ok(Payload::TrafficSelectorInitiator(
        PayloadTrafficSelector::from_payload(data)?,
    ))
}

fn decode_ts_responder(data: Octets) -> Result<Payload, FormatError> {
    Ok(Payload::TrafficSelectorResponder(
        PayloadTrafficSelector::from_payload(data)?,
    ))
}

fn decode_vendor_id(data: Octets) -> Result<Payload, FormatError> {
    Ok(Payload::VendorID(PayloadVendorID {
        data: data.as_slice(),
    }))
}

pub struct PayloadKeyExchange<'a> {
    dh_group: u16,
    data: &'a [u8],
}

impl<'a> PayloadKeyExchange<'a> {
    fn from_payload(data: Octets<'a>) -> Result<PayloadKeyExchange<'a>, FormatError> {
        if data.len() < 4 {
            debug!("Not enough data in key exchange payload");
            return Err("Not enough data in key exchange payload".into());
        }
        Ok(PayloadKeyExchange {
            dh_group: data.read_u16(0)?,
            data: data.skip(4)?.as_slice(),
        })
    }

    pub fn read_group_num(&self) -> u16 {
        self.dh_group
    }

    pub fn read_value(&self) -> &'a [u8] {
        self.data
    }
}

pub struct PayloadNonce<'a> {
    data: &'a [u8],
}

impl<'a> PayloadNonce<'a> {
    fn from_payload(data: Octets<'a>) -> Result<PayloadNonce<'a>, FormatError> {
        if !(MIN_NONCE_LENGTH..=MAX_NONCE_LENGTH).contains(&data.len()) {
            debug!("Nonce length {} is out of range", data.len());
            return Err("Nonce length is out of range".into());
        }
        Ok(PayloadNonce {
            data: data.as_slice(),
        })
    }

    pub fn read_value(&self) -> &'a [u8] {
        self.data
    }
}

pub struct PayloadIdentification<'a> {
    id_type: IdentificationType,
    raw: &'a [u8],
}

impl<'a> PayloadIdentification<'a> {
    fn from_payload(data: Octets<'a>) -> Result<PayloadIdentification<'a>, FormatError> {
        if data.len() < 4 {
            debug!("Not enough data in identification payload");
            return Err("Not enough data in identification payload".into());
        }
        Ok(PayloadIdentification {
            id_type: IdentificationType::from_u8(data.read_u8(0)?),
            raw: data.as_slice(),
        })
    }

    pub fn id_type(&self) -> IdentificationType {
        self.id_type
    }

    pub fn read_value(&self) -> &'a [u8] {
        &self.raw[4..]
    }

    /// Full payload body, including the ID type and reserved fields.
    pub fn raw_value(&self) -> &'a [u8] {
        self.raw
    }
}

pub struct PayloadAuthentication<'a> {
    auth_method: AuthMethod,
    data: &'a [u8],
}

impl<'a> PayloadAuthentication<'a> {
    fn from_payload(data: Octets<'a>) -> Result<PayloadAuthentication<'a>, FormatError> {
        if data.len() < 4 {
            debug!("Not enough data in authentication payload");
            return Err("Not enough data in authentication payload".into());
        }
        Ok(PayloadAuthentication {
            auth_method: AuthMethod::from_u8(data.read_u8(0)?),
            data: data.skip(4)?.as_slice(),
        })
    }

    pub fn read_method(&self) -> AuthMethod {
        self.auth_method
    }

    pub fn read_value(&self) -> &'a [u8] {
        self.data
    }
}

pub struct PayloadNotify<'a> {
    protocol_id: Option<IPSecProtocolID>,
    message_type: NotifyMessageType,
    spi: &'a [u8],
    data: &'a [u8],
}

impl<'a> PayloadNotify<'a> {
    fn from_payload(data: Octets<'a>) -> Result<PayloadNotify<'a>, FormatError> {
        if data.len() < 4 {
            debug!("Not enough data in notify payload");
            return Err("Not enough data in notify payload".into());
        }
        let protocol_id = data.read_u8(0)?;
        let protocol_id = if protocol_id != 0 {
            Some(IPSecProtocolID::from_u8(protocol_id))
        } else {
            None
        };
        let spi_size = data.read_u8(1)? as usize;
        let message_type = NotifyMessageType::from_u16(data.read_u16(2)?);
        let spi = data.slice(4..4 + spi_size).map_err(|_| {
            debug!("Notify SPI overflow");
            FormatError::InvalidSyntax("Notify SPI overflow")
        })?;
        Ok(PayloadNotify {
            protocol_id,
            message_type,
            spi: spi.as_slice(),
            data: data.skip(4 + spi_size)?.as_slice(),
        })
    }

    pub fn protocol_id(&self) -> Option<IPSecProtocolID> {
        self.protocol_id
    }

    pub fn message_type(&self) -> NotifyMessageType {
        self.message_type
    }

    pub fn spi(&self) -> &'a [u8] {
        self.spi
    }

    pub fn read_value(&self) -> &'a [u8] {
        self.data
    }
}

pub struct PayloadDelete<'a> {
    protocol_id: IPSecProtocolID,
    spi_size: usize,
    data: &'a [u8],
}

impl<'a> PayloadDelete<'a> {
    fn from_payload(data: Octets<'a>) -> Result<PayloadDelete<'a>, FormatError> {
        if data.len() < 4 {
            debug!("Not enough data in delete payload");
            return Err("Not enough data in delete payload".into());
        }
        let protocol_id = IPSecProtocolID::from_u8(data.read_u8(0)?);
        let spi_size = data.read_u8(1)? as usize;
        let num_spi = data.read_u16(2)? as usize;
        let expected_spi_size = match protocol_id {
            IPSecProtocolID::IKE => 0,
            IPSecProtocolID::AH | IPSecProtocolID::ESP => 4,
            _ => {
                debug!("Unsupported delete protocol ID {}", protocol_id);
                return Err("Unsupported delete protocol ID".into());
            }
        };
        if spi_size != expected_spi_size && !(protocol_id == IPSecProtocolID::IKE && spi_size == 8)
        {
            debug!(
                "Unexpected SPI size {} for protocol {}",
                spi_size, protocol_id
            );
            return Err("Unexpected delete SPI size".into());
        }
        let spis = data.slice(4..4 + spi_size * num_spi).map_err(|_| {
            debug!("Delete SPI overflow");
            FormatError::InvalidSyntax("Delete SPI overflow")
        })?;
        Ok(PayloadDelete {
            protocol_id,
            spi_size,
            data: spis.as_slice(),
        })
    }

    pub fn protocol_id(&self) -> IPSecProtocolID {
        self.protocol_id
    }

    pub fn iter_spi(&self) -> impl Iterator<Item = Spi> + 'a {
        let spi_size = self.spi_size;
        let data = self.data;
        let chunks = if spi_size > 0 {
            data.chunks_exact(spi_size)
        } else {
            data[..0].chunks_exact(1)
        };
        chunks.filter_map(|spi| Spi::from_slice(spi).ok())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrafficSelectorType(u8);

impl TrafficSelectorType {
    pub const TS_IPV4_ADDR_RANGE: TrafficSelectorType = TrafficSelectorType(7);
    pub const TS_IPV6_ADDR_RANGE: TrafficSelectorType = TrafficSelectorType(8);

    fn from_u8(value: u8) -> Result<TrafficSelectorType, FormatError> {
        if value == Self::TS_IPV4_ADDR_RANGE.0 || value == Self::TS_IPV6_ADDR_RANGE.0 {
            Ok(TrafficSelectorType(value))
        } else {
            debug!("Unsupported traffic selector type {}", value);
            Err("Unsupported traffic selector type".into())
        }
    }

    fn selector_length(&self) -> usize {
        if *self == Self::TS_IPV4_ADDR_RANGE {
            8 + 4 * 2
        } else {
            8 + 16 * 2
        }
    }
}

impl fmt::Display for TrafficSelectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::TS_IPV4_ADDR_RANGE => write!(f, "TS_IPV4_ADDR_RANGE"),
            Self::TS_IPV6_ADDR_RANGE => write!(f, "TS_IPV6_ADDR_RANGE"),
            _ => write!(f, "Unknown traffic selector type {}", self.0),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrafficSelector {
    ts_type: TrafficSelectorType,
    ip_protocol: u8,
    addr: RangeInclusive<IpAddr>,
    port: RangeInclusive<u16>,
}

impl TrafficSelector {
    pub const ANY_PROTOCOL: u8 = 0;

    pub fn from_ip_range(addr: RangeInclusive<IpAddr>) -> Result<TrafficSelector, FormatError> {
        let ts_type = match (addr.start(), addr.end()) {
            (IpAddr::V4(_), IpAddr::V4(_)) => TrafficSelectorType::TS_IPV4_ADDR_RANGE,
            (IpAddr::V6(_), IpAddr::V6(_)) => TrafficSelectorType::TS_IPV6_ADDR_RANGE,
            _ => return Err("Traffic selector address families don't match".into()),
        };
        Ok(TrafficSelector {
            ts_type,
            ip_protocol: Self::ANY_PROTOCOL,
            addr,
            port: 0..=u16::MAX,
        })
    }

    pub fn ts_type(&self) -> TrafficSelectorType {
        self.ts_type
    }

    pub fn ip_protocol(&self) -> u8 {
        self.ip_protocol
    }

    pub fn addr(&self) -> &RangeInclusive<IpAddr> {
        &self.addr
    }

    pub fn port(&self) -> &RangeInclusive<u16> {
        &self.port
    }

    /// Returns true if other is fully contained in this selector.
    pub fn contains(&self, other: &TrafficSelector) -> bool {
        self.ts_type == other.ts_type
            && (self.ip_protocol == Self::ANY_PROTOCOL || self.ip_protocol == other.ip_protocol)
            && self.addr.start() <= other.addr.start()
            && self.addr.end() >= other.addr.end()
            && self.port.start() <= other.port.start()
            && self.port.end() >= other.port.end()
    }

    fn read(data: Octets) -> Result<(TrafficSelector, usize), FormatError> {
        let ts_type = TrafficSelectorType::from_u8(data.read_u8(0)?)?;
        let ip_protocol = data.read_u8(1)?;
        let selector_length = data.read_u16(2)? as usize;
        if selector_length != ts_type.selector_length() {
            debug!(
                "Unexpected traffic selector length {} for {}",
                selector_length, ts_type
            );
            return Err("Unexpected traffic selector length".into());
        }
        let start_port = data.read_u16(4)?;
        let end_port = data.read_u16(6)?;
        let addr = if ts_type == TrafficSelectorType::TS_IPV4_ADDR_RANGE {
            let start = Ipv4Addr::from(data.read_u32(8)?);
            let end = Ipv4Addr::from(data.read_u32(12)?);
            IpAddr::V4(start)..=IpAddr::V4(end)
        } else {
            let start = Ipv6Addr::from(
                (data.read_u64(8)? as u128) << 64 | data.read_u64(16)? as u128,
            );
            let end = Ipv6Addr::from(
                (data.read_u64(24)? as u128) << 64 | data.read_u64(32)? as u128,
            );
            IpAddr::V6(start)..=IpAddr::V6(end)
        };
        let ts = TrafficSelector {
            ts_type,
            ip_protocol,
            addr,
            port: start_port..=end_port,
        };
        Ok((ts, selector_length))
    }

    fn write(&self, dest: &mut [u8]) -> usize {
        let length = self.ts_type.selector_length();
        dest[0] = self.ts_type.0;
        dest[1] = self.ip_protocol;
        dest[2..4].copy_from_slice(&(length as u16).to_be_bytes());
        dest[4..6].copy_from_slice(&self.port.start().to_be_bytes());
        dest[6..8].copy_from_slice(&self.port.end().to_be_bytes());
        match (self.addr.start(), self.addr.end()) {
            (IpAddr::V4(start), IpAddr::V4(end)) => {
                dest[8..12].copy_from_slice(&start.octets());
                dest[12..16].copy_from_slice(&end.octets());
            }
            (IpAddr::V6(start), IpAddr::V6(end)) => {
                dest[8..24].copy_from_slice(&start.octets());
                dest[24..40].copy_from_slice(&end.octets());
            }
            // Construction guarantees matching address families.
            _ => {}
        }
        length
    }
}

impl fmt::Display for TrafficSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} protocol {} addr {}-{} port {}-{}",
            self.ts_type,
            self.ip_protocol,
            self.addr.start(),
            self.addr.end(),
            self.port.start(),
            self.port.end()
        )
    }
}

pub struct PayloadTrafficSelector {
    traffic_selectors: Vec<TrafficSelector>,
}

impl PayloadTrafficSelector {
    fn from_payload(data: Octets) -> Result<PayloadTrafficSelector, FormatError> {
        if data.len() < 4 {
            debug!("Not enough data in traffic selector payload");
            return Err("Not enough data in traffic selector payload".into());
        }
        let num_selectors = data.read_u8(0)? as usize;
        let mut rest = data.skip(4)?;
        let mut traffic_selectors = Vec::with_capacity(num_selectors);
        for _ in 0..num_selectors {
            let (ts, length) = TrafficSelector::read(rest)?;
            traffic_selectors.push(ts);
            rest = rest.skip(length)?;
        }
        if !rest.is_empty() {
            debug!("Traffic selector payload has {} unaccounted bytes", rest.len());
        }
        Ok(PayloadTrafficSelector { traffic_selectors })
    }

    pub fn traffic_selectors(&self) -> &[TrafficSelector] {
        &self.traffic_selectors
    }

    pub fn into_traffic_selectors(self) -> Vec<TrafficSelector> {
        self.traffic_selectors
    }
}

pub struct PayloadVendorID<'a> {
    data: &'a [u8],
}

impl<'a> PayloadVendorID<'a> {
    pub fn read_value(&self) -> &'a [u8] {
        self.data
    }
}

/// Builds an IKEv2 message in place, chaining payload types and lengths.
pub struct MessageWriter<'a> {
    dest: &'a mut [u8],
    next_payload_index: usize,
    cursor: usize,
}

impl<'a> MessageWriter<'a> {
    pub fn new(dest: &'a mut [u8]) -> Result<MessageWriter<'a>, NotEnoughSpaceError> {
        if dest.len() < HEADER_LENGTH {
            return Err(NotEnoughSpaceError {});
        }
        Ok(MessageWriter {
            dest,
            next_payload_index: 16,
            cursor: HEADER_LENGTH,
        })
    }

    pub fn write_header(
        &mut self,
        initiator_spi: u64,
        responder_spi: u64,
        exchange_type: ExchangeType,
        flags: Flags,
        message_id: u32,
    ) {
        self.dest[0..8].copy_from_slice(&initiator_spi.to_be_bytes());
        self.dest[8..16].copy_from_slice(&responder_spi.to_be_bytes());
        self.dest[16] = PayloadType::NONE.0;
        self.dest[17] = IKEV2_VERSION;
        self.dest[18] = exchange_type.0;
        self.dest[19] = flags.0;
        self.dest[20..24].copy_from_slice(&message_id.to_be_bytes());
        self.dest[24..28].fill(0);
        self.next_payload_index = 16;
        self.cursor = HEADER_LENGTH;
    }

    /// Appends a payload header and returns its body for the caller to fill in.
    pub fn next_payload_slice(
        &mut self,
        payload_type: PayloadType,
        data_length: usize,
    ) -> Result<&mut [u8], NotEnoughSpaceError> {
        let payload_length = PAYLOAD_HEADER_LENGTH + data_length;
        if payload_length > u16::MAX as usize || self.cursor + payload_length > self.dest.len() {
            return Err(NotEnoughSpaceError {});
        }
        self.dest[self.next_payload_index] = payload_type.0;
        let header = &mut self.dest[self.cursor..self.cursor + PAYLOAD_HEADER_LENGTH];
        header[0] = PayloadType::NONE.0;
        header[1] = 0;
        header[2..4].copy_from_slice(&(payload_length as u16).to_be_bytes());
        self.next_payload_index = self.cursor;
        let start = self.cursor + PAYLOAD_HEADER_LENGTH;
        self.cursor += payload_length;
        Ok(&mut self.dest[start..self.cursor])
    }

    pub fn write_security_association(
        &mut self,
        proposals: &[Proposal],
    ) -> Result<(), NotEnoughSpaceError> {
        let length = proposal::proposals_length(proposals)?;
        let dest = self.next_payload_slice(PayloadType::SECURITY_ASSOCIATION, length)?;
        proposal::write_proposals(dest, proposals)?;
        Ok(())
    }

    pub fn write_key_exchange_payload(
        &mut self,
        dh_group: u16,
        public_key: &[u8],
    ) -> Result<(), NotEnoughSpaceError> {
        let dest = self.next_payload_slice(PayloadType::KEY_EXCHANGE, 4 + public_key.len())?;
        dest[0..2].copy_from_slice(&dh_group.to_be_bytes());
        dest[2..4].fill(0);
        dest[4..].copy_from_slice(public_key);
        Ok(())
    }

    pub fn write_nonce_payload(&mut self, nonce: &[u8]) -> Result<(), NotEnoughSpaceError> {
        let dest = self.next_payload_slice(PayloadType::NONCE, nonce.len())?;
        dest.copy_from_slice(nonce);
        Ok(())
    }

    pub fn write_notify_payload(
        &mut self,
        protocol_id: Option<IPSecProtocolID>,
        spi: &[u8],
        notify_message_type: NotifyMessageType,
        data: &[u8],
    ) -> Result<(), NotEnoughSpaceError> {
        if spi.len() > u8::MAX as usize {
            return Err(NotEnoughSpaceError {});
        }
        let dest =
            self.next_payload_slice(PayloadType::NOTIFY, 4 + spi.len() + data.len())?;
        dest[0] = protocol_id.map(|id| id.protocol_id()).unwrap_or(0);
        dest[1] = spi.len() as u8;
        dest[2..4].copy_from_slice(&notify_message_type.0.to_be_bytes());
        dest[4..4 + spi.len()].copy_from_slice(spi);
        dest[4 + spi.len()..].copy_from_slice(data);
        Ok(())
    }

    /// Writes an identification payload; raw_value includes the ID type and reserved fields.
    pub fn write_identification_payload(
        &mut self,
        initiator: bool,
        raw_value: &[u8],
    ) -> Result<(), NotEnoughSpaceError> {
        let payload_type = if initiator {
            PayloadType::ID_INITIATOR
        } else {
            PayloadType::ID_RESPONDER
        };
        let dest = self.next_payload_slice(payload_type, raw_value.len())?;
        dest.copy_from_slice(raw_value);
        Ok(())
    }

    pub fn write_authentication_payload(
        &mut self,
        auth_method: AuthMethod,
        data: &[u8],
    ) -> Result<(), NotEnoughSpaceError> {
        let dest = self.next_payload_slice(PayloadType::AUTHENTICATION, 4 + data.len())?;
        dest[0] = auth_method.0;
        dest[1..4].fill(0);
        dest[4..].copy_from_slice(data);
        Ok(())
    }

    pub fn write_delete_payload(
        &mut self,
        protocol_id: IPSecProtocolID,
        spis: &[Spi],
    ) -> Result<(), NotEnoughSpaceError> {
        let spi_size = spis.first().map(|spi| spi.length()).unwrap_or(0);
        if spis.len() > u16::MAX as usize || spis.iter().any(|spi| spi.length() != spi_size) {
            return Err(NotEnoughSpaceError {});
        }
        let dest = self.next_payload_slice(PayloadType::DELETE, 4 + spi_size * spis.len())?;
        dest[0] = protocol_id.protocol_id();
        dest[1] = spi_size as u8;
        dest[2..4].copy_from_slice(&(spis.len() as u16).to_be_bytes());
        for (i, spi) in spis.iter().enumerate() {
            spi.write_to(&mut dest[4 + i * spi_size..]);
        }
        Ok(())
    }

    pub fn write_traffic_selector_payload(
        &mut self,
        initiator: bool,
        traffic_selectors: &[TrafficSelector],
    ) -> Result<(), NotEnoughSpaceError> {
        if traffic_selectors.len() > u8::MAX as usize {
            return Err(NotEnoughSpaceError {});
        }
        let payload_type = if initiator {
            PayloadType::TRAFFIC_SELECTOR_INITIATOR
        } else {
            PayloadType::TRAFFIC_SELECTOR_RESPONDER
        };
        let length = traffic_selectors
            .iter()
            .map(|ts| ts.ts_type.selector_length())
            .sum::<usize>();
        let dest = self.next_payload_slice(payload_type, 4 + length)?;
        dest[0] = traffic_selectors.len() as u8;
        dest[1..4].fill(0);
        let mut offset = 4;
        for ts in traffic_selectors {
            offset += ts.write(&mut dest[offset..]);
        }
        Ok(())
    }

    /// Writes the final length into the header and returns it.
    pub fn complete_message(&mut self) -> usize {
        self.dest[24..28].copy_from_slice(&(self.cursor as u32).to_be_bytes());
        self.cursor
    }

    pub fn raw_data(&self) -> &[u8] {
        &self.dest[..self.cursor]
    }
}

impl fmt::Debug for Message<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "IKEv2 message")?;
        writeln!(f, "  Initiator SPI {:x}", self.header.initiator_spi)?;
        writeln!(f, "  Responder SPI {:x}", self.header.responder_spi)?;
        writeln!(f, "  Next payload {}", self.header.next_payload)?;
        writeln!(
            f,
            "  Version {}.{}",
            self.header.major_version(),
            self.header.minor_version()
        )?;
        writeln!(f, "  Exchange type {}", self.header.exchange_type)?;
        writeln!(f, "  Flags {}", self.header.flags)?;
        writeln!(f, "  Message ID {}", self.header.message_id)?;
        writeln!(f, "  Length {}", self.header.length)?;
        for pl in self.iter_payloads() {
            let pl = match pl {
                Ok(pl) => pl,
                Err(err) => {
                    writeln!(f, "  Payload data invalid {}", err)?;
                    continue;
                }
            };
            let critical = if pl.critical {
                "critical"
            } else {
                "not critical"
            };
            writeln!(f, "  Payload type {}, {}", pl.payload_type, critical)?;
            let payload = match pl.dispatch() {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    writeln!(f, "    Data {:?}", pl.data)?;
                    continue;
                }
                Err(err) => {
                    writeln!(f, "    Payload invalid {}", err)?;
                    continue;
                }
            };
            match payload {
                Payload::SecurityAssociation(sa) => {
                    for prop in sa.proposals.iter() {
                        writeln!(
                            f,
                            "    Proposal {} protocol ID {} SPI {:?}",
                            prop.proposal_num,
                            prop.protocol_id,
                            Octets::new(prop.spi)
                        )?;
                        for tf in prop.transforms.iter() {
                            writeln!(f, "      Transform {}", tf.id)?;
                            for attr in tf.attributes.iter() {
                                writeln!(
                                    f,
                                    "        Attribute {} value {:?}",
                                    attr.attribute_type.type_id(),
                                    attr.value
                                )?;
                            }
                        }
                    }
                }
                Payload::KeyExchange(kex) => writeln!(
                    f,
                    "    DH Group num {} value {:?}",
                    kex.read_group_num(),
                    Octets::new(kex.read_value())
                )?,
                Payload::IdentificationInitiator(id) | Payload::IdentificationResponder(id) => {
                    writeln!(
                        f,
                        "    ID type {} value {:?}",
                        id.id_type(),
                        Octets::new(id.read_value())
                    )?
                }
                Payload::Authentication(auth) => writeln!(
                    f,
                    "    Method {} value {:?}",
                    auth.read_method(),
                    Octets::new(auth.read_value())
                )?,
                Payload::Nonce(nonce) => {
                    writeln!(f, "    Value {:?}", Octets::new(nonce.read_value()))?
                }
                Payload::Notify(notify) => writeln!(
                    f,
                    "    Notify protocol ID {:?} SPI {:?} type {} value {:?}",
                    notify.protocol_id(),
                    Octets::new(notify.spi()),
                    notify.message_type(),
                    Octets::new(notify.read_value()),
                )?,
                Payload::Delete(delete) => {
                    write!(f, "    Delete protocol ID {} SPIs", delete.protocol_id())?;
                    for spi in delete.iter_spi() {
                        write!(f, " {}", spi)?;
                    }
                    writeln!(f)?;
                }
                Payload::TrafficSelectorInitiator(ts) | Payload::TrafficSelectorResponder(ts) => {
                    for ts in ts.traffic_selectors() {
                        writeln!(f, "    {}", ts)?;
                    }
                }
                Payload::VendorID(vendor_id) => {
                    writeln!(f, "    Value {:?}", Octets::new(vendor_id.read_value()))?
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatError {
    TruncatedHeader,
    DeclaredLengthExceedsBuffer,
    MalformedTransform,
    MalformedProposal,
    UnsupportedPayloadType(u8),
    InvalidSyntax(&'static str),
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::TruncatedHeader => write!(f, "Not enough data for header"),
            Self::DeclaredLengthExceedsBuffer => write!(f, "Declared length exceeds buffer"),
            Self::MalformedTransform => write!(f, "Malformed transform"),
            Self::MalformedProposal => write!(f, "Malformed proposal"),
            Self::UnsupportedPayloadType(payload_type) => {
                write!(f, "Unsupported critical payload type {}", payload_type)
            }
            Self::InvalidSyntax(msg) => f.write_str(msg),
        }
    }
}

impl error::Error for FormatError {}

impl From<&'static str> for FormatError {
    fn from(msg: &'static str) -> FormatError {
        Self::InvalidSyntax(msg)
    }
}

impl From<OutOfBounds> for FormatError {
    fn from(_: OutOfBounds) -> FormatError {
        Self::DeclaredLengthExceedsBuffer
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct NotEnoughSpaceError {}

impl fmt::Display for NotEnoughSpaceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Not enough space in buffer")
    }
}

impl error::Error for NotEnoughSpaceError {}

#[cfg(test)]
mod tests {
    use super::super::proposal::{Transform, TransformId};
    use super::*;

    const NONCE: [u8; 16] = [0x5a; 16];

    fn write_test_message(dest: &mut [u8]) -> usize {
        let mut writer = MessageWriter::new(dest).unwrap();
        writer.write_header(
            0x0102030405060708,
            0,
            ExchangeType::IKE_SA_INIT,
            Flags::INITIATOR,
            0,
        );
        writer
            .write_security_association(&[Proposal {
                proposal_num: 1,
                protocol_id: IPSecProtocolID::IKE,
                spi: &[],
                transforms: vec![
                    Transform::with_key_length(TransformId::ENCR_AES_GCM_16, 256),
                    Transform::new(TransformId::PRF_HMAC_SHA2_256),
                    Transform::new(TransformId::DH_256_ECP),
                ],
            }])
            .unwrap();
        writer
            .write_key_exchange_payload(19, &[0x11; 64])
            .unwrap();
        writer.write_nonce_payload(&NONCE).unwrap();
        writer.complete_message()
    }

    #[test]
    fn rejects_short_header() {
        let data = [0u8; 27];
        assert_eq!(
            Message::decode(&data).err(),
            Some(FormatError::TruncatedHeader)
        );
    }

    #[test]
    fn rejects_length_shorter_than_header() {
        let mut data = [0u8; 28];
        data[27] = 20;
        assert!(matches!(
            Message::decode(&data),
            Err(FormatError::InvalidSyntax(_))
        ));
    }

    #[test]
    fn rejects_length_longer_than_buffer() {
        let mut data = [0u8; 28];
        data[27] = 29;
        assert_eq!(
            Message::decode(&data).err(),
            Some(FormatError::DeclaredLengthExceedsBuffer)
        );
    }

    #[test]
    fn ignores_trailing_data() {
        let mut buf = [0u8; 512];
        let length = write_test_message(&mut buf);
        let msg = Message::decode(&buf[..length + 10]).unwrap();
        assert_eq!(msg.raw_data().len(), length);
        assert_eq!(msg.iter_payloads().count(), 3);
    }

    #[test]
    fn walks_payload_chain() {
        let mut buf = [0u8; 512];
        let length = write_test_message(&mut buf);
        let msg = Message::decode(&buf[..length]).unwrap();
        assert_eq!(msg.read_exchange_type(), ExchangeType::IKE_SA_INIT);
        assert!(msg.read_flags().has(Flags::INITIATOR));
        assert_eq!(msg.read_initiator_spi(), 0x0102030405060708);
        let payloads = msg.iter_payloads().collect::<Result<Vec<_>, _>>().unwrap();
        let types = payloads
            .iter()
            .map(|pl| pl.payload_type())
            .collect::<Vec<_>>();
        assert_eq!(
            types,
            vec![
                PayloadType::SECURITY_ASSOCIATION,
                PayloadType::KEY_EXCHANGE,
                PayloadType::NONCE
            ]
        );
        let payloads_length = payloads
            .iter()
            .map(|pl| pl.raw_data().len() + PAYLOAD_HEADER_LENGTH)
            .sum::<usize>();
        assert_eq!(payloads_length, length - HEADER_LENGTH);
    }

    #[test]
    fn dispatches_typed_payloads() {
        let mut buf = [0u8; 512];
        let length = write_test_message(&mut buf);
        let msg = Message::decode(&buf[..length]).unwrap();
        let mut found = 0;
        for pl in msg.iter_payloads() {
            match pl.unwrap().dispatch().unwrap() {
                Some(Payload::SecurityAssociation(sa)) => {
                    assert_eq!(sa.proposals.len(), 1);
                    assert_eq!(sa.proposals[0].transforms.len(), 3);
                    found += 1;
                }
                Some(Payload::KeyExchange(kex)) => {
                    assert_eq!(kex.read_group_num(), 19);
                    assert_eq!(kex.read_value(), &[0x11; 64]);
                    found += 1;
                }
                Some(Payload::Nonce(nonce)) => {
                    assert_eq!(nonce.read_value(), &NONCE);
                    found += 1;
                }
                _ => panic!("Unexpected payload"),
            }
        }
        assert_eq!(found, 3);
    }

    #[test]
    fn oversized_payload_stops_iteration() {
        let mut buf = [0u8; 512];
        let length = write_test_message(&mut buf);
        // Inflate the SA payload length past the end of the message.
        buf[HEADER_LENGTH + 2..HEADER_LENGTH + 4].copy_from_slice(&0x0400u16.to_be_bytes());
        let msg = Message::decode(&buf[..length]).unwrap();
        let mut payloads = msg.iter_payloads();
        assert_eq!(
            payloads.next().map(|pl| pl.err()),
            Some(Some(FormatError::DeclaredLengthExceedsBuffer))
        );
        assert!(payloads.next().is_none());
    }

    #[test]
    fn short_payload_length_is_invalid_syntax() {
        let mut buf = [0u8; 512];
        let length = write_test_message(&mut buf);
        buf[HEADER_LENGTH + 2..HEADER_LENGTH + 4].copy_from_slice(&2u16.to_be_bytes());
        let msg = Message::decode(&buf[..length]).unwrap();
        assert!(matches!(
            msg.iter_payloads().next(),
            Some(Err(FormatError::InvalidSyntax(_)))
        ));
    }

    #[test]
    fn truncated_payload_header() {
        let data = [0x00, 0x00];
        assert_eq!(
            GenericPayloadHeader::read(Octets::new(&data)),
            Err(FormatError::TruncatedHeader)
        );
    }

    #[test]
    fn unknown_payloads_are_skipped_unless_critical() {
        let data = [0xde, 0xad];
        let payload = RawPayload::new(PayloadType::from_u8(200), false, &data);
        assert!(payload.dispatch().unwrap().is_none());
        assert!(payload.decode().unwrap().is_none());
        let payload = RawPayload::new(PayloadType::from_u8(200), true, &data);
        assert!(payload.dispatch().unwrap().is_none());
        assert_eq!(
            payload.decode().err(),
            Some(FormatError::UnsupportedPayloadType(200))
        );
    }

    #[test]
    fn writes_and_reads_auxiliary_payloads() {
        let mut buf = [0u8; 512];
        let mut writer = MessageWriter::new(&mut buf).unwrap();
        writer.write_header(1, 2, ExchangeType::IKE_AUTH, Flags::RESPONSE, 1);
        writer
            .write_identification_payload(false, &[2, 0, 0, 0, b'v', b'p', b'n'])
            .unwrap();
        writer
            .write_authentication_payload(AuthMethod::SHARED_KEY_MESSAGE_INTEGRITY_CODE, &[7; 32])
            .unwrap();
        writer
            .write_notify_payload(
                Some(IPSecProtocolID::ESP),
                &[0, 0, 1, 0],
                NotifyMessageType::REKEY_SA,
                &[],
            )
            .unwrap();
        writer
            .write_delete_payload(IPSecProtocolID::ESP, &[Spi::U32(0x1000), Spi::U32(0x2000)])
            .unwrap();
        let ts = [
            TrafficSelector::from_ip_range(
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0))..=IpAddr::V4(Ipv4Addr::new(10, 0, 0, 255)),
            )
            .unwrap(),
            TrafficSelector::from_ip_range(
                IpAddr::V6(Ipv6Addr::UNSPECIFIED)..=IpAddr::V6(Ipv6Addr::from(u128::MAX)),
            )
            .unwrap(),
        ];
        writer.write_traffic_selector_payload(true, &ts).unwrap();
        let length = writer.complete_message();

        let msg = Message::decode(&buf[..length]).unwrap();
        assert!(msg.is_response());
        let mut found = 0;
        for pl in msg.iter_payloads() {
            match pl.unwrap().dispatch().unwrap() {
                Some(Payload::IdentificationResponder(id)) => {
                    assert_eq!(id.id_type(), IdentificationType::ID_FQDN);
                    assert_eq!(id.read_value(), b"vpn");
                    found += 1;
                }
                Some(Payload::Authentication(auth)) => {
                    assert_eq!(
                        auth.read_method(),
                        AuthMethod::SHARED_KEY_MESSAGE_INTEGRITY_CODE
                    );
                    assert_eq!(auth.read_value(), &[7; 32]);
                    found += 1;
                }
                Some(Payload::Notify(notify)) => {
                    assert_eq!(notify.message_type(), NotifyMessageType::REKEY_SA);
                    assert_eq!(notify.protocol_id(), Some(IPSecProtocolID::ESP));
                    assert_eq!(Spi::from_slice(notify.spi()), Ok(Spi::U32(0x100)));
                    found += 1;
                }
                Some(Payload::Delete(delete)) => {
                    assert_eq!(
                        delete.iter_spi().collect::<Vec<_>>(),
                        vec![Spi::U32(0x1000), Spi::U32(0x2000)]
                    );
                    found += 1;
                }
                Some(Payload::TrafficSelectorInitiator(decoded)) => {
                    assert_eq!(decoded.traffic_selectors(), &ts);
                    found += 1;
                }
                _ => panic!("Unexpected payload"),
            }
        }
        assert_eq!(found, 5);
    }

    #[test]
    fn delete_ike_sa_has_no_spi() {
        let mut buf = [0u8; 64];
        let mut writer = MessageWriter::new(&mut buf).unwrap();
        writer.write_header(1, 2, ExchangeType::INFORMATIONAL, Flags::INITIATOR, 2);
        writer
            .write_delete_payload(IPSecProtocolID::IKE, &[])
            .unwrap();
        let length = writer.complete_message();
        let msg = Message::decode(&buf[..length]).unwrap();
        let payload = msg.iter_payloads().next().unwrap().unwrap();
        match payload.dispatch().unwrap() {
            Some(Payload::Delete(delete)) => {
                assert_eq!(delete.protocol_id(), IPSecProtocolID::IKE);
                assert_eq!(delete.iter_spi().count(), 0);
            }
            _ => panic!("Unexpected payload"),
        }
    }

    #[test]
    fn writer_reports_missing_space() {
        let mut buf = [0u8; 40];
        let mut writer = MessageWriter::new(&mut buf).unwrap();
        writer.write_header(1, 0, ExchangeType::IKE_SA_INIT, Flags::INITIATOR, 0);
        assert_eq!(
            writer.write_nonce_payload(&[0u8; 32]),
            Err(NotEnoughSpaceError {})
        );
        assert!(MessageWriter::new(&mut [0u8; 10]).is_err());
    }

    #[test]
    fn short_nonce_is_rejected() {
        let payload = RawPayload::new(PayloadType::NONCE, false, &[1, 2, 3]);
        assert!(matches!(
            payload.dispatch(),
            Err(FormatError::InvalidSyntax(_))
        ));
    }

    #[test]
    fn debug_dump_lists_payloads() {
        let mut buf = [0u8; 512];
        let length = write_test_message(&mut buf);
        let msg = Message::decode(&buf[..length]).unwrap();
        let dump = format!("{:?}", msg);
        assert!(dump.contains("Exchange type IKE_SA_INIT"));
        assert!(dump.contains("Transform ENCR_AES_GCM_16"));
        assert!(dump.contains("DH Group num 19"));
    }
}
