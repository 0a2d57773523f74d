use log::{debug, info, warn};
use rand::Rng;
use std::{
    cmp::Ordering,
    error, fmt,
    hash::{Hash, Hasher},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use super::config::{Identity, PeerConfig, PeerConfigProvider, PeerLookup};
use super::crypto::{
    self, AuthInput, ChildKeyInput, CryptoRegistry, IkeKeyInput, KeyExchange, KeyMaterial, Role,
    TransformParameters,
};
use super::message::{self, NotifyMessageType, Payload, Spi, TrafficSelector};
use super::proposal::{IPSecProtocolID, Proposal, SecurityAssociation, TransformId, TransformType};

#[derive(Clone, Copy)]
pub struct SessionID {
    remote_spi: u64,
    local_spi: u64,
}

impl PartialEq for SessionID {
    fn eq(&self, other: &Self) -> bool {
        self.remote_spi == other.remote_spi && self.local_spi == other.local_spi
    }
}

impl Eq for SessionID {}

impl Hash for SessionID {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.remote_spi.hash(state);
        self.local_spi.hash(state);
    }
}

impl SessionID {
    pub fn new(remote_spi: u64, local_spi: u64) -> SessionID {
        SessionID {
            remote_spi,
            local_spi,
        }
    }

    pub fn from_message(message: &message::Message) -> SessionID {
        let (remote_spi, local_spi) = if message.read_flags().has(message::Flags::INITIATOR) {
            (message.read_initiator_spi(), message.read_responder_spi())
        } else {
            (message.read_responder_spi(), message.read_initiator_spi())
        };
        SessionID {
            remote_spi,
            local_spi,
        }
    }

    pub fn remote_spi(&self) -> u64 {
        self.remote_spi
    }

    pub fn local_spi(&self) -> u64 {
        self.local_spi
    }
}

impl fmt::Display for SessionID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}-{:x}", self.remote_spi, self.local_spi)
    }
}

impl fmt::Debug for SessionID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Collaborators and limits shared by all sessions.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<dyn CryptoRegistry>,
    pub peers: Arc<dyn PeerConfigProvider>,
    pub nonce_length: usize,
    pub max_datagram_size: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Auth,
    Established,
    Failed,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Init => write!(f, "INIT"),
            SessionState::Auth => write!(f, "AUTH"),
            SessionState::Established => write!(f, "ESTABLISHED"),
            SessionState::Failed => write!(f, "FAILED"),
            SessionState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// IKE_SA_INIT octets which are signed during IKE_AUTH.
struct InitSAContext {
    message_initiator: Vec<u8>,
    message_responder: Vec<u8>,
    nonce_initiator: Vec<u8>,
    nonce_responder: Vec<u8>,
}

struct InitiatorContext {
    key_exchange: Box<dyn KeyExchange>,
    nonce_initiator: Vec<u8>,
    message_initiator: Vec<u8>,
}

enum RequestContext {
    InitSA(InitiatorContext),
    // Local SPI of the offered child SA.
    Auth(u32),
    DeleteIKE,
}

impl RequestContext {
    fn exchange_type(&self) -> message::ExchangeType {
        match self {
            RequestContext::InitSA(_) => message::ExchangeType::IKE_SA_INIT,
            RequestContext::Auth(_) => message::ExchangeType::IKE_AUTH,
            RequestContext::DeleteIKE => message::ExchangeType::INFORMATIONAL,
        }
    }
}

/// A negotiated ESP or AH security association.
pub struct ChildSA {
    params: TransformParameters,
    keys: KeyMaterial,
    ts_local: Vec<TrafficSelector>,
    ts_remote: Vec<TrafficSelector>,
}

impl ChildSA {
    pub fn protocol_id(&self) -> IPSecProtocolID {
        self.params.protocol_id()
    }

    pub fn local_spi(&self) -> Spi {
        self.params.local_spi()
    }

    pub fn remote_spi(&self) -> Spi {
        self.params.remote_spi()
    }

    pub fn params(&self) -> &TransformParameters {
        &self.params
    }

    pub fn keys(&self) -> &KeyMaterial {
        &self.keys
    }

    pub fn ts_local(&self) -> &[TrafficSelector] {
        &self.ts_local
    }

    pub fn ts_remote(&self) -> &[TrafficSelector] {
        &self.ts_remote
    }
}

impl fmt::Display for ChildSA {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}-{}",
            self.params.protocol_id(),
            self.params.remote_spi(),
            self.params.local_spi()
        )
    }
}

/// One IKE security association, in either the initiator or the responder role.
pub struct IKEv2Session {
    session_id: SessionID,
    role: Role,
    remote_addr: SocketAddr,
    state: SessionState,
    context: SessionContext,
    peer: Option<Arc<PeerConfig>>,
    params: Option<TransformParameters>,
    keys: Option<KeyMaterial>,
    init_ctx: Option<InitSAContext>,
    child_sas: Vec<ChildSA>,
    last_update: Instant,
    remote_message_id: u32,
    local_message_id: u32,
    last_request_hash: Option<[u8; 32]>,
    last_response: Option<Vec<u8>>,
    last_sent_request: Option<Vec<u8>>,
    sent_request: Option<RequestContext>,
}

impl IKEv2Session {
    pub fn new_responder(
        session_id: SessionID,
        remote_addr: SocketAddr,
        context: SessionContext,
    ) -> IKEv2Session {
        IKEv2Session::new(session_id, Role::Responder, remote_addr, None, context)
    }

    /// Creates a session which will start negotiating with `initiate`; the remote SPI is learned from the response.
    pub fn new_initiator(
        local_spi: u64,
        remote_addr: SocketAddr,
        peer: Arc<PeerConfig>,
        context: SessionContext,
    ) -> IKEv2Session {
        IKEv2Session::new(
            SessionID::new(0, local_spi),
            Role::Initiator,
            remote_addr,
            Some(peer),
            context,
        )
    }

    fn new(
        session_id: SessionID,
        role: Role,
        remote_addr: SocketAddr,
        peer: Option<Arc<PeerConfig>>,
        context: SessionContext,
    ) -> IKEv2Session {
        IKEv2Session {
            session_id,
            role,
            remote_addr,
            state: SessionState::Init,
            context,
            peer,
            params: None,
            keys: None,
            init_ctx: None,
            child_sas: vec![],
            last_update: Instant::now(),
            remote_message_id: 0,
            local_message_id: 0,
            last_request_hash: None,
            last_response: None,
            last_sent_request: None,
            sent_request: None,
        }
    }

    pub fn session_id(&self) -> SessionID {
        self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn peer_name(&self) -> Option<&str> {
        self.peer.as_ref().map(|peer| peer.name.as_str())
    }

    pub fn params(&self) -> Option<&TransformParameters> {
        self.params.as_ref()
    }

    pub fn child_sas(&self) -> &[ChildSA] {
        &self.child_sas
    }

    pub fn last_response(&self) -> Option<&[u8]> {
        self.last_response.as_deref()
    }

    pub fn last_request(&self) -> Option<&[u8]> {
        self.last_sent_request.as_deref()
    }

    /// Message ID of the next request this session expects from the peer.
    pub fn next_request_id(&self) -> u32 {
        if self.last_request_hash.is_some() {
            self.remote_message_id.wrapping_add(1)
        } else {
            self.remote_message_id
        }
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.state, SessionState::Failed | SessionState::Closed)
    }

    pub fn is_half_open_expired(&self, now: Instant, expiration: Duration) -> bool {
        matches!(self.state, SessionState::Init | SessionState::Auth)
            && self.last_update + expiration < now
    }

    fn header_spis(&self) -> (u64, u64) {
        match self.role {
            Role::Initiator => (self.session_id.local_spi, self.session_id.remote_spi),
            Role::Responder => (self.session_id.remote_spi, self.session_id.local_spi),
        }
    }

    fn request_flags(&self) -> message::Flags {
        match self.role {
            Role::Initiator => message::Flags::INITIATOR,
            Role::Responder => message::Flags::NONE,
        }
    }

    fn generate_nonce(&self) -> Vec<u8> {
        let length = self
            .context
            .nonce_length
            .clamp(message::MIN_NONCE_LENGTH, message::MAX_NONCE_LENGTH);
        let mut nonce = vec![0u8; length];
        rand::thread_rng().fill(&mut nonce[..]);
        nonce
    }

    fn ike_crypto(&self) -> Result<(&TransformParameters, &KeyMaterial), SessionError> {
        match (self.params.as_ref(), self.keys.as_ref()) {
            (Some(params), Some(keys)) => Ok((params, keys)),
            _ => Err("IKE SA keys are not available".into()),
        }
    }

    /// Handles a request from the peer; returns true if `last_response` should be sent.
    pub fn process_request(
        &mut self,
        remote_addr: SocketAddr,
        request: &message::Message,
    ) -> Result<bool, SessionError> {
        self.last_update = Instant::now();
        let message_id = request.read_message_id();
        match message_id.cmp(&self.remote_message_id) {
            Ordering::Less => {
                debug!(
                    "Ignoring outdated request {} for session {}",
                    message_id, self.session_id
                );
                return Ok(false);
            }
            Ordering::Equal => {
                if let Some(last_request_hash) = self.last_request_hash.as_ref() {
                    let request_hash = crypto::hash_sha256(request.raw_data());
                    if &request_hash == last_request_hash {
                        // Peer might have switched to another NAT port.
                        self.remote_addr = remote_addr;
                        debug!(
                            "Retransmitting response {} for session {}",
                            message_id, self.session_id
                        );
                        return Ok(true);
                    } else {
                        return Err(
                            "Retransmitted request hash mismatch, not sending response".into()
                        );
                    }
                }
            }
            Ordering::Greater => {}
        }
        if self.is_terminated() {
            debug!(
                "Ignoring request {} for session {} in {} state",
                message_id, self.session_id, self.state
            );
            return Ok(false);
        }

        let exchange_type = request.read_exchange_type();
        let mut response_bytes = vec![0u8; self.context.max_datagram_size];
        let mut response = message::MessageWriter::new(&mut response_bytes)?;
        let (initiator_spi, responder_spi) = self.header_spis();
        response.write_header(
            initiator_spi,
            responder_spi,
            exchange_type,
            self.request_flags().with(message::Flags::RESPONSE),
            message_id,
        );

        match decode_payloads(request) {
            Ok(payloads) => match exchange_type {
                message::ExchangeType::IKE_SA_INIT => {
                    self.process_sa_init_request(request, payloads, &mut response)
                }
                message::ExchangeType::IKE_AUTH => {
                    self.process_auth_request(payloads, &mut response)
                }
                message::ExchangeType::INFORMATIONAL => {
                    self.process_informational_request(payloads, &mut response)
                }
                message::ExchangeType::CREATE_CHILD_SA => {
                    self.process_create_child_sa_request(payloads, &mut response)
                }
                _ => {
                    warn!("Unimplemented handler for message {}", exchange_type);
                    Err("Unimplemented message".into())
                }
            }?,
            Err(reason) => {
                if self.state == SessionState::Init {
                    self.state = SessionState::Failed;
                }
                self.write_failed_response(&mut response, reason)?
            }
        }

        let response_length = response.complete_message();
        self.last_response = Some(response_bytes[..response_length].to_vec());
        self.last_request_hash = Some(crypto::hash_sha256(request.raw_data()));
        self.remote_message_id = message_id;
        self.remote_addr = remote_addr;

        Ok(true)
    }

    fn write_failed_response(
        &mut self,
        response: &mut message::MessageWriter,
        reason: NotifyMessageType,
    ) -> Result<(), SessionError> {
        Ok(response.write_notify_payload(None, &[], reason, &[])?)
    }

    fn fail_negotiation(
        &mut self,
        response: &mut message::MessageWriter,
        reason: NotifyMessageType,
    ) -> Result<(), SessionError> {
        self.state = SessionState::Failed;
        self.write_failed_response(response, reason)
    }

    fn process_sa_init_request(
        &mut self,
        request: &message::Message,
        payloads: Vec<Payload>,
        response: &mut message::MessageWriter,
    ) -> Result<(), SessionError> {
        if self.state != SessionState::Init || self.role != Role::Responder {
            warn!(
                "Received IKE_SA_INIT request for session {} in {} state",
                self.session_id, self.state
            );
            return self.write_failed_response(response, NotifyMessageType::INVALID_SYNTAX);
        }

        let mut sa = None;
        let mut kex = None;
        let mut nonce_initiator = None;
        for payload in payloads {
            match payload {
                Payload::SecurityAssociation(payload) => sa = Some(payload),
                Payload::KeyExchange(payload) => kex = Some(payload),
                Payload::Nonce(payload) => nonce_initiator = Some(payload.read_value()),
                Payload::Notify(notify) => {
                    debug!("Ignoring IKE_SA_INIT notify {}", notify.message_type())
                }
                _ => {}
            }
        }
        let (sa, kex, nonce_initiator) = match (sa, kex, nonce_initiator) {
            (Some(sa), Some(kex), Some(nonce_initiator)) => (sa, kex, nonce_initiator),
            _ => {
                warn!("IKE_SA_INIT request is missing a required payload");
                return self.fail_negotiation(response, NotifyMessageType::INVALID_SYNTAX);
            }
        };

        let peer = match self
            .context
            .peers
            .peer_config(&PeerLookup::Address(self.remote_addr))
        {
            Some(peer) => peer,
            None => {
                warn!("No peer configured for {}", self.remote_addr);
                return self.fail_negotiation(response, NotifyMessageType::NO_PROPOSAL_CHOSEN);
            }
        };
        let registry = self.context.registry.clone();
        let mut params = match crypto::choose_sa_parameters(
            &sa.proposals,
            &peer.ike_proposals,
            registry.as_ref(),
        ) {
            Some(params) => params,
            None => {
                warn!("No compatible SA parameters found for {}", self.remote_addr);
                return self.fail_negotiation(response, NotifyMessageType::NO_PROPOSAL_CHOSEN);
            }
        };
        let dh_group = match params.dh_group() {
            Some(dh_group) => dh_group,
            None => {
                warn!("Selected IKE proposal has no Diffie-Hellman group");
                return self.fail_negotiation(response, NotifyMessageType::NO_PROPOSAL_CHOSEN);
            }
        };
        if kex.read_group_num() != dh_group {
            warn!(
                "Initiator sent key exchange for group {}, expected {}",
                kex.read_group_num(),
                dh_group
            );
            self.state = SessionState::Failed;
            return Ok(response.write_notify_payload(
                None,
                &[],
                NotifyMessageType::INVALID_KE_PAYLOAD,
                &dh_group.to_be_bytes(),
            )?);
        }
        let key_exchange = match registry.key_exchange(dh_group) {
            Ok(key_exchange) => key_exchange,
            Err(err) => {
                warn!("Failed to init DH: {}", err);
                return self.fail_negotiation(response, NotifyMessageType::NO_PROPOSAL_CHOSEN);
            }
        };
        let public_key = key_exchange.public_key().to_vec();
        let shared_secret = match key_exchange.compute_shared_secret(kex.read_value()) {
            Ok(shared_secret) => shared_secret,
            Err(err) => {
                warn!("Failed to compute shared secret: {}", err);
                self.state = SessionState::Failed;
                return Ok(response.write_notify_payload(
                    None,
                    &[],
                    NotifyMessageType::INVALID_KE_PAYLOAD,
                    &dh_group.to_be_bytes(),
                )?);
            }
        };

        let nonce_responder = self.generate_nonce();
        let keys = match registry.derive_ike_keys(
            &params,
            &IkeKeyInput {
                shared_secret: &shared_secret,
                nonce_initiator,
                nonce_responder: &nonce_responder,
                spi_initiator: self.session_id.remote_spi,
                spi_responder: self.session_id.local_spi,
            },
        ) {
            Ok(keys) => keys,
            Err(err) => {
                warn!("Failed to derive IKE SA keys: {}", err);
                return self.fail_negotiation(response, NotifyMessageType::NO_PROPOSAL_CHOSEN);
            }
        };
        params.set_local_spi(Spi::U64(self.session_id.local_spi));
        params.set_remote_spi(Spi::U64(self.session_id.remote_spi));

        response.write_security_association(&[params.to_proposal(&[])])?;
        response.write_key_exchange_payload(dh_group, &public_key)?;
        response.write_nonce_payload(&nonce_responder)?;
        response.complete_message();

        info!(
            "Negotiated {} for session {} with {}",
            params, self.session_id, peer.name
        );
        self.init_ctx = Some(InitSAContext {
            message_initiator: request.raw_data().to_vec(),
            message_responder: response.raw_data().to_vec(),
            nonce_initiator: nonce_initiator.to_vec(),
            nonce_responder,
        });
        self.params = Some(params);
        self.keys = Some(keys);
        self.peer = Some(peer);
        self.state = SessionState::Auth;

        Ok(())
    }

    fn process_auth_request(
        &mut self,
        payloads: Vec<Payload>,
        response: &mut message::MessageWriter,
    ) -> Result<(), SessionError> {
        if self.state != SessionState::Auth || self.role != Role::Responder {
            warn!(
                "Received IKE_AUTH request for session {} in {} state",
                self.session_id, self.state
            );
            return self.write_failed_response(response, NotifyMessageType::AUTHENTICATION_FAILED);
        }

        let mut id_initiator = None;
        let mut auth = None;
        let mut sa = None;
        let mut ts_initiator = vec![];
        let mut ts_responder = vec![];
        for payload in payloads {
            match payload {
                Payload::IdentificationInitiator(id) => id_initiator = Some(id.raw_value()),
                Payload::Authentication(payload) => auth = Some(payload),
                Payload::SecurityAssociation(payload) => sa = Some(payload),
                Payload::TrafficSelectorInitiator(ts) => {
                    ts_initiator = ts.into_traffic_selectors()
                }
                Payload::TrafficSelectorResponder(ts) => {
                    ts_responder = ts.into_traffic_selectors()
                }
                Payload::Notify(notify) => {
                    debug!("Ignoring IKE_AUTH notify {}", notify.message_type())
                }
                _ => {}
            }
        }

        let id_raw = match id_initiator {
            Some(id) => id,
            None => {
                warn!("Initiator provided no ID");
                return self.fail_negotiation(response, NotifyMessageType::AUTHENTICATION_FAILED);
            }
        };
        let id = match Identity::from_payload(id_raw) {
            Some(id) => id,
            None => {
                return self.fail_negotiation(response, NotifyMessageType::AUTHENTICATION_FAILED)
            }
        };
        let auth = match auth {
            Some(auth) => auth,
            None => {
                warn!("Initiator {} provided no auth", id);
                return self.fail_negotiation(response, NotifyMessageType::AUTHENTICATION_FAILED);
            }
        };
        if auth.read_method() != message::AuthMethod::SHARED_KEY_MESSAGE_INTEGRITY_CODE {
            warn!(
                "Authentication method {} is unsupported",
                auth.read_method()
            );
            return self.fail_negotiation(response, NotifyMessageType::AUTHENTICATION_FAILED);
        }
        let peer = match self.context.peers.peer_config(&PeerLookup::Identity(&id)) {
            Some(peer) => peer,
            None => {
                warn!("No peer configured for identity {}", id);
                return self.fail_negotiation(response, NotifyMessageType::AUTHENTICATION_FAILED);
            }
        };
        let ctx = self.init_ctx.take().ok_or("IKE_SA_INIT context is missing")?;

        let registry = self.context.registry.clone();
        let (params, keys) = match self.ike_crypto() {
            Ok(crypto) => crypto,
            Err(err) => {
                self.init_ctx = Some(ctx);
                return Err(err);
            }
        };
        let verified = registry.verify_auth(
            params,
            keys,
            Role::Initiator,
            &peer.shared_key,
            &AuthInput {
                message: &ctx.message_initiator,
                peer_nonce: &ctx.nonce_responder,
                id: id_raw,
            },
            auth.read_value(),
        );
        match verified {
            Ok(true) => {}
            Ok(false) => {
                warn!("Initiator {} failed authentication", id);
                return self.fail_negotiation(response, NotifyMessageType::AUTHENTICATION_FAILED);
            }
            Err(err) => {
                warn!("Failed to verify initiator authentication: {}", err);
                return self.fail_negotiation(response, NotifyMessageType::AUTHENTICATION_FAILED);
            }
        }

        // Nothing is committed until the whole response is written.
        let child_sa = match self.write_auth_response(
            response,
            &peer,
            &ctx,
            sa.as_ref(),
            &ts_initiator,
            &ts_responder,
        ) {
            Ok(child_sa) => child_sa,
            Err(err) => {
                warn!(
                    "Failed to write IKE_AUTH response for session {}: {}",
                    self.session_id, err
                );
                self.init_ctx = Some(ctx);
                return Err(err);
            }
        };

        self.state = SessionState::Established;
        info!(
            "Established IKE SA {} with {} ({})",
            self.session_id, peer.name, id
        );
        if let Some(child_sa) = child_sa {
            info!("Created child SA {} for session {}", child_sa, self.session_id);
            self.child_sas.push(child_sa);
        }
        self.peer = Some(peer);

        Ok(())
    }

    fn write_auth_response(
        &self,
        response: &mut message::MessageWriter,
        peer: &PeerConfig,
        ctx: &InitSAContext,
        sa: Option<&SecurityAssociation>,
        ts_initiator: &[TrafficSelector],
        ts_responder: &[TrafficSelector],
    ) -> Result<Option<ChildSA>, SessionError> {
        let (params, keys) = self.ike_crypto()?;
        let id_responder = peer.local_id.to_payload();
        let signature = self.context.registry.sign_auth(
            params,
            keys,
            Role::Responder,
            &peer.shared_key,
            &AuthInput {
                message: &ctx.message_responder,
                peer_nonce: &ctx.nonce_initiator,
                id: &id_responder,
            },
        )?;
        response.write_identification_payload(false, &id_responder)?;
        response.write_authentication_payload(
            message::AuthMethod::SHARED_KEY_MESSAGE_INTEGRITY_CODE,
            &signature,
        )?;

        // The IKE SA stays up even if the child SA can't be negotiated.
        let sa = match sa {
            Some(sa) => sa,
            None => return Ok(None),
        };
        let key_input = ChildKeyInput {
            shared_secret: None,
            nonce_initiator: &ctx.nonce_initiator,
            nonce_responder: &ctx.nonce_responder,
        };
        let child_sa = self
            .select_child_parameters(peer, &sa.proposals)
            .and_then(|params| {
                self.install_child_sa(peer, params, ts_initiator, ts_responder, &key_input)
            });
        match child_sa {
            Ok(child_sa) => {
                write_child_sa(response, &child_sa, None, None)?;
                Ok(Some(child_sa))
            }
            Err(reason) => {
                response.write_notify_payload(None, &[], reason, &[])?;
                Ok(None)
            }
        }
    }

    fn select_child_parameters(
        &self,
        peer: &PeerConfig,
        proposals: &[Proposal],
    ) -> Result<TransformParameters, NotifyMessageType> {
        let params = crypto::choose_sa_parameters(
            proposals,
            &peer.child_proposals,
            self.context.registry.as_ref(),
        )
        .ok_or_else(|| {
            warn!("No compatible child SA parameters found");
            NotifyMessageType::NO_PROPOSAL_CHOSEN
        })?;
        if !matches!(params.remote_spi(), Spi::U32(_)) {
            warn!("Child SA proposal has unsupported SPI {}", params.remote_spi());
            return Err(NotifyMessageType::NO_PROPOSAL_CHOSEN);
        }
        Ok(params)
    }

    fn install_child_sa(
        &self,
        peer: &PeerConfig,
        mut params: TransformParameters,
        ts_initiator: &[TrafficSelector],
        ts_responder: &[TrafficSelector],
        key_input: &ChildKeyInput,
    ) -> Result<ChildSA, NotifyMessageType> {
        let ts_remote = narrow_traffic_selectors(ts_initiator, &peer.remote_ts);
        let ts_local = narrow_traffic_selectors(ts_responder, &peer.local_ts);
        if ts_remote.is_empty() || ts_local.is_empty() {
            warn!("Failed to narrow traffic selectors");
            return Err(NotifyMessageType::TS_UNACCEPTABLE);
        }
        let local_spi = loop {
            let spi = generate_child_spi();
            if !self
                .child_sas
                .iter()
                .any(|child_sa| child_sa.local_spi() == Spi::U32(spi))
            {
                break spi;
            }
        };
        params.set_local_spi(Spi::U32(local_spi));
        let (ike_params, ike_keys) = self.ike_crypto().map_err(|err| {
            warn!("Failed to create child SA: {}", err);
            NotifyMessageType::TEMPORARY_FAILURE
        })?;
        let keys = self
            .context
            .registry
            .derive_child_keys(ike_params, ike_keys, &params, key_input)
            .map_err(|err| {
                warn!("Failed to derive child SA keys: {}", err);
                NotifyMessageType::NO_PROPOSAL_CHOSEN
            })?;
        Ok(ChildSA {
            params,
            keys,
            ts_local,
            ts_remote,
        })
    }

    fn process_informational_request(
        &mut self,
        payloads: Vec<Payload>,
        response: &mut message::MessageWriter,
    ) -> Result<(), SessionError> {
        let mut delete_ike = false;
        let mut delete_spi = vec![];
        for payload in payloads {
            match payload {
                Payload::Delete(delete) => {
                    let protocol_id = delete.protocol_id();
                    if protocol_id == IPSecProtocolID::IKE {
                        delete_ike = true;
                    } else {
                        delete_spi.extend(delete.iter_spi().map(|spi| (protocol_id, spi)));
                    }
                }
                Payload::Notify(notify) => {
                    if notify.message_type().is_error() {
                        warn!(
                            "Session {} received error notification {}",
                            self.session_id,
                            notify.message_type()
                        );
                    } else {
                        debug!("Ignoring notify {}", notify.message_type());
                    }
                }
                _ => {}
            }
        }

        if self.state != SessionState::Established {
            if delete_ike || !delete_spi.is_empty() {
                warn!(
                    "Received delete request for session {} in {} state",
                    self.session_id, self.state
                );
            }
            return Ok(());
        }

        if delete_ike {
            info!("Peer closed IKE SA {}", self.session_id);
            self.state = SessionState::Closed;
            self.child_sas.clear();
            Ok(response.write_delete_payload(IPSecProtocolID::IKE, &[])?)
        } else if !delete_spi.is_empty() {
            let mut deleted = vec![];
            for (protocol_id, remote_spi) in delete_spi {
                let index = self.child_sas.iter().position(|child_sa| {
                    child_sa.protocol_id() == protocol_id && child_sa.remote_spi() == remote_spi
                });
                match index {
                    Some(index) => {
                        let child_sa = self.child_sas.remove(index);
                        info!("Deleted child SA {} of session {}", child_sa, self.session_id);
                        deleted.push((protocol_id, child_sa.local_spi()));
                    }
                    None => {
                        info!(
                            "Received request to delete non-existing child SA {}",
                            remote_spi
                        );
                    }
                }
            }
            for protocol_id in [IPSecProtocolID::ESP, IPSecProtocolID::AH] {
                let local_spis = deleted
                    .iter()
                    .filter(|(deleted_protocol, _)| *deleted_protocol == protocol_id)
                    .map(|(_, spi)| *spi)
                    .collect::<Vec<_>>();
                if !local_spis.is_empty() {
                    response.write_delete_payload(protocol_id, &local_spis)?;
                }
            }
            Ok(())
        } else {
            // Liveness check, the empty response is enough.
            Ok(())
        }
    }

    fn process_create_child_sa_request(
        &mut self,
        payloads: Vec<Payload>,
        response: &mut message::MessageWriter,
    ) -> Result<(), SessionError> {
        if self.state != SessionState::Established {
            warn!(
                "Received CREATE_CHILD_SA request for session {} in {} state",
                self.session_id, self.state
            );
            return self.write_failed_response(response, NotifyMessageType::INVALID_SYNTAX);
        }
        let peer = self.peer.clone().ok_or("Peer configuration is missing")?;

        let mut rekey_spi = None;
        let mut sa = None;
        let mut nonce_initiator = None;
        let mut kex = None;
        let mut ts_initiator = vec![];
        let mut ts_responder = vec![];
        for payload in payloads {
            match payload {
                Payload::Notify(notify) => {
                    if notify.message_type() == NotifyMessageType::REKEY_SA {
                        match Spi::from_slice(notify.spi()) {
                            Ok(spi) => rekey_spi = Some(spi),
                            Err(err) => {
                                warn!("Invalid REKEY_SA SPI: {}", err);
                                return self.write_failed_response(
                                    response,
                                    NotifyMessageType::INVALID_SYNTAX,
                                );
                            }
                        }
                    }
                }
                Payload::SecurityAssociation(payload) => sa = Some(payload),
                Payload::Nonce(payload) => nonce_initiator = Some(payload.read_value()),
                Payload::KeyExchange(payload) => kex = Some(payload),
                Payload::TrafficSelectorInitiator(ts) => {
                    ts_initiator = ts.into_traffic_selectors()
                }
                Payload::TrafficSelectorResponder(ts) => {
                    ts_responder = ts.into_traffic_selectors()
                }
                _ => {}
            }
        }
        let (sa, nonce_initiator) = match (sa, nonce_initiator) {
            (Some(sa), Some(nonce_initiator)) => (sa, nonce_initiator),
            _ => {
                warn!("CREATE_CHILD_SA request is missing a required payload");
                return self.write_failed_response(response, NotifyMessageType::INVALID_SYNTAX);
            }
        };

        let params = match self.select_child_parameters(&peer, &sa.proposals) {
            Ok(params) => params,
            Err(reason) => return self.write_failed_response(response, reason),
        };
        let replaced = match rekey_spi {
            Some(spi) => match self
                .child_sas
                .iter()
                .position(|child_sa| child_sa.remote_spi() == spi)
            {
                Some(index) => Some(index),
                None => {
                    warn!("Child SA {} to rekey doesn't exist", spi);
                    return self
                        .write_failed_response(response, NotifyMessageType::CHILD_SA_NOT_FOUND);
                }
            },
            None => None,
        };

        let mut local_public_key = None;
        let mut shared_secret = None;
        if let Some(dh_group) = params.dh_group() {
            let kex = match kex {
                Some(kex) if kex.read_group_num() == dh_group => kex,
                _ => {
                    warn!("CREATE_CHILD_SA request has no key exchange for group {}", dh_group);
                    return Ok(response.write_notify_payload(
                        None,
                        &[],
                        NotifyMessageType::INVALID_KE_PAYLOAD,
                        &dh_group.to_be_bytes(),
                    )?);
                }
            };
            let key_exchange = match self.context.registry.key_exchange(dh_group) {
                Ok(key_exchange) => key_exchange,
                Err(err) => {
                    warn!("Failed to init DH: {}", err);
                    return self
                        .write_failed_response(response, NotifyMessageType::NO_PROPOSAL_CHOSEN);
                }
            };
            local_public_key = Some((dh_group, key_exchange.public_key().to_vec()));
            match key_exchange.compute_shared_secret(kex.read_value()) {
                Ok(secret) => shared_secret = Some(secret),
                Err(err) => {
                    warn!("Failed to compute shared secret: {}", err);
                    return Ok(response.write_notify_payload(
                        None,
                        &[],
                        NotifyMessageType::INVALID_KE_PAYLOAD,
                        &dh_group.to_be_bytes(),
                    )?);
                }
            }
        }

        let nonce_responder = self.generate_nonce();
        let key_input = ChildKeyInput {
            shared_secret: shared_secret.as_ref(),
            nonce_initiator,
            nonce_responder: &nonce_responder,
        };
        let child_sa =
            match self.install_child_sa(&peer, params, &ts_initiator, &ts_responder, &key_input) {
                Ok(child_sa) => child_sa,
                Err(reason) => return self.write_failed_response(response, reason),
            };
        write_child_sa(
            response,
            &child_sa,
            Some(&nonce_responder),
            local_public_key
                .as_ref()
                .map(|(dh_group, public_key)| (*dh_group, public_key.as_slice())),
        )?;

        match replaced {
            Some(index) => {
                let old_sa = self.child_sas.remove(index);
                info!(
                    "Rekeyed child SA {} as {} for session {}",
                    old_sa, child_sa, self.session_id
                );
            }
            None => info!("Created child SA {} for session {}", child_sa, self.session_id),
        }
        self.child_sas.push(child_sa);
        Ok(())
    }

    fn start_request(
        &mut self,
        exchange_type: message::ExchangeType,
        command_generator: impl FnOnce(&mut message::MessageWriter) -> Result<(), SessionError>,
    ) -> Result<u32, SessionError> {
        if self.sent_request.is_some() || self.last_sent_request.is_some() {
            return Err("Already processing another request".into());
        }
        let mut request_bytes = vec![0u8; self.context.max_datagram_size];
        let mut request = message::MessageWriter::new(&mut request_bytes)?;
        let (initiator_spi, responder_spi) = self.header_spis();
        request.write_header(
            initiator_spi,
            responder_spi,
            exchange_type,
            self.request_flags(),
            self.local_message_id,
        );
        command_generator(&mut request)?;
        let request_length = request.complete_message();
        request_bytes.truncate(request_length);
        self.last_sent_request = Some(request_bytes);
        Ok(self.local_message_id)
    }

    /// Builds the IKE_SA_INIT request, available from `last_request`.
    pub fn initiate(&mut self) -> Result<u32, SessionError> {
        if self.role != Role::Initiator || self.state != SessionState::Init {
            return Err("Session can't initiate IKE_SA_INIT".into());
        }
        let peer = self.peer.clone().ok_or("Peer configuration is missing")?;
        if peer.ike_proposals.len() > u8::MAX as usize {
            return Err("Too many IKE proposals".into());
        }
        let dh_group = peer
            .ike_proposals
            .iter()
            .flat_map(|policy| policy.transforms.iter())
            .map(|tf| tf.id)
            .find(|id| {
                id.transform_type() == TransformType::DIFFIE_HELLMAN_GROUP
                    && *id != TransformId::DH_NONE
            })
            .ok_or("No Diffie-Hellman group is configured")?
            .id();
        let key_exchange = self.context.registry.key_exchange(dh_group)?;
        let nonce_initiator = self.generate_nonce();
        let proposals = peer
            .ike_proposals
            .iter()
            .enumerate()
            .map(|(i, policy)| policy.to_proposal(i as u8 + 1, &[]))
            .collect::<Vec<_>>();

        let message_id = self.start_request(message::ExchangeType::IKE_SA_INIT, |writer| {
            writer.write_security_association(&proposals)?;
            writer.write_key_exchange_payload(dh_group, key_exchange.public_key())?;
            writer.write_nonce_payload(&nonce_initiator)?;
            Ok(())
        })?;
        let message_initiator = self.last_sent_request.clone().unwrap_or_default();
        self.sent_request = Some(RequestContext::InitSA(InitiatorContext {
            key_exchange,
            nonce_initiator,
            message_initiator,
        }));
        info!(
            "Initiating session {} with {} ({})",
            self.session_id, peer.name, self.remote_addr
        );
        Ok(message_id)
    }

    pub fn start_request_delete_ike(&mut self) -> Result<u32, SessionError> {
        if self.state != SessionState::Established {
            return Err("Can't delete a non-established session".into());
        }
        let message_id = self.start_request(message::ExchangeType::INFORMATIONAL, |writer| {
            Ok(writer.write_delete_payload(IPSecProtocolID::IKE, &[])?)
        })?;
        self.sent_request = Some(RequestContext::DeleteIKE);
        Ok(message_id)
    }

    /// Handles a response from the peer; returns true if a new request is available from `last_request`.
    pub fn process_response(
        &mut self,
        remote_addr: SocketAddr,
        response: &message::Message,
    ) -> Result<bool, SessionError> {
        self.last_update = Instant::now();
        let message_id = response.read_message_id();
        match message_id.cmp(&self.local_message_id) {
            Ordering::Less => {
                debug!(
                    "Ignoring outdated response {} for session {}",
                    message_id, self.session_id
                );
                return Ok(false);
            }
            Ordering::Equal => {}
            Ordering::Greater => {
                return Err("Received unexpected response message ID".into());
            }
        }
        match self.sent_request.as_ref() {
            Some(sent_request) if sent_request.exchange_type() == response.read_exchange_type() => {
            }
            Some(_) => return Err("Response doesn't match the sent request".into()),
            None => {
                debug!(
                    "Ignoring duplicate response {} for session {}",
                    message_id, self.session_id
                );
                return Ok(false);
            }
        }
        let sent_request = self
            .sent_request
            .take()
            .ok_or("Sent request is missing")?;

        // Remove last request to stop retransmissions.
        self.local_message_id = self.local_message_id.wrapping_add(1);
        self.last_sent_request = None;
        self.remote_addr = remote_addr;

        let payloads = match decode_payloads(response) {
            Ok(payloads) => payloads,
            Err(reason) => {
                warn!("Response {} is invalid: {}", message_id, reason);
                self.state = SessionState::Failed;
                return Err(SessionError::InvalidSyntax);
            }
        };
        match sent_request {
            RequestContext::InitSA(ctx) => self.process_sa_init_response(response, payloads, ctx),
            RequestContext::Auth(child_spi) => self.process_auth_response(payloads, child_spi),
            RequestContext::DeleteIKE => {
                info!("Closed IKE SA {}", self.session_id);
                self.state = SessionState::Closed;
                self.child_sas.clear();
                Ok(false)
            }
        }
    }

    fn fail_response(&mut self, err: SessionError) -> Result<bool, SessionError> {
        warn!("Session {} failed: {}", self.session_id, err);
        self.state = SessionState::Failed;
        Err(err)
    }

    fn process_sa_init_response(
        &mut self,
        response: &message::Message,
        payloads: Vec<Payload>,
        ctx: InitiatorContext,
    ) -> Result<bool, SessionError> {
        let mut sa = None;
        let mut kex = None;
        let mut nonce_responder = None;
        let mut error = None;
        for payload in payloads {
            match payload {
                Payload::SecurityAssociation(payload) => sa = Some(payload),
                Payload::KeyExchange(payload) => kex = Some(payload),
                Payload::Nonce(payload) => nonce_responder = Some(payload.read_value()),
                Payload::Notify(notify) if notify.message_type().is_error() => {
                    if notify.message_type() == NotifyMessageType::INVALID_KE_PAYLOAD {
                        warn!(
                            "Responder requested DH group {}",
                            crate::logger::fmt_slice_hex(notify.read_value())
                        );
                    }
                    error = error.or(Some(notify.message_type()));
                }
                _ => {}
            }
        }
        if let Some(error) = error {
            return self.fail_response(SessionError::Rejected(error));
        }
        let (sa, kex, nonce_responder) = match (sa, kex, nonce_responder) {
            (Some(sa), Some(kex), Some(nonce_responder)) => (sa, kex, nonce_responder),
            _ => return self.fail_response(SessionError::InvalidSyntax),
        };
        let remote_spi = response.read_responder_spi();
        if remote_spi == 0 {
            return self.fail_response(SessionError::InvalidSyntax);
        }

        let peer = self.peer.clone().ok_or("Peer configuration is missing")?;
        let registry = self.context.registry.clone();
        let mut params = match crypto::verify_chosen_parameters(
            &sa.proposals,
            &peer.ike_proposals,
            registry.as_ref(),
        ) {
            Some(params) => params,
            None => return self.fail_response(SessionError::NoProposalChosen),
        };
        let dh_group = ctx.key_exchange.group();
        if params.dh_group() != Some(dh_group) || kex.read_group_num() != dh_group {
            warn!(
                "Responder chose DH group {}, but offered key exchange is for group {}",
                kex.read_group_num(),
                dh_group
            );
            return self.fail_response(SessionError::NoProposalChosen);
        }
        let shared_secret = match ctx.key_exchange.compute_shared_secret(kex.read_value()) {
            Ok(shared_secret) => shared_secret,
            Err(err) => return self.fail_response(err.into()),
        };

        self.session_id = SessionID::new(remote_spi, self.session_id.local_spi);
        let keys = match registry.derive_ike_keys(
            &params,
            &IkeKeyInput {
                shared_secret: &shared_secret,
                nonce_initiator: &ctx.nonce_initiator,
                nonce_responder,
                spi_initiator: self.session_id.local_spi,
                spi_responder: remote_spi,
            },
        ) {
            Ok(keys) => keys,
            Err(err) => return self.fail_response(err.into()),
        };
        params.set_local_spi(Spi::U64(self.session_id.local_spi));
        params.set_remote_spi(Spi::U64(remote_spi));
        info!(
            "Negotiated {} for session {} with {}",
            params, self.session_id, peer.name
        );
        self.params = Some(params);
        self.keys = Some(keys);
        self.state = SessionState::Auth;

        let init_ctx = InitSAContext {
            message_initiator: ctx.message_initiator,
            message_responder: response.raw_data().to_vec(),
            nonce_initiator: ctx.nonce_initiator,
            nonce_responder: nonce_responder.to_vec(),
        };
        if let Err(err) = self.start_auth_request(&peer, init_ctx) {
            return self.fail_response(err);
        }
        Ok(true)
    }

    fn start_auth_request(
        &mut self,
        peer: &PeerConfig,
        ctx: InitSAContext,
    ) -> Result<(), SessionError> {
        if peer.child_proposals.len() > u8::MAX as usize {
            return Err("Too many child SA proposals".into());
        }
        let id_initiator = peer.local_id.to_payload();
        let signature = {
            let (params, keys) = self.ike_crypto()?;
            self.context.registry.sign_auth(
                params,
                keys,
                Role::Initiator,
                &peer.shared_key,
                &AuthInput {
                    message: &ctx.message_initiator,
                    peer_nonce: &ctx.nonce_responder,
                    id: &id_initiator,
                },
            )?
        };
        let child_spi = generate_child_spi();
        let child_spi_bytes = child_spi.to_be_bytes();
        let proposals = peer
            .child_proposals
            .iter()
            .enumerate()
            .map(|(i, policy)| policy.to_proposal(i as u8 + 1, &child_spi_bytes))
            .collect::<Vec<_>>();

        self.start_request(message::ExchangeType::IKE_AUTH, |writer| {
            writer.write_identification_payload(true, &id_initiator)?;
            writer.write_authentication_payload(
                message::AuthMethod::SHARED_KEY_MESSAGE_INTEGRITY_CODE,
                &signature,
            )?;
            if !proposals.is_empty() {
                writer.write_security_association(&proposals)?;
                writer.write_traffic_selector_payload(true, &peer.local_ts)?;
                writer.write_traffic_selector_payload(false, &peer.remote_ts)?;
            }
            Ok(())
        })?;
        self.init_ctx = Some(ctx);
        self.sent_request = Some(RequestContext::Auth(child_spi));
        Ok(())
    }

    fn process_auth_response(
        &mut self,
        payloads: Vec<Payload>,
        child_spi: u32,
    ) -> Result<bool, SessionError> {
        let ctx = self.init_ctx.take().ok_or("IKE_SA_INIT context is missing")?;
        let peer = self.peer.clone().ok_or("Peer configuration is missing")?;

        let mut id_responder = None;
        let mut auth = None;
        let mut sa = None;
        let mut ts_initiator = vec![];
        let mut ts_responder = vec![];
        let mut error = None;
        for payload in payloads {
            match payload {
                Payload::IdentificationResponder(id) => id_responder = Some(id.raw_value()),
                Payload::Authentication(payload) => auth = Some(payload),
                Payload::SecurityAssociation(payload) => sa = Some(payload),
                Payload::TrafficSelectorInitiator(ts) => {
                    ts_initiator = ts.into_traffic_selectors()
                }
                Payload::TrafficSelectorResponder(ts) => {
                    ts_responder = ts.into_traffic_selectors()
                }
                Payload::Notify(notify) if notify.message_type().is_error() => {
                    error = error.or(Some(notify.message_type()));
                }
                _ => {}
            }
        }
        if error == Some(NotifyMessageType::AUTHENTICATION_FAILED) {
            return self.fail_response(SessionError::Rejected(
                NotifyMessageType::AUTHENTICATION_FAILED,
            ));
        }
        let (id_raw, auth) = match (id_responder, auth) {
            (Some(id_raw), Some(auth)) => (id_raw, auth),
            _ => {
                let err = match error {
                    Some(error) => SessionError::Rejected(error),
                    None => SessionError::AuthenticationFailed,
                };
                return self.fail_response(err);
            }
        };
        if Identity::from_payload(id_raw).as_ref() != Some(&peer.remote_id) {
            warn!("Responder identity doesn't match {}", peer.remote_id);
            return self.fail_response(SessionError::AuthenticationFailed);
        }
        if auth.read_method() != message::AuthMethod::SHARED_KEY_MESSAGE_INTEGRITY_CODE {
            warn!(
                "Authentication method {} is unsupported",
                auth.read_method()
            );
            return self.fail_response(SessionError::AuthenticationFailed);
        }
        let verified = {
            let (params, keys) = self.ike_crypto()?;
            self.context.registry.verify_auth(
                params,
                keys,
                Role::Responder,
                &peer.shared_key,
                &AuthInput {
                    message: &ctx.message_responder,
                    peer_nonce: &ctx.nonce_initiator,
                    id: id_raw,
                },
                auth.read_value(),
            )
        };
        match verified {
            Ok(true) => {}
            Ok(false) => return self.fail_response(SessionError::AuthenticationFailed),
            Err(err) => return self.fail_response(err.into()),
        }

        self.state = SessionState::Established;
        info!(
            "Established IKE SA {} with {} ({})",
            self.session_id, peer.name, peer.remote_id
        );

        match sa {
            Some(sa) => {
                match self.accept_child_sa(&peer, &sa.proposals, child_spi, ts_initiator, ts_responder, &ctx)
                {
                    Ok(child_sa) => {
                        info!("Created child SA {} for session {}", child_sa, self.session_id);
                        self.child_sas.push(child_sa);
                    }
                    Err(err) => warn!("Failed to create child SA: {}", err),
                }
            }
            None => {
                if let Some(error) = error {
                    warn!("Responder didn't create child SA: {}", error);
                }
            }
        }
        Ok(false)
    }

    fn accept_child_sa(
        &self,
        peer: &PeerConfig,
        proposals: &[Proposal],
        child_spi: u32,
        ts_initiator: Vec<TrafficSelector>,
        ts_responder: Vec<TrafficSelector>,
        ctx: &InitSAContext,
    ) -> Result<ChildSA, SessionError> {
        let registry = self.context.registry.as_ref();
        let mut params = crypto::verify_chosen_parameters(proposals, &peer.child_proposals, registry)
            .ok_or(SessionError::NoProposalChosen)?;
        if !matches!(params.remote_spi(), Spi::U32(_)) {
            return Err("Responder chose an unsupported child SPI".into());
        }
        params.set_local_spi(Spi::U32(child_spi));
        let (ike_params, ike_keys) = self.ike_crypto()?;
        let keys = registry.derive_child_keys(
            ike_params,
            ike_keys,
            &params,
            &ChildKeyInput {
                shared_secret: None,
                nonce_initiator: &ctx.nonce_initiator,
                nonce_responder: &ctx.nonce_responder,
            },
        )?;
        Ok(ChildSA {
            params,
            keys,
            ts_local: ts_initiator,
            ts_remote: ts_responder,
        })
    }
}

/// Decodes all payloads, or returns the notification describing why the message is rejected.
fn decode_payloads<'a>(
    message: &message::Message<'a>,
) -> Result<Vec<Payload<'a>>, NotifyMessageType> {
    let mut payloads = vec![];
    for payload in message.iter_payloads() {
        let payload = match payload {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Received invalid payload: {}", err);
                return Err(NotifyMessageType::INVALID_SYNTAX);
            }
        };
        match payload.decode() {
            Ok(Some(decoded)) => payloads.push(decoded),
            Ok(None) => {}
            Err(message::FormatError::UnsupportedPayloadType(payload_type)) => {
                warn!(
                    "Received critical, unsupported payload: {}",
                    message::PayloadType::from_u8(payload_type)
                );
                return Err(NotifyMessageType::UNSUPPORTED_CRITICAL_PAYLOAD);
            }
            Err(err) => {
                warn!(
                    "Failed to decode {} payload: {}",
                    payload.payload_type(),
                    err
                );
                return Err(NotifyMessageType::INVALID_SYNTAX);
            }
        }
    }
    Ok(payloads)
}

fn write_child_sa(
    response: &mut message::MessageWriter,
    child_sa: &ChildSA,
    nonce: Option<&[u8]>,
    public_key: Option<(u16, &[u8])>,
) -> Result<(), SessionError> {
    let local_spi = child_sa.local_spi().to_vec();
    response.write_security_association(&[child_sa.params.to_proposal(&local_spi)])?;
    if let Some(nonce) = nonce {
        response.write_nonce_payload(nonce)?;
    }
    if let Some((dh_group, public_key)) = public_key {
        response.write_key_exchange_payload(dh_group, public_key)?;
    }
    response.write_traffic_selector_payload(true, &child_sa.ts_remote)?;
    response.write_traffic_selector_payload(false, &child_sa.ts_local)?;
    Ok(())
}

/// Keeps the configured selectors covered by the offer, falling back to offered selectors covered by the configuration.
fn narrow_traffic_selectors(
    offered: &[TrafficSelector],
    configured: &[TrafficSelector],
) -> Vec<TrafficSelector> {
    let mut result = configured
        .iter()
        .filter(|conf| offered.iter().any(|ts| ts.contains(conf)))
        .cloned()
        .collect::<Vec<_>>();
    for ts in offered {
        if configured.iter().any(|conf| conf.contains(ts)) && !result.contains(ts) {
            result.push(ts.clone());
        }
    }
    result
}

pub fn generate_ike_spi() -> u64 {
    loop {
        let spi = rand::thread_rng().gen::<u64>();
        if spi != 0 {
            return spi;
        }
    }
}

fn generate_child_spi() -> u32 {
    // SPI values 0-255 are reserved.
    rand::thread_rng().gen_range(256..=u32::MAX)
}

#[derive(Debug)]
pub enum SessionError {
    Internal(&'static str),
    Format(message::FormatError),
    NotEnoughSpace(message::NotEnoughSpaceError),
    Crypto(crypto::CryptoError),
    NoProposalChosen,
    AuthenticationFailed,
    InvalidSyntax,
    Rejected(NotifyMessageType),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Internal(msg) => f.write_str(msg),
            Self::Format(e) => write!(f, "Format error: {}", e),
            Self::NotEnoughSpace(_) => write!(f, "Not enough space error"),
            Self::Crypto(e) => write!(f, "Crypto error: {}", e),
            Self::NoProposalChosen => write!(f, "No acceptable proposal"),
            Self::AuthenticationFailed => write!(f, "Authentication failed"),
            Self::InvalidSyntax => write!(f, "Invalid syntax"),
            Self::Rejected(notify) => write!(f, "Peer rejected request: {}", notify),
        }
    }
}

impl error::Error for SessionError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Format(err) => Some(err),
            Self::NotEnoughSpace(err) => Some(err),
            Self::Crypto(err) => Some(err),
            Self::Internal(_)
            | Self::NoProposalChosen
            | Self::AuthenticationFailed
            | Self::InvalidSyntax
            | Self::Rejected(_) => None,
        }
    }
}

impl From<&'static str> for SessionError {
    fn from(msg: &'static str) -> SessionError {
        Self::Internal(msg)
    }
}

impl From<message::FormatError> for SessionError {
    fn from(err: message::FormatError) -> SessionError {
        Self::Format(err)
    }
}

impl From<message::NotEnoughSpaceError> for SessionError {
    fn from(err: message::NotEnoughSpaceError) -> SessionError {
        Self::NotEnoughSpace(err)
    }
}

impl From<crypto::CryptoError> for SessionError {
    fn from(err: crypto::CryptoError) -> SessionError {
        Self::Crypto(err)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::super::config::StaticPeers;
    use super::super::crypto::{PolicyTransform, ProposalPolicy};
    use super::super::registry::AwsLcRegistry;
    use super::*;

    fn ike_policy() -> ProposalPolicy {
        ProposalPolicy::new(
            IPSecProtocolID::IKE,
            vec![
                PolicyTransform::with_key_length(TransformId::ENCR_AES_GCM_16, 256),
                PolicyTransform::new(TransformId::PRF_HMAC_SHA2_256),
                PolicyTransform::new(TransformId::DH_256_ECP),
            ],
        )
    }

    fn child_policy(pfs: bool) -> ProposalPolicy {
        let mut transforms = vec![
            PolicyTransform::with_key_length(TransformId::ENCR_AES_GCM_16, 256),
            PolicyTransform::new(TransformId::NO_ESN),
        ];
        if pfs {
            transforms.push(PolicyTransform::new(TransformId::DH_256_ECP));
        }
        ProposalPolicy::new(IPSecProtocolID::ESP, transforms)
    }

    fn ts(start: [u8; 4], end: [u8; 4]) -> TrafficSelector {
        TrafficSelector::from_ip_range(IpAddr::from(start)..=IpAddr::from(end)).unwrap()
    }

    fn peer_config(
        local_id: &str,
        remote_id: &str,
        shared_key: &[u8],
        pfs: bool,
        local_ts: TrafficSelector,
        remote_ts: TrafficSelector,
    ) -> PeerConfig {
        PeerConfig {
            name: remote_id.into(),
            remote_addr: None,
            local_id: Identity::fqdn(local_id),
            remote_id: Identity::fqdn(remote_id),
            shared_key: shared_key.to_vec(),
            ike_proposals: vec![ike_policy()],
            child_proposals: vec![child_policy(pfs)],
            local_ts: vec![local_ts],
            remote_ts: vec![remote_ts],
        }
    }

    fn gateway_config(shared_key: &[u8], pfs: bool) -> PeerConfig {
        peer_config(
            "gateway",
            "client",
            shared_key,
            pfs,
            ts([10, 1, 0, 0], [10, 1, 255, 255]),
            ts([10, 2, 0, 0], [10, 2, 255, 255]),
        )
    }

    fn client_config(shared_key: &[u8], pfs: bool) -> PeerConfig {
        peer_config(
            "client",
            "gateway",
            shared_key,
            pfs,
            ts([10, 2, 0, 0], [10, 2, 255, 255]),
            ts([10, 1, 0, 0], [10, 1, 255, 255]),
        )
    }

    fn context(peers: Vec<PeerConfig>) -> SessionContext {
        SessionContext {
            registry: Arc::new(AwsLcRegistry::new()),
            peers: Arc::new(StaticPeers::new(peers)),
            nonce_length: 32,
            max_datagram_size: 1500,
        }
    }

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 10)), 500)
    }

    fn initiator(peer: PeerConfig) -> IKEv2Session {
        IKEv2Session::new_initiator(
            0x1111_2222_3333_4444,
            addr(),
            Arc::new(peer.clone()),
            context(vec![peer]),
        )
    }

    fn responder(peer: PeerConfig, initiator_spi: u64) -> IKEv2Session {
        IKEv2Session::new_responder(
            SessionID::new(initiator_spi, 0x5555_6666_7777_8888),
            addr(),
            context(vec![peer]),
        )
    }

    fn notifications(data: &[u8]) -> Vec<NotifyMessageType> {
        let message = message::Message::decode(data).unwrap();
        message
            .iter_payloads()
            .filter_map(|pl| match pl.unwrap().dispatch().unwrap() {
                Some(Payload::Notify(notify)) => Some(notify.message_type()),
                _ => None,
            })
            .collect()
    }

    /// Sends the initiator's pending request to the responder and feeds back the response.
    fn exchange(
        initiator: &mut IKEv2Session,
        responder: &mut IKEv2Session,
    ) -> Result<bool, SessionError> {
        let request = initiator.last_request().unwrap().to_vec();
        assert!(responder
            .process_request(addr(), &message::Message::decode(&request).unwrap())
            .unwrap());
        let response = responder.last_response().unwrap().to_vec();
        initiator.process_response(addr(), &message::Message::decode(&response).unwrap())
    }

    fn establish(client: PeerConfig, gateway: PeerConfig) -> (IKEv2Session, IKEv2Session) {
        let mut initiator = initiator(client);
        initiator.initiate().unwrap();
        let mut responder = responder(gateway, 0x1111_2222_3333_4444);
        assert!(exchange(&mut initiator, &mut responder).unwrap());
        assert_eq!(initiator.state(), SessionState::Auth);
        assert_eq!(responder.state(), SessionState::Auth);
        assert!(!exchange(&mut initiator, &mut responder).unwrap());
        (initiator, responder)
    }

    fn request_writer<'a>(
        dest: &'a mut [u8],
        session: &IKEv2Session,
        exchange_type: message::ExchangeType,
        message_id: u32,
    ) -> message::MessageWriter<'a> {
        let mut writer = message::MessageWriter::new(dest).unwrap();
        writer.write_header(
            session.session_id().remote_spi(),
            session.session_id().local_spi(),
            exchange_type,
            message::Flags::INITIATOR,
            message_id,
        );
        writer
    }

    #[test]
    fn negotiates_ike_and_child_sa() {
        let (initiator, responder) = establish(
            client_config(b"secret", false),
            gateway_config(b"secret", false),
        );
        assert!(initiator.is_established());
        assert!(responder.is_established());
        assert_eq!(initiator.params(), responder.params().map(|params| {
            let mut params = params.clone();
            params.set_local_spi(initiator.params().unwrap().local_spi());
            params.set_remote_spi(initiator.params().unwrap().remote_spi());
            params
        }).as_ref());
        assert_eq!(
            initiator.session_id().remote_spi(),
            responder.session_id().local_spi()
        );
        assert_eq!(responder.peer_name(), Some("client"));

        assert_eq!(initiator.child_sas().len(), 1);
        assert_eq!(responder.child_sas().len(), 1);
        let initiator_sa = &initiator.child_sas()[0];
        let responder_sa = &responder.child_sas()[0];
        assert_eq!(initiator_sa.local_spi(), responder_sa.remote_spi());
        assert_eq!(initiator_sa.remote_spi(), responder_sa.local_spi());
        assert_eq!(initiator_sa.keys(), responder_sa.keys());
        assert_eq!(initiator_sa.ts_local(), responder_sa.ts_remote());
        assert_eq!(initiator_sa.ts_remote(), responder_sa.ts_local());
    }

    #[test]
    fn retransmitted_request_gets_cached_response() {
        let mut initiator = initiator(client_config(b"secret", false));
        initiator.initiate().unwrap();
        let request = initiator.last_request().unwrap().to_vec();
        let mut responder = responder(gateway_config(b"secret", false), 0x1111_2222_3333_4444);
        let message = message::Message::decode(&request).unwrap();
        assert!(responder.process_request(addr(), &message).unwrap());
        let response = responder.last_response().unwrap().to_vec();
        assert_eq!(responder.next_request_id(), 1);

        assert!(responder.process_request(addr(), &message).unwrap());
        assert_eq!(responder.last_response().unwrap(), response.as_slice());
        assert_eq!(responder.state(), SessionState::Auth);

        let mut modified = request.clone();
        let last = modified.len() - 1;
        modified[last] ^= 0xff;
        assert!(responder
            .process_request(addr(), &message::Message::decode(&modified).unwrap())
            .is_err());
    }

    #[test]
    fn no_proposal_chosen() {
        let mut gateway = gateway_config(b"secret", false);
        gateway.ike_proposals = vec![ProposalPolicy::new(
            IPSecProtocolID::IKE,
            vec![
                PolicyTransform::with_key_length(TransformId::ENCR_AES_CBC, 256),
                PolicyTransform::new(TransformId::PRF_HMAC_SHA2_256),
                PolicyTransform::new(TransformId::AUTH_HMAC_SHA2_256_128),
                PolicyTransform::new(TransformId::DH_256_ECP),
            ],
        )];
        let mut initiator = initiator(client_config(b"secret", false));
        initiator.initiate().unwrap();
        let mut responder = responder(gateway, 0x1111_2222_3333_4444);
        let result = exchange(&mut initiator, &mut responder);
        assert_eq!(responder.state(), SessionState::Failed);
        assert_eq!(
            notifications(responder.last_response().unwrap()),
            vec![NotifyMessageType::NO_PROPOSAL_CHOSEN]
        );
        assert!(matches!(
            result,
            Err(SessionError::Rejected(NotifyMessageType::NO_PROPOSAL_CHOSEN))
        ));
        assert_eq!(initiator.state(), SessionState::Failed);
    }

    #[test]
    fn wrong_key_exchange_group() {
        let mut client = client_config(b"secret", false);
        client.ike_proposals = vec![ProposalPolicy::new(
            IPSecProtocolID::IKE,
            vec![
                PolicyTransform::with_key_length(TransformId::ENCR_AES_GCM_16, 256),
                PolicyTransform::new(TransformId::PRF_HMAC_SHA2_256),
                PolicyTransform::new(TransformId::DH_CURVE25519),
                PolicyTransform::new(TransformId::DH_256_ECP),
            ],
        )];
        let mut initiator = initiator(client);
        initiator.initiate().unwrap();
        let mut responder = responder(gateway_config(b"secret", false), 0x1111_2222_3333_4444);
        assert!(exchange(&mut initiator, &mut responder).is_err());
        assert_eq!(responder.state(), SessionState::Failed);
        assert_eq!(
            notifications(responder.last_response().unwrap()),
            vec![NotifyMessageType::INVALID_KE_PAYLOAD]
        );
    }

    #[test]
    fn wrong_shared_key() {
        let mut initiator = initiator(client_config(b"wrong", false));
        initiator.initiate().unwrap();
        let mut responder = responder(gateway_config(b"secret", false), 0x1111_2222_3333_4444);
        assert!(exchange(&mut initiator, &mut responder).unwrap());
        let result = exchange(&mut initiator, &mut responder);
        assert_eq!(responder.state(), SessionState::Failed);
        assert!(matches!(
            result,
            Err(SessionError::Rejected(NotifyMessageType::AUTHENTICATION_FAILED))
        ));
        assert_eq!(initiator.state(), SessionState::Failed);
    }

    #[test]
    fn unacceptable_child_sa_keeps_ike_sa() {
        let mut gateway = gateway_config(b"secret", false);
        gateway.child_proposals = vec![ProposalPolicy::new(
            IPSecProtocolID::ESP,
            vec![
                PolicyTransform::with_key_length(TransformId::ENCR_AES_CBC, 128),
                PolicyTransform::new(TransformId::AUTH_HMAC_SHA2_256_128),
                PolicyTransform::new(TransformId::NO_ESN),
            ],
        )];
        let mut initiator = initiator(client_config(b"secret", false));
        initiator.initiate().unwrap();
        let mut responder = responder(gateway, 0x1111_2222_3333_4444);
        assert!(exchange(&mut initiator, &mut responder).unwrap());
        assert!(!exchange(&mut initiator, &mut responder).unwrap());
        assert!(responder.is_established());
        assert!(initiator.is_established());
        assert!(responder.child_sas().is_empty());
        assert!(initiator.child_sas().is_empty());
        assert_eq!(
            notifications(responder.last_response().unwrap()),
            vec![NotifyMessageType::NO_PROPOSAL_CHOSEN]
        );
    }

    #[test]
    fn auth_response_overflow_keeps_auth_state() {
        let mut initiator = initiator(client_config(b"secret", false));
        initiator.initiate().unwrap();
        let mut responder = responder(gateway_config(b"secret", false), 0x1111_2222_3333_4444);
        assert!(exchange(&mut initiator, &mut responder).unwrap());

        // ID and AUTH fit, the child SA doesn't.
        responder.context.max_datagram_size = 100;
        let request = initiator.last_request().unwrap().to_vec();
        let message = message::Message::decode(&request).unwrap();
        assert!(matches!(
            responder.process_request(addr(), &message),
            Err(SessionError::NotEnoughSpace(_))
        ));
        assert_eq!(responder.state(), SessionState::Auth);
        assert!(responder.child_sas().is_empty());
        assert_eq!(responder.next_request_id(), 1);

        responder.context.max_datagram_size = 1500;
        assert!(responder.process_request(addr(), &message).unwrap());
        assert!(responder.is_established());
        assert_eq!(responder.child_sas().len(), 1);
        let response = responder.last_response().unwrap().to_vec();
        assert!(!initiator
            .process_response(addr(), &message::Message::decode(&response).unwrap())
            .unwrap());
        assert!(initiator.is_established());
        assert_eq!(initiator.child_sas()[0].keys(), responder.child_sas()[0].keys());
    }

    #[test]
    fn invalid_syntax_in_init_fails_session() {
        let mut responder = responder(gateway_config(b"secret", false), 0x1111_2222_3333_4444);
        let mut data = [0u8; 64];
        let mut writer = request_writer(&mut data, &responder, message::ExchangeType::IKE_SA_INIT, 0);
        // Nonce payloads shorter than 16 bytes are rejected by the decoder.
        writer.write_nonce_payload(&[1u8; 8]).unwrap();
        let length = writer.complete_message();
        let request = message::Message::decode(&data[..length]).unwrap();
        assert!(responder.process_request(addr(), &request).unwrap());
        assert_eq!(responder.state(), SessionState::Failed);
        assert_eq!(
            notifications(responder.last_response().unwrap()),
            vec![NotifyMessageType::INVALID_SYNTAX]
        );
    }

    #[test]
    fn invalid_syntax_keeps_established_session() {
        let (_, mut responder) = establish(
            client_config(b"secret", false),
            gateway_config(b"secret", false),
        );
        let mut data = [0u8; 64];
        let mut writer =
            request_writer(&mut data, &responder, message::ExchangeType::INFORMATIONAL, 2);
        writer.write_nonce_payload(&[1u8; 8]).unwrap();
        let length = writer.complete_message();
        let request = message::Message::decode(&data[..length]).unwrap();
        assert!(responder.process_request(addr(), &request).unwrap());
        assert!(responder.is_established());
        assert_eq!(responder.next_request_id(), 3);
        assert_eq!(
            notifications(responder.last_response().unwrap()),
            vec![NotifyMessageType::INVALID_SYNTAX]
        );
    }

    #[test]
    fn unsupported_critical_payload() {
        let (_, mut responder) = establish(
            client_config(b"secret", false),
            gateway_config(b"secret", false),
        );
        let mut data = [0u8; 64];
        let mut writer =
            request_writer(&mut data, &responder, message::ExchangeType::INFORMATIONAL, 2);
        writer
            .next_payload_slice(message::PayloadType::from_u8(200), 4)
            .unwrap();
        let length = writer.complete_message();
        // Set the critical bit of the first payload.
        data[message::HEADER_LENGTH + 1] = 0x80;
        let request = message::Message::decode(&data[..length]).unwrap();
        assert!(responder.process_request(addr(), &request).unwrap());
        assert!(responder.is_established());
        assert_eq!(
            notifications(responder.last_response().unwrap()),
            vec![NotifyMessageType::UNSUPPORTED_CRITICAL_PAYLOAD]
        );
    }

    #[test]
    fn informational_exchanges() {
        let (initiator, mut responder) = establish(
            client_config(b"secret", false),
            gateway_config(b"secret", false),
        );

        // Liveness check.
        let mut data = [0u8; 64];
        let mut writer =
            request_writer(&mut data, &responder, message::ExchangeType::INFORMATIONAL, 2);
        let length = writer.complete_message();
        assert!(responder
            .process_request(addr(), &message::Message::decode(&data[..length]).unwrap())
            .unwrap());
        let response = message::Message::decode(responder.last_response().unwrap()).unwrap();
        assert_eq!(response.iter_payloads().count(), 0);
        assert!(response.is_response());

        // Delete the child SA by its initiator-side SPI.
        let child_spi = initiator.child_sas()[0].local_spi();
        let mut data = [0u8; 64];
        let mut writer =
            request_writer(&mut data, &responder, message::ExchangeType::INFORMATIONAL, 3);
        writer
            .write_delete_payload(IPSecProtocolID::ESP, &[child_spi])
            .unwrap();
        let length = writer.complete_message();
        assert!(responder
            .process_request(addr(), &message::Message::decode(&data[..length]).unwrap())
            .unwrap());
        assert!(responder.child_sas().is_empty());
        let response = message::Message::decode(responder.last_response().unwrap()).unwrap();
        let deleted = response
            .iter_payloads()
            .filter_map(|pl| match pl.unwrap().dispatch().unwrap() {
                Some(Payload::Delete(delete)) => Some(delete.iter_spi().collect::<Vec<_>>()),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(deleted, vec![vec![initiator.child_sas()[0].remote_spi()]]);

        // Delete the IKE SA.
        let mut data = [0u8; 64];
        let mut writer =
            request_writer(&mut data, &responder, message::ExchangeType::INFORMATIONAL, 4);
        writer
            .write_delete_payload(IPSecProtocolID::IKE, &[])
            .unwrap();
        let length = writer.complete_message();
        assert!(responder
            .process_request(addr(), &message::Message::decode(&data[..length]).unwrap())
            .unwrap());
        assert_eq!(responder.state(), SessionState::Closed);
        assert!(responder.is_terminated());
    }

    #[test]
    fn initiator_deletes_ike_sa() {
        let (mut initiator, mut responder) = establish(
            client_config(b"secret", false),
            gateway_config(b"secret", false),
        );
        assert_eq!(initiator.start_request_delete_ike().unwrap(), 2);
        assert!(!exchange(&mut initiator, &mut responder).unwrap());
        assert_eq!(initiator.state(), SessionState::Closed);
        assert_eq!(responder.state(), SessionState::Closed);
        assert!(initiator.last_request().is_none());
    }

    #[test]
    fn rekeys_child_sa_with_pfs() {
        let (initiator, mut responder) = establish(
            client_config(b"secret", true),
            gateway_config(b"secret", true),
        );
        let old_sa = &initiator.child_sas()[0];
        let registry = AwsLcRegistry::new();
        let key_exchange = registry.key_exchange(19).unwrap();
        let new_spi = [0x12, 0x34, 0x56, 0x78];
        let proposal = child_policy(true).to_proposal(1, &new_spi);

        let mut data = [0u8; 512];
        let mut writer =
            request_writer(&mut data, &responder, message::ExchangeType::CREATE_CHILD_SA, 2);
        writer
            .write_notify_payload(
                Some(IPSecProtocolID::ESP),
                &old_sa.local_spi().to_vec(),
                NotifyMessageType::REKEY_SA,
                &[],
            )
            .unwrap();
        writer.write_security_association(&[proposal]).unwrap();
        writer.write_nonce_payload(&[7u8; 32]).unwrap();
        writer
            .write_key_exchange_payload(19, key_exchange.public_key())
            .unwrap();
        writer
            .write_traffic_selector_payload(true, old_sa.ts_local())
            .unwrap();
        writer
            .write_traffic_selector_payload(false, old_sa.ts_remote())
            .unwrap();
        let length = writer.complete_message();
        assert!(responder
            .process_request(addr(), &message::Message::decode(&data[..length]).unwrap())
            .unwrap());

        assert!(notifications(responder.last_response().unwrap()).is_empty());
        assert_eq!(responder.child_sas().len(), 1);
        assert_eq!(
            responder.child_sas()[0].remote_spi(),
            Spi::U32(0x12345678)
        );
        let response = message::Message::decode(responder.last_response().unwrap()).unwrap();
        let has_kex = response.iter_payloads().any(|pl| {
            matches!(
                pl.unwrap().dispatch().unwrap(),
                Some(Payload::KeyExchange(_))
            )
        });
        assert!(has_kex);
    }

    #[test]
    fn rekey_of_unknown_child_sa() {
        let (_, mut responder) = establish(
            client_config(b"secret", false),
            gateway_config(b"secret", false),
        );
        let proposal = child_policy(false).to_proposal(1, &[0, 0, 1, 0]);
        let mut data = [0u8; 512];
        let mut writer =
            request_writer(&mut data, &responder, message::ExchangeType::CREATE_CHILD_SA, 2);
        writer
            .write_notify_payload(
                Some(IPSecProtocolID::ESP),
                &[0xde, 0xad, 0xbe, 0xef],
                NotifyMessageType::REKEY_SA,
                &[],
            )
            .unwrap();
        writer.write_security_association(&[proposal]).unwrap();
        writer.write_nonce_payload(&[7u8; 32]).unwrap();
        let length = writer.complete_message();
        assert!(responder
            .process_request(addr(), &message::Message::decode(&data[..length]).unwrap())
            .unwrap());
        assert_eq!(
            notifications(responder.last_response().unwrap()),
            vec![NotifyMessageType::CHILD_SA_NOT_FOUND]
        );
        assert!(responder.is_established());
        assert_eq!(responder.child_sas().len(), 1);
    }

    #[test]
    fn narrows_traffic_selectors() {
        let configured = vec![ts([10, 1, 0, 0], [10, 1, 255, 255])];
        let wide = vec![ts([0, 0, 0, 0], [255, 255, 255, 255])];
        assert_eq!(narrow_traffic_selectors(&wide, &configured), configured);
        let narrow = vec![ts([10, 1, 2, 0], [10, 1, 2, 255])];
        assert_eq!(narrow_traffic_selectors(&narrow, &configured), narrow);
        let other = vec![ts([10, 3, 0, 0], [10, 3, 255, 255])];
        assert!(narrow_traffic_selectors(&other, &configured).is_empty());
    }

    #[test]
    fn child_spi_skips_reserved_range() {
        for _ in 0..100 {
            assert!(generate_child_spi() >= 256);
        }
        assert_ne!(generate_ike_spi(), 0);
    }
}
