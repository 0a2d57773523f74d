use log::{debug, info, warn};
use std::{
    collections::{hash_map, HashMap},
    error, fmt,
    future::{self, Future},
    io,
    net::SocketAddr,
    pin::pin,
    sync::{Arc, Mutex, RwLock},
    task::Poll,
    time::{Duration, Instant},
};
use tokio::{
    sync::{self as async_sync, watch},
    task::JoinSet,
    time,
};

pub mod config;
pub mod crypto;
pub mod message;
pub mod octets;
pub mod proposal;
pub mod registry;
pub mod session;

use config::{PeerConfig, PeerConfigProvider};
use crypto::CryptoRegistry;
use session::{IKEv2Session, SessionContext, SessionID, SessionState};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(15);
// Requests further ahead of the expected message ID are dropped instead of queued.
const MAX_REORDER_WINDOW: u32 = 16;

pub struct Config {
    pub nonce_length: usize,
    pub half_open_expiration: Duration,
    pub reorder_timeout: Duration,
    pub max_datagram_size: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            nonce_length: 32,
            half_open_expiration: Duration::from_secs(15),
            reorder_timeout: Duration::from_secs(1),
            max_datagram_size: 1500,
        }
    }
}

struct AssociationSlot {
    session: async_sync::Mutex<IKEv2Session>,
    next_message_id: watch::Sender<u32>,
}

impl AssociationSlot {
    fn new(session: IKEv2Session) -> Arc<AssociationSlot> {
        let (next_message_id, _) = watch::channel(session.next_request_id());
        Arc::new(AssociationSlot {
            session: async_sync::Mutex::new(session),
            next_message_id,
        })
    }
}

/// Registry of IKE associations; every association is processed under its own lock.
pub struct Sessions {
    context: SessionContext,
    half_open_expiration: Duration,
    reorder_timeout: Duration,
    sessions: RwLock<HashMap<SessionID, Arc<AssociationSlot>>>,
    half_open: Mutex<HashMap<(SocketAddr, u64), (SessionID, Instant)>>,
}

impl Sessions {
    pub fn new(
        config: Config,
        registry: Arc<dyn CryptoRegistry>,
        peers: Arc<dyn PeerConfigProvider>,
    ) -> Sessions {
        Sessions {
            context: SessionContext {
                registry,
                peers,
                nonce_length: config.nonce_length,
                max_datagram_size: config.max_datagram_size,
            },
            half_open_expiration: config.half_open_expiration,
            reorder_timeout: config.reorder_timeout,
            sessions: RwLock::new(HashMap::new()),
            half_open: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().map(|sessions| sessions.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn session_ids(&self) -> Vec<SessionID> {
        self.sessions
            .read()
            .map(|sessions| sessions.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Runs f with exclusive access to the association.
    pub async fn inspect<R>(
        &self,
        session_id: &SessionID,
        f: impl FnOnce(&IKEv2Session) -> R,
    ) -> Option<R> {
        let slot = self.get_slot(session_id)?;
        let session = slot.session.lock().await;
        Some(f(&session))
    }

    pub async fn session_state(&self, session_id: &SessionID) -> Option<SessionState> {
        self.inspect(session_id, |session| session.state()).await
    }

    fn get_slot(&self, session_id: &SessionID) -> Option<Arc<AssociationSlot>> {
        self.sessions
            .read()
            .ok()
            .and_then(|sessions| sessions.get(session_id).cloned())
    }

    fn insert_slot(
        &self,
        session_id: SessionID,
        slot: Arc<AssociationSlot>,
    ) -> Result<(), IKEv2Error> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| "Sessions lock is poisoned")?;
        sessions.insert(session_id, slot);
        Ok(())
    }

    fn remove_slot(&self, session_id: &SessionID) {
        if let Ok(mut sessions) = self.sessions.write() {
            if sessions.remove(session_id).is_some() {
                info!("Removed session {}", session_id);
            }
        }
    }

    fn reserve_local_spi(&self) -> Result<u64, IKEv2Error> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| "Sessions lock is poisoned")?;
        loop {
            let spi = session::generate_ike_spi();
            if !sessions.keys().any(|id| id.local_spi() == spi) {
                return Ok(spi);
            }
        }
    }

    /// Processes one datagram and returns the reply to send back, if any.
    pub async fn process_datagram(
        &self,
        remote_addr: SocketAddr,
        data: &[u8],
    ) -> Result<Option<Vec<u8>>, IKEv2Error> {
        let message = message::Message::decode(data)?;
        debug!("Received packet from {}\n{:?}", remote_addr, message);
        if message.is_response() {
            self.process_response(remote_addr, &message).await
        } else if message.read_exchange_type() == message::ExchangeType::IKE_SA_INIT
            && message.read_responder_spi() == 0
        {
            self.process_init_request(remote_addr, &message).await
        } else {
            self.process_request(remote_addr, &message).await
        }
    }

    async fn process_init_request(
        &self,
        remote_addr: SocketAddr,
        message: &message::Message<'_>,
    ) -> Result<Option<Vec<u8>>, IKEv2Error> {
        let half_open_id = (remote_addr, message.read_initiator_spi());
        if let Some(slot) = self.get_half_open(&half_open_id)? {
            return Self::retransmit_init_response(&slot, remote_addr, message).await;
        }

        // Key exchange runs without holding the half-open lock.
        let session_id = SessionID::new(half_open_id.1, self.reserve_local_spi()?);
        let mut session =
            IKEv2Session::new_responder(session_id, remote_addr, self.context.clone());
        session.process_request(remote_addr, message)?;
        let response = session.last_response().map(|response| response.to_vec());
        if session.state() != SessionState::Auth {
            debug!(
                "Session {} with {} is {}, not registering",
                session_id,
                remote_addr,
                session.state()
            );
            return Ok(response);
        }

        let existing_slot = {
            let mut half_open = self
                .half_open
                .lock()
                .map_err(|_| "Half-open sessions lock is poisoned")?;
            match half_open.entry(half_open_id) {
                hash_map::Entry::Occupied(entry) => {
                    let (existing_id, _) = entry.get();
                    self.get_slot(existing_id)
                }
                hash_map::Entry::Vacant(entry) => {
                    entry.insert((session_id, Instant::now()));
                    self.insert_slot(session_id, AssociationSlot::new(session))?;
                    info!("Started session {} with {}", session_id, remote_addr);
                    return Ok(response);
                }
            }
        };
        match existing_slot {
            Some(slot) => {
                debug!(
                    "Session for {} was started by a concurrent request, discarding {}",
                    remote_addr, session_id
                );
                Self::retransmit_init_response(&slot, remote_addr, message).await
            }
            None => Err("Half-open session not found".into()),
        }
    }

    fn get_half_open(
        &self,
        half_open_id: &(SocketAddr, u64),
    ) -> Result<Option<Arc<AssociationSlot>>, IKEv2Error> {
        let session_id = self
            .half_open
            .lock()
            .map_err(|_| "Half-open sessions lock is poisoned")?
            .get(half_open_id)
            .map(|(session_id, _)| *session_id);
        Ok(session_id.and_then(|session_id| self.get_slot(&session_id)))
    }

    async fn retransmit_init_response(
        slot: &AssociationSlot,
        remote_addr: SocketAddr,
        message: &message::Message<'_>,
    ) -> Result<Option<Vec<u8>>, IKEv2Error> {
        let mut session = slot.session.lock().await;
        let send_response = session.process_request(remote_addr, message)?;
        Ok(send_response
            .then(|| session.last_response().map(|response| response.to_vec()))
            .flatten())
    }

    /// Waits until all requests preceding message_id were processed.
    async fn wait_for_turn(&self, slot: &AssociationSlot, message_id: u32) -> bool {
        let mut next_message_id = slot.next_message_id.subscribe();
        let expected = *next_message_id.borrow_and_update();
        if message_id <= expected {
            return true;
        }
        if message_id - expected > MAX_REORDER_WINDOW {
            debug!(
                "Request {} is too far ahead of expected request {}",
                message_id, expected
            );
            return false;
        }
        let ready = next_message_id.wait_for(|next| *next >= message_id);
        let turn = match time::timeout(self.reorder_timeout, ready).await {
            Ok(Ok(_)) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                debug!(
                    "Timed out waiting for requests preceding {}, dropping",
                    message_id
                );
                false
            }
        };
        turn
    }

    async fn process_request(
        &self,
        remote_addr: SocketAddr,
        message: &message::Message<'_>,
    ) -> Result<Option<Vec<u8>>, IKEv2Error> {
        let session_id = SessionID::from_message(message);
        let slot = match self.get_slot(&session_id) {
            Some(slot) => slot,
            None => {
                warn!("Session {} not found", session_id);
                return Err("Session not found".into());
            }
        };
        if !self.wait_for_turn(&slot, message.read_message_id()).await {
            return Ok(None);
        }

        let mut session = slot.session.lock().await;
        let result = session.process_request(remote_addr, message);
        slot.next_message_id.send_replace(session.next_request_id());
        let response = match result {
            Ok(true) => session.last_response().map(|response| response.to_vec()),
            Ok(false) => None,
            Err(err) => return Err(err.into()),
        };
        let terminated = session.is_terminated();
        drop(session);
        if terminated {
            self.remove_slot(&session_id);
        }
        Ok(response)
    }

    async fn process_response(
        &self,
        remote_addr: SocketAddr,
        message: &message::Message<'_>,
    ) -> Result<Option<Vec<u8>>, IKEv2Error> {
        let session_id = SessionID::from_message(message);
        // Until the IKE_SA_INIT response arrives, the initiator doesn't know the remote SPI.
        let (registered_id, slot) = match self.get_slot(&session_id) {
            Some(slot) => (session_id, slot),
            None => {
                let pending_id = SessionID::new(0, session_id.local_spi());
                match self.get_slot(&pending_id) {
                    Some(slot) => (pending_id, slot),
                    None => {
                        warn!("Session {} not found", session_id);
                        return Err("Session not found".into());
                    }
                }
            }
        };

        let mut session = slot.session.lock().await;
        let result = session.process_response(remote_addr, message);
        let request = match result {
            Ok(true) => session.last_request().map(|request| request.to_vec()),
            _ => None,
        };
        let current_id = session.session_id();
        let terminated = session.is_terminated();
        drop(session);

        if terminated {
            self.remove_slot(&registered_id);
        } else if current_id != registered_id {
            self.remove_slot(&registered_id);
            self.insert_slot(current_id, slot)?;
        }
        result?;
        Ok(request)
    }

    /// Creates an initiator association and returns the IKE_SA_INIT request.
    pub fn initiate(
        &self,
        remote_addr: SocketAddr,
        peer: Arc<PeerConfig>,
    ) -> Result<(SessionID, Vec<u8>), IKEv2Error> {
        let local_spi = self.reserve_local_spi()?;
        let mut session =
            IKEv2Session::new_initiator(local_spi, remote_addr, peer, self.context.clone());
        session.initiate()?;
        let request = session
            .last_request()
            .ok_or("Initiator didn't create a request")?
            .to_vec();
        let session_id = session.session_id();
        self.insert_slot(session_id, AssociationSlot::new(session))?;
        Ok((session_id, request))
    }

    /// Returns the request which closes an established association.
    pub async fn start_delete(&self, session_id: &SessionID) -> Result<Vec<u8>, IKEv2Error> {
        let slot = self.get_slot(session_id).ok_or("Session not found")?;
        let mut session = slot.session.lock().await;
        session.start_request_delete_ike()?;
        Ok(session
            .last_request()
            .ok_or("Session didn't create a request")?
            .to_vec())
    }

    /// Removes expired half-open associations; busy associations are checked on the next run.
    pub fn cleanup(&self, now: Instant) {
        if let Ok(mut half_open) = self.half_open.lock() {
            half_open.retain(|_, (_, created)| *created + self.half_open_expiration > now);
        }
        let expired = match self.sessions.read() {
            Ok(sessions) => sessions
                .iter()
                .filter(|(_, slot)| match slot.session.try_lock() {
                    Ok(session) => {
                        session.is_terminated()
                            || session.is_half_open_expired(now, self.half_open_expiration)
                    }
                    Err(_) => false,
                })
                .map(|(session_id, _)| *session_id)
                .collect::<Vec<_>>(),
            Err(_) => return,
        };
        for session_id in expired {
            debug!("Session {} expired", session_id);
            self.remove_slot(&session_id);
        }
    }
}

pub struct Datagram {
    pub remote_addr: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Source and sink of IKE datagrams.
pub trait Transport: Send + Sync + 'static {
    /// Returns None once the transport is closed; must be cancel-safe.
    fn receive(&self) -> impl Future<Output = Result<Option<Datagram>, io::Error>> + Send;

    fn send(&self, datagram: Datagram) -> impl Future<Output = Result<(), io::Error>> + Send;
}

pub struct Server<T: Transport> {
    transport: Arc<T>,
    sessions: Arc<Sessions>,
    join_set: JoinSet<()>,
}

impl<T: Transport> Server<T> {
    pub fn new(transport: T, sessions: Sessions) -> Server<T> {
        Server {
            transport: Arc::new(transport),
            sessions: Arc::new(sessions),
            join_set: JoinSet::new(),
        }
    }

    pub fn sessions(&self) -> &Arc<Sessions> {
        &self.sessions
    }

    pub async fn initiate(
        &self,
        remote_addr: SocketAddr,
        peer: Arc<PeerConfig>,
    ) -> Result<SessionID, IKEv2Error> {
        let (session_id, request) = self.sessions.initiate(remote_addr, peer)?;
        self.transport
            .send(Datagram {
                remote_addr,
                bytes: request,
            })
            .await?;
        Ok(session_id)
    }

    async fn process_datagram(sessions: Arc<Sessions>, transport: Arc<T>, datagram: Datagram) {
        let remote_addr = datagram.remote_addr;
        match sessions
            .process_datagram(remote_addr, &datagram.bytes)
            .await
        {
            Ok(Some(response)) => {
                let response = Datagram {
                    remote_addr,
                    bytes: response,
                };
                if let Err(err) = transport.send(response).await {
                    warn!("Failed to send response to {}: {}", remote_addr, err);
                }
            }
            Ok(None) => {}
            Err(err) => warn!("Failed to process message from {}: {}", remote_addr, err),
        }
    }

    /// Receives datagrams until the transport is closed.
    pub async fn run(&mut self) -> Result<(), IKEv2Error> {
        let mut cleanup_interval = time::interval(CLEANUP_INTERVAL);
        cleanup_interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        loop {
            // Wait until something is ready.
            let (datagram, cleanup) = {
                let mut receive = pin!(self.transport.receive());
                let mut tick = pin!(cleanup_interval.tick());
                future::poll_fn(move |cx| {
                    let datagram = match receive.as_mut().poll(cx) {
                        Poll::Ready(datagram) => Some(datagram),
                        Poll::Pending => None,
                    };
                    let cleanup = tick.as_mut().poll(cx).is_ready();
                    if datagram.is_some() || cleanup {
                        Poll::Ready((datagram, cleanup))
                    } else {
                        Poll::Pending
                    }
                })
                .await
            };
            if cleanup {
                self.sessions.cleanup(Instant::now());
            }
            match datagram {
                Some(Ok(Some(datagram))) => {
                    let sessions = self.sessions.clone();
                    let transport = self.transport.clone();
                    self.join_set
                        .spawn(Self::process_datagram(sessions, transport, datagram));
                }
                Some(Ok(None)) => {
                    debug!("Transport closed");
                    break;
                }
                Some(Err(err)) => {
                    warn!("Failed to receive datagram: {}", err);
                    self.shutdown().await?;
                    return Err(err.into());
                }
                None => {}
            }
            while let Some(res) = self.join_set.try_join_next() {
                res?;
            }
        }
        self.shutdown().await
    }

    async fn shutdown(&mut self) -> Result<(), IKEv2Error> {
        while let Some(res) = self.join_set.join_next().await {
            res?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum IKEv2Error {
    Internal(&'static str),
    Format(message::FormatError),
    NotEnoughSpace(message::NotEnoughSpaceError),
    Session(session::SessionError),
    Join(tokio::task::JoinError),
    Io(io::Error),
}

impl fmt::Display for IKEv2Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Internal(msg) => f.write_str(msg),
            Self::Format(ref e) => write!(f, "Format error: {}", e),
            Self::NotEnoughSpace(_) => write!(f, "Not enough space error"),
            Self::Session(ref e) => write!(f, "IKEv2 session error: {}", e),
            Self::Join(ref e) => write!(f, "Tokio join error: {}", e),
            Self::Io(ref e) => write!(f, "IO error: {}", e),
        }
    }
}

impl error::Error for IKEv2Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Self::Internal(_msg) => None,
            Self::Format(ref err) => Some(err),
            Self::NotEnoughSpace(ref err) => Some(err),
            Self::Session(ref err) => Some(err),
            Self::Join(ref err) => Some(err),
            Self::Io(ref err) => Some(err),
        }
    }
}

impl From<&'static str> for IKEv2Error {
    fn from(msg: &'static str) -> IKEv2Error {
        Self::Internal(msg)
    }
}

impl From<message::FormatError> for IKEv2Error {
    fn from(err: message::FormatError) -> IKEv2Error {
        Self::Format(err)
    }
}

impl From<message::NotEnoughSpaceError> for IKEv2Error {
    fn from(err: message::NotEnoughSpaceError) -> IKEv2Error {
        Self::NotEnoughSpace(err)
    }
}

impl From<session::SessionError> for IKEv2Error {
    fn from(err: session::SessionError) -> IKEv2Error {
        Self::Session(err)
    }
}

impl From<tokio::task::JoinError> for IKEv2Error {
    fn from(err: tokio::task::JoinError) -> IKEv2Error {
        Self::Join(err)
    }
}

impl From<io::Error> for IKEv2Error {
    fn from(err: io::Error) -> IKEv2Error {
        Self::Io(err)
    }
}
