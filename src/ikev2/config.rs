use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use log::debug;

use super::crypto::ProposalPolicy;
use super::message::{IdentificationType, TrafficSelector};

/// Identity, as carried in an Identification payload.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity {
    id_type: IdentificationType,
    value: Vec<u8>,
}

impl Identity {
    pub fn new(id_type: IdentificationType, value: &[u8]) -> Identity {
        Identity {
            id_type,
            value: value.to_vec(),
        }
    }

    pub fn fqdn(name: &str) -> Identity {
        Identity::new(IdentificationType::ID_FQDN, name.as_bytes())
    }

    pub fn from_ip(addr: IpAddr) -> Identity {
        match addr {
            IpAddr::V4(addr) => Identity::new(IdentificationType::ID_IPV4_ADDR, &addr.octets()),
            IpAddr::V6(addr) => Identity::new(IdentificationType::ID_IPV6_ADDR, &addr.octets()),
        }
    }

    /// Parses the body of an Identification payload (type, reserved octets, data).
    pub fn from_payload(raw_value: &[u8]) -> Option<Identity> {
        if raw_value.len() < 4 {
            debug!("Identification payload is too short");
            return None;
        }
        Some(Identity::new(
            IdentificationType::from_u8(raw_value[0]),
            &raw_value[4..],
        ))
    }

    pub fn id_type(&self) -> IdentificationType {
        self.id_type
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Identification payload body, which is also what AUTH signs.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(4 + self.value.len());
        result.push(self.id_type.type_id());
        result.extend_from_slice(&[0u8; 3]);
        result.extend_from_slice(&self.value);
        result
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id_type {
            IdentificationType::ID_FQDN | IdentificationType::ID_RFC822_ADDR => {
                write!(f, "{}", String::from_utf8_lossy(&self.value))
            }
            IdentificationType::ID_IPV4_ADDR if self.value.len() == 4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&self.value);
                write!(f, "{}", IpAddr::from(octets))
            }
            IdentificationType::ID_IPV6_ADDR if self.value.len() == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.value);
                write!(f, "{}", IpAddr::from(octets))
            }
            _ => write!(
                f,
                "{} {}",
                self.id_type,
                crate::logger::fmt_slice_hex(&self.value)
            ),
        }
    }
}

/// Policy for one remote peer.
#[derive(Clone, Debug)]
pub struct PeerConfig {
    pub name: String,
    /// Only accept associations from this address; None accepts any address.
    pub remote_addr: Option<IpAddr>,
    pub local_id: Identity,
    pub remote_id: Identity,
    pub shared_key: Vec<u8>,
    pub ike_proposals: Vec<ProposalPolicy>,
    pub child_proposals: Vec<ProposalPolicy>,
    pub local_ts: Vec<TrafficSelector>,
    pub remote_ts: Vec<TrafficSelector>,
}

impl PeerConfig {
    fn matches(&self, lookup: &PeerLookup) -> bool {
        match lookup {
            PeerLookup::Address(addr) => self
                .remote_addr
                .map(|remote_addr| remote_addr == addr.ip())
                .unwrap_or(true),
            PeerLookup::Identity(id) => self.remote_id == **id,
        }
    }
}

pub enum PeerLookup<'a> {
    /// Used before identities are exchanged.
    Address(SocketAddr),
    Identity(&'a Identity),
}

impl fmt::Display for PeerLookup<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerLookup::Address(addr) => write!(f, "address {}", addr),
            PeerLookup::Identity(id) => write!(f, "identity {}", id),
        }
    }
}

pub trait PeerConfigProvider: Send + Sync {
    fn peer_config(&self, lookup: &PeerLookup) -> Option<Arc<PeerConfig>>;
}

/// In-memory list of peers; the first matching entry wins.
pub struct StaticPeers {
    peers: Vec<Arc<PeerConfig>>,
}

impl StaticPeers {
    pub fn new(peers: Vec<PeerConfig>) -> StaticPeers {
        StaticPeers {
            peers: peers.into_iter().map(Arc::new).collect(),
        }
    }
}

impl PeerConfigProvider for StaticPeers {
    fn peer_config(&self, lookup: &PeerLookup) -> Option<Arc<PeerConfig>> {
        let peer = self.peers.iter().find(|peer| peer.matches(lookup)).cloned();
        if peer.is_none() {
            debug!("No peer configured for {}", lookup);
        }
        peer
    }
}
