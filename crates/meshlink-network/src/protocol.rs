//! Wire Protocol
//!
//! Message types exchanged between agents, the signal server and the relay.
//! Everything on the wire is bincode-encoded.

use std::net::SocketAddr;

use meshlink_crypto::{HandshakeProof, Nonce, PublicKey};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::NetworkResult;

/// Kind of an address candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CandidateKind {
    /// Address bound on a local interface
    Host,
    /// Public address as observed by the signal server
    ServerReflexive,
}

/// An address a peer can possibly be reached at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub addr: SocketAddr,
    pub kind: CandidateKind,
}

impl Candidate {
    pub fn host(addr: SocketAddr) -> Self {
        Self { addr, kind: CandidateKind::Host }
    }

    pub fn server_reflexive(addr: SocketAddr) -> Self {
        Self { addr, kind: CandidateKind::ServerReflexive }
    }
}

/// Sort candidates into probe order: host first, then reflexive.
/// Relative order within a kind is kept and duplicates are dropped.
pub fn preference_order(candidates: &[Candidate]) -> Vec<Candidate> {
    let mut ordered: Vec<Candidate> = Vec::with_capacity(candidates.len());
    let mut sorted = candidates.to_vec();
    sorted.sort_by_key(|c| c.kind);
    for candidate in sorted {
        if !ordered.iter().any(|c| c.addr == candidate.addr) {
            ordered.push(candidate);
        }
    }
    ordered
}

/// Where a peer can be reached through a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEndpoint {
    /// Relay server address
    pub relay_addr: SocketAddr,
    /// Key the peer is allocated under on that relay
    pub peer: PublicKey,
}

/// Messages carried inside signal payloads between two agents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationMessage {
    /// Start (or restart) a negotiation with our candidates
    Offer {
        negotiation: Nonce,
        candidates: Vec<Candidate>,
    },
    /// Reply to an offer with our candidates
    Answer {
        negotiation: Nonce,
        candidates: Vec<Candidate>,
    },
    /// Our relayed endpoint, sent after direct probing gave up
    RelayOffer {
        negotiation: Nonce,
        endpoint: RelayEndpoint,
    },
    /// We no longer need the session
    Teardown { negotiation: Nonce },
}

impl NegotiationMessage {
    pub fn negotiation(&self) -> Nonce {
        match self {
            NegotiationMessage::Offer { negotiation, .. }
            | NegotiationMessage::Answer { negotiation, .. }
            | NegotiationMessage::RelayOffer { negotiation, .. }
            | NegotiationMessage::Teardown { negotiation } => *negotiation,
        }
    }
}

/// A signal message addressed from one peer to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub from: PublicKey,
    pub to: PublicKey,
    pub payload: Vec<u8>,
}

/// Signal server protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SignalMessage {
    /// Register (or refresh) the sender as the subscriber for `peer`
    Subscribe { peer: PublicKey },
    /// Subscription accepted; carries the address the server saw us at
    SubscribeAck { observed_addr: SocketAddr },
    /// Queue an envelope for delivery
    Send { id: u64, envelope: SignalEnvelope },
    /// Envelope accepted by the server
    SendAck { id: u64 },
    /// Envelope pushed to a subscriber; repeated until acked
    Deliver { id: u64, envelope: SignalEnvelope },
    /// Subscriber received delivery `id`
    DeliverAck { peer: PublicKey, id: u64 },
    /// Request refused
    Error { id: Option<u64>, message: String },
}

/// Packets exchanged directly between peers (or wrapped in relay data)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerPacket {
    /// Hole punch probe
    Punch {
        from: PublicKey,
        nonce: Nonce,
        proof: HandshakeProof,
        seq: u32,
        timestamp: u64,
    },
    /// Hole punch acknowledgment
    PunchAck {
        from: PublicKey,
        nonce: Nonce,
        proof: HandshakeProof,
        ack_seq: u32,
        echo_timestamp: u64,
    },
    /// Session liveness check, tagged under the pair secret
    Keepalive {
        from: PublicKey,
        seq: u64,
        tag: HandshakeProof,
    },
    /// Reply to a keepalive
    KeepaliveAck {
        from: PublicKey,
        seq: u64,
        tag: HandshakeProof,
    },
}

impl PeerPacket {
    /// Key the packet claims to come from
    pub fn sender(&self) -> PublicKey {
        match self {
            PeerPacket::Punch { from, .. }
            | PeerPacket::PunchAck { from, .. }
            | PeerPacket::Keepalive { from, .. }
            | PeerPacket::KeepaliveAck { from, .. } => *from,
        }
    }
}

/// Serialize a message to bytes
pub fn encode<T: Serialize>(msg: &T) -> NetworkResult<Vec<u8>> {
    Ok(bincode::serialize(msg)?)
}

/// Deserialize a message from bytes
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> NetworkResult<T> {
    Ok(bincode::deserialize(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlink_crypto::KeyPair;

    #[test]
    fn test_preference_order() {
        let srflx = Candidate::server_reflexive("203.0.113.7:51820".parse().unwrap());
        let host_a = Candidate::host("192.168.1.10:51820".parse().unwrap());
        let host_b = Candidate::host("10.0.0.4:51820".parse().unwrap());

        let ordered = preference_order(&[srflx, host_a, host_b, host_a]);

        assert_eq!(ordered, vec![host_a, host_b, srflx]);
    }

    #[test]
    fn test_negotiation_message_encoding() {
        let negotiation = Nonce::random();
        let msg = NegotiationMessage::Offer {
            negotiation,
            candidates: vec![Candidate::host("127.0.0.1:4000".parse().unwrap())],
        };

        let bytes = encode(&msg).unwrap();
        let decoded: NegotiationMessage = decode(&bytes).unwrap();

        assert_eq!(decoded, msg);
        assert_eq!(decoded.negotiation(), negotiation);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(decode::<SignalMessage>(&[0xff, 0xff, 0xff, 0xff, 0x01]).is_err());
    }

    #[test]
    fn test_peer_packet_sender() {
        let keys = KeyPair::generate();
        let packet = PeerPacket::Keepalive {
            from: keys.public,
            seq: 9,
            tag: HandshakeProof([0u8; 32]),
        };
        assert_eq!(packet.sender(), keys.public);
    }
}
