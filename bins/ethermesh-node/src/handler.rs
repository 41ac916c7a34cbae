//! Inbound Protocol Handler
//!
//! Decodes packets that terminate at this node and drives the topology and
//! switch callbacks: HELLO performs identity verification and peer
//! insertion, OK carries latency samples and WHOIS answers, RENDEZVOUS
//! schedules the NAT-traversal probe. Frames are verified and logged; the
//! virtual tap that would consume them is outside this daemon.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use ethermesh_core::{DecodeOutcome, InboundPacketHandler, Path, Peer, Switch, Topology};
use ethermesh_crypto::constants::IDENTITY_MARSHAL_SIZE;
use ethermesh_crypto::{Address, IdentityPublic};
use ethermesh_wire::{Packet, Verb};
use tracing::{debug, trace, warn};

/// How far in the future a received RENDEZVOUS schedules its hole-punch
/// HELLO, giving the counterpart time to do the same
const RENDEZVOUS_FIRE_DELAY: i64 = 500;

pub struct NodeHandler {
    topology: Arc<Topology>,
    switch: OnceLock<Arc<Switch>>,
}

impl NodeHandler {
    pub fn new(topology: Arc<Topology>) -> Arc<Self> {
        Arc::new(Self {
            topology,
            switch: OnceLock::new(),
        })
    }

    /// Wire up the switch after construction (the switch owns the handler,
    /// so the reference arrives late)
    pub fn bind_switch(&self, switch: Arc<Switch>) {
        let _ = self.switch.set(switch);
    }

    fn switch(&self) -> Option<&Arc<Switch>> {
        self.switch.get()
    }

    async fn handle_hello(&self, source: &Arc<Path>, packet: &Packet, now: i64) {
        let Some(switch) = self.switch() else { return };
        let payload = packet.payload();
        // [proto][major][minor][revision u16][timestamp u64][identity]
        if payload.len() < 13 + IDENTITY_MARSHAL_SIZE {
            trace!("dropped short HELLO");
            return;
        }
        let timestamp = u64::from_be_bytes(payload[5..13].try_into().unwrap());
        let identity = match IdentityPublic::unmarshal(&payload[13..13 + IDENTITY_MARSHAL_SIZE]) {
            Ok(id) => id,
            Err(e) => {
                debug!(error = %e, "dropped HELLO with invalid identity");
                return;
            }
        };
        if identity.address() != packet.source() {
            warn!(claimed = %packet.source(), derived = %identity.address(),
                "dropped HELLO whose identity does not bind to its source");
            return;
        }

        let peer = match self.topology.peer(packet.source(), true) {
            Some(p) => p,
            None => self
                .topology
                .add(Arc::new(Peer::new(self.topology.my_identity(), identity))),
        };
        if !packet.mac_verify(peer.mac_key()) {
            debug!(peer = %peer.address(), "dropped HELLO with bad authenticator");
            return;
        }

        peer.learn_path(source.clone(), now);
        switch.do_anything_waiting_for_peer(&peer, now).await;

        // Acknowledge, echoing the timestamp so the sender can measure RTT
        let mut ok = Packet::new(peer.address(), switch.address(), Verb::Ok);
        ok.append_u64(packet.packet_id());
        ok.append_u8(Verb::Hello as u8);
        ok.append_u64(timestamp);
        switch.send(ok, true, now).await;
    }

    async fn handle_ok(&self, source: &Arc<Path>, peer: &Arc<Peer>, packet: &Packet, now: i64) {
        let Some(switch) = self.switch() else { return };
        let payload = packet.payload();
        if payload.len() < 9 {
            return;
        }
        let in_re_verb = payload[8];
        let body = &payload[9..];
        match Verb::try_from(in_re_verb) {
            Ok(Verb::Hello) => {
                if body.len() >= 8 {
                    let sent_at = u64::from_be_bytes(body[..8].try_into().unwrap()) as i64;
                    let rtt = now.saturating_sub(sent_at);
                    if (0..=10_000).contains(&rtt) {
                        peer.record_latency(rtt as u32);
                    }
                }
                peer.learn_path(source.clone(), now);
            }
            Ok(Verb::Whois) => {
                if body.len() < IDENTITY_MARSHAL_SIZE {
                    return;
                }
                let Ok(identity) = IdentityPublic::unmarshal(&body[..IDENTITY_MARSHAL_SIZE]) else {
                    debug!("dropped WHOIS answer with invalid identity");
                    return;
                };
                let resolved = self
                    .topology
                    .add(Arc::new(Peer::new(self.topology.my_identity(), identity)));
                debug!(peer = %resolved.address(), "WHOIS resolved");
                switch.do_anything_waiting_for_peer(&resolved, now).await;
            }
            _ => trace!(in_re_verb, "OK for unhandled verb"),
        }
    }

    async fn handle_whois(&self, peer: &Arc<Peer>, packet: &Packet, now: i64) {
        let Some(switch) = self.switch() else { return };
        let payload = packet.payload();
        let Ok(queried) = Address::from_bytes(payload) else {
            return;
        };
        match self.topology.peer(queried, true) {
            Some(known) => {
                let mut ok = Packet::new(peer.address(), switch.address(), Verb::Ok);
                ok.append_u64(packet.packet_id());
                ok.append_u8(Verb::Whois as u8);
                ok.append_bytes(&known.identity().marshal());
                switch.send(ok, true, now).await;
            }
            None => {
                trace!(%queried, "WHOIS for unknown address");
                let mut err = Packet::new(peer.address(), switch.address(), Verb::Error);
                err.append_u64(packet.packet_id());
                err.append_u8(Verb::Whois as u8);
                switch.send(err, true, now).await;
            }
        }
    }

    fn handle_rendezvous(&self, source: &Arc<Path>, packet: &Packet, now: i64) {
        let Some(switch) = self.switch() else { return };
        // Introductions are only believed when a root makes them
        if !self.topology.is_root_address(packet.source()) {
            debug!(from = %packet.source(), "ignored RENDEZVOUS from non-root");
            return;
        }
        let payload = packet.payload();
        if payload.len() < 8 {
            return;
        }
        let Ok(with_peer) = Address::from_bytes(&payload[..5]) else {
            return;
        };
        let port = u16::from_be_bytes([payload[5], payload[6]]);
        let ip: IpAddr = match payload[7] {
            4 if payload.len() >= 12 => {
                let octets: [u8; 4] = payload[8..12].try_into().unwrap();
                Ipv4Addr::from(octets).into()
            }
            16 if payload.len() >= 24 => {
                let octets: [u8; 16] = payload[8..24].try_into().unwrap();
                Ipv6Addr::from(octets).into()
            }
            other => {
                trace!(len = other, "dropped RENDEZVOUS with bad address length");
                return;
            }
        };
        let endpoint = SocketAddr::new(ip, port);
        debug!(%with_peer, %endpoint, "scheduling NAT-T hello");
        switch.schedule_rendezvous(
            with_peer,
            source.local_socket(),
            endpoint,
            now + RENDEZVOUS_FIRE_DELAY,
        );
    }

    fn handle_frame(&self, peer: &Arc<Peer>, packet: &mut Packet) {
        if packet.decompress().is_err() {
            debug!(peer = %peer.address(), "dropped FRAME with corrupt compression");
            return;
        }
        let payload = packet.payload();
        if payload.len() < 10 {
            return;
        }
        let network_id = u64::from_be_bytes(payload[..8].try_into().unwrap());
        let ether_type = u16::from_be_bytes([payload[8], payload[9]]);
        // Tap delivery is outside this daemon; account for the frame here
        debug!(
            peer = %peer.address(),
            network = format_args!("{network_id:016x}"),
            ether_type = format_args!("{ether_type:04x}"),
            len = payload.len() - 10,
            "frame received"
        );
    }
}

#[async_trait]
impl InboundPacketHandler for NodeHandler {
    async fn handle(&self, source: &Arc<Path>, packet: &Packet, now: i64) -> DecodeOutcome {
        // Armor removal first: an encrypted packet's verb is unreadable
        // until the sender's keystream is applied, which needs the peer
        let peer = self.topology.peer(packet.source(), true);
        let mut clear = packet.clone();
        if clear.encrypted() {
            let Some(peer) = peer.as_ref() else {
                return DecodeOutcome::NeedPeer(packet.source());
            };
            if !packet.mac_verify(peer.mac_key()) {
                debug!(peer = %peer.address(), "dropped packet with bad authenticator");
                return DecodeOutcome::Done;
            }
            clear.decrypt(peer.crypt_key());
        }

        let verb = match clear.verb() {
            Ok(v) => v,
            Err(e) => {
                trace!(error = %e, "dropped packet with unknown verb");
                return DecodeOutcome::Done;
            }
        };

        // HELLO authenticates itself and may introduce a brand-new peer
        if verb == Verb::Hello {
            self.handle_hello(source, &clear, now).await;
            return DecodeOutcome::Done;
        }

        let Some(peer) = peer else {
            return DecodeOutcome::NeedPeer(packet.source());
        };
        // Unencrypted packets still carry an authenticator
        if !packet.encrypted() && !packet.mac_verify(peer.mac_key()) {
            debug!(peer = %peer.address(), ?verb, "dropped packet with bad authenticator");
            return DecodeOutcome::Done;
        }
        peer.learn_path(source.clone(), now);

        match verb {
            Verb::Nop => {}
            Verb::Hello => unreachable!("handled above"),
            Verb::Ok => self.handle_ok(source, &peer, &clear, now).await,
            Verb::Error => {
                trace!(peer = %peer.address(), "peer reported an error");
            }
            Verb::Whois => self.handle_whois(&peer, &clear, now).await,
            Verb::Rendezvous => self.handle_rendezvous(source, &clear, now),
            Verb::Frame => self.handle_frame(&peer, &mut clear),
            Verb::MulticastFrame | Verb::MulticastLike => {
                trace!(peer = %peer.address(), ?verb, "multicast traffic received");
            }
        }
        DecodeOutcome::Done
    }
}
