//! The Switch
//!
//! Sits between the virtual tap and the UDP transport. Inbound datagrams
//! are classified as fragments or packet heads, relayed when addressed
//! elsewhere, reassembled and decoded when addressed here. Outbound frames
//! from the tap are encapsulated, fragmented against the MTU, armored, and
//! sent direct or via a root. Everything that cannot make progress right
//! now waits in a bounded queue serviced by the periodic tick.
//!
//! Every ingress failure collapses to a logged drop; neither the ingress
//! path nor the tick ever raises.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use ethermesh_crypto::{Address, Identity};
use ethermesh_wire::constants::{
    ETHERTYPE_ARP, ETHERTYPE_IPV4, ETHERTYPE_IPV6, MAX_FRAGMENTS, MIN_FRAGMENT_LENGTH,
    MIN_PACKET_LENGTH, MULTICAST_PROPAGATION_BREADTH, RELAY_MAX_HOPS, UDP_DEFAULT_PAYLOAD_MTU,
};
use ethermesh_wire::{
    Fragment, Mac, MulticastGroup, Packet, Verb, WireResult, FRAGMENT_INDICATOR,
    FRAGMENT_INDICATOR_INDEX,
};
use tracing::{debug, trace, warn};

use crate::config::CoreConfig;
use crate::defrag::DefragCache;
use crate::path::Path;
use crate::peer::Peer;
use crate::queues::{RxEntry, RxQueue, TxEntry, TxQueue};
use crate::rendezvous::{RendezvousEntry, RendezvousQueue, UniteThrottle};
use crate::runtime::{
    DecodeOutcome, InboundPacketHandler, MulticastBloom, Multicaster, Network, WireSender,
};
use crate::topology::Topology;
use crate::whois::WhoisResolver;
use crate::{PROTOCOL_VERSION, VERSION_MAJOR, VERSION_MINOR, VERSION_REVISION};

/// The packet dispatch engine
pub struct Switch {
    identity: Arc<Identity>,
    topology: Arc<Topology>,
    sender: Arc<dyn WireSender>,
    handler: Arc<dyn InboundPacketHandler>,
    multicaster: Arc<dyn Multicaster>,
    config: CoreConfig,

    tx_queue: TxQueue,
    rx_queue: RxQueue,
    defrag: DefragCache,
    whois: WhoisResolver,
    rendezvous: RendezvousQueue,
    unite_throttle: UniteThrottle,
}

impl Switch {
    pub fn new(
        identity: Arc<Identity>,
        topology: Arc<Topology>,
        sender: Arc<dyn WireSender>,
        handler: Arc<dyn InboundPacketHandler>,
        multicaster: Arc<dyn Multicaster>,
        config: CoreConfig,
    ) -> Self {
        Self {
            identity,
            topology,
            sender,
            handler,
            multicaster,
            config,
            tx_queue: TxQueue::new(),
            rx_queue: RxQueue::new(),
            defrag: DefragCache::new(),
            whois: WhoisResolver::new(),
            rendezvous: RendezvousQueue::new(),
            unite_throttle: UniteThrottle::new(),
        }
    }

    /// This node's address
    pub fn address(&self) -> Address {
        self.identity.address()
    }

    /// The topology this switch dispatches over
    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    // =====================
    // Ingress
    // =====================

    /// Classify and dispatch one received datagram. Never fails: malformed
    /// input is dropped with a trace log.
    pub async fn on_remote_packet(
        &self,
        local_socket: i64,
        from: SocketAddr,
        data: &[u8],
        now: i64,
    ) {
        if data.len() <= MIN_FRAGMENT_LENGTH {
            trace!(%from, len = data.len(), "dropped runt datagram");
            return;
        }
        let result = if data[FRAGMENT_INDICATOR_INDEX] == FRAGMENT_INDICATOR {
            self.handle_remote_fragment(local_socket, from, data, now).await
        } else if data.len() > MIN_PACKET_LENGTH {
            self.handle_remote_head(local_socket, from, data, now).await
        } else {
            trace!(%from, len = data.len(), "dropped runt packet head");
            Ok(())
        };
        if let Err(e) = result {
            trace!(%from, error = %e, "dropped datagram");
        }
    }

    async fn handle_remote_fragment(
        &self,
        local_socket: i64,
        from: SocketAddr,
        data: &[u8],
        now: i64,
    ) -> WireResult<()> {
        let mut fragment = Fragment::from_bytes(data)?;
        let dest = fragment.destination();

        if dest != self.address() {
            // Not ours: relay toward the destination if the hop budget allows
            if fragment.hops() < RELAY_MAX_HOPS {
                fragment.increment_hops();
                let relayed = match self.topology.peer(dest, true) {
                    Some(peer) => {
                        peer.send(self.sender.as_ref(), fragment.data(), true, Verb::Nop, now)
                            .await
                    }
                    None => false,
                };
                if !relayed {
                    if let Some(root) = self.topology.best_root(&[]) {
                        root.send(self.sender.as_ref(), fragment.data(), true, Verb::Nop, now)
                            .await;
                    }
                }
            } else {
                trace!(%from, %dest, "dropped relayed fragment, max hops exceeded");
            }
            return Ok(());
        }

        if !fragment.is_sane() {
            trace!(%from, ?fragment, "dropped fragment with out-of-range fields");
            return Ok(());
        }
        if let Some(packet) = self.defrag.insert_fragment(fragment, now) {
            let source = self.topology.path(local_socket, from);
            self.decode_or_park(source, packet, now).await;
        }
        Ok(())
    }

    async fn handle_remote_head(
        &self,
        local_socket: i64,
        from: SocketAddr,
        data: &[u8],
        now: i64,
    ) -> WireResult<()> {
        let mut packet = Packet::from_bytes(data)?;
        let dest = packet.destination();

        if dest != self.address() {
            if packet.hops() < RELAY_MAX_HOPS {
                packet.increment_hops();
                let direct = match self.topology.peer(dest, true) {
                    Some(peer) => {
                        peer.send(self.sender.as_ref(), packet.data(), true, Verb::Nop, now)
                            .await
                    }
                    None => false,
                };
                if direct {
                    // Both ends are talking through us: opportunistically
                    // introduce them so they can hole-punch
                    self.unite(packet.source(), dest, false, now).await;
                } else if let Some(root) = self.topology.best_root(&[]) {
                    root.send(self.sender.as_ref(), packet.data(), true, Verb::Nop, now)
                        .await;
                }
            } else {
                trace!(source = %packet.source(), %from, %dest, "dropped relay, max hops exceeded");
            }
            return Ok(());
        }

        if packet.fragmented() {
            if let Some(complete) = self.defrag.insert_head(packet, now) {
                let source = self.topology.path(local_socket, from);
                self.decode_or_park(source, complete, now).await;
            }
        } else {
            let source = self.topology.path(local_socket, from);
            self.decode_or_park(source, packet, now).await;
        }
        Ok(())
    }

    /// Hand a packet to the decoder; when decode is blocked on a missing
    /// peer, issue the WHOIS and park the packet for retry
    async fn decode_or_park(&self, source: Arc<Path>, packet: Packet, now: i64) {
        match self.handler.handle(&source, &packet, now).await {
            DecodeOutcome::Done => {}
            DecodeOutcome::NeedPeer(missing) => {
                self.request_whois(missing, now).await;
                self.rx_queue.push(RxEntry {
                    received_time: now,
                    packet,
                    source,
                });
            }
        }
    }

    // =====================
    // Egress from the local tap
    // =====================

    /// Encapsulate one Ethernet frame read from the local virtual
    /// interface
    pub async fn on_local_ethernet(
        &self,
        network: &Arc<dyn Network>,
        from: Mac,
        to: Mac,
        ether_type: u16,
        data: &[u8],
        now: i64,
    ) {
        if from != network.tap_mac() {
            debug!(%from, %to, ether_type, "ignored tap frame from foreign MAC (bridging not supported)");
            return;
        }

        if to == network.tap_mac() {
            // Some OSes reflect frames at us; hand them straight back
            trace!("reflecting self-addressed frame to tap");
            network.tap_inject(from, to, ether_type, data);
            return;
        }

        if !matches!(ether_type, ETHERTYPE_ARP | ETHERTYPE_IPV4 | ETHERTYPE_IPV6) {
            debug!(%from, %to, ether_type, "ignored tap frame with unsupported ethertype");
            return;
        }

        if to.is_multicast() {
            self.multicast_local_frame(network, from, to, ether_type, data, now)
                .await;
        } else if let Some(to_addr) = to.overlay_address() {
            if network.is_allowed(to_addr) {
                let mut outp = Packet::new(to_addr, self.address(), Verb::Frame);
                outp.append_u64(network.id());
                outp.append_u16(ether_type);
                outp.append_bytes(data);
                outp.compress();
                self.send(outp, true, now).await;
            } else {
                debug!(%to_addr, network = network.id(), "dropped unicast frame, destination not allowed on network");
            }
        } else {
            trace!(%to, "dropped frame, destination MAC not overlay-scheme");
        }
    }

    async fn multicast_local_frame(
        &self,
        network: &Arc<dyn Network>,
        from: Mac,
        to: Mac,
        ether_type: u16,
        data: &[u8],
        now: i64,
    ) {
        let mut group = MulticastGroup::new(to, 0);
        if to.is_broadcast() && is_ipv4_arp_request(ether_type, data) {
            // Give each ARP target IP its own channel
            group = MulticastGroup::for_address_resolution(
                data[24..28].try_into().expect("length checked"),
            );
        }

        let mut bloom = MulticastBloom::new();
        let next_hops = self.multicaster.pick_propagation_peers(
            &self.topology,
            network.id(),
            &group,
            self.address(),
            &mut bloom,
            MULTICAST_PROPAGATION_BREADTH,
        );
        if next_hops.is_empty() {
            return;
        }

        let signature = self.sign_multicast_frame(network.id(), from, &group, ether_type, data);

        let mut template = Packet::new(next_hops[0].address(), self.address(), Verb::MulticastFrame);
        template.append_u8(0); // flags
        template.append_u64(network.id());
        template.append_bytes(&self.address().to_bytes());
        template.append_bytes(from.as_bytes());
        template.append_bytes(group.mac().as_bytes());
        template.append_u32(group.adi());
        template.append_bytes(bloom.as_bytes());
        template.append_u8(0); // propagation hops
        template.append_u16(ether_type);
        template.append_u16(data.len() as u16);
        template.append_u16(signature.len() as u16);
        template.append_bytes(data);
        template.append_bytes(&signature);
        template.compress();

        self.send(template.clone(), true, now).await;
        for peer in &next_hops[1..] {
            template.new_initialization_vector();
            template.set_destination(peer.address());
            self.send(template.clone(), true, now).await;
        }
    }

    fn sign_multicast_frame(
        &self,
        network_id: u64,
        from: Mac,
        group: &MulticastGroup,
        ether_type: u16,
        data: &[u8],
    ) -> [u8; 64] {
        let mut message = Vec::with_capacity(8 + 6 + 6 + 4 + 2 + data.len());
        message.extend_from_slice(&network_id.to_be_bytes());
        message.extend_from_slice(from.as_bytes());
        message.extend_from_slice(group.mac().as_bytes());
        message.extend_from_slice(&group.adi().to_be_bytes());
        message.extend_from_slice(&ether_type.to_be_bytes());
        message.extend_from_slice(data);
        self.identity.sign(&message)
    }

    // =====================
    // Sending
    // =====================

    /// Send a packet, queueing it when the destination cannot be reached
    /// yet
    pub async fn send(&self, packet: Packet, encrypt: bool, now: i64) {
        if !self.try_send(&packet, encrypt, now).await {
            self.tx_queue.push(
                packet.destination(),
                TxEntry {
                    creation_time: now,
                    packet,
                    encrypt,
                },
            );
        }
    }

    /// One attempt to move a packet onto the wire. False means "queue it":
    /// no peer, no root to relay through, or the socket write failed.
    async fn try_send(&self, packet: &Packet, encrypt: bool, now: i64) -> bool {
        let dest = packet.destination();
        let Some(peer) = self.topology.peer(dest, true) else {
            self.request_whois(dest, now).await;
            return false;
        };

        let (via, is_relay) = if self.topology.is_root_address(dest)
            || peer.has_active_direct_path(now, self.config.path_activity_timeout)
        {
            (peer.clone(), false)
        } else {
            match self.topology.best_root(&[]) {
                Some(root) => (root, true),
                None => return false,
            }
        };

        let mtu = UDP_DEFAULT_PAYLOAD_MTU;
        let mut armored = packet.clone();
        let chunk = armored.size().min(mtu);
        armored.set_fragmented(chunk < armored.size());

        // Oversized packets that cannot fit the fragment budget are a
        // programming error upstream; refuse rather than truncate
        let frag_capacity = mtu - MIN_FRAGMENT_LENGTH;
        let remaining = armored.size() - chunk;
        let total_fragments = 1 + remaining.div_ceil(frag_capacity);
        if total_fragments > MAX_FRAGMENTS as usize {
            warn!(%dest, size = armored.size(), "packet exceeds maximum fragment budget");
            return false;
        }

        if encrypt {
            armored.encrypt(peer.crypt_key());
        }
        armored.mac_set(peer.mac_key());

        let verb = packet.verb().unwrap_or(Verb::Nop);
        if !via
            .send(self.sender.as_ref(), &armored.data()[..chunk], is_relay, verb, now)
            .await
        {
            return false;
        }

        if chunk < armored.size() {
            let mut start = chunk;
            let mut remaining = remaining;
            let mut fragment_no = 1u8;
            while remaining > 0 {
                let len = remaining.min(frag_capacity);
                let frag =
                    Fragment::new(&armored, start, len, fragment_no, total_fragments as u8);
                if !via
                    .send(self.sender.as_ref(), frag.data(), is_relay, verb, now)
                    .await
                {
                    // The receiver ages out the partial reassembly
                    trace!(%dest, fragment_no, "fragment send failed");
                    return false;
                }
                start += len;
                remaining -= len;
                fragment_no += 1;
            }
        }
        true
    }

    /// Greet a node through the normal send path (queues behind WHOIS when
    /// the destination is unknown). HELLO stays unencrypted so the receiver
    /// can read it before any key agreement.
    pub async fn send_hello(&self, dest: Address, now: i64) {
        let packet = self.build_hello(dest, now);
        self.send(packet, false, now).await;
    }

    /// Fire a HELLO at one specific physical endpoint, bypassing path
    /// selection. This is the NAT-traversal probe: the datagram itself
    /// opens the NAT mapping toward the advertised address.
    pub async fn send_hello_via(
        &self,
        peer: &Arc<Peer>,
        local_socket: i64,
        remote: SocketAddr,
        now: i64,
    ) -> bool {
        let mut packet = self.build_hello(peer.address(), now);
        packet.mac_set(peer.mac_key());
        self.sender.send_udp(local_socket, remote, packet.data()).await
    }

    fn build_hello(&self, dest: Address, now: i64) -> Packet {
        let mut packet = Packet::new(dest, self.address(), Verb::Hello);
        packet.append_u8(PROTOCOL_VERSION);
        packet.append_u8(VERSION_MAJOR);
        packet.append_u8(VERSION_MINOR);
        packet.append_u16(VERSION_REVISION);
        packet.append_u64(now as u64);
        packet.append_bytes(&self.identity.public().marshal());
        packet
    }

    // =====================
    // Identity resolution
    // =====================

    /// Resolve an unknown address via the roots. A repeated request for an
    /// address already in flight resets its retry budget and sends again
    /// immediately.
    pub async fn request_whois(&self, addr: Address, now: i64) {
        self.whois.begin(addr, now);
        trace!(%addr, "requesting WHOIS");
        if let Some(root) = self.send_whois_request(addr, &[], now).await {
            self.whois.record_consulted(addr, root);
        }
    }

    /// Send one WHOIS to the best root outside `excluded`; returns the root
    /// consulted
    async fn send_whois_request(
        &self,
        addr: Address,
        excluded: &[Address],
        now: i64,
    ) -> Option<Address> {
        let root = self.topology.best_root(excluded)?;
        let mut packet = Packet::new(root.address(), self.address(), Verb::Whois);
        packet.append_bytes(&addr.to_bytes());
        packet.encrypt(root.crypt_key());
        packet.mac_set(root.mac_key());
        if root
            .send(self.sender.as_ref(), packet.data(), false, Verb::Whois, now)
            .await
        {
            Some(root.address())
        } else {
            None
        }
    }

    /// A new peer just became usable: cancel its WHOIS, retry parked
    /// inbound decodes, and flush outbound packets waiting on it
    pub async fn do_anything_waiting_for_peer(&self, peer: &Arc<Peer>, now: i64) {
        self.whois.cancel(peer.address());

        for entry in self.rx_queue.drain() {
            match self.handler.handle(&entry.source, &entry.packet, now).await {
                DecodeOutcome::Done => {}
                DecodeOutcome::NeedPeer(missing) => {
                    self.request_whois(missing, now).await;
                    self.rx_queue.push(entry);
                }
            }
        }

        for entry in self.tx_queue.take(peer.address()) {
            if !self.try_send(&entry.packet, entry.encrypt, now).await {
                self.tx_queue.push(peer.address(), entry);
            }
        }
    }

    // =====================
    // Rendezvous
    // =====================

    /// Introduce two peers that are relaying through us so they can try a
    /// direct path. Returns false when either peer is missing, no common
    /// ground exists, or the pair was introduced too recently.
    pub async fn unite(&self, p1: Address, p2: Address, force: bool, now: i64) -> bool {
        let Some(p1p) = self.topology.peer(p1, true) else {
            return false;
        };
        let Some(p2p) = self.topology.peer(p2, true) else {
            return false;
        };

        let Some((to_reach_p2, to_reach_p1)) =
            Peer::find_common_ground(&p1p, &p2p, now, self.config.path_activity_timeout)
        else {
            return false;
        };

        if !self
            .unite_throttle
            .should_attempt(p1, p2, force, now, self.config.min_unite_interval)
        {
            return false;
        }

        debug!(%p1, %p2, "unite: introducing peers for direct connectivity");
        self.send_rendezvous(&p1p, p2, to_reach_p2, now).await;
        self.send_rendezvous(&p2p, p1, to_reach_p1, now).await;
        true
    }

    /// Tell `to` where to find `about`
    async fn send_rendezvous(&self, to: &Arc<Peer>, about: Address, at: SocketAddr, now: i64) {
        let mut packet = Packet::new(to.address(), self.address(), Verb::Rendezvous);
        packet.append_bytes(&about.to_bytes());
        packet.append_u16(at.port());
        match at.ip() {
            IpAddr::V4(ip) => {
                packet.append_u8(4);
                packet.append_bytes(&ip.octets());
            }
            IpAddr::V6(ip) => {
                packet.append_u8(16);
                packet.append_bytes(&ip.octets());
            }
        }
        packet.encrypt(to.crypt_key());
        packet.mac_set(to.mac_key());
        to.send(self.sender.as_ref(), packet.data(), false, Verb::Rendezvous, now)
            .await;
    }

    /// Schedule the time-fired NAT-traversal HELLO a received RENDEZVOUS
    /// asked for
    pub fn schedule_rendezvous(
        &self,
        with_peer: Address,
        local_socket: i64,
        remote: SocketAddr,
        fire_at: i64,
    ) {
        self.rendezvous.schedule(
            with_peer,
            RendezvousEntry {
                fire_at,
                local_socket,
                remote,
            },
        );
    }

    // =====================
    // Periodic maintenance
    // =====================

    /// Run all time-driven work. Returns the suggested delay in ms until
    /// the next call; callers may come back sooner but not later.
    pub async fn do_timer_tasks(&self, now: i64) -> i64 {
        let mut next_delay = i64::MAX;

        // Fire scheduled NAT-traversal hellos
        let (fired, delay) = self.rendezvous.due(now);
        next_delay = next_delay.min(delay);
        for (addr, entry) in fired {
            if let Some(peer) = self.topology.peer(addr, true) {
                trace!(%addr, remote = %entry.remote, "sending NAT-T HELLO");
                self.send_hello_via(&peer, entry.local_socket, entry.remote, now)
                    .await;
            }
        }

        // WHOIS retries rotate across roots not yet consulted
        let (retries, delay) = self.whois.sweep(
            now,
            self.config.whois_retry_delay,
            self.config.max_whois_retries,
        );
        next_delay = next_delay.min(delay);
        for retry in retries {
            if let Some(root) = self
                .send_whois_request(retry.address, &retry.consulted, now)
                .await
            {
                self.whois.record_consulted(retry.address, root);
            }
        }

        // Retry queued outbound packets, dropping the ones that aged out
        for (dest, entry) in self.tx_queue.drain_all() {
            if self.try_send(&entry.packet, entry.encrypt, now).await {
                continue;
            }
            if now.saturating_sub(entry.creation_time) > self.config.transmit_queue_timeout {
                trace!(%dest, "queued packet timed out");
                continue;
            }
            self.tx_queue.push(dest, entry);
        }

        // Age out parked inbound packets
        for entry in self.rx_queue.drain() {
            if now.saturating_sub(entry.received_time) > self.config.receive_queue_timeout {
                trace!(source = %entry.source, "parked inbound packet timed out");
                continue;
            }
            self.rx_queue.push(entry);
        }

        // Discard stale partial reassemblies
        self.defrag
            .sweep(now, self.config.fragmented_packet_receive_timeout);

        next_delay.clamp(self.config.timer_min_delay, self.config.timer_max_delay)
    }

    // =====================
    // Multicast announcement
    // =====================

    /// Tell every directly-connected peer which multicast groups this node
    /// subscribes to, batching 18-byte (network, mac, adi) tuples up to the
    /// MTU and gating each network on the peer's right to see it
    pub async fn announce_multicast_groups(
        &self,
        memberships: &[(Arc<dyn Network>, Vec<MulticastGroup>)],
        now: i64,
    ) {
        let direct_peers: Vec<Arc<Peer>> = self
            .topology
            .peers()
            .into_iter()
            .filter(|p| p.has_active_direct_path(now, self.config.path_activity_timeout))
            .collect();

        for peer in direct_peers {
            let mut outp = Packet::new(peer.address(), self.address(), Verb::MulticastLike);

            for (network, groups) in memberships {
                let visible = network.is_open()
                    || self.topology.is_root_address(peer.address())
                    || network.is_member(peer.address());
                if !visible {
                    continue;
                }
                for group in groups {
                    if outp.size() + 18 > UDP_DEFAULT_PAYLOAD_MTU {
                        let full = std::mem::replace(
                            &mut outp,
                            Packet::new(peer.address(), self.address(), Verb::MulticastLike),
                        );
                        self.send(full, true, now).await;
                    }
                    outp.append_u64(network.id());
                    outp.append_bytes(group.mac().as_bytes());
                    outp.append_u32(group.adi());
                }
            }

            if outp.size() > MIN_PACKET_LENGTH {
                self.send(outp, true, now).await;
            }
        }
    }

    // Test-facing introspection

    /// Outstanding WHOIS count
    pub fn pending_whois(&self) -> usize {
        self.whois.len()
    }

    /// Packets waiting for peer resolution
    pub fn pending_tx(&self) -> usize {
        self.tx_queue.len()
    }

    /// Parked inbound packets
    pub fn pending_rx(&self) -> usize {
        self.rx_queue.len()
    }

    /// Reassemblies in flight
    pub fn pending_defrag(&self) -> usize {
        self.defrag.len()
    }
}

/// Fixed-offset check for an IPv4 ARP request body (28 bytes): protocol
/// IPv4, hardware length 6, protocol length 4, opcode 1
fn is_ipv4_arp_request(ether_type: u16, data: &[u8]) -> bool {
    ether_type == ETHERTYPE_ARP
        && data.len() == 28
        && data[2] == 0x08
        && data[3] == 0x00
        && data[4] == 6
        && data[5] == 4
        && data[7] == 0x01
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arp_request_detection() {
        let mut arp = [0u8; 28];
        arp[0] = 0x00;
        arp[1] = 0x01; // hardware: ethernet
        arp[2] = 0x08;
        arp[3] = 0x00; // protocol: IPv4
        arp[4] = 6;
        arp[5] = 4;
        arp[7] = 0x01; // opcode: request
        assert!(is_ipv4_arp_request(ETHERTYPE_ARP, &arp));

        assert!(!is_ipv4_arp_request(ETHERTYPE_IPV4, &arp));
        assert!(!is_ipv4_arp_request(ETHERTYPE_ARP, &arp[..27]));

        let mut reply = arp;
        reply[7] = 0x02;
        assert!(!is_ipv4_arp_request(ETHERTYPE_ARP, &reply));
    }
}
