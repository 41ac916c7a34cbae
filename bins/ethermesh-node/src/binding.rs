//! UDP Socket Bindings
//!
//! Binds every configured listen address, hands each socket a small
//! numeric id (the "local socket" the core keys paths by), and runs one
//! reader task per socket feeding the switch classifier.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ethermesh_core::{Switch, WireSender};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::now_ms;

const RECV_BUFFER_SIZE: usize = 1 << 20;
const MAX_DATAGRAM_SIZE: usize = 4096;

/// All bound sockets, addressable by local socket id
pub struct UdpBindings {
    sockets: Vec<Arc<UdpSocket>>,
}

impl UdpBindings {
    /// Bind every listen address with a tuned receive buffer
    pub async fn bind(listen: &[SocketAddr]) -> Result<Arc<Self>> {
        let mut sockets = Vec::with_capacity(listen.len());
        for addr in listen {
            let domain = if addr.is_ipv6() {
                Domain::IPV6
            } else {
                Domain::IPV4
            };
            let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
                .context("creating UDP socket")?;
            socket
                .set_recv_buffer_size(RECV_BUFFER_SIZE)
                .context("setting receive buffer")?;
            socket.set_reuse_address(true)?;
            socket.set_nonblocking(true)?;
            socket
                .bind(&(*addr).into())
                .with_context(|| format!("binding {addr}"))?;

            let std_socket: std::net::UdpSocket = socket.into();
            let tokio_socket = UdpSocket::from_std(std_socket)?;
            debug!(local = %tokio_socket.local_addr()?, "bound UDP socket");
            sockets.push(Arc::new(tokio_socket));
        }
        Ok(Arc::new(Self { sockets }))
    }

    /// Local addresses actually bound (useful with port 0)
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets
            .iter()
            .filter_map(|s| s.local_addr().ok())
            .collect()
    }

    /// Spawn one reader task per socket, each feeding the switch
    pub fn spawn_readers(self: &Arc<Self>, switch: Arc<Switch>) {
        for (id, socket) in self.sockets.iter().enumerate() {
            let socket = socket.clone();
            let switch = switch.clone();
            let local_socket = id as i64;
            tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((len, from)) => {
                            trace!(%from, len, local_socket, "datagram");
                            switch
                                .on_remote_packet(local_socket, from, &buf[..len], now_ms())
                                .await;
                        }
                        Err(e) => {
                            warn!(local_socket, error = %e, "UDP receive error");
                        }
                    }
                }
            });
        }
    }
}

#[async_trait]
impl WireSender for UdpBindings {
    async fn send_udp(&self, local_socket: i64, remote: SocketAddr, data: &[u8]) -> bool {
        let Some(socket) = usize::try_from(local_socket)
            .ok()
            .and_then(|i| self.sockets.get(i))
        else {
            warn!(local_socket, "send on unknown local socket");
            return false;
        };
        match socket.send_to(data, remote).await {
            Ok(_) => true,
            Err(e) => {
                trace!(%remote, error = %e, "UDP send failed");
                false
            }
        }
    }
}
