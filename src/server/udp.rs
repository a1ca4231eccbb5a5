//! UDP flow server (S-U). See SPEC_FULL.md §4.4.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{net::UdpSocket, sync::Mutex, time::sleep};

use crate::error::FlowServerError;
use crate::mutate;

use super::session::Notification;
use super::side_channel::ServerShared;

const SENDER_CAP: Duration = Duration::from_secs(45);

/// One bound UDP server port. Owns the mapping from admitted
/// `(clientIP, clientPort)` pairs to the replay they belong to, so the
/// side-channel close callback can purge it on disconnect.
pub struct UdpFlowServer {
    socket: Arc<UdpSocket>,
    server_port: u16,
    send_lock: Mutex<()>,
    mapping: Mutex<HashMap<SocketAddr, ()>>,
}

impl UdpFlowServer {
    /// Binds a UDP server on `server_port`.
    ///
    /// # Errors
    ///
    /// Errors if the socket cannot be bound.
    pub async fn bind(server_port: u16) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", server_port)).await?;
        Ok(Self {
            socket: Arc::new(socket),
            server_port,
            send_lock: Mutex::new(()),
            mapping: Mutex::new(HashMap::new()),
        })
    }

    /// Runs the receive loop: every first datagram from an unknown
    /// `(clientIP, clientPort)` triggers admission lookup and spawns a
    /// scripted sender.
    ///
    /// # Errors
    ///
    /// Errors if the socket fails irrecoverably.
    pub async fn serve(self: Arc<Self>, shared: Arc<ServerShared>) -> Result<(), FlowServerError> {
        let mut buf = vec![0_u8; 2048];
        loop {
            let (_, peer) = self.socket.recv_from(&mut buf).await?;
            let already_known = self.mapping.lock().await.contains_key(&peer);
            if already_known {
                continue;
            }

            {
                let mut sessions = shared.clients.lock().await;
                let session = match sessions.get_mut(&peer.ip()) {
                    Some(session) => session,
                    None => continue,
                };
                session.ports.insert(self.server_port);
                session.hosts.insert(peer.ip());
            }
            self.mapping.lock().await.insert(peer, ());

            let this = Arc::clone(&self);
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let _ = this.run_sender(shared, peer).await;
            });
        }
    }

    async fn run_sender(
        &self,
        shared: Arc<ServerShared>,
        peer: SocketAddr,
    ) -> Result<(), FlowServerError> {
        let (replay_name, mutation) = {
            let sessions = shared.clients.lock().await;
            match sessions.get(&peer.ip()) {
                Some(session) => (session.replay_name.clone(), session.mutation.clone()),
                None => return Ok(()),
            }
        };

        let events = {
            let store = shared.trace_store.lock().await;
            store
                .get(&replay_name)
                .and_then(|r| r.server_script.udp.get(&self.server_port).cloned())
                .and_then(|by_client_port| by_client_port.into_iter().next())
                .map(|(_, events)| events)
        };
        let events = match events {
            Some(events) => events,
            None => return Ok(()),
        };

        notify(&shared, peer.ip(), self.server_port, true).await;

        let origin = Instant::now();
        for (index, event) in events.iter().enumerate() {
            if origin.elapsed() >= SENDER_CAP {
                break;
            }
            let payload = match &mutation {
                Some(m) if m.packet_index == index => mutate::apply(&event.payload, &m.action),
                _ => event.payload.clone(),
            };
            if shared.conf.timing {
                let deadline = origin + Duration::from_secs_f64(event.timestamp);
                sleep(deadline.saturating_duration_since(Instant::now())).await;
            }
            let _guard = self.send_lock.lock().await;
            self.socket.send_to(&payload, peer).await?;
        }

        notify(&shared, peer.ip(), self.server_port, false).await;
        Ok(())
    }

    /// Removes every mapping entry sourced from `ip`. The close callback
    /// only knows the client's data-plane IP, not the ephemeral source
    /// port(s) its datagrams arrived from, so this purges by IP rather
    /// than by exact peer address.
    pub async fn purge(&self, ip: IpAddr) {
        self.mapping.lock().await.retain(|peer, ()| peer.ip() != ip);
    }
}

async fn notify(shared: &Arc<ServerShared>, ip: std::net::IpAddr, port: u16, started: bool) {
    if let Some(tx) = shared.notify_targets.lock().await.get(&ip) {
        let notification = if started {
            Notification::Started { observed_ip: ip, port }
        } else {
            Notification::Done { observed_ip: ip, port }
        };
        let _ = tx.send(notification);
    }
}
