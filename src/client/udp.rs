//! Client-side UDP sender and receiver. See SPEC_FULL.md §4.6.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{net::UdpSocket, sync::mpsc, time::{sleep, Instant}};

use crate::error::ClientDriverError;
use crate::trace::ClientEvent;

use super::throughput::ByteCounter;
use super::watchdog::Activity;

/// Sends one flow's scripted client-to-server datagrams on a lazily-bound
/// ephemeral socket, honoring scripted timing when enabled.
///
/// # Errors
///
/// Errors on any send failure.
pub async fn send_flow(
    server_addr: SocketAddr,
    events: Vec<ClientEvent>,
    timing: bool,
    origin: Instant,
    activity: mpsc::UnboundedSender<Activity>,
) -> Result<UdpSocket, ClientDriverError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(server_addr).await?;

    for event in &events {
        if timing {
            let deadline = origin + Duration::from_secs_f64(event.timestamp);
            sleep(deadline.saturating_duration_since(Instant::now())).await;
        }
        socket.send(&event.payload).await?;
        let _ = activity.send(Activity::Tick);
    }

    Ok(socket)
}

/// Receives server-to-client datagrams on every socket in `sockets` until
/// `stop` fires, recording byte counts for the throughput sampler and
/// activity for the watchdog.
pub async fn receive_loop(
    sockets: Arc<Vec<UdpSocket>>,
    counter: Arc<ByteCounter>,
    activity: mpsc::UnboundedSender<Activity>,
    mut stop: tokio::sync::watch::Receiver<bool>,
) {
    let mut buf = vec![0_u8; 2048];
    loop {
        if *stop.borrow() {
            return;
        }
        if sockets.is_empty() {
            if stop.changed().await.is_err() {
                return;
            }
            continue;
        }

        let recv_any = async {
            for socket in sockets.iter() {
                if let Ok(Ok(n)) =
                    tokio::time::timeout(Duration::from_millis(100), socket.recv(&mut buf)).await
                {
                    return Some(n);
                }
            }
            None
        };

        tokio::select! {
            biased;
            _ = stop.changed() => return,
            n = recv_any => {
                if let Some(n) = n {
                    counter.add(n as u64);
                    let _ = activity.send(Activity::Tick);
                }
            }
        }
    }
}
