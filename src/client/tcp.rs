//! Client-side TCP request/response pump. See SPEC_FULL.md §4.6.

use std::{net::IpAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::{sleep, timeout, Instant},
};

use crate::error::ClientDriverError;
use crate::mutate::{self, Mutation};
use crate::trace::ClientEvent;

use super::throughput::ByteCounter;
use super::watchdog::Activity;

/// Byte tolerance on response reads: if fewer than `expected - tolerance`
/// bytes remain buffered, poll once briefly then move on rather than
/// block for the full expected length (middleboxes may change response
/// sizes).
const RESPONSE_TOLERANCE: usize = 100;
const TOLERANCE_POLL: Duration = Duration::from_millis(10);

/// Drives one TCP flow end to end: connects, then for each client event in
/// order, optionally mutates, optionally waits for scripted timing, sends,
/// and reads the expected response with the tolerance rule above.
///
/// `xrr_header` is injected into the first event's payload when the
/// side-channel-observed IP and the data-plane IP diverge (see
/// SPEC_FULL.md §4.6 / §6 "X-rr").
///
/// # Errors
///
/// Errors on any I/O failure. Does not itself detect `SuspiciousClientIP!`
/// — callers should inspect returned bytes for that sentinel and push
/// [`Activity::IpFlip`] to the watchdog.
pub async fn run_flow(
    bind_ip: Option<IpAddr>,
    server_addr: (IpAddr, u16),
    events: Vec<ClientEvent>,
    mutation: Option<Mutation>,
    timing: bool,
    origin: Instant,
    xrr_header: Option<String>,
    counter: Arc<ByteCounter>,
    activity: mpsc::UnboundedSender<Activity>,
) -> Result<(), ClientDriverError> {
    let mut stream = connect(bind_ip, server_addr).await?;
    stream.set_nodelay(true)?;

    for (index, event) in events.iter().enumerate() {
        let mut payload = match &mutation {
            Some(m) if m.packet_index == index => mutate::apply(&event.payload, &m.action),
            _ => event.payload.clone(),
        };
        if index == 0 {
            if let Some(header) = &xrr_header {
                payload = inject_xrr(&payload, header);
            }
        }

        if timing {
            let deadline = origin + Duration::from_secs_f64(event.timestamp);
            sleep(deadline.saturating_duration_since(Instant::now())).await;
        }

        stream.write_all(&payload).await?;
        let _ = activity.send(Activity::Tick);

        if let Some(expected_len) = event.expected_response_len {
            let data = read_response(&mut stream, expected_len).await?;
            counter.add(data.len() as u64);
            if !data.is_empty() {
                let _ = activity.send(Activity::Tick);
            }
            if let Some(ip) = suspicious_client_ip(&data) {
                let _ = activity.send(Activity::IpFlip(ip));
            }
        }
    }

    Ok(())
}

async fn connect(
    bind_ip: Option<IpAddr>,
    server_addr: (IpAddr, u16),
) -> std::io::Result<TcpStream> {
    match bind_ip {
        Some(ip) => {
            let socket = match ip {
                IpAddr::V4(_) => tokio::net::TcpSocket::new_v4()?,
                IpAddr::V6(_) => tokio::net::TcpSocket::new_v6()?,
            };
            socket.bind((ip, 0).into())?;
            socket.connect(server_addr.into()).await
        }
        None => TcpStream::connect(server_addr).await,
    }
}

/// Reads up to `expected_len` bytes, stopping early once fewer than
/// [`RESPONSE_TOLERANCE`] bytes remain to reach `expected_len`: one short
/// poll is given, then whatever has arrived is returned.
async fn read_response(
    stream: &mut TcpStream,
    expected_len: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(expected_len);
    let mut chunk = [0_u8; 4096];
    loop {
        let remaining = expected_len.saturating_sub(buf.len());
        if remaining == 0 {
            break;
        }
        if remaining < RESPONSE_TOLERANCE {
            match timeout(TOLERANCE_POLL, stream.read(&mut chunk)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(e),
            }
            break;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(buf)
}

fn suspicious_client_ip(data: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(data).ok()?;
    let rest = text.strip_prefix("SuspiciousClientIP!;")?;
    Some(rest.trim().to_owned())
}

/// For `-random`-suffixed replays, prefixes the payload with
/// `X-rr;<header>;X-rr`. For GET requests, inserts an `X-rr: <header>\r\n`
/// line after the request line instead.
fn inject_xrr(payload: &[u8], header: &str) -> Vec<u8> {
    if payload.starts_with(b"GET") {
        if let Some(pos) = find_subslice(payload, b"\r\n") {
            let mut out = Vec::with_capacity(payload.len() + header.len() + 9);
            out.extend_from_slice(&payload[..pos + 2]);
            out.extend_from_slice(format!("X-rr: {header}\r\n").as_bytes());
            out.extend_from_slice(&payload[pos + 2..]);
            return out;
        }
    }
    let mut out = Vec::with_capacity(payload.len() + header.len() + 10);
    out.extend_from_slice(format!("X-rr;{header};X-rr").as_bytes());
    out.extend_from_slice(payload);
    out
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
