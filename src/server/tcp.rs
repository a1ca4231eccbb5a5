//! TCP flow server (S-T). See SPEC_FULL.md §4.3.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::watch,
    time::sleep,
};

use crate::error::FlowServerError;
use crate::mutate::{self, Mutation};

use super::side_channel::ServerShared;

const PEEK_SIZE: usize = 4096;
const GET_TOLERANCE_WAIT: Duration = Duration::from_millis(10);

/// Binds and serves one TCP flow-server listener. One such listener runs
/// per distinct original server port (or a single one when
/// `original_ports = false`).
///
/// # Errors
///
/// Errors if the listener cannot be bound or its accept loop fails
/// irrecoverably.
pub async fn serve(
    shared: Arc<ServerShared>,
    listener: TcpListener,
) -> Result<(), FlowServerError> {
    loop {
        let (stream, addr) = listener.accept().await?;
        stream.set_nodelay(true)?;
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let _ = handle_connection(shared, stream, addr).await;
        });
    }
}

async fn handle_connection(
    shared: Arc<ServerShared>,
    mut stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), FlowServerError> {
    let mut buf = vec![0_u8; PEEK_SIZE];
    let n = stream.read(&mut buf).await?;
    buf.truncate(n);

    if is_probe(&buf) {
        let body = format!("HTTP/1.1 200 OK\r\n\r\n{}", addr.ip());
        stream.write_all(body.as_bytes()).await?;
        return Ok(());
    }

    let (flow_ref, mut consumed_prefix, exception) = if let Some(rest) = buf.strip_prefix(b"X-rr;") {
        match parse_inline_identity(rest) {
            Some((flow, prefix_len)) => (Some(flow), prefix_len + 5, None),
            None => (None, 0, None),
        }
    } else {
        (None, 0, None)
    };

    let (flow_ref, exception) = if let Some(flow_ref) = flow_ref {
        (Some(flow_ref), exception)
    } else {
        let known_replay_name =
            shared.clients.lock().await.get(&addr.ip()).map(|s| s.replay_name.clone());
        if let Some(name) = known_replay_name {
            let store = shared.trace_store.lock().await;
            match store.get(&name) {
                Some(replay) => {
                    let flow_key = replay.tcp_flow_keys.first().cloned();
                    (flow_key.map(|k| (name, k)), None)
                }
                None => (None, None),
            }
        } else if buf.starts_with(b"GET") {
            match extract_xrr_header(&buf) {
                Some(flow) => (Some(flow), Some("ipFlip-resolved")),
                None => (None, None),
            }
        } else {
            (None, None)
        }
    };

    let (replay_name, flow_key) = match flow_ref {
        Some(pair) => pair,
        None => {
            let body = format!("SuspiciousClientIP!;{}", addr.ip());
            stream.write_all(body.as_bytes()).await?;
            return Err(FlowServerError::UnknownClient(addr.ip().to_string()));
        }
    };

    if let Some(exception) = exception {
        if let Some(session) = shared.clients.lock().await.get_mut(&addr.ip()) {
            session.add_exception(exception);
        }
    }

    let script = {
        let store = shared.trace_store.lock().await;
        store.get(&replay_name).and_then(|r| r.server_script.tcp.get(&flow_key).cloned())
    };
    let script = match script {
        Some(script) => script,
        None => return Err(FlowServerError::UnknownClient(addr.ip().to_string())),
    };

    let first_fingerprint_ok = script
        .first()
        .map_or(true, |set| verify_fingerprint(&buf[consumed_prefix.min(buf.len())..], &set.request_hash));
    if !first_fingerprint_ok {
        if let Some(session) = shared.clients.lock().await.get_mut(&addr.ip()) {
            session.add_exception("ContentModification");
        }
    }

    let mutation = shared
        .clients
        .lock()
        .await
        .get(&addr.ip())
        .and_then(|s| s.mutation.clone());

    let timing = shared.conf.timing && !replay_name.contains("port");
    let origin = tokio::time::Instant::now();

    for (set_index, set) in script.iter().enumerate() {
        if set_index > 0 {
            let remaining = set.request_len.saturating_sub(consumed_prefix);
            let mut request_buf = vec![0_u8; remaining];
            let mut read_total = 0;
            while read_total < remaining {
                let n = stream.read(&mut request_buf[read_total..]).await?;
                if n == 0 {
                    return Ok(());
                }
                read_total += n;
                if is_get(&request_buf[..read_total]) {
                    let _ = tokio::time::timeout(GET_TOLERANCE_WAIT, stream.read(&mut [0_u8; 0])).await;
                    break;
                }
            }
        }
        consumed_prefix = 0;

        for (resp_index, response) in set.responses.iter().enumerate() {
            let payload = match &mutation {
                Some(m) if m.packet_index == resp_index => {
                    mutate::apply(&response.payload, &m.action)
                }
                _ => response.payload.clone(),
            };
            if timing {
                let deadline = origin + Duration::from_secs_f64(response.timestamp);
                sleep(deadline.saturating_duration_since(tokio::time::Instant::now())).await;
            }
            stream.write_all(&payload).await?;
        }
    }

    stream.shutdown().await.ok();
    Ok(())
}

fn is_probe(buf: &[u8]) -> bool {
    buf.starts_with(b"GET /WHATSMYIPMAN") || buf == b"WHATSMYIPMAN?"
}

fn is_get(buf: &[u8]) -> bool {
    buf.starts_with(b"GET ")
}

/// Parses `<id>;<replayCode>;<flowKey>;X-rr` from the bytes following the
/// `X-rr;` prefix, resolving the replay code via [`crate::codes`].
fn parse_inline_identity(rest: &[u8]) -> Option<((String, String), usize)> {
    let text = std::str::from_utf8(rest).ok()?;
    let end = text.find("X-rr")?;
    let body = &text[..end];
    let mut fields = body.splitn(3, ';');
    let _id = fields.next()?;
    let code = fields.next()?;
    let flow_key = fields.next()?.trim_end_matches(';');
    let replay_name = crate::codes::code_to_name(code);
    Some(((replay_name, flow_key.to_owned()), end + 4))
}

/// Extracts the `X-rr: <publicIP>;<replayCode>;<flowKey>` header from a GET
/// request's header block.
fn extract_xrr_header(buf: &[u8]) -> Option<(String, String)> {
    let text = std::str::from_utf8(buf).ok()?;
    let header = text.lines().find_map(|line| line.strip_prefix("X-rr:"))?;
    let mut fields = header.trim().splitn(3, ';');
    let _public_ip = fields.next()?;
    let code = fields.next()?;
    let flow_key = fields.next()?;
    Some((crate::codes::code_to_name(code), flow_key.to_owned()))
}

fn verify_fingerprint(first_bytes: &[u8], expected_hash: &str) -> bool {
    if expected_hash.is_empty() {
        return true;
    }
    use sha1::{Digest, Sha1};
    let sample = &first_bytes[..first_bytes.len().min(crate::trace::FINGERPRINT_SAMPLE_SIZE)];
    let mut hasher = Sha1::new();
    hasher.update(sample);
    hex::encode(hasher.finalize()) == expected_hash
}
