//! Client driver (C): orchestrates one replay run against a server,
//! tying together the persistent identity, side channel, TCP/UDP flow
//! pumps, throughput sampler and idle watchdog. See SPEC_FULL.md §4.6.

pub mod perma_data;
pub mod probe;
pub mod side_channel;
pub mod tcp;
pub mod throughput;
pub mod udp;
pub mod watchdog;

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use slog::Logger;
use tokio::{net::UdpSocket, sync::{mpsc, watch}, time::Instant};

use crate::conf::ClientConf;
use crate::error::ClientDriverError;
use crate::mutate::Mutation;
use crate::trace::{ClientEvent, Replay};

use self::side_channel::{Admission, PortMapping, SideChannel};
use self::throughput::{ByteCounter, Sampler};
use self::watchdog::Activity;

/// Sampling interval used when no bucket-count-derived interval is
/// available yet, ~0.22s as observed from the upstream client's live
/// throughput graph.
const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(220);

/// How the run ended, mirroring the exit codes from SPEC_FULL.md §6.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Completed normally.
    Done,
    /// No activity for `max_idle_time`.
    Timeout,
    /// The server observed a different data-plane source IP.
    IpFlip,
}

/// Everything gathered over one run, ready to be handed to the side
/// channel's closing steps and to the local exit-code mapping.
#[derive(Debug)]
pub struct RunResult {
    /// How the run ended.
    pub outcome: Outcome,
    /// Wall-clock duration of the scripted exchange, in seconds.
    pub elapsed_seconds: f64,
    /// Accumulated throughput sample, if any buckets were collected.
    pub throughput: Option<crate::analyzer_io::ThroughputSample>,
}

/// Runs one replay against `server_ip`, end to end: side-channel
/// handshake, admission, scripted TCP/UDP exchange, and the side
/// channel's closing steps.
///
/// # Errors
///
/// Errors if the side channel cannot be reached, or if admission is
/// denied (`Err(ClientDriverError::AdmissionDenied)`).
#[allow(clippy::too_many_arguments)]
pub async fn run(
    conf: &ClientConf,
    replay: &Replay,
    server_ip: IpAddr,
    real_id: &str,
    history_count: u64,
    test_id: u32,
    mutation: Option<Mutation>,
    log: &Logger,
) -> Result<RunResult, ClientDriverError> {
    let mut channel =
        SideChannel::connect((server_ip, conf.side_channel.port), conf.side_channel.read_timeout)
            .await?;

    channel
        .identify(
            real_id,
            test_id,
            &replay.name,
            "",
            history_count,
            conf.end_of_test,
            conf.public_ip,
            env!("CARGO_PKG_VERSION"),
        )
        .await?;

    if let Some(mutation) = &mutation {
        channel.send_mutation_spec(mutation).await?;
    }

    let (public_ip, bucket_count) = match channel.ask_permission().await? {
        Admission::Admitted { public_ip, bucket_count } => (public_ip, bucket_count),
        Admission::Denied(code) => return Err(ClientDriverError::AdmissionDenied(code)),
    };
    slog::info!(log, "admitted"; "public_ip" => %public_ip, "bucket_count" => bucket_count);

    channel.skip_iperf().await?;
    channel.skip_mobile_stats().await?;

    let mapping = channel.receive_port_mapping().await?;
    let _sender_count = channel.receive_sender_count().await?;

    let xrr_header = probe_xrr_header(replay, &mapping, public_ip, real_id, log).await;

    let (activity_tx, activity_rx) = mpsc::unbounded_channel();
    let counter = Arc::new(ByteCounter::default());
    let done = Arc::new(AtomicBool::new(false));
    let origin = Instant::now();

    let sample_interval = match (replay.replay_duration_secs, bucket_count) {
        (Some(duration), count) if count > 0 && duration > 0.0 => {
            Duration::from_secs_f64(duration / f64::from(count))
        }
        _ => DEFAULT_SAMPLE_INTERVAL,
    };
    let sampler = tokio::spawn(
        Sampler::new(Arc::clone(&counter), Arc::clone(&done)).run(sample_interval),
    );

    let flows = spawn_flows(
        conf, replay, &mapping, mutation, xrr_header, origin, Arc::clone(&counter),
        activity_tx.clone(),
    )
    .await?;

    let watchdog = tokio::spawn(watchdog::watch(activity_rx, conf.max_idle_time));

    // The server forwards STARTED;/DONE;<port> notifications over the same
    // side channel while UDP senders run; if nothing reads them here they
    // pile up in front of the step-10/11 reads below. Race the drain
    // alongside the flows and the watchdog so it's cancelled the moment
    // either of those settles the outcome.
    let outcome = tokio::select! {
        joined = futures::future::join_all(flows.tcp) => {
            for result in joined {
                result.map_err(|_| ClientDriverError::Io(std::io::Error::new(std::io::ErrorKind::Other, "flow task panicked")))??;
            }
            let _ = futures::future::join_all(flows.udp_send).await;
            Outcome::Done
        }
        result = watchdog => {
            match result {
                Ok(Ok(())) => Outcome::Done,
                Ok(Err(ClientDriverError::IpFlip(_))) => Outcome::IpFlip,
                _ => Outcome::Timeout,
            }
        }
        _ = channel.drain_notifications() => {
            // The side channel closed or sent something unexpected before
            // the flows or the watchdog resolved; fall back to Timeout so
            // the run still ends deterministically.
            Outcome::Timeout
        }
    };

    flows.udp_stop.send(true).ok();
    done.store(true, Ordering::Relaxed);
    let elapsed_seconds = origin.elapsed().as_secs_f64();

    match outcome {
        Outcome::Done => channel.send_done(elapsed_seconds).await?,
        Outcome::Timeout => channel.send_timeout().await?,
        Outcome::IpFlip => channel.send_ip_flip().await?,
    }

    let throughput = sampler.await.ok();
    channel.send_throughput(throughput.as_ref()).await?;
    channel.get_result(false).await?;

    Ok(RunResult { outcome, elapsed_seconds, throughput })
}

struct Flows {
    tcp: Vec<tokio::task::JoinHandle<Result<(), ClientDriverError>>>,
    udp_send: Vec<tokio::task::JoinHandle<Result<UdpSocket, ClientDriverError>>>,
    udp_stop: watch::Sender<bool>,
}

/// Probes the first TCP flow's server port (or the
/// [`probe::FALLBACK_PORT`] on `server_ip` if the replay has none) with a
/// `WHATSMYIPMAN` request, and returns an `X-rr` header value when the
/// reported IP diverges from what the side channel admitted us as —
/// signalling a NAT in between that the data-plane flow servers need
/// help identifying us through.
async fn probe_xrr_header(
    replay: &Replay,
    mapping: &PortMapping,
    admitted_as: IpAddr,
    real_id: &str,
    log: &Logger,
) -> Option<String> {
    let (probe_ip, probe_port) = replay
        .tcp_server_ports
        .first()
        .and_then(|port| resolve_address(&mapping.tcp, *port))
        .unwrap_or((admitted_as, probe::FALLBACK_PORT));

    match probe::ask_real_ip(probe_ip, probe_port).await {
        Ok(reported) if reported != admitted_as => {
            slog::info!(log, "data-plane IP diverges from side channel, injecting X-rr";
                "admitted_as" => %admitted_as, "reported" => %reported);
            Some(real_id.to_owned())
        }
        Ok(_) => None,
        Err(err) => {
            slog::debug!(log, "WHATSMYIPMAN probe failed, skipping X-rr"; "error" => %err);
            None
        }
    }
}

async fn spawn_flows(
    conf: &ClientConf,
    replay: &Replay,
    mapping: &PortMapping,
    mutation: Option<Mutation>,
    xrr_header: Option<String>,
    origin: Instant,
    counter: Arc<ByteCounter>,
    activity: mpsc::UnboundedSender<Activity>,
) -> Result<Flows, ClientDriverError> {
    let mut by_flow: HashMap<&str, Vec<&ClientEvent>> = HashMap::new();
    for event in &replay.client_events {
        by_flow.entry(event.flow_key.as_str()).or_default().push(event);
    }

    let mut tcp_handles = Vec::new();
    for flow_key in &replay.tcp_flow_keys {
        let Some(events) = by_flow.get(flow_key.as_str()) else { continue };
        let Some((_, server_port)) = parse_flow_key(flow_key) else { continue };
        let Some(addr) = resolve_address(&mapping.tcp, server_port) else { continue };

        let events: Vec<ClientEvent> = events.iter().map(|e| (*e).clone()).collect();

        tcp_handles.push(tokio::spawn(tcp::run_flow(
            conf.public_ip,
            addr,
            events,
            mutation.clone(),
            conf.timing,
            origin,
            xrr_header.clone(),
            Arc::clone(&counter),
            activity.clone(),
        )));
    }

    let mut udp_handles = Vec::new();
    let mut udp_flow_keys: Vec<&str> = by_flow
        .keys()
        .copied()
        .filter(|k| !replay.tcp_flow_keys.iter().any(|t| t == k))
        .collect();
    udp_flow_keys.sort_unstable();

    for flow_key in udp_flow_keys {
        let events = &by_flow[flow_key];
        let Some((_, server_port)) = parse_flow_key(flow_key) else { continue };
        let Some(addr) = resolve_address(&mapping.udp, server_port) else { continue };

        let events: Vec<ClientEvent> = events.iter().map(|e| (*e).clone()).collect();
        udp_handles.push(tokio::spawn(udp::send_flow(
            addr.into(),
            events,
            conf.timing,
            origin,
            activity.clone(),
        )));
    }

    let (udp_stop_tx, _udp_stop_rx) = watch::channel(false);

    Ok(Flows { tcp: tcp_handles, udp_send: udp_handles, udp_stop: udp_stop_tx })
}

/// Splits a flow key of the form `<clientIP>.<clientPort>-<serverIP>.<serverPort>`
/// into `(server_ip, server_port)`.
fn parse_flow_key(flow_key: &str) -> Option<(String, u16)> {
    let (_, server_part) = flow_key.split_once('-')?;
    let (server_ip, server_port) = server_part.rsplit_once('.')?;
    Some((server_ip.to_owned(), server_port.parse().ok()?))
}

fn resolve_address(
    table: &HashMap<String, HashMap<String, (String, u16)>>,
    server_port: u16,
) -> Option<(IpAddr, u16)> {
    for by_port in table.values() {
        if let Some((ip, port)) = by_port.get(&server_port.to_string()) {
            return Some((ip.parse().ok()?, *port));
        }
    }
    None
}
