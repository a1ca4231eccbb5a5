//! Side-channel server (SC): admission, mapping delivery, progress
//! notifications, post-replay result exchange. See SPEC_FULL.md §4.5.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use slog::Logger;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch, Mutex},
};
use tokio_util::codec::Framed;

use crate::analyzer_io::{AnalyzerIo, ReplayInfo, ThroughputSample};
use crate::codes;
use crate::conf::ServerConf;
use crate::error::SideChannelError;
use crate::framing::SideChannelCodec;
use crate::mutate::Mutation;
use crate::tcpdump::{NoopPostProcessor, PcapPostProcessor, TcpdumpHandle};
use crate::trace::TraceStore;

use super::admission::{AdmissionTable, DenialCode, Verdict};
use super::session::{ClientSession, Notification};
use super::udp::UdpFlowServer;

/// Everything a per-connection task needs, shared across the SC listener.
pub struct ServerShared {
    /// Server configuration.
    pub conf: ServerConf,
    /// Loaded-replay index. Guarded by a plain `Mutex` since accesses are
    /// brief and CPU-bound, not I/O-bound.
    pub trace_store: Mutex<TraceStore>,
    /// Admission bookkeeping, single-writer (only the SC task mutates it).
    pub admission: Mutex<AdmissionTable>,
    /// Live client sessions, keyed by observed data-plane IP.
    pub clients: Mutex<HashMap<IpAddr, ClientSession>>,
    /// Cancellation signal per real ID, broadcast to every flow task
    /// registered under that client.
    pub cancel: Mutex<HashMap<String, watch::Sender<bool>>>,
    /// Outbound notification forwarders, keyed by observed IP, fed by S-U
    /// senders via [`Notification`].
    pub notify_targets: Mutex<HashMap<IpAddr, mpsc::UnboundedSender<Notification>>>,
    /// Bound UDP flow servers, keyed by server port, so the close callback
    /// can purge a disconnecting client's mapping entries from each one.
    pub udp_servers: Mutex<HashMap<u16, Arc<UdpFlowServer>>>,
    /// Analyzer-facing artifact writer.
    pub analyzer: AnalyzerIo,
    /// Pcap post-processor; a no-op unless the embedding application wires
    /// in a real one.
    pub pcap_processor: Box<dyn PcapPostProcessor>,
    /// Root logger.
    pub log: Logger,
}

impl ServerShared {
    /// Builds shared server state from configuration and a trace store
    /// already pointed at the parser's artifact directory.
    #[must_use]
    pub fn new(conf: ServerConf, trace_store: TraceStore, log: Logger) -> Arc<Self> {
        let analyzer = AnalyzerIo::new(conf.results_folder.clone());
        Arc::new(Self {
            conf,
            trace_store: Mutex::new(trace_store),
            admission: Mutex::new(AdmissionTable::new()),
            clients: Mutex::new(HashMap::new()),
            cancel: Mutex::new(HashMap::new()),
            notify_targets: Mutex::new(HashMap::new()),
            udp_servers: Mutex::new(HashMap::new()),
            analyzer,
            pcap_processor: Box::new(NoopPostProcessor),
            log,
        })
    }

    /// Registers a bound UDP flow server so its mapping can be purged on
    /// client disconnect. Called once per published UDP port at startup.
    pub async fn register_udp_server(&self, port: u16, server: Arc<UdpFlowServer>) {
        self.udp_servers.lock().await.insert(port, server);
    }
}

/// Runs the side-channel accept loop until `listener` is closed or the
/// process is killed. One task is spawned per accepted connection.
///
/// # Errors
///
/// Errors if binding or accepting fails irrecoverably.
pub async fn run(
    shared: Arc<ServerShared>,
    listener: TcpListener,
) -> Result<(), SideChannelError> {
    slog::info!(shared.log, "side channel listening"; "addr" => ?listener.local_addr().ok());
    loop {
        let (stream, addr) = listener.accept().await?;
        let shared = Arc::clone(&shared);
        let log = shared.log.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(shared, stream, addr).await {
                slog::warn!(log, "side channel session ended with error"; "addr" => %addr, "error" => %err);
            }
        });
    }
}

async fn handle_connection(
    shared: Arc<ServerShared>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), SideChannelError> {
    let observed_ip = addr.ip();
    let framed = Framed::new(stream, SideChannelCodec);
    let (mut sink, mut source) = framed.split();

    // Step 1: identity.
    let identity = recv_text(&mut source).await?;
    let mut parts = identity.splitn(8, ';');
    let real_id = parts.next().ok_or_else(malformed)?.to_owned();
    let test_id: u32 = parts.next().ok_or_else(malformed)?.parse().map_err(|_| malformed())?;
    let replay_name = parts.next().ok_or_else(malformed)?.to_owned();
    let extra_string = parts.next().unwrap_or_default().to_owned();
    let history_count: u64 = parts.next().unwrap_or("0").parse().unwrap_or(0);
    let end_of_test = parts.next().unwrap_or("true") == "true";
    let reported_ip: Option<IpAddr> = parts.next().and_then(|s| s.parse().ok());
    let client_version = parts.next().unwrap_or("").to_owned();

    // Step 2: mutation spec.
    let mutation_raw = recv_text(&mut source).await?;
    let mutation: Option<Mutation> = serde_json::from_str(&mutation_raw).ok();

    // Admission (step 3).
    let replay = {
        let mut store = shared.trace_store.lock().await;
        store.load(&replay_name, !shared.conf.original_ips).ok()
    };
    let overloaded = false; // resource sampling is a pluggable concern, SPEC_FULL.md §4.5
    let verdict = shared.admission.lock().await.try_admit(
        observed_ip,
        &real_id,
        &replay_name,
        test_id,
        replay.is_some(),
        overloaded,
        shared.conf.side_channel.admission_idle_timeout,
        shared.conf.bucket_count,
    );

    let replay = match verdict {
        Verdict::Denied(code) => {
            let message = if code == DenialCode::Busy {
                format!("0;{};{}", code as u8, shared.conf.bucket_count)
            } else {
                format!("0;{}", code as u8)
            };
            send_text(&mut sink, &message).await?;
            return Ok(());
        }
        Verdict::Admitted { bucket_count } => {
            send_text(&mut sink, &format!("1;{};{}", shared.conf_public_ip(), bucket_count)).await?;
            replay.expect("admitted implies replay loaded")
        }
    };

    let (cancel_tx, cancel_rx) = watch::channel(false);
    shared.cancel.lock().await.insert(real_id.clone(), cancel_tx);

    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
    shared.notify_targets.lock().await.insert(observed_ip, notify_tx);

    let tcpdump = if shared.conf.capture_pcap {
        let dir = crate::analyzer_io::scratch_pcap_dir(&shared.conf.results_folder, &real_id);
        tokio::fs::create_dir_all(&dir).await.ok();
        TcpdumpHandle::start(dir.join(format!("{replay_name}.pcap")), None, Some(&observed_ip.to_string()))
            .await
            .ok()
    } else {
        None
    };

    shared.clients.lock().await.insert(
        observed_ip,
        ClientSession {
            real_id: real_id.clone(),
            observed_ip,
            reported_ip,
            replay_name: replay_name.clone(),
            test_id,
            extra_string,
            history_count,
            end_of_test,
            client_version,
            start_time: Instant::now(),
            start_wall_time: wall_time_now(),
            exceptions: String::new(),
            success: false,
            secondary_success: false,
            iperf_rate: None,
            mobile_stats: None,
            ports: Default::default(),
            hosts: Default::default(),
            mutation,
            tcpdump,
        },
    );

    // Step 4: iperf.
    let iperf_choice = recv_text(&mut source).await?;
    let iperf_rate = if iperf_choice == "WillSendIperf" {
        recv_text(&mut source).await?.parse().ok()
    } else {
        None
    };

    // Step 5: mobile stats.
    let mobile_choice = recv_text(&mut source).await?;
    let mobile_stats = if mobile_choice == "WillSendMobileStats" {
        serde_json::from_str(&recv_text(&mut source).await?).ok()
    } else {
        None
    };

    if let Some(session) = shared.clients.lock().await.get_mut(&observed_ip) {
        session.iperf_rate = iperf_rate;
        session.mobile_stats = mobile_stats;
    }

    // Step 6: port mapping.
    let public_ip = shared.conf_public_ip();
    let mapping = build_port_mapping(&replay, &shared.conf, public_ip);
    send_text(&mut sink, &serde_json::to_string(&mapping).unwrap_or_default()).await?;

    // Step 7: UDP sender count.
    let sender_count = replay.server_script.udp.values().map(HashMap::len).sum::<usize>();
    send_text(&mut sink, &sender_count.to_string()).await?;

    // Step 8/9: drain notifications while awaiting DONE/ipFlip/timeout.
    let end_signal = loop {
        tokio::select! {
            frame = recv_text(&mut source) => {
                let text = frame?;
                if text.starts_with("DONE;") || text == "ipFlip" || text == "timeout" {
                    break text;
                }
                // Unrecognized intermediate frame; ignore and keep waiting.
            }
            Some(notification) = notify_rx.recv() => {
                let text = match notification {
                    Notification::Started { port, .. } => format!("STARTED;{port}"),
                    Notification::Done { port, .. } => format!("DONE;{port}"),
                };
                send_text(&mut sink, &text).await?;
            }
            _ = cancel_watch(&cancel_rx) => {
                break "timeout".to_owned();
            }
        }
    };

    let elapsed = {
        let mut sessions = shared.clients.lock().await;
        if let Some(session) = sessions.get_mut(&observed_ip) {
            match end_signal.as_str() {
                "ipFlip" => session.add_exception("ipFlip-resolved"),
                "timeout" => {}
                _ => session.success = true,
            }
        }
        sessions.get(&observed_ip).map_or(0.0, |s| s.start_time.elapsed().as_secs_f64())
    };

    // Step 10: throughput sample.
    let xput_raw = recv_text(&mut source).await?;
    let sample: Option<ThroughputSample> = if xput_raw == "NoJitter" {
        None
    } else {
        serde_json::from_str::<(Vec<f64>, Vec<f64>)>(&xput_raw)
            .ok()
            .map(|(xput, t)| ThroughputSample { xput, t })
    };
    send_text(&mut sink, "OK").await?;

    // Step 11: result.
    let result_choice = recv_text(&mut source).await?;
    if result_choice == "Result;Yes" {
        let body = write_artifacts(&shared, observed_ip, &replay_name, elapsed, sample.as_ref()).await;
        send_text(&mut sink, &body).await?;
    } else {
        send_text(&mut sink, "OK").await?;
    }

    close_callback(&shared, observed_ip, &real_id, end_of_test || test_id == 1).await;
    Ok(())
}

/// Unix time in seconds with sub-second precision, for `ReplayInfo`'s
/// wall-clock fields.
fn wall_time_now() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

async fn cancel_watch(rx: &watch::Receiver<bool>) {
    let mut rx = rx.clone();
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn write_artifacts(
    shared: &ServerShared,
    observed_ip: IpAddr,
    replay_name: &str,
    elapsed: f64,
    sample: Option<&ThroughputSample>,
) -> String {
    let sessions = shared.clients.lock().await;
    let session = match sessions.get(&observed_ip) {
        Some(session) => session,
        None => return "OK".to_owned(),
    };
    if let Some(sample) = sample {
        let _ = shared.analyzer.write_xput(
            &session.real_id,
            session.history_count,
            session.test_id,
            sample,
        );
    }
    let info = ReplayInfo {
        incoming_time: session.start_wall_time,
        real_id: session.real_id.clone(),
        id_anonymized: anonymized_id(&session.real_id),
        ip_anonymized: crate::analyzer_io::anonymize_ip(observed_ip),
        replay_name: replay_name.to_owned(),
        extra_string: session.extra_string.clone(),
        history_count: session.history_count,
        test_id: session.test_id,
        exceptions: session.exceptions.clone(),
        success: session.success,
        secondary_success: session.secondary_success,
        iperf_rate: session.iperf_rate,
        elapsed_seconds: elapsed,
        client_time: 0.0,
        mobile_stats: session.mobile_stats.clone(),
        alerted_arcep: false,
        client_version: session.client_version.clone(),
    };
    let _ = shared.analyzer.write_replay_info(
        &session.real_id,
        session.history_count,
        session.test_id,
        &info,
    );
    "OK".to_owned()
}

fn anonymized_id(real_id: &str) -> String {
    let keep = real_id.len().min(4);
    format!("{}{}", &real_id[..keep], "*".repeat(real_id.len().saturating_sub(keep)))
}

/// Tears down every piece of per-client state on side-channel close
/// (normal or killed), per SPEC_FULL.md §4.5 "close callback" and
/// Testable Property 7.
async fn close_callback(
    shared: &Arc<ServerShared>,
    observed_ip: IpAddr,
    real_id: &str,
    release_slot: bool,
) {
    shared.notify_targets.lock().await.remove(&observed_ip);
    shared.cancel.lock().await.remove(real_id);
    if release_slot {
        shared.admission.lock().await.release_ip(observed_ip);
    }
    if let Some(session) = shared.clients.lock().await.remove(&observed_ip) {
        purge_udp_mappings(shared, &session).await;
        if let Some(tcpdump) = session.tcpdump {
            let path = tcpdump.out_file().to_owned();
            tcpdump.stop().await;
            if session.secondary_success && !session.exceptions.contains("ContentModification") {
                let _ = shared.pcap_processor.process(&path).await;
            }
        }
    }
}

/// Removes this client's mapping entries from every S-U port it touched,
/// per SPEC_FULL.md §4.5 and Testable Property 7.
async fn purge_udp_mappings(shared: &Arc<ServerShared>, session: &ClientSession) {
    let udp_servers = shared.udp_servers.lock().await;
    for port in &session.ports {
        if let Some(server) = udp_servers.get(port) {
            for host in &session.hosts {
                server.purge(*host).await;
            }
        }
    }
}

fn malformed() -> SideChannelError {
    SideChannelError::Malformed("identity frame did not match the expected shape".to_owned())
}

async fn recv_text<S>(source: &mut S) -> Result<String, SideChannelError>
where
    S: futures::Stream<Item = Result<BytesMut, crate::framing::FrameError>> + Unpin,
{
    let frame = source.next().await.ok_or(SideChannelError::Disconnected)??;
    String::from_utf8(frame.to_vec())
        .map_err(|e| SideChannelError::Malformed(e.to_string()))
}

async fn send_text<S>(sink: &mut S, text: &str) -> Result<(), SideChannelError>
where
    S: futures::Sink<Bytes, Error = crate::framing::FrameError> + Unpin,
{
    sink.send(Bytes::copy_from_slice(text.as_bytes())).await?;
    Ok(())
}

impl ServerShared {
    fn conf_public_ip(&self) -> IpAddr {
        self.conf.public_ip.unwrap_or(std::net::Ipv4Addr::UNSPECIFIED.into())
    }
}

/// `{tcp:{ip:{port:[ip,port]}}, udp:{…}}` per SPEC_FULL.md §4.5 step 6.
#[derive(Serialize, Deserialize)]
struct PortMapping {
    tcp: HashMap<String, HashMap<String, (String, u16)>>,
    udp: HashMap<String, HashMap<String, (String, u16)>>,
}

fn build_port_mapping(
    replay: &crate::trace::Replay,
    conf: &ServerConf,
    public_ip: IpAddr,
) -> PortMapping {
    let mut tcp: HashMap<String, HashMap<String, (String, u16)>> = HashMap::new();
    let mut by_ip = tcp.entry(public_ip.to_string()).or_default();
    for port in &replay.tcp_server_ports {
        let published = if conf.original_ports { *port } else { conf.side_channel.port };
        by_ip.insert(port.to_string(), (public_ip.to_string(), published));
    }
    let mut udp: HashMap<String, HashMap<String, (String, u16)>> = HashMap::new();
    let mut udp_by_ip = udp.entry(public_ip.to_string()).or_default();
    for port in &replay.udp_server_ports {
        let published = if conf.original_ports { *port } else { conf.side_channel.port };
        udp_by_ip.insert(port.to_string(), (public_ip.to_string(), published));
    }
    PortMapping { tcp, udp }
}
