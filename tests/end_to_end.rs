//! End-to-end coverage of the side channel plus TCP flow server against
//! the client driver, over real loopback sockets. See SPEC_FULL.md §8
//! (E1/E2 scenarios).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde_json::json;
use slog::{Discard, Logger};
use tempfile::TempDir;
use tokio::net::TcpListener;

use netreplay::client;
use netreplay::conf::{ClientConf, ServerConf};
use netreplay::server::{self, ServerShared};
use netreplay::trace::TraceStore;

const REPLAY_NAME: &str = "sample-replay";

fn test_log() -> Logger {
    Logger::root(Discard, slog::o!())
}

/// Writes a minimal one-flow replay fixture under `root/<REPLAY_NAME>/`,
/// in the same `client_all.json`/`server_all.json` shape
/// `trace::store::TraceStore::load` reads.
fn write_fixture(root: &std::path::Path, tcp_server_port: u16) {
    let dir = root.join(REPLAY_NAME);
    std::fs::create_dir_all(&dir).unwrap();

    let flow_key = format!("127.0.0.1.40001-127.0.0.1.{tcp_server_port}");
    let request_hex = hex::encode(b"hello-server");
    let response_hex = hex::encode(b"hello-client");

    let client_all = json!({
        "client_events": [{
            "timestamp": 0.0,
            "flow_key": flow_key,
            "protocol": "tcp",
            "payload": request_hex,
            "expected_response_len": 12,
        }],
        "udp_client_ports": [],
        "tcp_flow_keys": [flow_key],
        "replay_name": REPLAY_NAME,
    });

    let server_all = json!({
        "server_script": {
            "tcp": {
                flow_key: [{
                    "request_len": 12,
                    "request_hash": "",
                    "responses": [{"payload": response_hex, "timestamp": 0.0}],
                }],
            },
            "udp": {},
        },
        "get_index": {},
        "tcp_server_ports": [tcp_server_port],
        "udp_server_ports": [],
    });

    std::fs::write(dir.join("client_all.json"), client_all.to_string()).unwrap();
    std::fs::write(dir.join("server_all.json"), server_all.to_string()).unwrap();
}

fn base_server_conf(pcap_folder: &std::path::Path, results_folder: &std::path::Path) -> ServerConf {
    ServerConf {
        pcap_folder: Some(pcap_folder.to_owned()),
        results_folder: results_folder.to_owned(),
        original_ports: true,
        timing: false,
        bucket_count: 10,
        public_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        ..Default::default()
    }
}

fn base_client_conf(pcap_folder: &std::path::Path, side_channel_port: u16) -> ClientConf {
    let mut conf = ClientConf { pcap_folder: Some(pcap_folder.to_owned()), timing: false, ..Default::default() };
    conf.side_channel.port = side_channel_port;
    conf.max_idle_time = std::time::Duration::from_secs(5);
    conf
}

/// A client that knows a replay the server also has admits and completes
/// the full TCP exchange, ending in `Outcome::Done`.
#[tokio::test]
async fn admitted_replay_runs_to_completion() {
    let pcap_dir = TempDir::new().unwrap();
    let results_dir = TempDir::new().unwrap();

    let flow_listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await.unwrap();
    let tcp_port = flow_listener.local_addr().unwrap().port();
    write_fixture(pcap_dir.path(), tcp_port);

    let mut server_store = TraceStore::new(pcap_dir.path());
    server_store.load(REPLAY_NAME, false).unwrap();
    let shared = ServerShared::new(
        base_server_conf(pcap_dir.path(), results_dir.path()),
        server_store,
        test_log(),
    );

    let sc_listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await.unwrap();
    let sc_port = sc_listener.local_addr().unwrap().port();
    tokio::spawn(server::side_channel::run(std::sync::Arc::clone(&shared), sc_listener));
    tokio::spawn(server::tcp::serve(std::sync::Arc::clone(&shared), flow_listener));

    let mut client_store = TraceStore::new(pcap_dir.path());
    let replay = client_store.load(REPLAY_NAME, false).unwrap();

    let conf = base_client_conf(pcap_dir.path(), sc_port);
    let result = client::run(
        &conf,
        replay.as_ref(),
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        "real-id-1",
        0,
        1,
        None,
        &test_log(),
    )
    .await
    .expect("replay should complete");

    assert_eq!(result.outcome, client::Outcome::Done);
}

/// A replay name the server's trace store can't load is denied admission
/// with the `UnknownReplay` wire code, surfaced as
/// `ClientDriverError::AdmissionDenied(1)`.
#[tokio::test]
async fn unknown_replay_is_denied() {
    let client_pcap_dir = TempDir::new().unwrap();
    let server_pcap_dir = TempDir::new().unwrap();
    let results_dir = TempDir::new().unwrap();

    write_fixture(client_pcap_dir.path(), 0);

    let server_store = TraceStore::new(server_pcap_dir.path());
    let shared = ServerShared::new(
        base_server_conf(server_pcap_dir.path(), results_dir.path()),
        server_store,
        test_log(),
    );

    let sc_listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await.unwrap();
    let sc_port = sc_listener.local_addr().unwrap().port();
    tokio::spawn(server::side_channel::run(std::sync::Arc::clone(&shared), sc_listener));

    let mut client_store = TraceStore::new(client_pcap_dir.path());
    let replay = client_store.load(REPLAY_NAME, false).unwrap();

    let conf = base_client_conf(client_pcap_dir.path(), sc_port);
    let err = client::run(
        &conf,
        replay.as_ref(),
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        "real-id-2",
        0,
        1,
        None,
        &test_log(),
    )
    .await
    .expect_err("server has no such replay, admission should be denied");

    assert!(matches!(err, netreplay::error::ClientDriverError::AdmissionDenied(1)));
}
