//! Replay server entry point: side channel plus one TCP/UDP flow server
//! per published port. See SPEC_FULL.md §4.3-§4.5.

use std::{collections::HashSet, net::SocketAddr, sync::Arc};

use tokio::net::TcpListener;

use netreplay::conf::{self, ServerConf};
use netreplay::log::{self, Format};
use netreplay::server::{self, udp::UdpFlowServer, ServerShared};
use netreplay::trace::TraceStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let conf: ServerConf = conf::load(&args)?;
    let _log_guard = log::init(Format::Term);
    let log = slog_scope::logger();

    if conf.public_ip.is_none() {
        slog::warn!(log, "public_ip not configured, advertising the unspecified address; \
            only correct when client and server share a host");
    }

    let pcap_folder = conf::require(conf.pcap_folder.clone(), "pcap_folder")?;
    let mut trace_store = TraceStore::new(&pcap_folder);
    let mut tcp_ports = HashSet::new();
    let mut udp_ports = HashSet::new();

    for entry in std::fs::read_dir(&pcap_folder)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        match trace_store.load(&name, !conf.original_ips) {
            Ok(replay) => {
                tcp_ports.extend(replay.tcp_server_ports.iter().copied());
                udp_ports.extend(replay.udp_server_ports.iter().copied());
            }
            Err(err) => {
                slog::warn!(log, "failed to load replay at startup"; "name" => %name, "error" => %err);
            }
        }
    }

    slog::info!(log, "loaded replays"; "tcp_ports" => tcp_ports.len(), "udp_ports" => udp_ports.len());

    let shared = ServerShared::new(conf.clone(), trace_store, log.clone());

    let sc_addr: SocketAddr = ([0, 0, 0, 0], conf.side_channel.port).into();
    let sc_listener = TcpListener::bind(sc_addr).await?;
    let mut tasks = vec![tokio::spawn(server::side_channel::run(
        Arc::clone(&shared),
        sc_listener,
    ))];

    let flow_tcp_ports: Vec<u16> = if conf.original_ports {
        tcp_ports.into_iter().collect()
    } else {
        vec![conf.side_channel.port]
    };
    for port in flow_tcp_ports {
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let listener = TcpListener::bind(addr).await?;
        let shared = Arc::clone(&shared);
        let task_log = log.clone();
        tokio::spawn(async move {
            if let Err(err) = server::tcp::serve(shared, listener).await {
                slog::error!(task_log, "tcp flow server exited"; "port" => port, "error" => %err);
            }
        });
    }

    let flow_udp_ports: Vec<u16> = if conf.original_ports {
        udp_ports.into_iter().collect()
    } else {
        vec![conf.side_channel.port]
    };
    for port in flow_udp_ports {
        let udp_server = Arc::new(UdpFlowServer::bind(port).await?);
        shared.register_udp_server(port, Arc::clone(&udp_server)).await;
        let shared = Arc::clone(&shared);
        let task_log = log.clone();
        tokio::spawn(async move {
            if let Err(err) = udp_server.serve(shared).await {
                slog::error!(task_log, "udp flow server exited"; "port" => port, "error" => %err);
            }
        });
    }

    slog::info!(log, "replay server started");

    // The side channel is the only accept loop whose exit should end the
    // process; the TCP/UDP flow servers above run detached.
    for task in tasks.drain(..) {
        task.await??;
    }
    Ok(())
}
