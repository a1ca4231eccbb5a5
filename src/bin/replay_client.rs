//! Replay client entry point: loads a replay, drives one run against a
//! server, and maps the outcome to an exit code. See SPEC_FULL.md §4.6/§6.

use std::net::{IpAddr, ToSocketAddrs};

use netreplay::client::{self, perma_data::PermaData};
use netreplay::conf::{self, ClientConf};
use netreplay::log::{self, Format};
use netreplay::trace::TraceStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let conf: ClientConf = conf::load(&args)?;
    let _log_guard = log::init(Format::Term);
    let log = slog_scope::logger();

    let replay_name = find_arg(&args, "--Replay=").ok_or("missing --Replay=<name>")?;
    let test_id: u32 = find_arg(&args, "--Test=").and_then(|s| s.parse().ok()).unwrap_or(0);
    let mutation = find_arg(&args, "--Mutation=").and_then(|s| serde_json::from_str(&s).ok());

    let server_instance = conf::require(conf.server_instance.clone(), "server_instance")?;
    let server_ip = resolve_server(&server_instance)?;

    let pcap_folder = conf::require(conf.pcap_folder.clone(), "pcap_folder")?;
    let mut trace_store = TraceStore::new(&pcap_folder);
    let replay = trace_store.load(&replay_name, false)?;

    let mut identity = PermaData::load_or_create(&conf.perma_data_path)?;
    let history_count = identity.next_history_count()?;
    let real_id = identity.id().to_owned();

    slog::info!(log, "starting replay"; "replay" => &replay_name, "server" => %server_ip, "real_id" => &real_id);

    let result = client::run(
        &conf,
        replay.as_ref(),
        server_ip,
        &real_id,
        history_count,
        test_id,
        mutation,
        &log,
    )
    .await;

    match result {
        Ok(run_result) => {
            slog::info!(
                log, "replay finished";
                "outcome" => ?run_result.outcome,
                "elapsed_seconds" => run_result.elapsed_seconds,
            );
            std::process::exit(match run_result.outcome {
                client::Outcome::Done => 0,
                client::Outcome::Timeout => 2,
                client::Outcome::IpFlip => 3,
            });
        }
        Err(err) => {
            slog::error!(log, "replay failed"; "error" => %err);
            std::process::exit(1);
        }
    }
}

fn find_arg(args: &[String], prefix: &str) -> Option<String> {
    args.iter().find_map(|a| a.strip_prefix(prefix).map(str::to_owned))
}

/// Resolves `instance` as a literal IP, falling back to a DNS lookup.
fn resolve_server(instance: &str) -> std::io::Result<IpAddr> {
    if let Ok(ip) = instance.parse::<IpAddr>() {
        return Ok(ip);
    }
    (instance, 0_u16)
        .to_socket_addrs()?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "could not resolve server address")
        })
}
