//! Loads and indexes replay artifacts. See SPEC_FULL.md §4.1.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use sha1::{Digest, Sha1};

use crate::error::TraceStoreError;

use super::model::{FlowKey, HeaderMap, Replay};

/// Number of leading bytes of a TCP flow's first client packet that are
/// hashed to build the fingerprint table.
pub const FINGERPRINT_SAMPLE_SIZE: usize = 400;

/// `(replay name, flow key)`, the value a fingerprint or GET-similarity
/// lookup resolves to.
pub type FlowRef = (String, FlowKey);

/// In-memory index over every replay loaded so far: the replays
/// themselves, a fingerprint table keyed by SHA-1 of the first
/// [`FINGERPRINT_SAMPLE_SIZE`] bytes of each TCP flow's first client
/// packet, and a GET-similarity fallback index.
#[derive(Default)]
pub struct TraceStore {
    root: PathBuf,
    replays: HashMap<String, Arc<Replay>>,
    fingerprints: HashMap<[u8; 20], FlowRef>,
}

impl TraceStore {
    /// Creates an empty store rooted at `root`, the directory the trace
    /// parser writes replay folders into (`pcap_folder` in [`crate::conf`]).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), replays: HashMap::new(), fingerprints: HashMap::new() }
    }

    /// Loads a replay by name if not already cached, folding its scripts
    /// across original server IPs when `merge_ips` is true (§4.1 "merge
    /// mode"). Accepts both `-` and `_` separators in `name`.
    ///
    /// # Errors
    ///
    /// Errors if the artifact files are missing, malformed, or contain a
    /// payload that fails to hex-decode.
    pub fn load(
        &mut self,
        name: &str,
        merge_ips: bool,
    ) -> Result<Arc<Replay>, TraceStoreError> {
        let canonical = Replay::canonical_name(name);
        if let Some(replay) = self.replays.get(&canonical) {
            return Ok(Arc::clone(replay));
        }

        let mut replay = read_artifact(&self.root, &canonical)?;
        if merge_ips {
            merge_by_port(&mut replay);
        }

        self.index_fingerprints(&replay);

        let replay = Arc::new(replay);
        self.replays.insert(canonical, Arc::clone(&replay));
        Ok(replay)
    }

    /// Returns an already-loaded replay by name, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Replay>> {
        self.replays.get(&Replay::canonical_name(name)).cloned()
    }

    fn index_fingerprints(&mut self, replay: &Replay) {
        for flow_key in &replay.tcp_flow_keys {
            let first = match first_client_payload(replay, flow_key) {
                Some(first) => first,
                None => continue,
            };
            let sample = &first[..first.len().min(FINGERPRINT_SAMPLE_SIZE)];
            let hash = sha1_array(sample);
            self.fingerprints
                .insert(hash, (replay.name.clone(), flow_key.clone()));
        }
    }

    /// Resolves the first bytes of a brand-new TCP connection to a
    /// `(replay, flow key)` pair.
    ///
    /// First tries an exact fingerprint match on the first
    /// [`FINGERPRINT_SAMPLE_SIZE`] bytes. On a miss, if `first_bytes`
    /// begins with `GET`, falls back to comparing the parsed request line
    /// and headers against every loaded replay's GET-similarity index by
    /// signed edit distance (+1 per mismatching key, -1 per match),
    /// returning the closest candidate. Returns `None` on a miss with no
    /// GET fallback available.
    #[must_use]
    pub fn lookup_tcp(&self, first_bytes: &[u8]) -> Option<FlowRef> {
        let sample = &first_bytes[..first_bytes.len().min(FINGERPRINT_SAMPLE_SIZE)];
        let hash = sha1_array(sample);
        if let Some(hit) = self.fingerprints.get(&hash) {
            return Some(hit.clone());
        }

        if !first_bytes.starts_with(b"GET") {
            return None;
        }
        let headers = parse_http_headers(first_bytes)?;
        self.closest_get_match(&headers)
    }

    fn closest_get_match(&self, headers: &HeaderMap) -> Option<FlowRef> {
        let mut best: Option<(i64, FlowRef)> = None;
        for replay in self.replays.values() {
            for (flow_key, candidate) in &replay.get_index {
                if candidate.get("GET") == headers.get("GET") {
                    return Some((replay.name.clone(), flow_key.clone()));
                }
                let distance = header_distance(headers, candidate);
                if best.as_ref().map_or(true, |(d, _)| distance < *d) {
                    best = Some((
                        distance,
                        (replay.name.clone(), flow_key.clone()),
                    ));
                }
            }
        }
        best.map(|(_, flow_ref)| flow_ref)
    }
}

/// Signed edit distance over header keys: -1 for every key both maps
/// agree on (same value), +1 for every key present in only one or with
/// differing values.
fn header_distance(a: &HeaderMap, b: &HeaderMap) -> i64 {
    let mut distance = 0_i64;
    let keys = a.keys().chain(b.keys()).collect::<std::collections::HashSet<_>>();
    for key in keys {
        match (a.get(key), b.get(key)) {
            (Some(x), Some(y)) if x == y => distance -= 1,
            _ => distance += 1,
        }
    }
    distance
}

fn parse_http_headers(bytes: &[u8]) -> Option<HeaderMap> {
    let text = std::str::from_utf8(bytes).ok()?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next()?;
    let mut headers = HeaderMap::new();
    headers.insert("GET".to_owned(), request_line.to_owned());
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_owned(), value.trim().to_owned());
        }
    }
    Some(headers)
}

fn first_client_payload<'a>(
    replay: &'a Replay,
    flow_key: &FlowKey,
) -> Option<&'a [u8]> {
    replay
        .client_events
        .iter()
        .filter(|e| &e.flow_key == flow_key)
        .min_by(|a, b| a.timestamp.partial_cmp(&b.timestamp).unwrap())
        .map(|e| e.payload.as_slice())
}

fn sha1_array(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0_u8; 20];
    out.copy_from_slice(&digest);
    out
}

/// Reads `client_all.json` and `server_all.json` from `root/name/` and
/// assembles a [`Replay`].
fn read_artifact(root: &Path, name: &str) -> Result<Replay, TraceStoreError> {
    let dir = root.join(name);
    if !dir.is_dir() {
        return Err(TraceStoreError::UnknownReplay(name.to_owned()));
    }

    #[derive(serde::Deserialize)]
    struct ClientAllArtifact {
        client_events: Vec<super::model::ClientEvent>,
        udp_client_ports: Vec<u16>,
        tcp_flow_keys: Vec<FlowKey>,
        replay_name: String,
    }

    #[derive(serde::Deserialize)]
    struct ServerAllArtifact {
        server_script: super::model::ServerScript,
        get_index: HashMap<FlowKey, HeaderMap>,
        tcp_server_ports: Vec<u16>,
        udp_server_ports: Vec<u16>,
    }

    let client_raw = std::fs::read_to_string(dir.join("client_all.json"))?;
    let client: ClientAllArtifact = serde_json::from_str(&client_raw)?;

    let server_raw = std::fs::read_to_string(dir.join("server_all.json"))?;
    let server: ServerAllArtifact = serde_json::from_str(&server_raw)?;

    let replay_duration_secs = read_packet_meta_duration(&dir.join("packetMeta.tsv"));

    Ok(Replay {
        name: Replay::canonical_name(&client.replay_name),
        client_events: client.client_events,
        tcp_flow_keys: client.tcp_flow_keys,
        udp_client_ports: client.udp_client_ports,
        server_script: server.server_script,
        get_index: server.get_index,
        tcp_server_ports: server.tcp_server_ports,
        udp_server_ports: server.udp_server_ports,
        replay_duration_secs,
    })
}

/// Reads the replay's wall duration from `packetMeta.tsv`'s last line,
/// field index 2 (tab-separated seconds), per SPEC_FULL.md §6. Missing or
/// malformed files yield `None` rather than a load error, since the
/// sampling interval this feeds has a fixed-duration fallback.
fn read_packet_meta_duration(path: &Path) -> Option<f64> {
    let contents = std::fs::read_to_string(path).ok()?;
    let last_line = contents.lines().filter(|l| !l.trim().is_empty()).last()?;
    last_line.split('\t').nth(2)?.trim().parse().ok()
}

/// Folds the server script's UDP (and, symmetrically, TCP) entries across
/// all original server ports that share the same port number onto a
/// single logical script, sorting the merged event list by timestamp.
/// This is what lets a replay with several original server IPs be served
/// from one public address (`original_ips = false`).
fn merge_by_port(replay: &mut Replay) {
    let mut merged_udp: HashMap<u16, HashMap<u16, Vec<super::model::UdpEvent>>> =
        HashMap::new();
    for (server_port, by_client_port) in replay.server_script.udp.drain() {
        let entry = merged_udp.entry(server_port).or_default();
        for (client_port, mut events) in by_client_port {
            entry.entry(client_port).or_default().append(&mut events);
        }
    }
    for events in merged_udp.values_mut().flat_map(HashMap::values_mut) {
        events.sort_by(|a, b| a.timestamp.partial_cmp(&b.timestamp).unwrap());
    }
    replay.server_script.udp = merged_udp;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::model::{ClientEvent, OneResponse, Protocol, ResponseSet, ServerScript};

    fn sample_replay() -> Replay {
        let flow_key = "1.2.3.4.1000-5.6.7.8.80".to_owned();
        let mut tcp = HashMap::new();
        tcp.insert(
            flow_key.clone(),
            vec![ResponseSet {
                request_len: 6,
                request_hash: String::new(),
                responses: vec![OneResponse { payload: b"world\n".to_vec(), timestamp: 0.1 }],
            }],
        );
        Replay {
            name: "sample".to_owned(),
            client_events: vec![ClientEvent {
                timestamp: 0.0,
                flow_key: flow_key.clone(),
                protocol: Protocol::Tcp,
                payload: b"hello\n".to_vec(),
                expected_response_len: Some(6),
            }],
            tcp_flow_keys: vec![flow_key],
            udp_client_ports: vec![],
            server_script: ServerScript { tcp, udp: HashMap::new() },
            get_index: HashMap::new(),
            tcp_server_ports: vec![80],
            udp_server_ports: vec![],
            replay_duration_secs: None,
        }
    }

    #[test]
    fn fingerprint_round_trips() {
        let replay = sample_replay();
        let mut store = TraceStore::new(".");
        store.index_fingerprints(&replay);
        store.replays.insert(replay.name.clone(), Arc::new(replay.clone()));

        let hit = store.lookup_tcp(b"hello\n").expect("fingerprint hit");
        assert_eq!(hit, (replay.name.clone(), replay.tcp_flow_keys[0].clone()));
    }

    #[test]
    fn canonical_name_normalizes_underscores() {
        assert_eq!(Replay::canonical_name("youtube_360p"), "youtube-360p");
    }

    #[test]
    fn packet_meta_duration_reads_last_line_third_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("packetMeta.tsv");
        std::fs::write(&path, "0\tup\t0.0\n1\tdown\t5.0\n2\tup\t12.340\n").unwrap();
        assert_eq!(read_packet_meta_duration(&path), Some(12.34));
    }

    #[test]
    fn packet_meta_duration_missing_file_is_none() {
        assert_eq!(read_packet_meta_duration(Path::new("/no/such/packetMeta.tsv")), None);
    }
}
