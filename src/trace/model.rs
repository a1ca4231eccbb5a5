//! In-memory shape of a loaded replay. Deserialized from the on-disk
//! artifact described in SPEC_FULL.md §6, which re-encodes as JSON what the
//! upstream parser originally emitted as pickle.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Identifies one original TCP or UDP flow:
/// `<clientIP>.<clientPort>-<serverIP>.<serverPort>`.
pub type FlowKey = String;

/// Transport protocol of a client event or flow.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
}

/// One payload the client transmitted during the original capture.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ClientEvent {
    /// Seconds since replay start.
    pub timestamp: f64,
    /// Flow this event belongs to.
    pub flow_key: FlowKey,
    /// Transport protocol.
    pub protocol: Protocol,
    /// Decoded payload bytes.
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    /// For TCP events, the length of the response expected before the next
    /// request is sent. `None` for UDP.
    pub expected_response_len: Option<usize>,
}

/// One scripted server response.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OneResponse {
    /// Decoded payload bytes.
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    /// Seconds since replay start.
    pub timestamp: f64,
}

/// The server's scripted reply to one client request, keyed implicitly by
/// its position within a [`TcpFlowScript`].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ResponseSet {
    /// Length, in bytes, of the original request this response set replies
    /// to.
    pub request_len: usize,
    /// SHA-1 of the original request, hex-encoded.
    pub request_hash: String,
    /// Ordered scripted responses.
    pub responses: Vec<OneResponse>,
}

/// Ordered scripted responses for one TCP flow.
pub type TcpFlowScript = Vec<ResponseSet>;

/// One scripted server-to-client UDP datagram.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UdpEvent {
    /// Decoded payload bytes.
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    /// Seconds since replay start.
    pub timestamp: f64,
}

/// Server-side script for one replay: TCP responses keyed by flow, UDP
/// datagrams keyed by original server port then original client port.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ServerScript {
    /// TCP flow scripts, keyed by flow key.
    pub tcp: HashMap<FlowKey, TcpFlowScript>,
    /// UDP datagram scripts, keyed by server port then client port.
    pub udp: HashMap<u16, HashMap<u16, Vec<UdpEvent>>>,
}

/// Header fields extracted from a GET request's first line and header
/// block, used by the GET-similarity fallback matcher in
/// [`crate::trace::store::TraceStore::lookup_tcp`].
pub type HeaderMap = HashMap<String, String>;

/// One fully-loaded replay: the client's original event sequence plus the
/// server's scripted responses, fingerprinting data, and bookkeeping.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Replay {
    /// Replay name, e.g. `youtube-360p`. Always stored with `-` separators;
    /// `_`-separated on-disk names are normalized on load.
    pub name: String,
    /// Original client events, in capture order.
    pub client_events: Vec<ClientEvent>,
    /// Distinct flow keys of the replay's TCP flows.
    pub tcp_flow_keys: Vec<FlowKey>,
    /// Ephemeral client-side UDP source ports used in the capture.
    pub udp_client_ports: Vec<u16>,
    /// Server-side scripted responses.
    pub server_script: ServerScript,
    /// GET-similarity fallback index, keyed by flow key.
    pub get_index: HashMap<FlowKey, HeaderMap>,
    /// Distinct server TCP ports this replay uses.
    pub tcp_server_ports: Vec<u16>,
    /// Distinct server UDP ports this replay uses.
    pub udp_server_ports: Vec<u16>,
    /// Wall duration of the original capture, in seconds, read from the
    /// last line of `packetMeta.tsv` (field index 2). `None` when that file
    /// is missing or empty, in which case callers fall back to a fixed
    /// sampling interval.
    pub replay_duration_secs: Option<f64>,
}

impl Replay {
    /// Normalizes a replay name read from a filename (which may use `_` in
    /// place of `-`) to its canonical `-`-separated external form.
    #[must_use]
    pub fn canonical_name(raw: &str) -> String {
        raw.replace('_', "-")
    }
}

/// Serializes/deserializes a byte vector as a lowercase hex string, the
/// on-disk encoding every payload uses.
mod hex_bytes {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(
        bytes: &[u8],
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(D::Error::custom)
    }
}
