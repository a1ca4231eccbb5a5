//! Per-client session state held across one side-channel connection.

use std::{collections::HashSet, net::IpAddr, time::Instant};

use serde_json::Value;

use crate::mutate::Mutation;
use crate::tcpdump::TcpdumpHandle;

/// Transient state for one admitted client, created on side-channel accept
/// and torn down by the close callback. Mirrors the upstream `ClientObj`.
pub struct ClientSession {
    /// Client's persistent real ID.
    pub real_id: String,
    /// Observed data-plane/side-channel source IP.
    pub observed_ip: IpAddr,
    /// Client-reported data-plane IP, if it differs (behind NAT/proxy).
    pub reported_ip: Option<IpAddr>,
    /// Replay name requested.
    pub replay_name: String,
    /// Test ID within the client's session.
    pub test_id: u32,
    /// Free-form client annotation.
    pub extra_string: String,
    /// Monotonic per-client test counter.
    pub history_count: u64,
    /// Whether the client requested the admission slot be released at the
    /// end of this test.
    pub end_of_test: bool,
    /// Client version string reported in step 1.
    pub client_version: String,
    /// When this session was accepted, for computing elapsed durations.
    pub start_time: Instant,
    /// Wall-clock time the side channel accepted this session, Unix
    /// seconds with sub-second precision, for [`ReplayInfo::incoming_time`].
    ///
    /// [`ReplayInfo::incoming_time`]: crate::analyzer_io::ReplayInfo::incoming_time
    pub start_wall_time: f64,
    /// Exceptions accumulated during the replay
    /// (`ContentModification`, `ipFlip-resolved`, `UnknownReplayName`, or
    /// empty).
    pub exceptions: String,
    /// Whether the replay completed without a fatal error.
    pub success: bool,
    /// Whether the replay's data is fit for differentiation analysis.
    pub secondary_success: bool,
    /// Client-reported iperf rate, if any.
    pub iperf_rate: Option<f64>,
    /// Client-reported mobile network metadata, if any.
    pub mobile_stats: Option<Value>,
    /// Data-plane ports this client has touched, for S-U mapping cleanup.
    pub ports: HashSet<u16>,
    /// Data-plane hosts this client has touched.
    pub hosts: HashSet<IpAddr>,
    /// Server-side mutation spec for this test, if any.
    pub mutation: Option<Mutation>,
    /// Running packet capture, if enabled.
    pub tcpdump: Option<TcpdumpHandle>,
}

impl ClientSession {
    /// Appends `exception` to the session's exception list, comma
    /// separated, matching the upstream's accumulation of multiple
    /// exception strings on one session.
    pub fn add_exception(&mut self, exception: &str) {
        if self.exceptions.is_empty() {
            self.exceptions = exception.to_owned();
        } else {
            self.exceptions.push(',');
            self.exceptions.push_str(exception);
        }
    }
}

/// Posted by a UDP flow sender to notify the side channel a datagram
/// stream has started or finished, so the SC can forward
/// `STARTED;<port>`/`DONE;<port>` to the matching client connection.
#[derive(Clone, Debug)]
pub enum Notification {
    /// A UDP sender for `port` has started streaming.
    Started { observed_ip: IpAddr, port: u16 },
    /// A UDP sender for `port` has finished streaming.
    Done { observed_ip: IpAddr, port: u16 },
}
