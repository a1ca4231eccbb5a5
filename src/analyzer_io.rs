//! Analyzer-facing I/O: persists per-replay metadata and throughput
//! samples for the external analyzer service to consume. See
//! SPEC_FULL.md §4.7.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    path::{Path, PathBuf},
};

use serde::{Serialize, Serializer};
use serde_json::Value;

/// Per-bucket throughput sample: megabits/sec and cumulative seconds,
/// equal-length arrays.
#[derive(Clone, Debug, Serialize)]
pub struct ThroughputSample {
    /// Megabits per second observed in each bucket.
    pub xput: Vec<f64>,
    /// Cumulative seconds at the end of each bucket.
    pub t: Vec<f64>,
}

impl ThroughputSample {
    /// `len(xput) == len(t)`, `t` strictly increasing, every `xput >= 0`
    /// (Testable Property 6).
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.xput.len() == self.t.len()
            && self.xput.iter().all(|&x| x >= 0.0)
            && self.t.windows(2).all(|w| w[1] > w[0])
    }
}

/// The 17 positional fields written into `replayInfo_<realID>_<historyCount>_<testID>.json`.
#[derive(Clone, Debug)]
pub struct ReplayInfo {
    /// Wall-clock time the client first contacted the side channel.
    pub incoming_time: f64,
    /// Client's persistent real ID.
    pub real_id: String,
    /// `real_id`, anonymized for storage alongside public artifacts.
    pub id_anonymized: String,
    /// Observed client IP, anonymized (/24 IPv4, /48 IPv6).
    pub ip_anonymized: IpAddr,
    /// Replay name.
    pub replay_name: String,
    /// Free-form client-supplied annotation.
    pub extra_string: String,
    /// Monotonic per-client test counter.
    pub history_count: u64,
    /// `0` for the baseline run, `1`/`2`/... for subsequent variants.
    pub test_id: u32,
    /// Exceptions observed during the replay (`ContentModification`,
    /// `ipFlip-resolved`, `UnknownReplayName`, or empty).
    pub exceptions: String,
    /// Whether the replay completed without a fatal error.
    pub success: bool,
    /// Whether the replay's data is usable for differentiation analysis
    /// (stricter than `success`).
    pub secondary_success: bool,
    /// Optional client-reported iperf rate, Mbps.
    pub iperf_rate: Option<f64>,
    /// Wall-clock duration of the replay, in seconds.
    pub elapsed_seconds: f64,
    /// Client-reported local clock time at completion.
    pub client_time: f64,
    /// Opaque client-reported mobile network metadata, if any.
    pub mobile_stats: Option<Value>,
    /// Always `false`: regulatory alerting is out of scope for this core.
    pub alerted_arcep: bool,
    /// Client version string.
    pub client_version: String,
}

impl Serialize for ReplayInfo {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeSeq;
        let mut seq = serializer.serialize_seq(Some(17))?;
        seq.serialize_element(&self.incoming_time)?;
        seq.serialize_element(&self.real_id)?;
        seq.serialize_element(&self.id_anonymized)?;
        seq.serialize_element(&self.ip_anonymized.to_string())?;
        seq.serialize_element(&self.replay_name)?;
        seq.serialize_element(&self.extra_string)?;
        seq.serialize_element(&self.history_count)?;
        seq.serialize_element(&self.test_id)?;
        seq.serialize_element(&self.exceptions)?;
        seq.serialize_element(&self.success)?;
        seq.serialize_element(&self.secondary_success)?;
        seq.serialize_element(&self.iperf_rate)?;
        seq.serialize_element(&self.elapsed_seconds)?;
        seq.serialize_element(&self.client_time)?;
        seq.serialize_element(&self.mobile_stats)?;
        seq.serialize_element(&self.alerted_arcep)?;
        seq.serialize_element(&self.client_version)?;
        seq.end()
    }
}

/// Zeroes the last octet of an IPv4 address (a /24 mask) or the last 80
/// bits of an IPv6 address (a /48 mask).
#[must_use]
pub fn anonymize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            IpAddr::V4(Ipv4Addr::new(a, b, c, 0))
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            IpAddr::V6(Ipv6Addr::new(
                segments[0], segments[1], segments[2], 0, 0, 0, 0, 0,
            ))
        }
    }
}

/// Writer for the per-client analyzer artifacts under
/// `results_folder/tmpResults/<realID>/`.
pub struct AnalyzerIo {
    results_folder: PathBuf,
}

impl AnalyzerIo {
    /// Roots the writer at `results_folder` (`ServerConf::results_folder`).
    #[must_use]
    pub fn new(results_folder: impl Into<PathBuf>) -> Self {
        Self { results_folder: results_folder.into() }
    }

    fn client_dir(&self, real_id: &str) -> PathBuf {
        self.results_folder.join(real_id)
    }

    /// Writes `clientXputs/Xput_<realID>_<historyCount>_<testID>.json`.
    ///
    /// # Errors
    ///
    /// Errors on any failure creating directories or writing the file.
    pub fn write_xput(
        &self,
        real_id: &str,
        history_count: u64,
        test_id: u32,
        sample: &ThroughputSample,
    ) -> io::Result<PathBuf> {
        let dir = self.client_dir(real_id).join("clientXputs");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!(
            "Xput_{real_id}_{history_count}_{test_id}.json"
        ));
        let body = serde_json::to_vec(&(&sample.xput, &sample.t))?;
        std::fs::write(&path, body)?;
        Ok(path)
    }

    /// Writes `replayInfo/replayInfo_<realID>_<historyCount>_<testID>.json`.
    ///
    /// # Errors
    ///
    /// Errors on any failure creating directories or writing the file.
    pub fn write_replay_info(
        &self,
        real_id: &str,
        history_count: u64,
        test_id: u32,
        info: &ReplayInfo,
    ) -> io::Result<PathBuf> {
        let dir = self.client_dir(real_id).join("replayInfo");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!(
            "replayInfo_{real_id}_{history_count}_{test_id}.json"
        ));
        let body = serde_json::to_vec(info)?;
        std::fs::write(&path, body)?;
        Ok(path)
    }

    /// Destination a cleaned pcap should be moved to:
    /// `tcpdumpsResults/<realID>/`.
    #[must_use]
    pub fn pcap_destination(&self, real_id: &str) -> PathBuf {
        self.client_dir(real_id).join("tcpdumpsResults")
    }
}

/// Returns the directory a pcap capture for `real_id` should initially be
/// written to, before any post-processing moves it under
/// [`AnalyzerIo::pcap_destination`].
#[must_use]
pub fn scratch_pcap_dir(root: &Path, real_id: &str) -> PathBuf {
    root.join(real_id).join("tcpdumps")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymizes_ipv4_to_slash_24() {
        let ip: IpAddr = "198.51.100.42".parse().unwrap();
        assert_eq!(anonymize_ip(ip), "198.51.100.0".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn anonymizes_ipv6_to_slash_48() {
        let ip: IpAddr = "2001:db8:1234:5678::1".parse().unwrap();
        assert_eq!(
            anonymize_ip(ip),
            "2001:db8:1234::".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn throughput_sample_well_formed() {
        let sample = ThroughputSample { xput: vec![1.0, 2.0], t: vec![0.22, 0.44] };
        assert!(sample.is_well_formed());
    }

    #[test]
    fn throughput_sample_rejects_non_monotonic_t() {
        let sample = ThroughputSample { xput: vec![1.0, 2.0], t: vec![0.5, 0.3] };
        assert!(!sample.is_well_formed());
    }

    #[test]
    fn replay_info_serializes_as_17_element_array() {
        let info = ReplayInfo {
            incoming_time: 0.0,
            real_id: "abc123".into(),
            id_anonymized: "abc1**".into(),
            ip_anonymized: "198.51.100.0".parse().unwrap(),
            replay_name: "youtube-360p".into(),
            extra_string: String::new(),
            history_count: 1,
            test_id: 0,
            exceptions: String::new(),
            success: true,
            secondary_success: true,
            iperf_rate: None,
            elapsed_seconds: 10.2,
            client_time: 0.0,
            mobile_stats: None,
            alerted_arcep: false,
            client_version: "1.0".into(),
        };
        let value: Value = serde_json::to_value(&info).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 17);
    }
}
