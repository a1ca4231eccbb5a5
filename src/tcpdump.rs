//! Scoped `tcpdump` child-process lifecycle.
//!
//! Packet capture and pcap anonymization themselves are out of scope
//! (spec.md §1); this module only owns the acquire-on-admission,
//! release-in-close-callback lifecycle of the child process, grounded on
//! the original `tcpdump` class (`start` blocks until the process confirms
//! it is listening on its first stderr line; `stop` terminates and reaps
//! it).

use std::{path::PathBuf, process::Stdio};

use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};

/// A running `tcpdump` capture, scoped to one client's replay.
pub struct TcpdumpHandle {
    child: tokio::process::Child,
    out_file: PathBuf,
}

impl TcpdumpHandle {
    /// Starts `tcpdump -w out_file [-i interface] [host]`, waiting for its
    /// first line of stderr (tcpdump always announces "listening on ..."
    /// there) before returning, so the caller knows capture has begun
    /// before traffic starts flowing.
    ///
    /// # Errors
    ///
    /// Errors if the child process cannot be spawned or its stderr closes
    /// before emitting anything.
    pub async fn start(
        out_file: PathBuf,
        interface: Option<&str>,
        host: Option<&str>,
    ) -> std::io::Result<Self> {
        let mut cmd = Command::new("tcpdump");
        cmd.arg("-w").arg(&out_file);
        if let Some(iface) = interface {
            cmd.arg("-i").arg(iface);
        }
        if let Some(host) = host {
            cmd.arg("host").arg(host);
        }
        cmd.stderr(Stdio::piped()).stdout(Stdio::null());

        let mut child = cmd.spawn()?;
        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            let _ = lines.next_line().await?;
        }

        Ok(Self { child, out_file })
    }

    /// Path `tcpdump` is writing the capture to.
    #[must_use]
    pub fn out_file(&self) -> &std::path::Path {
        &self.out_file
    }

    /// Terminates the child and waits for it to exit. Idempotent-safe to
    /// call on every replay exit path (normal completion, timeout, IP
    /// flip, or cancellation).
    pub async fn stop(mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

/// Hook for the pcap post-processing step the upstream `clean_pcap`
/// performs (port filter, truncate, IP-anonymizing rewrite). Explicitly
/// out of scope for this crate per spec.md §1; the trait exists so a real
/// implementation can be plugged in without touching capture lifecycle.
#[async_trait::async_trait]
pub trait PcapPostProcessor: Send + Sync {
    /// Post-processes the pcap at `path`, returning the path it ends up
    /// at (which may differ if the processor moves the file).
    async fn process(&self, path: &std::path::Path) -> std::io::Result<PathBuf>;
}

/// A [`PcapPostProcessor`] that performs no processing and returns the
/// input path unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopPostProcessor;

#[async_trait::async_trait]
impl PcapPostProcessor for NoopPostProcessor {
    async fn process(&self, path: &std::path::Path) -> std::io::Result<PathBuf> {
        Ok(path.to_owned())
    }
}
