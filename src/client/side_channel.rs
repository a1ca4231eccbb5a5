//! Client-side side channel: identification, admission, mapping receipt,
//! progress, and result exchange. Mirrors [`crate::server::side_channel`]
//! step for step. See SPEC_FULL.md §4.6/§4.5.

use std::{collections::HashMap, net::IpAddr, time::Duration};

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpStream, time::timeout};
use tokio_util::codec::Framed;

use crate::analyzer_io::ThroughputSample;
use crate::error::ClientDriverError;
use crate::framing::SideChannelCodec;
use crate::mutate::Mutation;

/// `{tcp:{ip:{port:[ip,port]}}, udp:{…}}`, mirroring the server's
/// `PortMapping`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PortMapping {
    /// TCP port mapping, keyed by original server IP then original port.
    pub tcp: HashMap<String, HashMap<String, (String, u16)>>,
    /// UDP port mapping, keyed by original server IP then original port.
    pub udp: HashMap<String, HashMap<String, (String, u16)>>,
}

/// Admission verdict as received in step 3.
#[derive(Clone, Debug)]
pub enum Admission {
    /// Admitted. Carries the public server IP and advertised bucket
    /// count.
    Admitted { public_ip: IpAddr, bucket_count: u32 },
    /// Denied with the given wire code.
    Denied(u8),
}

/// A connected client-side side channel.
pub struct SideChannel {
    framed: Framed<TcpStream, SideChannelCodec>,
    read_timeout: Duration,
}

impl SideChannel {
    /// Connects to the server's side-channel port.
    ///
    /// # Errors
    ///
    /// Errors if the TCP connection cannot be established.
    pub async fn connect(
        addr: (IpAddr, u16),
        read_timeout: Duration,
    ) -> Result<Self, ClientDriverError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self { framed: Framed::new(stream, SideChannelCodec), read_timeout })
    }

    /// Step 1: sends
    /// `realID;testID;replayName;extra;historyCount;endOfTest;realIP;version`.
    ///
    /// # Errors
    ///
    /// Errors on any I/O or framing failure.
    #[allow(clippy::too_many_arguments)]
    pub async fn identify(
        &mut self,
        real_id: &str,
        test_id: u32,
        replay_name: &str,
        extra_string: &str,
        history_count: u64,
        end_of_test: bool,
        real_ip: Option<IpAddr>,
        version: &str,
    ) -> Result<(), ClientDriverError> {
        let real_ip = real_ip.map_or(String::new(), |ip| ip.to_string());
        let message = format!(
            "{real_id};{test_id};{replay_name};{extra_string};{history_count};{end_of_test};{real_ip};{version}"
        );
        self.send_text(&message).await
    }

    /// Step 2: sends the mutation spec as a JSON triple.
    ///
    /// # Errors
    ///
    /// Errors on any I/O or framing failure.
    pub async fn send_mutation_spec(
        &mut self,
        mutation: &Mutation,
    ) -> Result<(), ClientDriverError> {
        let body = serde_json::to_string(mutation).unwrap_or_default();
        self.send_text(&body).await
    }

    /// Step 3: awaits the admission verdict.
    ///
    /// # Errors
    ///
    /// Errors if the frame cannot be read or parsed.
    pub async fn ask_permission(&mut self) -> Result<Admission, ClientDriverError> {
        let text = self.recv_text().await?;
        let mut parts = text.split(';');
        match parts.next() {
            Some("1") => {
                let ip: IpAddr = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(std::net::Ipv4Addr::UNSPECIFIED.into());
                let bucket_count = parts.next().and_then(|s| s.parse().ok()).unwrap_or(100);
                Ok(Admission::Admitted { public_ip: ip, bucket_count })
            }
            _ => {
                let code = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                Ok(Admission::Denied(code))
            }
        }
    }

    /// Step 4: tells the server no iperf measurement will follow.
    ///
    /// # Errors
    ///
    /// Errors on any I/O or framing failure.
    pub async fn skip_iperf(&mut self) -> Result<(), ClientDriverError> {
        self.send_text("NoIperf").await
    }

    /// Step 5: tells the server no mobile stats will follow.
    ///
    /// # Errors
    ///
    /// Errors on any I/O or framing failure.
    pub async fn skip_mobile_stats(&mut self) -> Result<(), ClientDriverError> {
        self.send_text("NoMobileStats").await
    }

    /// Step 6: receives the port mapping.
    ///
    /// # Errors
    ///
    /// Errors if the frame cannot be read or does not decode as JSON.
    pub async fn receive_port_mapping(&mut self) -> Result<PortMapping, ClientDriverError> {
        let text = self.recv_text().await?;
        serde_json::from_str(&text)
            .map_err(|e| ClientDriverError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
    }

    /// Step 7: receives the UDP sender count.
    ///
    /// # Errors
    ///
    /// Errors if the frame cannot be read or parsed as a decimal integer.
    pub async fn receive_sender_count(&mut self) -> Result<usize, ClientDriverError> {
        let text = self.recv_text().await?;
        text.trim()
            .parse()
            .map_err(|_| ClientDriverError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "bad sender count")))
    }

    /// Step 9: sends `DONE;<durationSeconds>` on normal completion.
    ///
    /// # Errors
    ///
    /// Errors on any I/O or framing failure.
    pub async fn send_done(&mut self, duration_secs: f64) -> Result<(), ClientDriverError> {
        self.send_text(&format!("DONE;{duration_secs}")).await
    }

    /// Step 9 (idle-timeout path): sends `timeout`.
    ///
    /// # Errors
    ///
    /// Errors on any I/O or framing failure.
    pub async fn send_timeout(&mut self) -> Result<(), ClientDriverError> {
        self.send_text("timeout").await
    }

    /// Step 9 (IP-flip path): sends `ipFlip`.
    ///
    /// # Errors
    ///
    /// Errors on any I/O or framing failure.
    pub async fn send_ip_flip(&mut self) -> Result<(), ClientDriverError> {
        self.send_text("ipFlip").await
    }

    /// Step 10: sends the throughput sample, or `NoJitter` if none was
    /// collected, then awaits the server's `OK`.
    ///
    /// # Errors
    ///
    /// Errors on any I/O or framing failure.
    pub async fn send_throughput(
        &mut self,
        sample: Option<&ThroughputSample>,
    ) -> Result<(), ClientDriverError> {
        let body = match sample {
            Some(sample) => {
                serde_json::to_string(&(&sample.xput, &sample.t)).unwrap_or_default()
            }
            None => "NoJitter".to_owned(),
        };
        self.send_text(&body).await?;
        let _ack = self.recv_text().await?;
        Ok(())
    }

    /// Step 8: reads and discards `STARTED;<port>`/`DONE;<port>`
    /// notification frames the server forwards while UDP senders run.
    /// Meant to be raced against the scripted flows and the idle watchdog
    /// so these frames don't pile up in front of the step 10/11 reads.
    ///
    /// # Errors
    ///
    /// Errors if a frame can't be read, or if the server sends something
    /// other than a notification at this point in the exchange.
    pub async fn drain_notifications(&mut self) -> Result<(), ClientDriverError> {
        loop {
            // No per-frame read timeout here: a TCP-only replay may never
            // see a notification at all, and this future is meant to be
            // raced against (and cancelled by) the scripted flows and the
            // idle watchdog, not to time out on its own.
            let frame = self.recv_text_untimed().await?;
            if !(frame.starts_with("STARTED;") || frame.starts_with("DONE;")) {
                return Err(ClientDriverError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unexpected frame while draining notifications: {frame}"),
                )));
            }
        }
    }

    /// Step 11: requests (`Result;Yes`) or declines (`Result;No`) the
    /// server's result bytes, returning them if requested.
    ///
    /// # Errors
    ///
    /// Errors on any I/O or framing failure.
    pub async fn get_result(&mut self, want_result: bool) -> Result<String, ClientDriverError> {
        self.send_text(if want_result { "Result;Yes" } else { "Result;No" }).await?;
        self.recv_text().await
    }

    async fn send_text(&mut self, text: &str) -> Result<(), ClientDriverError> {
        self.framed
            .send(Bytes::copy_from_slice(text.as_bytes()))
            .await
            .map_err(|e| ClientDriverError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
    }

    async fn recv_text(&mut self) -> Result<String, ClientDriverError> {
        let frame: BytesMut = timeout(self.read_timeout, self.framed.next())
            .await
            .map_err(|_| ClientDriverError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "side channel read timed out")))?
            .ok_or_else(|| ClientDriverError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "side channel closed")))?
            .map_err(|e| ClientDriverError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
        Self::frame_to_text(frame)
    }

    async fn recv_text_untimed(&mut self) -> Result<String, ClientDriverError> {
        let frame: BytesMut = self
            .framed
            .next()
            .await
            .ok_or_else(|| ClientDriverError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "side channel closed")))?
            .map_err(|e| ClientDriverError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
        Self::frame_to_text(frame)
    }

    fn frame_to_text(frame: BytesMut) -> Result<String, ClientDriverError> {
        String::from_utf8(frame.to_vec())
            .map_err(|e| ClientDriverError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
    }
}
