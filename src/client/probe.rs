//! `WHATSMYIPMAN` probe: a plain HTTP GET the client issues against a
//! flow server port before the main replay, used to learn the
//! data-plane-visible source IP ahead of the scripted exchange. See
//! SPEC_FULL.md §4.6.

use std::net::IpAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::ClientDriverError;

/// Fallback port used when a replay has no TCP flows of its own to probe.
pub const FALLBACK_PORT: u16 = 55557;

/// Connects to `(server_ip, port)`, issues `GET /WHATSMYIPMAN HTTP/1.1`,
/// and parses the response body as the IP the server observed.
///
/// # Errors
///
/// Errors on any I/O failure or if the response body does not parse as
/// an IP address.
pub async fn ask_real_ip(server_ip: IpAddr, port: u16) -> Result<IpAddr, ClientDriverError> {
    let mut stream = TcpStream::connect((server_ip, port)).await?;
    stream
        .write_all(b"GET /WHATSMYIPMAN HTTP/1.1\r\nHost: replay\r\nConnection: close\r\n\r\n")
        .await?;

    let mut body = Vec::new();
    stream.read_to_end(&mut body).await?;

    let text = String::from_utf8_lossy(&body);
    let line = text
        .rsplit("\r\n\r\n")
        .next()
        .unwrap_or(&text)
        .trim();

    line.parse().map_err(|_| {
        ClientDriverError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "WHATSMYIPMAN response did not contain an IP address",
        ))
    })
}
