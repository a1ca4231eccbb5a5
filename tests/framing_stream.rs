//! Exercises `SideChannelCodec` over a real loopback socket rather than a
//! synthetic `BytesMut`, including a frame whose payload arrives split
//! across two separate TCP writes.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

use netreplay::framing::SideChannelCodec;

#[tokio::test]
async fn frame_split_across_writes_decodes_once_complete() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, SideChannelCodec);
        framed.next().await.unwrap().unwrap().freeze()
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"0000000010hello").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.write_all(b"world").await.unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(1), server).await.unwrap().unwrap();
    assert_eq!(&frame[..], b"helloworld");
}

/// A frame whose payload never fully arrives must never resolve with a
/// `None` item; the stream should simply stall, which a `StreamExt::timeout`
/// wrapper reports as an elapsed error rather than end-of-stream.
#[tokio::test]
async fn incomplete_frame_does_not_resolve_as_end_of_stream() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, SideChannelCodec).timeout(Duration::from_millis(50));
        framed.next().await
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"0000000010hel").await.unwrap();

    let outcome = server.await.unwrap();
    assert!(matches!(outcome, Some(Err(_))), "expected a timeout-elapsed error");

    drop(client);
}
