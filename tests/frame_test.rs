//! Wire compatibility: a raw TCP peer speaking the length-prefixed format
//! interoperates with server-owned connections.

use std::time::Duration;

use packetwire::{Packet, Server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn raw_client_frame_is_received() {
    let server = Server::new("127.0.0.1:0".parse().unwrap());
    let connected = server.subscribe_connected();
    let address = server.start().await.unwrap();

    let mut client = TcpStream::connect(address).await.unwrap();
    let event = timeout(WAIT, connected.recv()).await.unwrap().unwrap();
    let connection = event.connection.expect("connected without fault");
    let received = connection.subscribe_received();

    // big-endian length prefix followed by the payload
    client.write_all(&[0, 0, 0, 5]).await.unwrap();
    client.write_all(b"Hello").await.unwrap();

    let event = timeout(WAIT, received.recv()).await.unwrap().unwrap();
    assert!(event.succeeded());
    assert_eq!(event.packet.payload().as_ref(), b"Hello");

    server.stop().await;
}

#[tokio::test]
async fn server_write_is_framed_on_the_wire() {
    let server = Server::new("127.0.0.1:0".parse().unwrap());
    let connected = server.subscribe_connected();
    let address = server.start().await.unwrap();

    let mut client = TcpStream::connect(address).await.unwrap();
    let event = timeout(WAIT, connected.recv()).await.unwrap().unwrap();
    let connection = event.connection.unwrap();

    connection.write(Packet::new("Hello").unwrap()).unwrap();
    connection.write(Packet::empty()).unwrap();

    let mut frame = [0u8; 9];
    timeout(WAIT, client.read_exact(&mut frame)).await.unwrap().unwrap();
    assert_eq!(&frame, b"\x00\x00\x00\x05Hello");

    let mut empty = [0u8; 4];
    timeout(WAIT, client.read_exact(&mut empty)).await.unwrap().unwrap();
    assert_eq!(empty, [0, 0, 0, 0]);

    server.stop().await;
}

#[tokio::test]
async fn byte_at_a_time_frames_are_reassembled() {
    let server = Server::new("127.0.0.1:0".parse().unwrap());
    let connected = server.subscribe_connected();
    let address = server.start().await.unwrap();

    let mut client = TcpStream::connect(address).await.unwrap();
    client.set_nodelay(true).unwrap();
    let connection = timeout(WAIT, connected.recv())
        .await
        .unwrap()
        .unwrap()
        .connection
        .unwrap();
    let received = connection.subscribe_received();

    let framed = Packet::new(&b"trickled payload"[..]).unwrap().framed();
    for byte in framed.iter() {
        client.write_all(&[*byte]).await.unwrap();
        client.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let event = timeout(WAIT, received.recv()).await.unwrap().unwrap();
    assert_eq!(event.packet.payload().as_ref(), b"trickled payload");

    server.stop().await;
}
