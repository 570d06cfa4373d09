use std::net::Ipv4Addr;

use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

use socks5_engine::{Address, AuthMethod, Command, Reply, ServerPolicy, Socks5Acceptor, Socks5Stream};

#[tokio::test]
async fn end_to_end_connect_and_relay() {
    let _ = env_logger::try_init();

    let (client_side, server_side) = duplex(4096);

    let server = tokio::spawn(async move {
        let acceptor = Socks5Acceptor::default();
        let incoming = acceptor.accept(server_side).await.unwrap();

        assert_eq!(incoming.command(), Command::Connect);
        assert_eq!(incoming.address(), &Address::Ipv4(Ipv4Addr::new(93, 184, 216, 34)));
        assert_eq!(incoming.port(), 80);

        let mut stream = incoming.grant(Address::Ipv4(Ipv4Addr::UNSPECIFIED), 0).await.unwrap();

        // echo everything back
        let mut buf = [0u8; 256];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            stream.write_all(&buf[..n]).await.unwrap();
        }
    });

    let mut stream = Socks5Stream::connect_with_stream(
        Address::Ipv4(Ipv4Addr::new(93, 184, 216, 34)),
        80,
        client_side,
    )
    .await
    .unwrap();

    stream.write_all(b"hello through the proxy").await.unwrap();

    let mut buf = [0u8; 23];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello through the proxy");

    drop(stream);
    server.await.unwrap();
}

#[tokio::test]
async fn auth_rejection_fails_both_sides() {
    let _ = env_logger::try_init();

    let (client_side, server_side) = duplex(4096);

    // the server will only select username/password, which the client
    // does not offer
    let server = tokio::spawn(async move {
        let acceptor = Socks5Acceptor::new(ServerPolicy {
            methods: vec![AuthMethod::Password],
            commands: vec![Command::Connect],
        });
        acceptor.accept(server_side).await
    });

    let client_err = Socks5Stream::connect_with_stream(
        Address::DomainName("example.com".to_owned()),
        80,
        client_side,
    )
    .await
    .unwrap_err();
    assert!(
        client_err.to_string().contains("no acceptable authentication method"),
        "unexpected client error: {client_err}"
    );

    let server_err = server.await.unwrap().map(|_| ()).unwrap_err();
    assert!(
        server_err.to_string().contains("no acceptable authentication method"),
        "unexpected server error: {server_err}"
    );
}

#[tokio::test]
async fn upstream_failure_is_reported_to_client() {
    let _ = env_logger::try_init();

    let (client_side, server_side) = duplex(4096);

    let server = tokio::spawn(async move {
        let acceptor = Socks5Acceptor::default();
        let incoming = acceptor.accept(server_side).await.unwrap();
        incoming.reject(Reply::HostUnreachable).await.unwrap();
    });

    let client_err = Socks5Stream::connect_with_stream(
        Address::DomainName("unreachable.example".to_owned()),
        443,
        client_side,
    )
    .await
    .unwrap_err();
    assert!(
        client_err.to_string().contains("Host unreachable"),
        "unexpected client error: {client_err}"
    );

    server.await.unwrap();
}

#[tokio::test]
async fn handshake_survives_byte_at_a_time_delivery() {
    let _ = env_logger::try_init();

    let (mut client_side, server_side) = duplex(4096);

    let server = tokio::spawn(async move {
        let acceptor = Socks5Acceptor::default();
        let incoming = acceptor.accept(server_side).await.unwrap();
        assert_eq!(incoming.address(), &Address::DomainName("example.com".to_owned()));
        incoming.grant(Address::Ipv4(Ipv4Addr::UNSPECIFIED), 0).await.unwrap();
    });

    // hand-rolled client writing one byte per flush
    for b in [0x05u8, 0x01, 0x00] {
        client_side.write_all(&[b]).await.unwrap();
        client_side.flush().await.unwrap();
    }

    let mut selection = [0u8; 2];
    client_side.read_exact(&mut selection).await.unwrap();
    assert_eq!(selection, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x03, 0x0b];
    request.extend_from_slice(b"example.com");
    request.extend_from_slice(&[0x00, 0x50]);
    for b in request {
        client_side.write_all(&[b]).await.unwrap();
        client_side.flush().await.unwrap();
    }

    let mut response = [0u8; 10];
    client_side.read_exact(&mut response).await.unwrap();
    assert_eq!(response, [0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

    server.await.unwrap();
}

#[tokio::test]
async fn optimistic_payload_reaches_the_server() {
    let _ = env_logger::try_init();

    let (mut client_side, server_side) = duplex(4096);

    let server = tokio::spawn(async move {
        let acceptor = Socks5Acceptor::default();
        let incoming = acceptor.accept(server_side).await.unwrap();
        let mut stream = incoming.grant(Address::Ipv4(Ipv4Addr::UNSPECIFIED), 0).await.unwrap();

        // the payload pipelined after the request must come out of the
        // established stream unmodified, before anything newly read
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early");
    });

    client_side.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut selection = [0u8; 2];
    client_side.read_exact(&mut selection).await.unwrap();

    // request and payload in a single write
    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90];
    request.extend_from_slice(b"early");
    client_side.write_all(&request).await.unwrap();

    let mut response = [0u8; 10];
    client_side.read_exact(&mut response).await.unwrap();
    assert_eq!(response[1], 0x00);

    server.await.unwrap();
}
