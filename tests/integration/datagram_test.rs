// tests/integration/datagram_test.rs

//! Repliable and raw datagrams, over the command connection and the UDP side channel.

use super::test_helpers::{READ_TIMEOUT, TestGateway, create_session, field, my_destination};
use tokio::net::UdpSocket;

#[tokio::test]
async fn test_v3_datagram_carries_sender_and_ports() {
    let gw = TestGateway::new().await;
    let mut a = gw.client("3.1").await;
    let mut b = gw.client("3.1").await;
    create_session(&mut a, "STYLE=DATAGRAM ID=dga DESTINATION=TRANSIENT").await;
    create_session(&mut b, "STYLE=DATAGRAM ID=dgb DESTINATION=TRANSIENT").await;
    let a_dest = my_destination(&mut a).await;
    let b_dest = my_destination(&mut b).await;

    a.send_with_payload(
        &format!("DATAGRAM SEND DESTINATION={b_dest} SIZE=5 FROM_PORT=7 TO_PORT=9"),
        b"hello",
    )
    .await;
    assert_eq!(
        b.read_line().await,
        format!("DATAGRAM RECEIVED DESTINATION={a_dest} SIZE=5 FROM_PORT=7 TO_PORT=9")
    );
    assert_eq!(b.read_exact(5).await, b"hello");
}

#[tokio::test]
async fn test_v1_datagram_omits_ports() {
    let gw = TestGateway::new().await;
    let mut a = gw.client("1.0").await;
    let mut b = gw.client("1.0").await;
    create_session(&mut a, "STYLE=DATAGRAM DESTINATION=TRANSIENT").await;
    create_session(&mut b, "STYLE=DATAGRAM DESTINATION=TRANSIENT").await;
    let a_dest = my_destination(&mut a).await;
    let b_dest = my_destination(&mut b).await;

    a.send_with_payload(&format!("DATAGRAM SEND DESTINATION={b_dest} SIZE=3"), b"abc")
        .await;
    assert_eq!(
        b.read_line().await,
        format!("DATAGRAM RECEIVED DESTINATION={a_dest} SIZE=3")
    );
    assert_eq!(b.read_exact(3).await, b"abc");
}

#[tokio::test]
async fn test_raw_size_bounds() {
    let gw = TestGateway::new().await;
    let mut a = gw.client("3.1").await;
    let mut b = gw.client("3.1").await;
    create_session(&mut a, "STYLE=RAW ID=rawa DESTINATION=TRANSIENT").await;
    create_session(&mut b, "STYLE=RAW ID=rawb DESTINATION=TRANSIENT").await;
    let b_dest = my_destination(&mut b).await;

    let largest = vec![7u8; 32768];
    a.send_with_payload(&format!("RAW SEND DESTINATION={b_dest} SIZE=32768"), &largest)
        .await;
    assert_eq!(
        b.read_line().await,
        "RAW RECEIVED SIZE=32768 PROTOCOL=18 FROM_PORT=0 TO_PORT=0"
    );
    assert_eq!(b.read_exact(32768).await, largest);

    let reply = a
        .request(&format!("RAW SEND DESTINATION={b_dest} SIZE=32769"))
        .await;
    assert!(reply.starts_with("RAW STATUS RESULT=I2P_ERROR"), "{reply}");
    a.expect_closed().await;
}

#[tokio::test]
async fn test_zero_size_is_rejected() {
    let gw = TestGateway::new().await;
    let mut a = gw.client("3.1").await;
    create_session(&mut a, "STYLE=RAW ID=zero DESTINATION=TRANSIENT").await;
    let own = my_destination(&mut a).await;

    let reply = a.request(&format!("RAW SEND DESTINATION={own} SIZE=0")).await;
    assert!(reply.starts_with("RAW STATUS RESULT=I2P_ERROR"), "{reply}");
    a.expect_closed().await;
}

#[tokio::test]
async fn test_raw_protocol_override() {
    let gw = TestGateway::new().await;
    let mut a = gw.client("3.1").await;
    let mut b = gw.client("3.1").await;
    create_session(&mut a, "STYLE=RAW ID=pa DESTINATION=TRANSIENT PROTOCOL=200").await;
    create_session(&mut b, "STYLE=RAW ID=pb DESTINATION=TRANSIENT").await;
    let b_dest = my_destination(&mut b).await;

    a.send_with_payload(&format!("RAW SEND DESTINATION={b_dest} SIZE=1"), b"1")
        .await;
    assert_eq!(field(&b.read_line().await, "PROTOCOL").as_deref(), Some("200"));
    b.read_exact(1).await;

    a.send_with_payload(&format!("RAW SEND DESTINATION={b_dest} SIZE=1 PROTOCOL=201"), b"2")
        .await;
    assert_eq!(field(&b.read_line().await, "PROTOCOL").as_deref(), Some("201"));
}

#[tokio::test]
async fn test_send_to_offline_destination_is_silent() {
    let gw = TestGateway::new().await;
    let mut a = gw.client("3.1").await;
    create_session(&mut a, "STYLE=DATAGRAM ID=lonely DESTINATION=TRANSIENT").await;
    let offline = field(&a.request("DEST GENERATE").await, "PUB").unwrap();

    a.send_with_payload(&format!("DATAGRAM SEND DESTINATION={offline} SIZE=4"), b"void")
        .await;
    // Nothing comes back; the connection keeps working.
    assert_eq!(a.request("PING after").await, "PONG after");
}

#[tokio::test]
async fn test_side_channel_sends_through_named_session() {
    let gw = TestGateway::new().await;
    let mut a = gw.client("3.1").await;
    let mut b = gw.client("3.1").await;
    create_session(&mut a, "STYLE=DATAGRAM ID=udpa DESTINATION=TRANSIENT").await;
    create_session(&mut b, "STYLE=DATAGRAM ID=udpb DESTINATION=TRANSIENT").await;
    let a_dest = my_destination(&mut a).await;
    let b_dest = my_destination(&mut b).await;

    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let packet = format!("3.0 udpa {b_dest} TO_PORT=12\nover udp");
    udp.send_to(packet.as_bytes(), gw.datagram_addr())
        .await
        .unwrap();

    assert_eq!(
        b.read_line().await,
        format!("DATAGRAM RECEIVED DESTINATION={a_dest} SIZE=8 FROM_PORT=0 TO_PORT=12")
    );
    assert_eq!(b.read_exact(8).await, b"over udp");
}

#[tokio::test]
async fn test_inbound_datagrams_forwarded_to_host_port() {
    let gw = TestGateway::new().await;
    let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let sink_port = sink.local_addr().unwrap().port();

    let mut a = gw.client("3.1").await;
    let mut b = gw.client("3.1").await;
    create_session(&mut a, "STYLE=DATAGRAM ID=fwa DESTINATION=TRANSIENT").await;
    create_session(
        &mut b,
        &format!("STYLE=DATAGRAM ID=fwb DESTINATION=TRANSIENT HOST=127.0.0.1 PORT={sink_port}"),
    )
    .await;
    let a_dest = my_destination(&mut a).await;
    let b_dest = my_destination(&mut b).await;

    a.send_with_payload(&format!("DATAGRAM SEND DESTINATION={b_dest} SIZE=6"), b"to udp")
        .await;

    let mut buf = [0u8; 2048];
    let (n, _) = tokio::time::timeout(READ_TIMEOUT, sink.recv_from(&mut buf))
        .await
        .expect("no forwarded datagram")
        .unwrap();
    let expected = format!("{a_dest} FROM_PORT=0 TO_PORT=0\nto udp");
    assert_eq!(&buf[..n], expected.as_bytes());
}

#[tokio::test]
async fn test_raw_forward_with_header() {
    let gw = TestGateway::new().await;
    let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let sink_port = sink.local_addr().unwrap().port();

    let mut a = gw.client("3.1").await;
    let mut b = gw.client("3.1").await;
    create_session(&mut a, "STYLE=RAW ID=hra DESTINATION=TRANSIENT").await;
    create_session(
        &mut b,
        &format!("STYLE=RAW ID=hrb DESTINATION=TRANSIENT HOST=127.0.0.1 PORT={sink_port} HEADER=true"),
    )
    .await;
    let b_dest = my_destination(&mut b).await;

    a.send_with_payload(&format!("RAW SEND DESTINATION={b_dest} SIZE=3 FROM_PORT=5"), b"raw")
        .await;

    let mut buf = [0u8; 2048];
    let (n, _) = tokio::time::timeout(READ_TIMEOUT, sink.recv_from(&mut buf))
        .await
        .expect("no forwarded datagram")
        .unwrap();
    assert_eq!(&buf[..n], b"PROTOCOL=18 FROM_PORT=5 TO_PORT=0\nraw");
}
