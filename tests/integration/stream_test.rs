// tests/integration/stream_test.rs

//! Streams: framed ids for protocol 1 and 2, spliced connections for protocol 3.

use super::test_helpers::{TestClient, TestGateway, create_session, field, my_destination};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Two connected clients, each owning a transient stream session.
async fn stream_pair(gw: &TestGateway, version: &str) -> (TestClient, TestClient, String, String) {
    let mut a = gw.client(version).await;
    let mut b = gw.client(version).await;
    let (a_opts, b_opts) = if version.starts_with('3') {
        (
            "STYLE=STREAM ID=alpha DESTINATION=TRANSIENT",
            "STYLE=STREAM ID=beta DESTINATION=TRANSIENT",
        )
    } else {
        ("STYLE=STREAM DESTINATION=TRANSIENT", "STYLE=STREAM DESTINATION=TRANSIENT")
    };
    create_session(&mut a, a_opts).await;
    create_session(&mut b, b_opts).await;
    let a_dest = my_destination(&mut a).await;
    let b_dest = my_destination(&mut b).await;
    (a, b, a_dest, b_dest)
}

#[tokio::test]
async fn test_v1_stream_round_trip() {
    let gw = TestGateway::new().await;
    let (mut a, mut b, a_dest, b_dest) = stream_pair(&gw, "1.0").await;

    let status = a
        .request(&format!("STREAM CONNECT ID=1 DESTINATION={b_dest}"))
        .await;
    assert_eq!(status, "STREAM STATUS RESULT=OK ID=1");

    let announced = b.read_line().await;
    assert_eq!(announced, format!("STREAM CONNECTED DESTINATION={a_dest} ID=-1"));

    // Protocol 1 sends have no reply on success.
    a.send_with_payload("STREAM SEND ID=1 SIZE=5", b"hello").await;
    assert_eq!(b.read_line().await, "STREAM RECEIVED ID=-1 SIZE=5");
    assert_eq!(b.read_exact(5).await, b"hello");

    b.send_with_payload("STREAM SEND ID=-1 SIZE=2", b"hi").await;
    assert_eq!(a.read_line().await, "STREAM RECEIVED ID=1 SIZE=2");
    assert_eq!(a.read_exact(2).await, b"hi");
}

#[tokio::test]
async fn test_v1_close_is_reported_to_peer_and_idempotent() {
    let gw = TestGateway::new().await;
    let (mut a, mut b, _, b_dest) = stream_pair(&gw, "1.0").await;

    a.request(&format!("STREAM CONNECT ID=7 DESTINATION={b_dest}"))
        .await;
    let announced = b.read_line().await;
    assert_eq!(field(&announced, "ID").as_deref(), Some("-1"));

    assert_eq!(a.request("STREAM CLOSE ID=7").await, "STREAM CLOSED RESULT=OK ID=7");
    assert_eq!(b.read_line().await, "STREAM CLOSED RESULT=OK ID=-1");

    // Closing again changes nothing.
    assert_eq!(
        a.request("STREAM CLOSE ID=7").await,
        "STREAM CLOSED RESULT=INVALID_ID ID=7"
    );
}

#[tokio::test]
async fn test_v1_send_on_unknown_id() {
    let gw = TestGateway::new().await;
    let (mut a, _b, _, _) = stream_pair(&gw, "1.0").await;

    a.send_with_payload("STREAM SEND ID=42 SIZE=3", b"abc").await;
    assert_eq!(a.read_line().await, "STREAM CLOSED RESULT=INVALID_ID ID=42");
}

#[tokio::test]
async fn test_stream_send_size_out_of_range_closes() {
    let gw = TestGateway::new().await;
    let (mut a, _b, _, _) = stream_pair(&gw, "1.0").await;

    let reply = a.request("STREAM SEND ID=1 SIZE=32769").await;
    assert!(reply.starts_with("STREAM STATUS RESULT=I2P_ERROR"), "{reply}");
    a.expect_closed().await;
}

#[tokio::test]
async fn test_v1_connect_to_offline_destination() {
    let gw = TestGateway::new().await;
    let (mut a, _b, _, _) = stream_pair(&gw, "1.0").await;
    let offline = field(&a.request("DEST GENERATE").await, "PUB").unwrap();

    let reply = a
        .request(&format!("STREAM CONNECT ID=2 DESTINATION={offline}"))
        .await;
    assert!(reply.starts_with("STREAM STATUS RESULT=CANT_REACH_PEER"), "{reply}");
    assert_eq!(field(&reply, "ID").as_deref(), Some("2"));

    // The id is free again after the failure.
    let reply = a
        .request(&format!("STREAM CONNECT ID=2 DESTINATION={offline}"))
        .await;
    assert!(reply.contains("RESULT=CANT_REACH_PEER"), "{reply}");
}

#[tokio::test]
async fn test_v2_connect_reports_asynchronously() {
    let gw = TestGateway::new().await;
    let (mut a, mut b, a_dest, b_dest) = stream_pair(&gw, "2.0").await;

    let status = a
        .request(&format!("STREAM CONNECT ID=3 DESTINATION={b_dest}"))
        .await;
    assert_eq!(status, "STREAM STATUS RESULT=OK ID=3");
    assert_eq!(
        b.read_line().await,
        format!("STREAM CONNECTED DESTINATION={a_dest} ID=-1")
    );

    // Reusing an open id fails without touching the stream.
    let reply = a
        .request(&format!("STREAM CONNECT ID=3 DESTINATION={b_dest}"))
        .await;
    assert!(reply.starts_with("STREAM STATUS RESULT=INVALID_ID"), "{reply}");
}

#[tokio::test]
async fn test_v2_send_reports_credit_state() {
    let gw = TestGateway::new().await;
    let (mut a, mut b, _, b_dest) = stream_pair(&gw, "2.0").await;

    a.request(&format!("STREAM CONNECT ID=1 DESTINATION={b_dest}"))
        .await;
    b.read_line().await;

    a.send_with_payload("STREAM SEND ID=1 SIZE=4", b"ping").await;
    let reply = a.read_line().await;
    assert_eq!(field(&reply, "RESULT").as_deref(), Some("OK"), "{reply}");
    assert_eq!(field(&reply, "STATE").as_deref(), Some("READY"), "{reply}");
    assert_eq!(b.read_line().await, "STREAM RECEIVED ID=-1 SIZE=4");
    assert_eq!(b.read_exact(4).await, b"ping");

    // A full buffer's worth reports BUFFER_FULL, and READY_TO_SEND follows
    // once the transport drained it. The two lines may arrive in either order.
    let big = vec![b'x'; 32768];
    a.send_with_payload("STREAM SEND ID=1 SIZE=32768", &big).await;
    let lines = [a.read_line().await, a.read_line().await];
    let send = lines
        .iter()
        .find(|l| l.starts_with("STREAM SEND"))
        .expect("no STREAM SEND reply");
    assert_eq!(field(send, "STATE").as_deref(), Some("BUFFER_FULL"), "{send}");
    assert!(
        lines.iter().any(|l| l == "STREAM READY_TO_SEND ID=1"),
        "{lines:?}"
    );
}

/// Sends one credit-controlled chunk on stream 1. Waits out any BUFFER_FULL
/// until READY_TO_SEND comes back.
async fn credit_send(client: &mut TestClient, payload: &[u8]) {
    client
        .send_with_payload(&format!("STREAM SEND ID=1 SIZE={}", payload.len()), payload)
        .await;
    let mut reply: Option<String> = None;
    let mut ready = false;
    loop {
        let line = client.read_line().await;
        if line == "STREAM READY_TO_SEND ID=1" {
            ready = true;
        } else {
            assert_eq!(field(&line, "RESULT").as_deref(), Some("OK"), "{line}");
            reply = Some(line);
        }
        if let Some(reply) = &reply {
            if ready || field(reply, "STATE").as_deref() == Some("READY") {
                return;
            }
        }
    }
}

/// Lifts the receive limit on stream -1 and collects `total` bytes. Returns
/// the data and whether `STREAM CLOSED` was seen along the way.
async fn release_and_collect(client: &mut TestClient, total: usize, want_close: bool) -> Vec<u8> {
    client.send("STREAM RECEIVE ID=-1 LIMIT=NONE").await;
    let mut data = Vec::new();
    let mut saw_reply = false;
    let mut saw_close = false;
    while data.len() < total || !saw_reply || (want_close && !saw_close) {
        let line = client.read_line().await;
        if line.starts_with("STREAM RECEIVED ID=-1") {
            let size: usize = field(&line, "SIZE").unwrap().parse().unwrap();
            data.extend(client.read_exact(size).await);
        } else if line == "STREAM CLOSED RESULT=OK ID=-1" {
            assert!(want_close, "unexpected close");
            saw_close = true;
        } else {
            assert_eq!(line, "STREAM RECEIVE RESULT=OK ID=-1");
            saw_reply = true;
        }
    }
    data
}

/// Connects stream 1 from `a` to `b` and pauses `b`'s delivery.
async fn paused_v2_stream(gw: &TestGateway) -> (TestClient, TestClient) {
    let (mut a, mut b, _, b_dest) = stream_pair(gw, "2.0").await;
    a.request(&format!("STREAM CONNECT ID=1 DESTINATION={b_dest}"))
        .await;
    b.read_line().await;
    assert_eq!(
        b.request("STREAM RECEIVE ID=-1 LIMIT=0").await,
        "STREAM RECEIVE RESULT=OK ID=-1"
    );
    (a, b)
}

/// Two full chunks fill the transport pipe; then many small ones queue up.
fn backlog_chunks() -> Vec<Vec<u8>> {
    let mut chunks = vec![vec![b'a'; 32768], vec![b'b'; 32768]];
    for i in 0..80u8 {
        chunks.push(vec![i; 100]);
    }
    chunks
}

#[tokio::test]
async fn test_v2_many_small_sends_stay_within_credit() {
    let gw = TestGateway::new().await;
    let (mut a, mut b) = paused_v2_stream(&gw).await;

    let chunks = backlog_chunks();
    for chunk in &chunks {
        credit_send(&mut a, chunk).await;
    }

    let expected = chunks.concat();
    let received = release_and_collect(&mut b, expected.len(), false).await;
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_v2_close_delivers_queued_data() {
    let gw = TestGateway::new().await;
    let (mut a, mut b) = paused_v2_stream(&gw).await;

    let chunks = backlog_chunks();
    for chunk in &chunks {
        credit_send(&mut a, chunk).await;
    }
    assert_eq!(a.request("STREAM CLOSE ID=1").await, "STREAM CLOSED RESULT=OK ID=1");

    let expected = chunks.concat();
    let received = release_and_collect(&mut b, expected.len(), true).await;
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_v2_receive_limit() {
    let gw = TestGateway::new().await;
    let (mut a, mut b, _, b_dest) = stream_pair(&gw, "2.0").await;

    a.request(&format!("STREAM CONNECT ID=1 DESTINATION={b_dest}"))
        .await;
    b.read_line().await;

    assert_eq!(
        b.request("STREAM RECEIVE ID=-1 LIMIT=3").await,
        "STREAM RECEIVE RESULT=OK ID=-1"
    );

    a.send_with_payload("STREAM SEND ID=1 SIZE=10", b"0123456789").await;
    a.read_line().await;
    assert_eq!(b.read_line().await, "STREAM RECEIVED ID=-1 SIZE=3");
    assert_eq!(b.read_exact(3).await, b"012");

    // Lifting the limit releases the rest; the reply and the data race.
    b.send("STREAM RECEIVE ID=-1 LIMIT=NONE").await;
    let mut saw_reply = false;
    let mut saw_data = false;
    while !(saw_reply && saw_data) {
        let line = b.read_line().await;
        if line.starts_with("STREAM RECEIVED") {
            assert_eq!(line, "STREAM RECEIVED ID=-1 SIZE=7");
            assert_eq!(b.read_exact(7).await, b"3456789");
            saw_data = true;
        } else {
            assert_eq!(line, "STREAM RECEIVE RESULT=OK ID=-1");
            saw_reply = true;
        }
    }

    assert_eq!(
        b.request("STREAM RECEIVE ID=-9 LIMIT=1").await,
        "STREAM RECEIVE RESULT=INVALID_ID ID=-9"
    );
}

#[tokio::test]
async fn test_receive_only_session_cannot_connect() {
    let gw = TestGateway::new().await;
    let mut listener = gw.client("2.0").await;
    create_session(&mut listener, "STYLE=STREAM DESTINATION=TRANSIENT").await;
    let target = my_destination(&mut listener).await;

    let mut client = gw.client("2.0").await;
    create_session(&mut client, "STYLE=STREAM DESTINATION=TRANSIENT DIRECTION=RECEIVE").await;
    let reply = client
        .request(&format!("STREAM CONNECT ID=1 DESTINATION={target}"))
        .await;
    assert!(reply.starts_with("STREAM STATUS RESULT=INVALID_DIRECTION"), "{reply}");
}

#[tokio::test]
async fn test_v3_accept_and_connect_splice() {
    let gw = TestGateway::new().await;
    let (_srv, _cli, srv_dest, cli_dest) = stream_pair(&gw, "3.1").await;

    let mut acceptor = gw.client("3.1").await;
    assert_eq!(acceptor.request("STREAM ACCEPT ID=alpha").await, "STREAM STATUS RESULT=OK");

    let mut connector = gw.client("3.1").await;
    assert_eq!(
        connector
            .request(&format!("STREAM CONNECT ID=beta DESTINATION={srv_dest}"))
            .await,
        "STREAM STATUS RESULT=OK"
    );

    assert_eq!(
        acceptor.read_line().await,
        format!("{cli_dest} FROM_PORT=0 TO_PORT=0")
    );

    // From here on both connections carry raw bytes.
    let (mut acc_read, mut acc_write) = acceptor.into_parts();
    let (mut con_read, mut con_write) = connector.into_parts();

    con_write.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    let mut request = [0u8; 18];
    acc_read.read_exact(&mut request).await.unwrap();
    assert_eq!(&request, b"GET / HTTP/1.0\r\n\r\n");

    acc_write.write_all(b"200 OK").await.unwrap();
    acc_write.shutdown().await.unwrap();
    let mut response = Vec::new();
    con_read.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, b"200 OK");
}

#[tokio::test]
async fn test_v3_second_accept_is_rejected() {
    let gw = TestGateway::new().await;
    let (_srv, _cli, _, _) = stream_pair(&gw, "3.1").await;

    let mut first = gw.client("3.1").await;
    assert_eq!(first.request("STREAM ACCEPT ID=alpha").await, "STREAM STATUS RESULT=OK");

    let mut second = gw.client("3.1").await;
    let reply = second.request("STREAM ACCEPT ID=alpha").await;
    assert!(reply.starts_with("STREAM STATUS RESULT=ALREADY_ACCEPTING"), "{reply}");
}

#[tokio::test]
async fn test_v3_silent_streams_carry_only_data() {
    let gw = TestGateway::new().await;
    let (_srv, _cli, srv_dest, _) = stream_pair(&gw, "3.1").await;

    let mut acceptor = gw.client("3.1").await;
    acceptor.send("STREAM ACCEPT ID=alpha SILENT=true").await;
    let mut connector = gw.client("3.1").await;
    connector
        .send(&format!("STREAM CONNECT ID=beta DESTINATION={srv_dest} SILENT=true"))
        .await;

    connector.send_bytes(b"quiet").await;
    assert_eq!(acceptor.read_exact(5).await, b"quiet");
}

#[tokio::test]
async fn test_v3_connect_failure_closes_connection() {
    let gw = TestGateway::new().await;
    let (_srv, mut cli, _, _) = stream_pair(&gw, "3.1").await;
    let offline = field(&cli.request("DEST GENERATE").await, "PUB").unwrap();

    let mut connector = gw.client("3.1").await;
    let reply = connector
        .request(&format!("STREAM CONNECT ID=beta DESTINATION={offline}"))
        .await;
    assert!(reply.starts_with("STREAM STATUS RESULT=CANT_REACH_PEER"), "{reply}");
    connector.expect_closed().await;
}

#[tokio::test]
async fn test_v3_stream_commands_need_a_known_session() {
    let gw = TestGateway::new().await;
    let mut client = gw.client("3.1").await;

    let reply = client.request("STREAM ACCEPT ID=nobody").await;
    assert!(reply.starts_with("STREAM STATUS RESULT=INVALID_ID"), "{reply}");
}

#[tokio::test]
async fn test_v3_forward_to_local_listener() {
    let gw = TestGateway::new().await;
    let (_srv, _cli, srv_dest, cli_dest) = stream_pair(&gw, "3.1").await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut forwarder = gw.client("3.1").await;
    assert_eq!(
        forwarder
            .request(&format!("STREAM FORWARD ID=alpha PORT={port} HOST=127.0.0.1"))
            .await,
        "STREAM STATUS RESULT=OK"
    );

    let mut connector = gw.client("3.1").await;
    connector
        .request(&format!("STREAM CONNECT ID=beta DESTINATION={srv_dest}"))
        .await;
    connector.send_bytes(b"forwarded").await;

    let (mut inbound, _) = tokio::time::timeout(
        super::test_helpers::READ_TIMEOUT,
        listener.accept(),
    )
    .await
    .expect("no forwarded connection")
    .unwrap();
    let header = format!("{cli_dest} FROM_PORT=0 TO_PORT=0\n");
    let mut buf = vec![0u8; header.len() + 9];
    inbound.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf[..header.len()], header.as_bytes());
    assert_eq!(&buf[header.len()..], b"forwarded");
}
