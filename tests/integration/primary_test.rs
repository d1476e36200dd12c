// tests/integration/primary_test.rs

//! Primary sessions and the sub-sessions sharing their destination.

use super::test_helpers::{TestGateway, create_session, my_destination};

#[tokio::test]
async fn test_add_and_remove_sub_session() {
    let gw = TestGateway::new().await;
    let mut primary = gw.client("3.1").await;
    create_session(&mut primary, "STYLE=PRIMARY ID=main DESTINATION=TRANSIENT").await;

    let reply = primary
        .request("SESSION ADD STYLE=RAW ID=raw100 LISTEN_PORT=100")
        .await;
    assert_eq!(reply, "SESSION STATUS RESULT=OK ID=raw100 MESSAGE=\"ADD raw100\"");
    let record = gw.gateway.state.registry.get("raw100").expect("sub-session missing");
    assert_eq!(record.parent.as_deref(), Some("main"));
    assert_eq!(gw.gateway.state.registry.children_of("main"), vec!["raw100".to_string()]);

    let reply = primary.request("SESSION REMOVE ID=raw100").await;
    assert_eq!(reply, "SESSION STATUS RESULT=OK ID=raw100 MESSAGE=\"REMOVE raw100\"");
    assert!(gw.gateway.state.registry.get("raw100").is_none());

    let reply = primary.request("SESSION REMOVE ID=raw100").await;
    assert!(reply.starts_with("SESSION STATUS RESULT=INVALID_ID"), "{reply}");
}

#[tokio::test]
async fn test_inbound_raw_routed_by_port() {
    let gw = TestGateway::new().await;
    let mut primary = gw.client("3.1").await;
    create_session(&mut primary, "STYLE=PRIMARY ID=router DESTINATION=TRANSIENT").await;
    let primary_dest = my_destination(&mut primary).await;
    primary
        .request("SESSION ADD STYLE=RAW ID=port100 LISTEN_PORT=100")
        .await;

    let mut sender = gw.client("3.1").await;
    create_session(&mut sender, "STYLE=RAW ID=sender DESTINATION=TRANSIENT").await;
    sender
        .send_with_payload(
            &format!("RAW SEND DESTINATION={primary_dest} SIZE=4 TO_PORT=100"),
            b"p100",
        )
        .await;

    assert_eq!(
        primary.read_line().await,
        "RAW RECEIVED SIZE=4 PROTOCOL=18 FROM_PORT=0 TO_PORT=100"
    );
    assert_eq!(primary.read_exact(4).await, b"p100");
}

#[tokio::test]
async fn test_port_zero_sub_session_catches_the_rest() {
    let gw = TestGateway::new().await;
    let mut primary = gw.client("3.1").await;
    create_session(&mut primary, "STYLE=PRIMARY ID=catchall DESTINATION=TRANSIENT").await;
    let primary_dest = my_destination(&mut primary).await;
    primary.request("SESSION ADD STYLE=DATAGRAM ID=any").await;

    let mut sender = gw.client("3.1").await;
    create_session(&mut sender, "STYLE=DATAGRAM ID=dsend DESTINATION=TRANSIENT").await;
    let sender_dest = my_destination(&mut sender).await;
    sender
        .send_with_payload(
            &format!("DATAGRAM SEND DESTINATION={primary_dest} SIZE=2 TO_PORT=4242"),
            b"hi",
        )
        .await;

    assert_eq!(
        primary.read_line().await,
        format!("DATAGRAM RECEIVED DESTINATION={sender_dest} SIZE=2 FROM_PORT=0 TO_PORT=4242")
    );
    assert_eq!(primary.read_exact(2).await, b"hi");
}

#[tokio::test]
async fn test_stream_sub_session_accepts() {
    let gw = TestGateway::new().await;
    let mut primary = gw.client("3.1").await;
    create_session(&mut primary, "STYLE=PRIMARY ID=web DESTINATION=TRANSIENT").await;
    let primary_dest = my_destination(&mut primary).await;
    let reply = primary
        .request("SESSION ADD STYLE=STREAM ID=web80 LISTEN_PORT=80")
        .await;
    assert!(reply.contains("RESULT=OK"), "{reply}");

    let mut cli = gw.client("3.1").await;
    create_session(&mut cli, "STYLE=STREAM ID=browser DESTINATION=TRANSIENT").await;
    let cli_dest = my_destination(&mut cli).await;

    let mut acceptor = gw.client("3.1").await;
    assert_eq!(acceptor.request("STREAM ACCEPT ID=web80").await, "STREAM STATUS RESULT=OK");

    let mut connector = gw.client("3.1").await;
    let reply = connector
        .request(&format!("STREAM CONNECT ID=browser DESTINATION={primary_dest} TO_PORT=80"))
        .await;
    assert_eq!(reply, "STREAM STATUS RESULT=OK");

    assert_eq!(
        acceptor.read_line().await,
        format!("{cli_dest} FROM_PORT=0 TO_PORT=80")
    );
    connector.send_bytes(b"index").await;
    assert_eq!(acceptor.read_exact(5).await, b"index");
}

#[tokio::test]
async fn test_duplicate_listen_port_is_rejected() {
    let gw = TestGateway::new().await;
    let mut primary = gw.client("3.1").await;
    create_session(&mut primary, "STYLE=PRIMARY ID=dup DESTINATION=TRANSIENT").await;
    primary
        .request("SESSION ADD STYLE=RAW ID=first LISTEN_PORT=100")
        .await;

    let reply = primary
        .request("SESSION ADD STYLE=RAW ID=second LISTEN_PORT=100")
        .await;
    assert!(reply.starts_with("SESSION STATUS RESULT=I2P_ERROR"), "{reply}");
    assert!(gw.gateway.state.registry.get("second").is_none());

    // The primary connection is still usable, and the name is free.
    let reply = primary
        .request("SESSION ADD STYLE=RAW ID=second LISTEN_PORT=101")
        .await;
    assert!(reply.contains("RESULT=OK"), "{reply}");
}

#[tokio::test]
async fn test_sub_session_rejects_destination() {
    let gw = TestGateway::new().await;
    let mut primary = gw.client("3.1").await;
    create_session(&mut primary, "STYLE=PRIMARY ID=nodest DESTINATION=TRANSIENT").await;

    let reply = primary
        .request("SESSION ADD STYLE=STREAM ID=child DESTINATION=TRANSIENT")
        .await;
    assert!(reply.starts_with("SESSION STATUS RESULT=I2P_ERROR"), "{reply}");
}

#[tokio::test]
async fn test_primary_rejects_sub_session_keys() {
    let gw = TestGateway::new().await;
    let mut client = gw.client("3.1").await;

    let reply = client
        .request("SESSION CREATE STYLE=PRIMARY ID=ported DESTINATION=TRANSIENT FROM_PORT=5")
        .await;
    assert!(reply.starts_with("SESSION STATUS RESULT=I2P_ERROR"), "{reply}");
}

#[tokio::test]
async fn test_primary_needs_protocol_3() {
    let gw = TestGateway::new().await;
    let mut client = gw.client("2.0").await;

    let reply = client
        .request("SESSION CREATE STYLE=PRIMARY DESTINATION=TRANSIENT")
        .await;
    assert!(reply.starts_with("SESSION STATUS RESULT=I2P_ERROR"), "{reply}");
}

#[tokio::test]
async fn test_closing_primary_removes_sub_sessions() {
    let gw = TestGateway::new().await;
    let mut primary = gw.client("3.1").await;
    create_session(&mut primary, "STYLE=MASTER ID=parent DESTINATION=TRANSIENT").await;
    primary
        .request("SESSION ADD STYLE=DATAGRAM ID=kid LISTEN_PORT=9")
        .await;
    drop(primary);

    for _ in 0..50 {
        if gw.gateway.state.registry.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(gw.gateway.state.registry.is_empty());
}

#[tokio::test]
async fn test_messages_routed_by_protocol_and_port() {
    let gw = TestGateway::new().await;
    let mut primary = gw.client("3.1").await;
    create_session(&mut primary, "STYLE=PRIMARY ID=mux DESTINATION=TRANSIENT").await;
    let primary_dest = my_destination(&mut primary).await;
    let reply = primary
        .request("SESSION ADD STYLE=RAW ID=raw21 PROTOCOL=21 LISTEN_PORT=100")
        .await;
    assert!(reply.contains("RESULT=OK"), "{reply}");
    let reply = primary
        .request("SESSION ADD STYLE=DATAGRAM ID=dgram200 LISTEN_PORT=200")
        .await;
    assert!(reply.contains("RESULT=OK"), "{reply}");

    let mut raw = gw.client("3.1").await;
    create_session(&mut raw, "STYLE=RAW ID=rawsrc DESTINATION=TRANSIENT PROTOCOL=21").await;
    let mut dgram = gw.client("3.1").await;
    create_session(&mut dgram, "STYLE=DATAGRAM ID=dgramsrc DESTINATION=TRANSIENT").await;
    let dgram_dest = my_destination(&mut dgram).await;

    // Unmatched ports, and a protocol nobody listens on at port 100.
    for (port, body) in [(300, b"r300"), (200, b"r200")] {
        raw.send_with_payload(
            &format!("RAW SEND DESTINATION={primary_dest} SIZE=4 TO_PORT={port}"),
            body,
        )
        .await;
    }
    raw.send_with_payload(
        &format!("RAW SEND DESTINATION={primary_dest} SIZE=4 PROTOCOL=22 TO_PORT=100"),
        b"p22!",
    )
    .await;
    raw.send_with_payload(
        &format!("RAW SEND DESTINATION={primary_dest} SIZE=4 TO_PORT=100"),
        b"r100",
    )
    .await;

    // Nothing sent before it reached the primary's client.
    assert_eq!(
        primary.read_line().await,
        "RAW RECEIVED SIZE=4 PROTOCOL=21 FROM_PORT=0 TO_PORT=100"
    );
    assert_eq!(primary.read_exact(4).await, b"r100");

    dgram
        .send_with_payload(
            &format!("DATAGRAM SEND DESTINATION={primary_dest} SIZE=4 TO_PORT=300"),
            b"d300",
        )
        .await;
    dgram
        .send_with_payload(
            &format!("DATAGRAM SEND DESTINATION={primary_dest} SIZE=4 TO_PORT=200"),
            b"d200",
        )
        .await;
    assert_eq!(
        primary.read_line().await,
        format!("DATAGRAM RECEIVED DESTINATION={dgram_dest} SIZE=4 FROM_PORT=0 TO_PORT=200")
    );
    assert_eq!(primary.read_exact(4).await, b"d200");

    // Each matched message arrived once: the next line is the next send.
    raw.send_with_payload(
        &format!("RAW SEND DESTINATION={primary_dest} SIZE=4 TO_PORT=100"),
        b"last",
    )
    .await;
    assert_eq!(
        primary.read_line().await,
        "RAW RECEIVED SIZE=4 PROTOCOL=21 FROM_PORT=0 TO_PORT=100"
    );
    assert_eq!(primary.read_exact(4).await, b"last");
}

#[tokio::test]
async fn test_inbound_stream_without_sub_session_is_dropped() {
    let gw = TestGateway::new().await;
    let mut primary = gw.client("3.1").await;
    create_session(&mut primary, "STYLE=PRIMARY ID=site DESTINATION=TRANSIENT").await;
    let primary_dest = my_destination(&mut primary).await;
    primary
        .request("SESSION ADD STYLE=STREAM ID=site80 LISTEN_PORT=80")
        .await;

    let mut cli = gw.client("3.1").await;
    create_session(&mut cli, "STYLE=STREAM ID=visitor DESTINATION=TRANSIENT").await;
    let cli_dest = my_destination(&mut cli).await;

    let mut acceptor = gw.client("3.1").await;
    assert_eq!(acceptor.request("STREAM ACCEPT ID=site80").await, "STREAM STATUS RESULT=OK");

    // Port 443 has no stream sub-session: the socket is dropped and the
    // spliced connection ends.
    let mut stray = gw.client("3.1").await;
    let reply = stray
        .request(&format!("STREAM CONNECT ID=visitor DESTINATION={primary_dest} TO_PORT=443"))
        .await;
    assert_eq!(reply, "STREAM STATUS RESULT=OK");
    stray.expect_closed().await;

    let mut connector = gw.client("3.1").await;
    let reply = connector
        .request(&format!("STREAM CONNECT ID=visitor DESTINATION={primary_dest} TO_PORT=80"))
        .await;
    assert_eq!(reply, "STREAM STATUS RESULT=OK");

    // The acceptor's first peer is the port 80 stream, not the dropped one.
    assert_eq!(
        acceptor.read_line().await,
        format!("{cli_dest} FROM_PORT=0 TO_PORT=80")
    );
    connector.send_bytes(b"home").await;
    assert_eq!(acceptor.read_exact(4).await, b"home");
}
