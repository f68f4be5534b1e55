// tests/transport_memory.rs

use std::sync::Arc;

use bytes::Bytes;
use tokio::time::{timeout, Duration};

use rmq_rpc::{
    // ---
    create_memory_transport,
    Address,
    CorrelationId,
    Envelope,
    MemoryHub,
    JSON_CONTENT_TYPE,
};

#[tokio::test]
async fn memory_subscribe_then_publish_delivers() {
    // ---
    // Arrange
    // ---
    let transport = create_memory_transport("mstpd", MemoryHub::new());
    let address = Address::from("test.address");

    let mut sub = transport
        .subscribe(address.clone().into())
        .await
        .expect("subscribe failed");

    let payload = Bytes::from_static(b"{\"hello\":1}");
    let correlation_id = CorrelationId::generate();

    let env = Envelope::request(
        address.clone(),
        Arc::from("getHistory"),
        payload.clone(),
        correlation_id.clone().into(),
        Address::from("replies"),
    );

    // ---
    // Act
    // ---
    transport.publish(env).await.expect("publish failed");

    // ---
    // Assert
    // ---
    let received = timeout(Duration::from_millis(100), sub.inbox.recv())
        .await
        .expect("timed out waiting for message")
        .expect("subscription channel closed unexpectedly");

    assert_eq!(received.payload, payload);
    assert_eq!(received.address, address);
    assert_eq!(received.method.as_deref(), Some("getHistory"));
    assert_eq!(received.correlation_id.as_deref(), Some(correlation_id.as_str()));
    assert_eq!(received.reply_to, Some(Address::from("replies")));
    assert_eq!(received.content_type.as_deref(), Some(JSON_CONTENT_TYPE));
}

#[tokio::test]
async fn every_subscriber_of_an_address_receives_a_copy() {
    // ---
    let hub = MemoryHub::new();
    let a = create_memory_transport("a", hub.clone());
    let b = create_memory_transport("b", hub.clone());
    let publisher = create_memory_transport("p", hub);

    let mut sub_a = a.subscribe("fanout".into()).await.unwrap();
    let mut sub_b = b.subscribe("fanout".into()).await.unwrap();
    let mut other = a.subscribe("elsewhere".into()).await.unwrap();

    publisher
        .publish(Envelope::cast(
            Address::from("fanout"),
            Arc::from("tick"),
            Bytes::from_static(b"1"),
        ))
        .await
        .unwrap();

    for sub in [&mut sub_a, &mut sub_b] {
        let env = timeout(Duration::from_millis(100), sub.inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(env.reply_to.is_none());
        assert!(env.correlation_id.is_none());
    }

    let nothing = timeout(Duration::from_millis(50), other.inbox.recv()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn closing_a_transport_closes_its_inboxes() {
    // ---
    let hub = MemoryHub::new();
    let server = create_memory_transport("server", hub.clone());
    let client = create_memory_transport("client", hub);

    let mut server_sub = server.subscribe("calls".into()).await.unwrap();
    let mut client_sub = client.subscribe("calls".into()).await.unwrap();

    server.close().await.unwrap();

    assert!(server_sub.inbox.recv().await.is_none());

    client
        .publish(Envelope::cast(
            Address::from("calls"),
            Arc::from("still-here"),
            Bytes::new(),
        ))
        .await
        .unwrap();
    let env = timeout(Duration::from_millis(100), client_sub.inbox.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(env.method.as_deref(), Some("still-here"));
}
