mod common;

use std::time::Duration;

use common::ms;
use tessera_net::protocol::{ClientMessage, ServerMessage, StoreRequest};

#[test]
fn test_connect_and_receive_welcome() {
    let (mut server, addr) = common::bind_server();

    let mut client = common::RawClient::connect(&addr).unwrap();
    client.send_hello("seat-1").unwrap();
    common::drive_until_clients(&mut server, 1, Duration::from_secs(2));

    match client.recv().unwrap() {
        ServerMessage::Welcome { .. } => {}
        other => panic!("Expected Welcome, got {:?}", other),
    }
}

#[test]
fn test_clients_get_distinct_ids() {
    let (mut server, addr) = common::bind_server();

    let mut a = common::RawClient::connect(&addr).unwrap();
    let mut b = common::RawClient::connect(&addr).unwrap();
    a.send_hello("a").unwrap();
    b.send_hello("b").unwrap();
    common::drive_until_clients(&mut server, 2, Duration::from_secs(2));

    let id = |msg: ServerMessage| match msg {
        ServerMessage::Welcome { client_id } => client_id,
        other => panic!("Expected Welcome, got {:?}", other),
    };
    assert_ne!(id(a.recv().unwrap()), id(b.recv().unwrap()));
}

#[test]
fn test_messages_before_hello_are_refused() {
    let (mut server, addr) = common::bind_server();

    let mut client = common::RawClient::connect(&addr).unwrap();
    client
        .send(&ClientMessage::Store {
            request_id: 1,
            request: StoreRequest::ReadGlobal,
        })
        .unwrap();
    common::settle(&mut server, ms(0));

    match client.recv().unwrap() {
        ServerMessage::Error { message } => assert!(message.contains("Hello")),
        other => panic!("Expected Error, got {:?}", other),
    }
    assert_eq!(server.client_count(), 0);
}

#[test]
fn test_ping_pong() {
    let (mut server, addr) = common::bind_server();
    let mut client = common::connected_client(&mut server, &addr, "seat-1");

    client.send(&ClientMessage::Ping).unwrap();
    common::settle(&mut server, ms(0));
    assert_eq!(client.recv().unwrap(), ServerMessage::Pong);
}

#[test]
fn test_goodbye_removes_client() {
    let (mut server, addr) = common::bind_server();
    let mut client = common::connected_client(&mut server, &addr, "seat-1");

    client.send(&ClientMessage::Goodbye).unwrap();
    common::drive_until(&mut server, ms(0), Duration::from_secs(2), |s| s.client_count() == 0);
}

#[test]
fn test_dropped_connection_removes_client() {
    let (mut server, addr) = common::bind_server();
    let client = common::connected_client(&mut server, &addr, "seat-1");

    drop(client);
    common::drive_until(&mut server, ms(0), Duration::from_secs(2), |s| s.client_count() == 0);
}

#[test]
fn test_shutdown_is_broadcast() {
    let (mut server, addr) = common::bind_server();
    let mut a = common::connected_client(&mut server, &addr, "a");
    let mut b = common::connected_client(&mut server, &addr, "b");

    server.broadcast_shutdown();
    assert_eq!(a.recv().unwrap(), ServerMessage::Shutdown);
    assert_eq!(b.recv().unwrap(), ServerMessage::Shutdown);
}
