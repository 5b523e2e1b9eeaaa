// End-to-end tests of the detecting gateway on loopback sockets.
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use wiregate::{
    DetectingGateway, GatewayService, HttpClientAdapter, HttpProxyHandler,
    config::GatewayConfig,
    core::{ServiceDetails, ServiceRegistration},
    utils::GracefulShutdown,
};

struct TestGateway {
    gateway: Arc<GatewayService>,
    addr: SocketAddr,
    _shutdown: GracefulShutdown,
}

async fn start_gateway(config: GatewayConfig) -> TestGateway {
    let gateway = Arc::new(GatewayService::new(&config).unwrap());
    let proxy = Arc::new(HttpProxyHandler::new(
        gateway.clone(),
        Arc::new(HttpClientAdapter::new().unwrap()),
    ));
    let listener = DetectingGateway::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = GracefulShutdown::new();
    let acceptor = Arc::new(DetectingGateway::new(gateway.clone(), proxy));
    tokio::spawn(acceptor.run(listener, shutdown.shutdown_token()));
    TestGateway {
        gateway,
        addr,
        _shutdown: shutdown,
    }
}

fn register(gateway: &GatewayService, virtual_host: &str, urls: &[String]) {
    gateway.apply_service_update(
        false,
        &ServiceRegistration {
            service_path: virtual_host.to_string(),
            virtual_host: virtual_host.to_string(),
            urls: urls.to_vec(),
            params: HashMap::new(),
            details: ServiceDetails::default(),
        },
    );
}

/// MQTT 3.1.1 CONNECT with user name and password.
fn mqtt_connect(client_id: &str, username: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0x00, 0x04]);
    body.extend_from_slice(b"MQTT");
    body.push(0x04);
    body.push(0x80 | 0x40 | 0x02);
    body.extend_from_slice(&30u16.to_be_bytes());
    for field in [client_id, username, "secret"] {
        body.extend_from_slice(&(field.len() as u16).to_be_bytes());
        body.extend_from_slice(field.as_bytes());
    }
    assert!(body.len() < 128, "single byte remaining length only");

    let mut packet = vec![0x10, body.len() as u8];
    packet.extend_from_slice(&body);
    packet
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_mqtt_relay_routes_by_virtual_host() {
    let east = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let west = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let test = start_gateway(GatewayConfig::default()).await;
    register(
        &test.gateway,
        "east",
        &[format!("mqtt://{}", east.local_addr().unwrap())],
    );
    register(
        &test.gateway,
        "west",
        &[format!("mqtt://{}", west.local_addr().unwrap())],
    );

    let mut client = TcpStream::connect(test.addr).await.unwrap();
    client
        .write_all(&mqtt_connect("sensor-1", "east/alice"))
        .await
        .unwrap();

    let (mut broker, _) = tokio::time::timeout(Duration::from_secs(5), east.accept())
        .await
        .expect("east broker receives the connection")
        .unwrap();

    // the virtual host prefix is stripped and the length fixed up
    let expected = mqtt_connect("sensor-1", "alice");
    let mut received = vec![0u8; expected.len()];
    broker.read_exact(&mut received).await.unwrap();
    assert_eq!(received, expected);

    // CONNACK back to the client, PINGREQ forward to the broker
    broker.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
    let mut connack = [0u8; 4];
    client.read_exact(&mut connack).await.unwrap();
    assert_eq!(connack, [0x20, 0x02, 0x00, 0x00]);

    client.write_all(&[0xc0, 0x00]).await.unwrap();
    let mut ping = [0u8; 2];
    broker.read_exact(&mut ping).await.unwrap();
    assert_eq!(ping, [0xc0, 0x00]);

    let tracker = test.gateway.tracker().clone();
    assert_eq!(tracker.successful_connection_attempts(), 1);
    assert_eq!(tracker.connected_clients().len(), 1);

    // broker hangs up; the client connection follows
    drop(broker);
    let mut rest = Vec::new();
    let _ = client.read_to_end(&mut rest).await;
    assert!(rest.is_empty());
    wait_until(|| tracker.connected_clients().is_empty()).await;
    assert_eq!(tracker.failed_connection_attempts(), 0);
}

#[tokio::test]
async fn test_silent_client_times_out_with_one_failure() {
    let config = GatewayConfig {
        connection_timeout: "200ms".to_string(),
        ..GatewayConfig::default()
    };
    let test = start_gateway(config).await;

    let mut client = TcpStream::connect(test.addr).await.unwrap();
    // fewer bytes than any protocol needs to be identified
    client.write_all(b"\x10").await.unwrap();

    let mut buf = Vec::new();
    let closed = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut buf)).await;
    assert!(closed.is_ok(), "gateway closes the silent connection");
    assert!(buf.is_empty());

    let tracker = test.gateway.tracker().clone();
    wait_until(|| tracker.failed_connection_attempts() == 1).await;
    // give a late second failure a chance to show up
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(tracker.failed_connection_attempts(), 1);
    assert_eq!(tracker.received_connection_attempts(), 1);
    assert_eq!(tracker.successful_connection_attempts(), 0);
    assert!(tracker.connecting_clients().is_empty());
}

#[tokio::test]
async fn test_connection_timeout_change_applies_to_new_connections() {
    let test = start_gateway(GatewayConfig::default()).await;
    test.gateway
        .tracker()
        .set_connection_timeout(Duration::from_millis(100));

    let mut client = TcpStream::connect(test.addr).await.unwrap();
    let mut buf = Vec::new();
    let closed = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut buf)).await;
    assert!(closed.is_ok());

    let tracker = test.gateway.tracker().clone();
    wait_until(|| tracker.failed_connection_attempts() == 1).await;
}
