//! Listener manager behaviour against real sockets.

use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use mqttd::config::{ListenerConfig, Protocol, TlsConfig};
use mqttd::net::manager::{share, ListenerManager, ReloadError};
use mqttd::net::stream::PeerAddr;
use mqttd::net::BindError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

mod common;
use common::{free_port, harness, harness_with_identity, next_connection, port_is_free, Pki, WAIT};

fn local(port: u16) -> ListenerConfig {
    ListenerConfig::tcp(Some("127.0.0.1"), port)
}

fn first_addr(manager: &ListenerManager, index: usize) -> std::net::SocketAddr {
    manager.listeners()[index].local_addrs()[0]
}

#[tokio::test]
async fn failed_bind_leaves_nothing_open() {
    let h = harness();
    let busy = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let busy_port = busy.local_addr().unwrap().port();
    let first = free_port();

    let mut manager = ListenerManager::new(h.ctx, None);
    let err = manager
        .start_all(&share(&[local(first), local(busy_port)]))
        .unwrap_err();

    assert_eq!(err.listener_index, 1);
    assert!(matches!(err.cause, BindError::AddressInUse { .. }), "got {:?}", err.cause);
    assert!(manager.is_empty());
    assert!(port_is_free(first));
}

#[tokio::test]
async fn invalid_key_path_is_an_invalid_cert_error() {
    let h = harness();
    let dir = tempfile::tempdir().unwrap();
    let pki = Pki::generate(dir.path(), "a");
    let plain_port = free_port();
    let tls_port = free_port();

    let broken = ListenerConfig {
        tls: Some(TlsConfig {
            key_file: Some(dir.path().join("missing.key")),
            ..pki.server_tls()
        }),
        ..local(tls_port)
    };

    let mut manager = ListenerManager::new(h.ctx, None);
    let err = manager.start_all(&share(&[local(plain_port), broken])).unwrap_err();

    assert_eq!(err.listener_index, 1);
    assert!(matches!(err.cause, BindError::InvalidCert(_)));
    assert!(manager.is_empty());
    assert!(port_is_free(plain_port));
    assert!(port_is_free(tls_port));
}

#[tokio::test]
async fn stop_all_is_idempotent() {
    let h = harness();
    let port = free_port();
    let mut manager = ListenerManager::new(h.ctx, None);
    manager.start_all(&share(&[local(port)])).unwrap();
    manager.serve();
    assert!(manager.statuses()[0].serving);

    manager.stop_all().await;
    manager.stop_all().await;

    assert!(manager.statuses().is_empty());
    assert!(manager.board().snapshot().is_empty());
    assert!(port_is_free(port));
}

#[tokio::test]
async fn plain_tcp_connection_is_handed_off() {
    let mut h = harness();
    let mut manager = ListenerManager::new(h.ctx.clone(), None);
    manager.start_all(&share(&[local(0)])).unwrap();
    manager.serve();
    let addr = first_addr(&manager, 0);

    let mut client = TcpStream::connect(addr).await.unwrap();
    let conn = next_connection(&mut h.rx).await;

    assert_eq!(conn.protocol, Protocol::Mqtt);
    assert_eq!(conn.listener_id, manager.listeners()[0].id());
    assert!(matches!(conn.peer, PeerAddr::Inet(_)));
    assert!(conn.username.is_none());
    assert!(!conn.stream.is_tls());
    assert_eq!(h.tracker.active_count(), 1);
    assert_eq!(manager.statuses()[0].clients, 1);

    client.write_all(b"\x10\x00").await.unwrap();
    drop(conn);
    assert_eq!(h.tracker.active_count(), 0);
    manager.stop_all().await;
}

#[tokio::test]
async fn connections_over_the_limit_are_closed() {
    let mut h = harness();
    let config = ListenerConfig {
        max_connections: Some(1),
        ..local(0)
    };
    let mut manager = ListenerManager::new(h.ctx.clone(), None);
    manager.start_all(&share(&[config])).unwrap();
    manager.serve();
    let addr = first_addr(&manager, 0);

    let _first = TcpStream::connect(addr).await.unwrap();
    let held = next_connection(&mut h.rx).await;

    let mut second = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(WAIT, second.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)), "over-limit connection stayed open");
    assert!(h.rx.try_recv().is_err());

    drop(held);
    manager.stop_all().await;
}

#[tokio::test]
async fn global_limit_applies_when_listener_has_none() {
    let h = harness();
    let mut manager = ListenerManager::new(h.ctx, Some(7));
    manager.start_all(&share(&[local(0)])).unwrap();
    assert_eq!(manager.statuses()[0].max_clients, Some(7));
    manager.stop_all().await;
}

#[tokio::test]
async fn unix_socket_listener_accepts_and_cleans_up() {
    let mut h = harness();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mqttd.sock");

    let mut manager = ListenerManager::new(h.ctx.clone(), None);
    manager.start_all(&share(&[ListenerConfig::unix(&path)])).unwrap();
    manager.serve();

    let _client = UnixStream::connect(&path).await.unwrap();
    let conn = next_connection(&mut h.rx).await;
    assert_eq!(conn.peer, PeerAddr::Unix);

    manager.stop_all().await;
    assert!(!path.exists());
}

#[tokio::test]
async fn websocket_upgrade_respects_mount_point() {
    let mut h = harness();
    let config = ListenerConfig {
        protocol: Protocol::Websockets,
        mount_point: Some("/mqtt".to_string()),
        ..local(0)
    };
    let mut manager = ListenerManager::new(h.ctx.clone(), None);
    manager.start_all(&share(&[config])).unwrap();
    manager.serve();
    let addr = first_addr(&manager, 0);

    let mut request = format!("ws://{addr}/mqtt").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("mqtt"));
    let tcp = TcpStream::connect(addr).await.unwrap();
    let (mut ws, response) = tokio_tungstenite::client_async(request, tcp).await.unwrap();
    assert_eq!(
        response.headers().get("Sec-WebSocket-Protocol").unwrap(),
        "mqtt"
    );

    let conn = next_connection(&mut h.rx).await;
    assert!(conn.stream.is_websocket());
    assert_eq!(conn.protocol, Protocol::Websockets);
    ws.send(Message::Binary(vec![0xc0, 0x00].into())).await.unwrap();

    let request = format!("ws://{addr}/elsewhere").into_client_request().unwrap();
    let tcp = TcpStream::connect(addr).await.unwrap();
    assert!(tokio_tungstenite::client_async(request, tcp).await.is_err());
    assert!(h.rx.try_recv().is_err());

    manager.stop_all().await;
}

#[tokio::test]
async fn websocket_listener_on_unix_socket_upgrades() {
    let mut h = harness();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ws.sock");
    let config = ListenerConfig {
        protocol: Protocol::Websockets,
        mount_point: Some("/mqtt".to_string()),
        ..ListenerConfig::unix(&path)
    };
    let mut manager = ListenerManager::new(h.ctx.clone(), None);
    manager.start_all(&share(&[config])).unwrap();
    manager.serve();

    let mut raw = UnixStream::connect(&path).await.unwrap();
    raw.write_all(b"\x10\x0c\x00\x04MQTT\x04\x02\x00\x3c\r\n\r\n").await.unwrap();
    let mut buf = [0u8; 64];
    let _ = tokio::time::timeout(WAIT, raw.read(&mut buf)).await;
    assert!(h.rx.try_recv().is_err());

    let request = "ws://localhost/mqtt".into_client_request().unwrap();
    let unix = UnixStream::connect(&path).await.unwrap();
    let (_ws, _) = tokio_tungstenite::client_async(request, unix).await.unwrap();
    let conn = next_connection(&mut h.rx).await;
    assert!(conn.stream.is_websocket());
    assert_eq!(conn.protocol, Protocol::Websockets);

    manager.stop_all().await;
}

#[tokio::test]
async fn mqtt_sn_on_unix_socket_fails_startup() {
    let h = harness();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sn.sock");
    let config = ListenerConfig {
        protocol: Protocol::MqttSn,
        ..ListenerConfig::unix(&path)
    };
    let mut manager = ListenerManager::new(h.ctx, None);
    let err = manager.start_all(&share(&[config])).unwrap_err();
    assert!(matches!(err.cause, BindError::UnsupportedProtocol(_)));
    assert!(!path.exists());
}

#[tokio::test]
async fn tls_client_identity_becomes_username() {
    let mut h = harness();
    let dir = tempfile::tempdir().unwrap();
    let pki = Pki::generate(dir.path(), "m");
    let config = ListenerConfig {
        tls: Some(pki.mutual_tls()),
        ..local(0)
    };
    let mut manager = ListenerManager::new(h.ctx.clone(), None);
    manager.start_all(&share(&[config])).unwrap();
    manager.serve();
    let addr = first_addr(&manager, 0);

    let mut client = pki.connect(addr, true).await.unwrap();
    client.write_all(b"\x10\x00").await.unwrap();

    let conn = next_connection(&mut h.rx).await;
    assert!(conn.stream.is_tls());
    assert_eq!(conn.username.as_deref(), Some("sensor-1"));
    manager.stop_all().await;
}

#[tokio::test]
async fn rejected_identity_never_reaches_the_core() {
    let deny_all = |_: &str| -> Option<String> { None };
    let mut h = harness_with_identity(Arc::new(deny_all));
    let dir = tempfile::tempdir().unwrap();
    let pki = Pki::generate(dir.path(), "r");
    let config = ListenerConfig {
        tls: Some(pki.mutual_tls()),
        ..local(0)
    };
    let mut manager = ListenerManager::new(h.ctx.clone(), None);
    manager.start_all(&share(&[config])).unwrap();
    manager.serve();
    let addr = first_addr(&manager, 0);

    let mut client = pki.connect(addr, true).await.unwrap();
    let _ = client.write_all(b"\x10\x00").await;
    let mut buf = [0u8; 1];
    let _ = tokio::time::timeout(WAIT, client.read(&mut buf)).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.rx.try_recv().is_err());
    assert_eq!(h.tracker.active_count(), 0);
    manager.stop_all().await;
}

#[tokio::test]
async fn certificate_reload_keeps_contexts_already_loaded() {
    let h = harness();
    let dir = tempfile::tempdir().unwrap();
    let old = Pki::generate(dir.path(), "old");
    let new = Pki::generate(dir.path(), "new");
    let port = free_port();

    let mut manager = ListenerManager::new(h.ctx, None);
    let initial = ListenerConfig {
        tls: Some(old.server_tls()),
        ..local(port)
    };
    manager.start_all(&share(&[initial])).unwrap();
    manager.serve();

    let in_flight = manager.listeners()[0].tls_context().unwrap();
    let old_fingerprint = in_flight.fingerprint().clone();

    let reloaded = ListenerConfig {
        tls: Some(new.server_tls()),
        ..local(port)
    };
    let errors = manager.reload_certificates(&share(&[reloaded]));
    assert!(errors.is_empty(), "{errors:?}");

    let current = manager.listeners()[0].tls_context().unwrap();
    assert!(!Arc::ptr_eq(&in_flight, &current));
    // A handshake that loaded the old context still owns a working copy.
    assert_eq!(in_flight.fingerprint(), &old_fingerprint);

    // The socket was never closed.
    assert!(!port_is_free(port));
    let addr = first_addr(&manager, 0);
    assert!(new.connect(addr, false).await.is_ok());
    assert!(old.connect(addr, false).await.is_err());

    manager.stop_all().await;
}

#[tokio::test]
async fn handshake_started_before_reload_completes_with_old_certificate() {
    let mut h = harness();
    let dir = tempfile::tempdir().unwrap();
    let old = Pki::generate(dir.path(), "old");
    let new = Pki::generate(dir.path(), "new");
    let port = free_port();

    let mut manager = ListenerManager::new(h.ctx.clone(), None);
    manager
        .start_all(&share(&[ListenerConfig {
            tls: Some(old.server_tls()),
            ..local(port)
        }]))
        .unwrap();
    manager.serve();
    let addr = first_addr(&manager, 0);

    // Accepted, context loaded, ClientHello not yet sent.
    let pending = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let errors = manager.reload_certificates(&share(&[ListenerConfig {
        tls: Some(new.server_tls()),
        ..local(port)
    }]));
    assert!(errors.is_empty(), "{errors:?}");

    let finished = old.handshake(pending, false).await;
    assert!(finished.is_ok(), "{:?}", finished.err());
    let conn = next_connection(&mut h.rx).await;
    assert!(matches!(conn.peer, PeerAddr::Inet(_)));

    assert!(old.connect(addr, false).await.is_err());
    assert!(new.connect(addr, false).await.is_ok());
    manager.stop_all().await;
}

#[tokio::test]
async fn changed_listener_with_broken_certificate_fails_once() {
    let h = harness();
    let dir = tempfile::tempdir().unwrap();
    let pki = Pki::generate(dir.path(), "c");
    let port = free_port();

    let mut manager = ListenerManager::new(h.ctx, None);
    manager
        .start_all(&share(&[ListenerConfig {
            tls: Some(pki.server_tls()),
            ..local(port)
        }]))
        .unwrap();
    manager.serve();

    let desired = share(&[ListenerConfig {
        max_connections: Some(3),
        tls: Some(TlsConfig {
            key_file: Some(dir.path().join("missing.key")),
            ..pki.server_tls()
        }),
        ..local(port)
    }]);
    let cert_errors = manager.reload_certificates(&desired);
    assert!(cert_errors.is_empty(), "{cert_errors:?}");

    let summary = manager.apply(&desired).await;
    assert_eq!(summary.errors.len(), 1);
    assert!(matches!(
        summary.errors[0],
        ReloadError::Bind {
            source: BindError::InvalidCert(_),
            ..
        }
    ));
    manager.stop_all().await;
}

#[tokio::test]
async fn unchanged_certificates_are_not_reloaded() {
    let h = harness();
    let dir = tempfile::tempdir().unwrap();
    let pki = Pki::generate(dir.path(), "same");
    let config = share(&[ListenerConfig {
        tls: Some(pki.server_tls()),
        ..local(0)
    }]);

    let mut manager = ListenerManager::new(h.ctx, None);
    manager.start_all(&config).unwrap();
    let before = manager.listeners()[0].tls_context().unwrap();

    let port = first_addr(&manager, 0).port();
    let same = share(&[ListenerConfig {
        tls: Some(pki.server_tls()),
        ..local(port)
    }]);
    assert!(manager.reload_certificates(&same).is_empty());
    let after = manager.listeners()[0].tls_context().unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    manager.stop_all().await;
}

#[tokio::test]
async fn one_broken_certificate_does_not_block_the_others() {
    let h = harness();
    let dir = tempfile::tempdir().unwrap();
    let a = Pki::generate(dir.path(), "a");
    let b = Pki::generate(dir.path(), "b");
    let b2 = Pki::generate(dir.path(), "b2");
    let (port_a, port_b) = (free_port(), free_port());

    let mut manager = ListenerManager::new(h.ctx, None);
    manager
        .start_all(&share(&[
            ListenerConfig {
                tls: Some(a.server_tls()),
                ..local(port_a)
            },
            ListenerConfig {
                tls: Some(b.server_tls()),
                ..local(port_b)
            },
        ]))
        .unwrap();
    let a_before = manager.listeners()[0].tls_context().unwrap();
    let b_before = manager.listeners()[1].tls_context().unwrap();

    let errors = manager.reload_certificates(&share(&[
        ListenerConfig {
            tls: Some(TlsConfig {
                cert_file: Some(dir.path().join("gone.pem")),
                ..a.server_tls()
            }),
            ..local(port_a)
        },
        ListenerConfig {
            tls: Some(b2.server_tls()),
            ..local(port_b)
        },
    ]));

    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], ReloadError::CertLoad { index: 0, .. }));
    assert!(Arc::ptr_eq(&a_before, &manager.listeners()[0].tls_context().unwrap()));
    assert!(!Arc::ptr_eq(&b_before, &manager.listeners()[1].tls_context().unwrap()));
    manager.stop_all().await;
}

#[tokio::test]
async fn apply_diffs_by_endpoint() {
    let h = harness();
    let (a, b, c) = (free_port(), free_port(), free_port());
    let mut manager = ListenerManager::new(h.ctx, None);
    manager.start_all(&share(&[local(a), local(b)])).unwrap();
    manager.serve();
    let kept_id = manager.listeners()[1].id();

    let summary = manager.apply(&share(&[local(b), local(c)])).await;

    assert_eq!(summary.kept, 1);
    assert_eq!(summary.removed, vec![local(a).endpoint_key()]);
    assert_eq!(summary.added, vec![local(c).endpoint_key()]);
    assert!(summary.restarted.is_empty());
    assert!(summary.errors.is_empty());

    assert_eq!(manager.listeners()[0].id(), kept_id);
    assert_eq!(manager.listeners()[0].index(), 0);
    assert!(manager.listeners()[1].is_serving());
    assert!(port_is_free(a));
    assert!(!port_is_free(c));

    manager.stop_all().await;
}

#[tokio::test]
async fn apply_restarts_listeners_whose_settings_changed() {
    let h = harness();
    let port = free_port();
    let mut manager = ListenerManager::new(h.ctx, None);
    manager.start_all(&share(&[local(port)])).unwrap();
    manager.serve();
    let old_id = manager.listeners()[0].id();

    let changed = ListenerConfig {
        max_connections: Some(5),
        ..local(port)
    };
    let summary = manager.apply(&share(&[changed])).await;

    assert_eq!(summary.restarted, vec![local(port).endpoint_key()]);
    assert!(summary.added.is_empty());
    assert_ne!(manager.listeners()[0].id(), old_id);
    assert_eq!(manager.statuses()[0].max_clients, Some(5));
    manager.stop_all().await;
}

#[tokio::test]
async fn local_only_binds_loopback() {
    let mut h = harness();
    let port = free_port();
    let mut manager = ListenerManager::new(h.ctx.clone(), None);
    manager.add_local_only(port).unwrap();
    manager.serve();

    assert!(!manager.is_empty());
    for listener in manager.listeners() {
        for addr in listener.local_addrs() {
            assert!(addr.ip().is_loopback());
            assert_eq!(addr.port(), port);
        }
    }

    let _client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    next_connection(&mut h.rx).await;
    manager.stop_all().await;
}

#[tokio::test]
async fn mqtt_sn_fails_startup() {
    let h = harness();
    let config = ListenerConfig {
        protocol: Protocol::MqttSn,
        ..local(0)
    };
    let mut manager = ListenerManager::new(h.ctx, None);
    let err = manager.start_all(&share(&[config])).unwrap_err();
    assert!(matches!(err.cause, BindError::UnsupportedProtocol(_)));
}
