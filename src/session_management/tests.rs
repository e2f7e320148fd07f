use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use super::*;
use crate::environment::types::{EnvironmentSpec, HandleState};
use crate::environment::{BackoffPolicy, EnvironmentController};
use crate::error_handling::types::{EnvironmentError, FailureKind, ProxyError, SessionError};
use crate::network::NetworkBridgeConfig;
use crate::proxy::certificate_authority::crypto_provider;
use crate::proxy::types::{RootCertificate, UpstreamProxyConfig, UpstreamScheme};
use crate::proxy::ProxySessionManager;
use crate::screen_relay::ScreenRelay;
use crate::testing::{
    device_spec, free_port, init_logging, proxy_config, test_ca, vm_spec, FakeBridge,
    FakeHypervisor, Journal,
};

struct Rig {
    coordinator: SessionCoordinator,
    hypervisor: Arc<FakeHypervisor>,
    bridge: Arc<FakeBridge>,
    root: RootCertificate,
    _ca_dir: TempDir,
}

impl Rig {
    fn new() -> Self {
        init_logging();
        let journal = Journal::default();
        let hypervisor = Arc::new(FakeHypervisor::with_journal(journal.clone()));
        let bridge = Arc::new(FakeBridge::with_journal(journal));
        let backoff = BackoffPolicy {
            initial: Duration::from_millis(10),
            cap: Duration::from_millis(50),
        };
        let coordinator = SessionCoordinator::new(SessionComponents {
            environments: Arc::new(EnvironmentController::new(
                hypervisor.clone(),
                bridge.clone(),
                backoff,
            )),
            network: Arc::new(NetworkBridgeConfig::new(bridge.clone())),
            proxies: Arc::new(ProxySessionManager::new()),
            screen: Arc::new(ScreenRelay::new(bridge.clone(), Duration::from_millis(500))),
        });
        let ca_dir = tempfile::tempdir().unwrap();
        let root = test_ca(&ca_dir);
        Self {
            coordinator,
            hypervisor,
            bridge,
            root,
            _ca_dir: ca_dir,
        }
    }

    fn request(&self, environment: EnvironmentSpec, port: u16) -> SessionRequest {
        SessionRequest {
            app_target: "com.example.app".into(),
            environment,
            proxy: Arc::new(proxy_config(port, self.root.clone(), None)),
            screen_endpoint: None,
            deadline: None,
        }
    }

    /// Journal entries recorded after the last occurrence of `marker`.
    fn journal_after(&self, marker: &str) -> Vec<String> {
        let journal = self.bridge.journal();
        let start = journal
            .iter()
            .rposition(|e| e == marker)
            .unwrap_or_else(|| panic!("{} not in {:?}", marker, journal));
        journal[start + 1..].to_vec()
    }
}

/// Accepts one viewer connection and discards what it receives.
async fn screen_sink() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        if let Ok((mut viewer, _)) = listener.accept().await {
            let mut sink = Vec::new();
            let _ = viewer.read_to_end(&mut sink).await;
        }
    });
    port
}

async fn wait_for_state(rig: &Rig, id: uuid::Uuid, state: SessionState) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if rig.coordinator.get_status(id).await.unwrap() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "session never reached {}", state);
}

async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await.unwrap() == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).to_string()
}

#[tokio::test]
#[serial]
async fn setup_reaches_ready_and_teardown_runs_in_reverse_order() {
    let rig = Rig::new();
    let mut request = rig.request(vm_spec(), free_port());
    request.screen_endpoint = Some((IpAddr::V4(Ipv4Addr::LOCALHOST), screen_sink().await));

    let id = rig.coordinator.start_session(request).await.unwrap();
    assert_eq!(rig.coordinator.get_status(id).await.unwrap(), SessionState::Ready);
    assert!(rig.hypervisor.is_powered());
    rig.coordinator.begin_test(id).await.unwrap();
    assert_eq!(rig.coordinator.get_status(id).await.unwrap(), SessionState::Running);

    let report = rig.coordinator.stop_session(id).await.unwrap();
    assert_eq!(report.state, SessionState::TornDown);
    assert_eq!(report.stop_reason, StopReason::Explicit);
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert!(report.screen_endpoint_closed);
    assert_eq!(report.screen.as_ref().map(|s| s.bytes_relayed), Some(19));
    assert!(report.environment_log.contains("ActivityManager"));
    assert_eq!(report.environment_state, Some(HandleState::Released));

    assert_eq!(
        rig.journal_after("open_screen_stream"),
        vec![
            "screen_stream_closed",
            "clear_global_proxy",
            "collect_logs",
            "is_running",
            "power_off",
            "restore_snapshot snap-1",
        ]
    );
    assert!(!rig.hypervisor.is_powered());
    assert!(rig.coordinator.components().proxies.active_ports().is_empty());
    assert_eq!(rig.coordinator.components().environments.bound_count().await, 0);
}

#[tokio::test]
#[serial]
async fn deadline_expiry_reverts_the_vm_and_it_can_be_reacquired() {
    let rig = Rig::new();
    let port = free_port();
    let mut request = rig.request(vm_spec(), port);
    request.deadline = Some(Duration::from_millis(300));

    let id = rig.coordinator.start_session(request.clone()).await.unwrap();
    rig.coordinator.begin_test(id).await.unwrap();
    wait_for_state(&rig, id, SessionState::TornDown).await;

    let report = rig.coordinator.stop_session(id).await.unwrap();
    assert_eq!(report.stop_reason, StopReason::DeadlineExpired);
    assert!(report.traffic_log.is_empty());
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(report.environment_state, Some(HandleState::Released));
    assert_eq!(
        rig.journal_after("clear_global_proxy"),
        vec!["collect_logs", "is_running", "power_off", "restore_snapshot snap-1"]
    );
    assert!(!rig.hypervisor.is_powered());

    // Same VM, same port, booted again from the clean snapshot.
    let again = rig.coordinator.start_session(request).await.unwrap();
    assert_eq!(rig.coordinator.get_status(again).await.unwrap(), SessionState::Ready);
    assert_eq!(
        rig.journal_after("power_off")[..4],
        ["restore_snapshot snap-1", "is_running", "restore_snapshot snap-1", "start"]
    );
    rig.coordinator.stop_session(again).await.unwrap();
}

#[tokio::test]
#[serial]
async fn dropped_start_request_still_unwinds_the_environment() {
    let rig = Rig::new();
    rig.bridge.set_reachable(false);
    let mut spec = vm_spec();
    if let EnvironmentSpec::VirtualMachine(vm) = &mut spec {
        vm.timeout = Duration::from_millis(400);
    }

    let cancelled = tokio::time::timeout(
        Duration::from_millis(100),
        rig.coordinator.start_session(rig.request(spec.clone(), free_port())),
    )
    .await;
    assert!(cancelled.is_err());

    let id = rig.coordinator.sessions().await[0].id;
    wait_for_state(&rig, id, SessionState::Failed(FailureKind::DeviceUnreachable)).await;
    let report = rig.coordinator.stop_session(id).await.unwrap();
    assert_eq!(report.stop_reason, StopReason::SetupFailed);
    assert!(report.failures[0].starts_with("DeviceUnreachable"), "{:?}", report.failures);

    assert_eq!(rig.coordinator.components().environments.bound_count().await, 0);
    assert!(rig.coordinator.components().proxies.active_ports().is_empty());
    assert!(!rig.hypervisor.is_powered());
    assert_eq!(
        rig.hypervisor.journal().last().map(String::as_str),
        Some("restore_snapshot snap-1")
    );

    rig.bridge.set_reachable(true);
    let again = rig
        .coordinator
        .start_session(rig.request(spec, free_port()))
        .await
        .unwrap();
    assert_eq!(rig.coordinator.get_status(again).await.unwrap(), SessionState::Ready);
    rig.coordinator.stop_session(again).await.unwrap();
}

#[tokio::test]
#[serial]
async fn stale_listener_fails_setup_and_unwinds_route_and_environment() {
    let rig = Rig::new();
    let port = free_port();
    let _stale = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();

    let res = rig.coordinator.start_session(rig.request(vm_spec(), port)).await;
    assert!(
        matches!(res, Err(SessionError::Proxy(ProxyError::PortInUse(p))) if p == port),
        "{:?}",
        res
    );

    let sessions = rig.coordinator.sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].state, SessionState::Failed(FailureKind::PortInUse));
    assert_eq!(
        rig.journal_after(&format!("set_global_proxy 127.0.0.1:{}", port)),
        vec!["clear_global_proxy", "is_running", "power_off", "restore_snapshot snap-1"]
    );
    assert_eq!(rig.coordinator.components().environments.bound_count().await, 0);
    assert!(rig.coordinator.components().proxies.active_ports().is_empty());

    let report = rig.coordinator.stop_session(sessions[0].id).await.unwrap();
    assert_eq!(report.stop_reason, StopReason::SetupFailed);
    assert!(report.failures[0].starts_with("PortInUse"), "{:?}", report.failures);
    assert_eq!(report.environment_state, Some(HandleState::Released));
}

#[tokio::test]
#[serial]
async fn unreachable_device_fails_without_routing() {
    let rig = Rig::new();
    rig.bridge.set_reachable(false);
    let mut spec = device_spec();
    if let EnvironmentSpec::PhysicalDevice(device) = &mut spec {
        device.timeout = Duration::from_millis(100);
    }

    let res = rig.coordinator.start_session(rig.request(spec, free_port())).await;
    assert!(matches!(
        res,
        Err(SessionError::Environment(EnvironmentError::DeviceUnreachable { .. }))
    ));
    assert!(rig.bridge.journal().is_empty());
    let sessions = rig.coordinator.sessions().await;
    assert_eq!(
        sessions[0].state,
        SessionState::Failed(FailureKind::DeviceUnreachable)
    );
}

#[tokio::test]
#[serial]
async fn intercepts_https_through_upstream_proxy() {
    let rig = Rig::new();

    // Operator proxy: answers CONNECT, then plays the TLS origin itself.
    let origin = rcgen::generate_simple_self_signed(vec!["example.test".to_string()]).unwrap();
    let origin_config = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(
            vec![origin.cert.der().clone()],
            rustls::pki_types::PrivateKeyDer::Pkcs8(origin.key_pair.serialize_der().into()),
        )
        .unwrap();
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = upstream.local_addr().unwrap().port();
    let (connect_tx, connect_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        let _ = connect_tx.send(head);
        stream
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
            .unwrap();
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(origin_config));
        let mut tls = acceptor.accept(stream).await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.ends_with(b"\r\n\r\n") {
            let n = tls.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        tls.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello")
            .await
            .unwrap();
        let _ = tls.shutdown().await;
    });

    let port = free_port();
    let mut request = rig.request(device_spec(), port);
    let mut proxy = proxy_config(
        port,
        rig.root.clone(),
        Some(UpstreamProxyConfig {
            scheme: UpstreamScheme::Http,
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: upstream_port,
            verify_tls: false,
            credentials: None,
        }),
    );
    proxy.drain_grace = Duration::from_secs(2);
    request.proxy = Arc::new(proxy);
    let id = rig.coordinator.start_session(request).await.unwrap();
    rig.coordinator.begin_test(id).await.unwrap();
    let mut live = rig.coordinator.subscribe_traffic(id).await.unwrap();

    // The app under test: trusts the root CA installed by routing.
    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client
        .write_all(b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n")
        .await
        .unwrap();
    assert!(read_head(&mut client).await.starts_with("HTTP/1.1 200"));

    use rustls::pki_types::pem::PemObject;
    let ca_pem = std::fs::read(&rig.root.cert_path).unwrap();
    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(rustls::pki_types::CertificateDer::from_pem_slice(&ca_pem).unwrap())
        .unwrap();
    let client_config = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
    let name = rustls::pki_types::ServerName::try_from("example.test").unwrap();
    let mut tls = connector.connect(name, client).await.unwrap();
    tls.write_all(b"GET /index.html HTTP/1.1\r\nHost: example.test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match tls.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => response.extend_from_slice(&buf[..n]),
        }
    }
    assert!(String::from_utf8_lossy(&response).ends_with("hello"));
    let _ = tls.shutdown().await;
    drop(tls);

    let flow = tokio::time::timeout(Duration::from_secs(5), live.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(flow.host, "example.test");

    let connect = connect_rx.await.unwrap();
    assert!(connect.starts_with("CONNECT example.test:443 HTTP/1.1\r\n"));

    let report = rig.coordinator.stop_session(id).await.unwrap();
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(report.traffic_log.len(), 1);
    let flow = &report.traffic_log[0];
    assert_eq!(flow.session_id, id);
    assert_eq!(flow.host, "example.test");
    assert_eq!(flow.port, 443);
    assert_eq!(flow.operation, "GET");
    assert!(flow.tls_intercepted);
    assert!(!flow.truncated);
    assert!(flow.request_bytes.starts_with(b"GET /index.html HTTP/1.1\r\n"));
    assert!(String::from_utf8_lossy(&flow.response_bytes).ends_with("hello"));
}

#[tokio::test]
#[serial]
async fn screen_relay_failure_is_not_fatal() {
    let rig = Rig::new();
    rig.bridge.set_screen_available(false);
    let mut request = rig.request(device_spec(), free_port());
    request.screen_endpoint = Some((IpAddr::V4(Ipv4Addr::LOCALHOST), screen_sink().await));

    let id = rig.coordinator.start_session(request).await.unwrap();
    assert_eq!(rig.coordinator.get_status(id).await.unwrap(), SessionState::Ready);
    rig.coordinator.begin_test(id).await.unwrap();
    assert_eq!(rig.coordinator.get_status(id).await.unwrap(), SessionState::Running);

    let report = rig.coordinator.stop_session(id).await.unwrap();
    assert_eq!(report.state, SessionState::TornDown);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].starts_with("StreamUnavailable"), "{:?}", report.failures);
    assert!(report.screen.is_none());
}

#[tokio::test]
#[serial]
async fn stop_mid_flight_truncates_open_flow() {
    let rig = Rig::new();

    // Origin that takes the request and never answers.
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_port = origin.local_addr().unwrap().port();
    let (seen_tx, seen_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = origin.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        let _ = seen_tx.send(head);
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
    });

    let port = free_port();
    let id = rig
        .coordinator
        .start_session(rig.request(device_spec(), port))
        .await
        .unwrap();
    rig.coordinator.begin_test(id).await.unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client
        .write_all(
            format!(
                "GET http://127.0.0.1:{}/slow HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
                origin_port, origin_port
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    let forwarded = tokio::time::timeout(Duration::from_secs(5), seen_rx)
        .await
        .unwrap()
        .unwrap();
    assert!(forwarded.starts_with("GET /slow HTTP/1.1\r\n"));

    let report = rig.coordinator.stop_session(id).await.unwrap();
    assert_eq!(report.state, SessionState::TornDown);
    assert!(
        report.failures.iter().any(|f| f.starts_with("DrainTimeout")),
        "{:?}",
        report.failures
    );
    assert_eq!(report.traffic_log.len(), 1);
    assert!(report.traffic_log[0].truncated);
    assert_eq!(report.traffic_log[0].operation, "GET");
    let drain = report.drain.as_ref().expect("drain report kept on timeout");
    assert_eq!(drain.in_flight, 1);
    assert_eq!(drain.truncated_flows, 1);
    assert_eq!(drain.flows_committed, 1);
    assert_eq!(report.environment_state, Some(HandleState::Released));
    drop(client);
}

#[tokio::test]
#[serial]
async fn stop_is_idempotent_and_concurrent_callers_share_the_report() {
    let rig = Rig::new();
    let id = rig
        .coordinator
        .start_session(rig.request(device_spec(), free_port()))
        .await
        .unwrap();
    rig.coordinator.begin_test(id).await.unwrap();

    let (first, second) = tokio::join!(
        rig.coordinator.stop_session(id),
        rig.coordinator.stop_session(id)
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(first.stopped_at, second.stopped_at);

    let later = rig.coordinator.stop_session(id).await.unwrap();
    assert_eq!(later.stopped_at, first.stopped_at);
    let clears = rig
        .bridge
        .journal()
        .iter()
        .filter(|e| *e == "clear_global_proxy")
        .count();
    assert_eq!(clears, 1);
}

#[tokio::test]
#[serial]
async fn ready_session_can_be_stopped_without_running() {
    let rig = Rig::new();
    let id = rig
        .coordinator
        .start_session(rig.request(device_spec(), free_port()))
        .await
        .unwrap();
    let active = rig.coordinator.lookup(id).await.unwrap();
    assert!(!*active.disarm.borrow());

    let report = rig.coordinator.stop_session(id).await.unwrap();
    assert_eq!(report.state, SessionState::TornDown);
    // Recorded even though no watchdog was listening.
    assert!(*active.disarm.borrow());

    assert!(matches!(
        rig.coordinator.begin_test(id).await,
        Err(SessionError::InvalidTransition { .. })
    ));
    assert!(matches!(
        rig.coordinator.subscribe_traffic(id).await,
        Err(SessionError::NoTrafficLog { .. })
    ));
}

#[tokio::test]
#[serial]
async fn unknown_session_is_not_found() {
    let rig = Rig::new();
    let id = uuid::Uuid::new_v4();
    assert!(matches!(
        rig.coordinator.get_status(id).await,
        Err(SessionError::NotFound(_))
    ));
    assert!(matches!(
        rig.coordinator.stop_session(id).await,
        Err(SessionError::NotFound(_))
    ));
}

#[tokio::test]
#[serial]
async fn environments_and_ports_are_exclusive() {
    let rig = Rig::new();
    let port = free_port();
    let first = rig
        .coordinator
        .start_session(rig.request(device_spec(), port))
        .await
        .unwrap();

    let same_env = rig
        .coordinator
        .start_session(rig.request(device_spec(), free_port()))
        .await;
    assert!(matches!(
        same_env,
        Err(SessionError::Environment(
            EnvironmentError::EnvironmentUnavailable(_)
        ))
    ));

    let same_port = rig.coordinator.start_session(rig.request(vm_spec(), port)).await;
    assert!(matches!(
        same_port,
        Err(SessionError::Proxy(ProxyError::PortInUse(_)))
    ));
    // Only the first session still holds anything.
    assert_eq!(rig.coordinator.components().environments.bound_count().await, 1);
    assert_eq!(rig.coordinator.components().proxies.active_ports(), vec![port]);

    rig.coordinator.stop_session(first).await.unwrap();
    assert_eq!(rig.coordinator.components().environments.bound_count().await, 0);
}

#[tokio::test]
#[serial]
async fn failed_revert_is_reported_as_leak() {
    let rig = Rig::new();
    let id = rig
        .coordinator
        .start_session(rig.request(vm_spec(), free_port()))
        .await
        .unwrap();
    rig.hypervisor.fail_restore(true);

    let report = rig.coordinator.stop_session(id).await.unwrap();
    assert_eq!(report.state, SessionState::TornDown);
    assert_eq!(report.environment_state, Some(HandleState::Leaked));
    assert!(
        report.failures.iter().any(|f| f.starts_with("ResourceLeak")),
        "{:?}",
        report.failures
    );

    let environments = &rig.coordinator.components().environments;
    assert_eq!(environments.leaked().await.len(), 1);
    rig.hypervisor.fail_restore(false);
    let res = rig.coordinator.start_session(rig.request(vm_spec(), free_port())).await;
    assert!(matches!(
        res,
        Err(SessionError::Environment(
            EnvironmentError::EnvironmentUnavailable(_)
        ))
    ));
}

#[tokio::test]
#[serial]
async fn shutdown_all_stops_live_sessions() {
    let rig = Rig::new();
    let running = rig
        .coordinator
        .start_session(rig.request(device_spec(), free_port()))
        .await
        .unwrap();
    rig.coordinator.begin_test(running).await.unwrap();
    let ready = rig
        .coordinator
        .start_session(rig.request(vm_spec(), free_port()))
        .await
        .unwrap();

    let reports = rig.coordinator.shutdown_all().await;
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.stop_reason == StopReason::Shutdown));
    for id in [running, ready] {
        assert_eq!(
            rig.coordinator.get_status(id).await.unwrap(),
            SessionState::TornDown
        );
    }
    assert!(rig.coordinator.shutdown_all().await.is_empty());
}
