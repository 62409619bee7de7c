/*
[INPUT]:  Mock premium gateway (wiremock acting as forward proxy), system_config switch
[OUTPUT]: Verification of tier selection, probe degradation and lease reuse
[POS]:    Integration test layer - egress identity allocation
[UPDATE]: When probe handling or tier fallback changes
*/

use aster_auto_core::types::ConfigValueType;
use aster_auto_core::{Database, SMARTPROXY_ENABLED_KEY};
use aster_auto_orchestrator::config::{PremiumKind, PremiumProxyConfig, ProxyConfig};
use aster_auto_orchestrator::{EgressTier, ProxySessionAllocator};
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DEV_URL: &str = "socks5://127.0.0.1:7890";

fn store() -> (TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::new(dir.path().join("proxy.db")).unwrap();
    (dir, db)
}

fn premium(port: u16, timeout_ms: u64) -> PremiumProxyConfig {
    PremiumProxyConfig {
        enabled: true,
        base_username: "sp9y3nhxbw".to_string(),
        password: Some(SecretString::from("gatepass".to_string())),
        host: "127.0.0.1".to_string(),
        port,
        kind: PremiumKind::Residential,
        probe_url: Some("http://probe.test/ip".to_string()),
        timeout_ms,
        ..PremiumProxyConfig::default()
    }
}

fn allocator(db: &Database, premium: PremiumProxyConfig) -> ProxySessionAllocator {
    ProxySessionAllocator::new(
        ProxyConfig {
            premium,
            dev_url: Some(DEV_URL.to_string()),
        },
        Arc::new(db.clone()),
    )
}

#[tokio::test]
async fn test_probe_success_leases_premium_session() {
    let gateway = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ip"))
        .respond_with(ResponseTemplate::new(200).set_body_string("203.0.113.7"))
        .expect(1)
        .mount(&gateway)
        .await;
    let (_dir, db) = store();
    let proxies = allocator(&db, premium(gateway.address().port(), 3000));

    let first = proxies.allocate(42).await.unwrap();
    assert_eq!(first.tier, EgressTier::Premium);
    assert_eq!(first.session_id.as_deref(), Some("task0042"));
    assert_eq!(first.port, gateway.address().port());

    // a live lease is reused without probing again
    let second = proxies.allocate(42).await.unwrap();
    assert_eq!(second.session_id, first.session_id);
    assert_eq!(proxies.active_sessions().await, vec![(42, "task0042".to_string())]);

    assert!(proxies.release(42).await);
    assert!(!proxies.release(42).await);
    assert!(proxies.active_sessions().await.is_empty());
}

#[tokio::test]
async fn test_failed_probe_degrades_to_dev_proxy() {
    let gateway = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&gateway)
        .await;
    let (_dir, db) = store();
    let proxies = allocator(&db, premium(gateway.address().port(), 3000));

    let identity = proxies.allocate(5).await.unwrap();
    assert_eq!(identity.tier, EgressTier::Development);
    assert_eq!(identity.display_url(), DEV_URL);
    assert!(identity.session_id.is_none());
    assert!(proxies.active_sessions().await.is_empty());
}

#[tokio::test]
async fn test_slow_gateway_degrades_within_timeout() {
    let gateway = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&gateway)
        .await;
    let (_dir, db) = store();
    let proxies = allocator(&db, premium(gateway.address().port(), 300));

    let started = tokio::time::Instant::now();
    let identity = proxies.allocate(6).await.unwrap();
    assert_eq!(identity.tier, EgressTier::Development);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_unreachable_gateway_without_dev_proxy_uses_host_network() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let (_dir, db) = store();
    let proxies = ProxySessionAllocator::new(
        ProxyConfig {
            premium: premium(port, 1000),
            dev_url: None,
        },
        Arc::new(db.clone()),
    );

    assert!(proxies.allocate(8).await.is_none());
}

#[tokio::test]
async fn test_premium_switch_is_read_on_every_allocation() {
    let gateway = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&gateway)
        .await;
    let (_dir, db) = store();
    let proxies = allocator(&db, premium(gateway.address().port(), 3000));

    db.set_config_value(
        SMARTPROXY_ENABLED_KEY,
        "false",
        ConfigValueType::Boolean,
        None,
    )
    .unwrap();
    let off = proxies.allocate(9).await.unwrap();
    assert_eq!(off.tier, EgressTier::Development);

    db.set_config_value(SMARTPROXY_ENABLED_KEY, "true", ConfigValueType::Boolean, None)
        .unwrap();
    let on = proxies.allocate(9).await.unwrap();
    assert_eq!(on.tier, EgressTier::Premium);
}
