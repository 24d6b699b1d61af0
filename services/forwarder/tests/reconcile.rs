
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use harness::{eventually, loopback_rule, temp_rules_path, write_rules, EchoBackend};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use flowgate_forwarder::discovery::StaticResolver;
use flowgate_forwarder::error::RulesError;
use flowgate_forwarder::reconciler::Reconciler;
use flowgate_forwarder::rules::Definition;
use flowgate_forwarder::telemetry::TelemetrySink;

fn reconciler_at(path: std::path::PathBuf) -> Reconciler {
    let resolver = Arc::new(StaticResolver::new());
    let (telemetry, _drain) = TelemetrySink::channel(16);
    // The drain is dropped: telemetry is best-effort and must not
    // affect reconciliation.
    Reconciler::new(path, resolver, telemetry, Duration::from_secs(600))
}

fn snapshot(rules: &[&Definition]) -> BTreeMap<String, Definition> {
    rules
        .iter()
        .map(|rule| (rule.name.clone(), (*rule).clone()))
        .collect()
}

#[tokio::test]
async fn merge_closes_removed_replaces_changed_keeps_unchanged_adds_new() {
    let reconciler = reconciler_at(temp_rules_path("unused"));

    let rule_a = loopback_rule("a", "127.0.0.1:9001");
    let rule_b = loopback_rule("b", "127.0.0.1:9002");
    let rule_c = loopback_rule("c", "127.0.0.1:9003");

    reconciler
        .apply(snapshot(&[&rule_a, &rule_b, &rule_c]))
        .await;

    let first_a = reconciler.listener("a").await.expect("a open");
    let first_b = reconciler.listener("b").await.expect("b open");
    let first_c = reconciler.listener("c").await.expect("c open");
    let port_a = first_a.local_addr().unwrap();

    // New snapshot: a removed, b unchanged, c's sink differs, d added.
    let mut changed_c = rule_c.clone();
    changed_c.sink = "127.0.0.1:9013".to_string();
    let rule_d = loopback_rule("d", "127.0.0.1:9004");

    reconciler
        .apply(snapshot(&[&rule_b, &changed_c, &rule_d]))
        .await;

    assert!(reconciler.listener("a").await.is_none(), "a must be closed");
    assert_eq!(
        reconciler.rule_names().await,
        vec!["b".to_string(), "c".to_string(), "d".to_string()]
    );

    let second_b = reconciler.listener("b").await.expect("b still open");
    assert!(
        Arc::ptr_eq(&first_b, &second_b),
        "unchanged rule must keep its listener instance"
    );

    let second_c = reconciler.listener("c").await.expect("c reopened");
    assert!(
        !Arc::ptr_eq(&first_c, &second_c),
        "changed rule must get a fresh listener"
    );
    assert_eq!(second_c.definition().sink, "127.0.0.1:9013");

    let listener_d = reconciler.listener("d").await.expect("d open");
    assert!(listener_d.local_addr().is_some());

    // a's socket is actually released.
    assert!(
        eventually(Duration::from_secs(2), || {
            std::net::TcpStream::connect_timeout(&port_a, Duration::from_millis(50)).is_err()
        })
        .await,
        "removed rule should stop accepting"
    );

    reconciler.shutdown().await;
}

#[tokio::test]
async fn reapplying_an_identical_snapshot_changes_nothing() {
    let reconciler = reconciler_at(temp_rules_path("unused"));
    let rule = loopback_rule("web", "127.0.0.1:9001");

    reconciler.apply(snapshot(&[&rule])).await;
    let first = reconciler.listener("web").await.unwrap();

    reconciler.apply(snapshot(&[&rule])).await;
    let second = reconciler.listener("web").await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));

    reconciler.shutdown().await;
}

#[tokio::test]
async fn endpoint_reorder_in_snapshot_is_not_a_change() {
    let reconciler = reconciler_at(temp_rules_path("unused"));

    let mut rule = loopback_rule("web", "127.0.0.1:9001");
    rule.endpoints = flowgate_forwarder::rules::EndpointSet::new(vec![
        "10.0.0.1:80".to_string(),
        "10.0.0.2:80".to_string(),
    ]);
    reconciler.apply(snapshot(&[&rule])).await;
    let first = reconciler.listener("web").await.unwrap();

    let mut reordered = rule.clone();
    reordered.endpoints = flowgate_forwarder::rules::EndpointSet::new(vec![
        "10.0.0.2:80".to_string(),
        "10.0.0.1:80".to_string(),
    ]);
    reconciler.apply(snapshot(&[&reordered])).await;
    let second = reconciler.listener("web").await.unwrap();

    assert!(
        Arc::ptr_eq(&first, &second),
        "endpoint reordering alone must not churn the listener"
    );

    reconciler.shutdown().await;
}

#[tokio::test]
async fn rules_file_roundtrip_reconcile_and_forward() {
    let echo = EchoBackend::spawn().await.unwrap();
    let path = temp_rules_path("roundtrip");

    let rule = loopback_rule("web", &echo.addr.to_string());
    write_rules(&path, &snapshot(&[&rule]));

    let reconciler = reconciler_at(path.clone());
    reconciler.reconcile().await.unwrap();

    let listener = reconciler.listener("web").await.expect("web open");
    let addr = listener.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"roundtrip").await.unwrap();
    let mut buf = [0u8; 9];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"roundtrip");
    drop(client);

    // Empty the rules file: the rule disappears on the next pass.
    write_rules(&path, &BTreeMap::new());
    reconciler.reconcile().await.unwrap();
    assert!(reconciler.listener("web").await.is_none());
    assert!(reconciler.rule_names().await.is_empty());

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn unparsable_rules_are_fatal() {
    let path = temp_rules_path("bad");
    std::fs::write(&path, "not a rules [document").unwrap();

    let reconciler = reconciler_at(path.clone());
    assert!(matches!(
        reconciler.reconcile().await,
        Err(RulesError::Parse { .. })
    ));

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn missing_rules_file_is_fatal() {
    let reconciler = reconciler_at(temp_rules_path("missing"));
    assert!(matches!(
        reconciler.reconcile().await,
        Err(RulesError::Read { .. })
    ));
}
