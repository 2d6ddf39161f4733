//! End-to-end runs of the front end against the in-memory directory.

use dsmlgw_core::MemoryDirectory;
use dsmlgw_server::{GatewayConfig, memory_gateway, read_document, serve_document, write_response};

fn anonymous_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.settings.allow_anonymous = true;
    config
}

const BATCH: &str = r#"<batchRequest xmlns="urn:oasis:names:tc:DSML:2:0:core" requestID="cli-1" onError="resume">
  <addRequest dn="dc=test" requestID="1"><attr name="objectClass"><value>domain</value></attr></addRequest>
  <searchRequest dn="dc=test" scope="baseObject" requestID="2">
    <filter><present name="objectClass"/></filter>
  </searchRequest>
  <delRequest dn="dc=missing" requestID="3"/>
</batchRequest>"#;

#[tokio::test]
async fn file_in_file_out() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("batch.xml");
    let output = dir.path().join("response.xml");
    std::fs::write(&input, BATCH).unwrap();

    let directory = MemoryDirectory::new();
    let gateway = memory_gateway(&anonymous_config(), &directory);
    let document = read_document(Some(&input)).await.unwrap();
    let xml = serve_document(&gateway, &document, None).await;
    write_response(Some(&output), &xml).await.unwrap();

    let written = std::fs::read_to_string(&output).unwrap();
    assert!(written.starts_with("<batchResponse"));
    assert!(written.contains(r#"requestID="cli-1""#));
    assert!(written.contains(r#"<searchResultEntry dn="dc=test""#));
    assert!(written.contains(r#"code="32" descr="noSuchObject""#));
    assert!(directory.entry("dc=test").is_some());

    // Pools are torn down once the batch is answered.
    assert!(gateway.operational_pool().borrow().await.is_err());
}

#[tokio::test]
async fn missing_input_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = read_document(Some(&dir.path().join("absent.xml"))).await.unwrap_err();
    assert!(err.to_string().starts_with("i/o error"));
}

#[tokio::test]
async fn credentials_are_required_unless_anonymous_is_allowed() {
    let directory = MemoryDirectory::new();
    let gateway = memory_gateway(&GatewayConfig::default(), &directory);

    let xml = serve_document(&gateway, BATCH, None).await;
    assert!(xml.contains(r#"<errorResponse type="authenticationFailed""#));
    assert!(directory.is_empty());
}

#[tokio::test]
async fn unreachable_directory_is_reported_per_operation() {
    let directory = MemoryDirectory::new();
    directory.set_unavailable(true);
    let gateway = memory_gateway(&anonymous_config(), &directory);

    // Warm-up fails, yet the batch is still answered.
    let xml = serve_document(&gateway, BATCH, None).await;
    assert!(xml.starts_with("<batchResponse"));
    assert!(xml.contains(r#"requestID="cli-1""#));
    assert!(xml.contains(r#"code="52" descr="unavailable""#));
    assert_eq!(directory.connections_opened(), 0);
}
