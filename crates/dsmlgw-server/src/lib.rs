//! DSML gateway front end.
//!
//! This crate wires the gateway core to a real directory:
//! - `ldap3` for directory connections
//! - Tokio for the async runtime and file/stdio access
//! - clap for configuration
//!
//! ## Architecture
//!
//! ```text
//! dsmlgw-server
//!   ├─ GatewayArgs / GatewayConfig  (flags + DSMLGW_* env, validated)
//!   ├─ LdapConnector                (production Connector over ldap3)
//!   └─ serve_document               (warm up -> process -> close)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
mod error;
pub mod ldap;

use std::path::Path;

pub use config::{DirectoryConfig, GatewayArgs, GatewayConfig};
use dsmlgw_core::{ConnectionPool, Connector, Gateway, MemoryConnector, MemoryDirectory};
pub use error::ServerError;
pub use ldap::{LdapConnection, LdapConnector};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

/// Gateway over two `ldap3` pools to the configured directory.
pub fn ldap_gateway(config: &GatewayConfig) -> Gateway<LdapConnector> {
    let connector = LdapConnector::new(config.directory.clone());
    gateway(connector, config)
}

/// Gateway over an in-memory directory, for dry runs.
pub fn memory_gateway(
    config: &GatewayConfig,
    directory: &MemoryDirectory,
) -> Gateway<MemoryConnector> {
    gateway(directory.connector(), config)
}

fn gateway<C: Connector + Clone>(connector: C, config: &GatewayConfig) -> Gateway<C> {
    Gateway::new(
        ConnectionPool::new("operational", connector.clone(), config.operational_pool.clone()),
        ConnectionPool::new("login", connector, config.login_pool.clone()),
        config.settings.clone(),
    )
}

/// Run one batch document and render the response.
///
/// A directory that cannot be reached during warm-up is not fatal: the
/// batch still runs and reports `unavailable` per operation.
pub async fn serve_document<C: Connector>(
    gateway: &Gateway<C>,
    document: &str,
    authorization: Option<&str>,
) -> String {
    if let Err(e) = gateway.warm_up().await {
        warn!(error = %e, "pool warm-up failed");
    }

    let response = gateway.process_with_header(document, authorization).await;
    gateway.close().await;

    info!(responses = response.responses.len(), "batch response ready");
    response.to_xml()
}

/// Read a batch document from `path`, or stdin when absent.
pub async fn read_document(path: Option<&Path>) -> Result<String, ServerError> {
    match path {
        Some(path) => Ok(tokio::fs::read_to_string(path).await?),
        None => {
            let mut document = String::new();
            tokio::io::stdin().read_to_string(&mut document).await?;
            Ok(document)
        },
    }
}

/// Write a rendered response to `path`, or stdout when absent.
pub async fn write_response(path: Option<&Path>, xml: &str) -> Result<(), ServerError> {
    match path {
        Some(path) => tokio::fs::write(path, xml).await?,
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(xml.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        },
    }
    Ok(())
}
