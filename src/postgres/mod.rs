// ABOUTME: PostgreSQL adapters - connections, session, catalog, logical slot and notifications
// ABOUTME: Connections use native-tls so managed databases requiring SSL work unchanged

pub mod catalog;
pub mod decoder;
pub mod notify;
pub mod privileges;
pub mod replication;
pub mod session;

use anyhow::{Context, Result};
use postgres_native_tls::MakeTlsConnector;
use std::time::Duration;
use tokio_postgres::Client;

pub use catalog::PgCatalog;
pub use notify::{install_triggers, NotifyListener};
pub use privileges::{check_source, SourceReadiness};
pub use replication::PgReplicationSource;
pub use session::PgSession;

/// Schema searched when a table name is not qualified.
pub const DEFAULT_SCHEMA: &str = "public";

/// TLS connector that accepts the server's certificate chain as configured
/// by the system trust store.
pub fn tls_connector() -> Result<MakeTlsConnector> {
    let connector = native_tls::TlsConnector::builder()
        .build()
        .context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// Connect to PostgreSQL and drive the connection on a background task.
pub async fn connect(url: &str) -> Result<Client> {
    let tls = tls_connector()?;
    let (client, connection) = tokio_postgres::connect(url, tls)
        .await
        .with_context(|| format!("Failed to connect to {}", crate::utils::sanitize_url(url)))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });

    Ok(client)
}

/// [`connect`] with exponential backoff for databases that are still
/// starting up or briefly unreachable.
pub async fn connect_with_retry(url: &str) -> Result<Client> {
    crate::utils::retry_with_backoff(|| connect(url), 3, Duration::from_secs(1)).await
}
