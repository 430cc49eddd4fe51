// ABOUTME: Trigger-based change notifications - trigger DDL and a LISTEN feeder
// ABOUTME: Notification payloads are change records pushed into a change buffer

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_postgres::{AsyncMessage, Client};

use crate::sync::buffer::Buffer;
use crate::sync::change::ChangeRecord;
use crate::utils::{quote_ident, quote_literal};

const NOTIFY_FUNCTION: &str = "document_replicator_notify";

/// Trigger function that publishes `{table, kind, primary_key_values,
/// old_primary_key_values, transaction_id}` on the channel named by the
/// first trigger argument. Remaining arguments are primary-key columns.
pub fn notify_function_sql(schema: &str) -> String {
    format!(
        r#"CREATE OR REPLACE FUNCTION {schema}.{function}() RETURNS trigger AS $$
DECLARE
    new_row jsonb := CASE WHEN TG_OP = 'DELETE' THEN NULL ELSE to_jsonb(NEW) END;
    old_row jsonb := CASE WHEN TG_OP = 'INSERT' THEN NULL ELSE to_jsonb(OLD) END;
    new_key jsonb;
    old_key jsonb;
BEGIN
    SELECT jsonb_object_agg(k, COALESCE(new_row, old_row) -> k), jsonb_object_agg(k, old_row -> k)
      INTO new_key, old_key
      FROM unnest(TG_ARGV[1:TG_NARGS - 1]) AS k;
    PERFORM pg_notify(TG_ARGV[0], jsonb_build_object(
        'table', TG_TABLE_NAME,
        'kind', lower(TG_OP),
        'primary_key_values', new_key,
        'old_primary_key_values',
            CASE WHEN TG_OP = 'UPDATE' AND old_key IS DISTINCT FROM new_key THEN old_key ELSE NULL END,
        'transaction_id', txid_current()
    )::text);
    RETURN NULL;
END;
$$ LANGUAGE plpgsql"#,
        schema = quote_ident(schema),
        function = quote_ident(NOTIFY_FUNCTION),
    )
}

/// Row trigger on `table` publishing to `channel`.
pub fn trigger_sql(schema: &str, table: &str, channel: &str, primary_key: &[String]) -> String {
    let trigger = format!("{}_{}", NOTIFY_FUNCTION, table);
    let mut args = vec![quote_literal(channel)];
    args.extend(primary_key.iter().map(|c| quote_literal(c)));
    format!(
        "DROP TRIGGER IF EXISTS {trigger} ON {schema}.{table};\n\
         CREATE TRIGGER {trigger} AFTER INSERT OR UPDATE OR DELETE ON {schema}.{table} \
         FOR EACH ROW EXECUTE FUNCTION {schema}.{function}({args})",
        trigger = quote_ident(&trigger),
        schema = quote_ident(schema),
        table = quote_ident(table),
        function = quote_ident(NOTIFY_FUNCTION),
        args = args.join(", "),
    )
}

/// Install the notify function and one trigger per `(table, primary key)`.
pub async fn install_triggers(
    client: &Client,
    schema: &str,
    channel: &str,
    tables: &[(String, Vec<String>)],
) -> Result<()> {
    client
        .batch_execute(&notify_function_sql(schema))
        .await
        .context("Failed to create notify trigger function")?;
    for (table, primary_key) in tables {
        client
            .batch_execute(&trigger_sql(schema, table, channel, primary_key))
            .await
            .with_context(|| format!("Failed to create notify trigger on {}", table))?;
        tracing::info!("Installed notify trigger on {}.{} (channel {})", schema, table, channel);
    }
    Ok(())
}

/// Decode a notification payload.
pub fn parse_payload(payload: &str) -> Result<ChangeRecord> {
    serde_json::from_str(payload).context("Failed to parse notification payload")
}

/// Forwards notifications on one channel into a buffer.
pub struct NotifyListener {
    url: String,
    channel: String,
    buffer: Arc<dyn Buffer>,
}

impl NotifyListener {
    pub fn new(url: impl Into<String>, channel: impl Into<String>, buffer: Arc<dyn Buffer>) -> Self {
        Self {
            url: url.into(),
            channel: channel.into(),
            buffer,
        }
    }

    /// LISTEN until `shutdown` fires or the connection drops.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let tls = super::tls_connector()?;
        let (client, mut connection) = tokio_postgres::connect(&self.url, tls)
            .await
            .with_context(|| format!("Failed to connect to {}", crate::utils::sanitize_url(&self.url)))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(async move {
            let mut messages = stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(notification)) => {
                        if tx.send(notification.payload().to_string()).is_err() {
                            break;
                        }
                    }
                    Ok(AsyncMessage::Notice(notice)) => {
                        tracing::debug!("Server notice: {}", notice.message());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("Notification connection error: {}", e);
                        break;
                    }
                }
            }
        });

        client
            .batch_execute(&format!("LISTEN {}", quote_ident(&self.channel)))
            .await
            .with_context(|| format!("Failed to LISTEN on {}", self.channel))?;
        tracing::info!("Listening for change notifications on {}", self.channel);

        let result = loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break Ok(()),
                payload = rx.recv() => {
                    let payload = match payload {
                        Some(payload) => payload,
                        None => break Err(anyhow::anyhow!("notification connection closed")),
                    };
                    match parse_payload(&payload) {
                        Ok(record) => self.buffer.push(record).await?,
                        Err(e) => tracing::warn!("Ignoring notification on {}: {:#}", self.channel, e),
                    }
                }
            }
        };

        drop(client);
        pump.abort();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::change::{ChangeKind, Txid};
    use serde_json::json;

    #[test]
    fn test_parse_payload() {
        let record = parse_payload(
            r#"{"table": "book", "kind": "update", "primary_key_values": {"isbn": "002"},
                "old_primary_key_values": {"isbn": "001"}, "transaction_id": 812}"#,
        )
        .unwrap();
        assert_eq!(record.table, "book");
        assert_eq!(record.kind, ChangeKind::Update);
        assert_eq!(record.transaction_id, Txid(812));
        assert_eq!(record.primary_key_values.get("isbn"), Some(&json!("002")));
        assert!(record.primary_key_changed());

        let insert = parse_payload(
            r#"{"table": "book", "kind": "insert", "primary_key_values": {"isbn": "003"},
                "old_primary_key_values": null, "transaction_id": 813}"#,
        )
        .unwrap();
        assert!(insert.old_primary_key_values.is_none());
    }

    #[test]
    fn test_trigger_sql_passes_channel_and_key() {
        let sql = trigger_sql("public", "book", "books", &["isbn".to_string()]);
        assert!(sql.contains("ON \"public\".\"book\""));
        assert!(sql.contains("\"document_replicator_notify\"('books', 'isbn')"));
        assert!(sql.contains("\"document_replicator_notify_book\""));
    }
}
