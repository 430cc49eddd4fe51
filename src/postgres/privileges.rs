// ABOUTME: Source readiness checks run before creating slots and triggers
// ABOUTME: Verifies wal_level, replication privilege and table ownership for triggers

use anyhow::{Context, Result};
use tokio_postgres::Client;

/// What the connected role can do on the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceReadiness {
    pub wal_level: String,
    /// Role has REPLICATION (needed for logical slots)
    pub has_replication: bool,
    pub is_superuser: bool,
    /// Tables the role does not own; triggers cannot be created on them.
    pub not_owned: Vec<String>,
}

impl SourceReadiness {
    /// Human-readable reasons the source cannot be bootstrapped. Empty when
    /// ready.
    pub fn problems(&self, with_triggers: bool) -> Vec<String> {
        let mut problems = Vec::new();
        if self.wal_level != "logical" {
            problems.push(format!(
                "wal_level is '{}'; logical replication slots need wal_level = logical",
                self.wal_level
            ));
        }
        if !self.has_replication && !self.is_superuser {
            problems.push("current role lacks the REPLICATION privilege".to_string());
        }
        if with_triggers && !self.is_superuser && !self.not_owned.is_empty() {
            problems.push(format!(
                "current role does not own {}; notify triggers cannot be installed",
                self.not_owned.join(", ")
            ));
        }
        problems
    }
}

/// Inspect the source for slot and trigger prerequisites on `tables`.
pub async fn check_source(client: &Client, schema: &str, tables: &[String]) -> Result<SourceReadiness> {
    let wal_level: String = client
        .query_one("SHOW wal_level", &[])
        .await
        .context("Failed to read wal_level")?
        .get(0);

    let row = client
        .query_one(
            "SELECT rolreplication, rolsuper
             FROM pg_roles
             WHERE rolname = current_user",
            &[],
        )
        .await
        .context("Failed to query user privileges")?;

    let not_owned: Vec<String> = client
        .query(
            "SELECT c.relname::text
             FROM pg_class c
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = $1
               AND c.relname = ANY($2)
               AND NOT pg_has_role(current_user, c.relowner, 'USAGE')
             ORDER BY c.relname",
            &[&schema, &tables],
        )
        .await
        .context("Failed to check table ownership")?
        .iter()
        .map(|row| row.get(0))
        .collect();

    Ok(SourceReadiness {
        wal_level,
        has_replication: row.get(0),
        is_superuser: row.get(1),
        not_owned,
    })
}
