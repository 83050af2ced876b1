//! Schema migrations compiled into the binary.

use std::borrow::Cow;

use sqlx_core::migrate::{Migration, MigrationType, Migrator};
use sqlx_postgres::PgPool;
use tracing::{info, instrument};

use crate::error::{PostgresError, Result};

struct Script {
    version: i64,
    description: &'static str,
    sql: &'static str,
}

/// Oldest first. Versions are the file name prefixes under `migrations/`.
const SCRIPTS: &[Script] = &[Script {
    version: 20250301000001,
    description: "gateway_schema",
    sql: include_str!("../../migrations/20250301000001_gateway_schema.sql"),
}];

fn migrator() -> Migrator {
    let migrations = SCRIPTS
        .iter()
        .map(|s| Migration {
            version: s.version,
            description: Cow::Borrowed(s.description),
            migration_type: MigrationType::Simple,
            sql: Cow::Borrowed(s.sql),
            // Scripts are embedded, so there is no file to checksum.
            checksum: Cow::Borrowed(&[]),
            no_tx: false,
        })
        .collect();

    Migrator {
        migrations: Cow::Owned(migrations),
        ignore_missing: false,
        locking: true,
        no_tx: false,
    }
}

/// Applies pending migrations. Applied versions are recorded in
/// `_sqlx_migrations`, and the advisory lock keeps two starting instances
/// from racing.
#[instrument(skip_all)]
pub async fn run(pool: &PgPool) -> Result<()> {
    let latest = SCRIPTS.last().map(|s| s.version);
    migrator()
        .run(pool)
        .await
        .map_err(|e| PostgresError::Migration(e.to_string()))?;
    info!(?latest, "Schema up to date");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripts_are_ordered_and_create_all_tables() {
        assert!(SCRIPTS.windows(2).all(|w| w[0].version < w[1].version));

        let sql: String = SCRIPTS.iter().map(|s| s.sql).collect();
        for table in ["shared_credential", "calendar_day", "sync_marker"] {
            assert!(sql.contains(table), "missing table {table}");
        }
        assert_eq!(migrator().migrations.len(), SCRIPTS.len());
    }
}
