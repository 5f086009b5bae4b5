// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for obshell-core.
//!
//! The local store always runs [`SQLITE`]; the cluster store runs [`MYSQL`]
//! when a shared database is configured; in single mode the local store
//! doubles as the cluster store.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::MySqlPool;
//! use obshell_core::migrations;
//!
//! let pool = MySqlPool::connect(&database_url).await?;
//! migrations::run_mysql(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// MySQL migrator for the cluster store.
pub static MYSQL: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/mysql");

/// SQLite migrator for the local store.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run MySQL migrations.
///
/// Already-applied migrations are skipped.
pub async fn run_mysql(pool: &sqlx::MySqlPool) -> Result<(), MigrateError> {
    MYSQL.run(pool).await
}

/// Run SQLite migrations.
///
/// Already-applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
