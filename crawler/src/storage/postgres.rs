// Copyright 2022. The GlobalWitness Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::net::IpAddr;

use chrono::{NaiveDateTime, Utc};
use diesel::{
    prelude::*,
    r2d2::{ConnectionManager, Pool},
    sql_query,
    sql_types::Double,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::*;

use super::{
    error::StorageError,
    model::{make_conn_string, NodeEvent, NodeInfo},
    schema::{nodehistory, nodes},
    NodeStore,
};

const LOG_TARGET: &str = "crawler::storage::postgres";

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

/// Discovery graph store backed by Postgres over a bounded r2d2 pool. Every operation checks a
/// connection out of the pool for its own duration only.
pub struct PostgresNodeStore {
    pool: Pool<ConnectionManager<PgConnection>>,
}

#[derive(Debug, Queryable, QueryableByName)]
#[diesel(table_name = nodes)]
struct NodeRow {
    id: i64,
    connstring: String,
    referrer: Option<i64>,
    discovery: NaiveDateTime,
    lastseen: NaiveDateTime,
    version: Option<String>,
    data: Option<serde_json::Value>,
}

impl From<NodeRow> for NodeInfo {
    fn from(row: NodeRow) -> Self {
        Self {
            id: row.id,
            conn_string: row.connstring,
            referrer: row.referrer,
            discovery: row.discovery,
            last_seen: row.lastseen,
            version: row.version,
            data: row.data,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = nodes)]
struct NewNodeRow<'a> {
    connstring: &'a str,
    referrer: Option<i64>,
    discovery: NaiveDateTime,
    lastseen: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = nodehistory)]
struct NewHistoryRow<'a> {
    nodeid: i64,
    eventtype: &'a str,
    timestamp: NaiveDateTime,
    data: Option<serde_json::Value>,
}

impl PostgresNodeStore {
    /// Connects the pool, verifies connectivity and applies any pending migrations.
    pub fn connect(database_url: &str, max_open: u32, max_idle: u32) -> Result<Self, StorageError> {
        let manager = ConnectionManager::<PgConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(max_open)
            .min_idle(Some(max_idle.min(max_open)))
            .build(manager)?;

        let mut conn = pool.get()?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|err| StorageError::Migration(err.to_string()))?;
        if !applied.is_empty() {
            info!(target: LOG_TARGET, "Applied {} pending database migration(s)", applied.len());
        }

        Ok(Self { pool })
    }
}

impl NodeStore for PostgresNodeStore {
    fn get_by_conn_string(&self, conn_string: &str) -> Result<Option<NodeInfo>, StorageError> {
        let mut conn = self.pool.get()?;
        match nodes::table
            .filter(nodes::connstring.eq(conn_string))
            .first::<NodeRow>(&mut conn)
            .optional()
        {
            Ok(row) => Ok(row.map(Into::into)),
            Err(err) => {
                error!(
                    target: LOG_TARGET,
                    "Query failed in get_by_conn_string({}): {}", conn_string, err
                );
                Ok(None)
            },
        }
    }

    fn add_node(&self, ip: IpAddr, port: u16, referrer: Option<i64>) -> Result<(NodeInfo, bool), StorageError> {
        let conn_string = make_conn_string(ip, port);
        let now = Utc::now().naive_utc();
        let mut conn = self.pool.get()?;

        let inserted_id = diesel::insert_into(nodes::table)
            .values(&NewNodeRow {
                connstring: conn_string.as_str(),
                referrer,
                discovery: now,
                lastseen: now,
            })
            .on_conflict_do_nothing()
            .returning(nodes::id)
            .get_result::<i64>(&mut conn)
            .optional()?;

        match inserted_id {
            Some(id) => Ok((
                NodeInfo {
                    id,
                    conn_string,
                    referrer,
                    discovery: now,
                    last_seen: now,
                    version: None,
                    data: None,
                },
                true,
            )),
            None => {
                // Unique-key conflict: another caller beat us to it, hand back their row.
                let existing = nodes::table
                    .filter(nodes::connstring.eq(&conn_string))
                    .first::<NodeRow>(&mut conn)?;
                Ok((existing.into(), false))
            },
        }
    }

    fn update_node(&self, node: &NodeInfo) -> Result<bool, StorageError> {
        let mut conn = self.pool.get()?;
        let changed = diesel::update(nodes::table.find(node.id))
            .set((
                nodes::connstring.eq(&node.conn_string),
                nodes::referrer.eq(node.referrer),
                nodes::discovery.eq(node.discovery),
                nodes::lastseen.eq(node.last_seen),
                nodes::version.eq(node.version.as_deref()),
            ))
            .execute(&mut conn)?;
        Ok(changed > 0)
    }

    fn get_random_node(&self) -> Result<Option<NodeInfo>, StorageError> {
        let mut conn = self.pool.get()?;
        match sql_query("SELECT * FROM nodes TABLESAMPLE BERNOULLI(10) LIMIT 1")
            .get_result::<NodeRow>(&mut conn)
            .optional()
        {
            Ok(row) => Ok(row.map(Into::into)),
            Err(err) => {
                error!(target: LOG_TARGET, "Query failed in get_random_node: {}", err);
                Ok(None)
            },
        }
    }

    fn get_random_nodes(&self, probability: f64) -> Result<Vec<NodeInfo>, StorageError> {
        let percent = probability.clamp(0.0, 1.0) * 100.0;
        let mut conn = self.pool.get()?;
        match sql_query("SELECT * FROM nodes TABLESAMPLE BERNOULLI($1)")
            .bind::<Double, _>(percent)
            .load::<NodeRow>(&mut conn)
        {
            Ok(rows) => Ok(rows.into_iter().map(Into::into).collect()),
            Err(err) => {
                error!(target: LOG_TARGET, "Query failed in get_random_nodes: {}", err);
                Ok(Vec::new())
            },
        }
    }

    fn add_history(
        &self,
        node_id: i64,
        event: NodeEvent,
        timestamp: NaiveDateTime,
        data: Option<serde_json::Value>,
    ) -> Result<(), StorageError> {
        let mut conn = self.pool.get()?;
        diesel::insert_into(nodehistory::table)
            .values(&NewHistoryRow {
                nodeid: node_id,
                eventtype: event.as_str(),
                timestamp,
                data,
            })
            .execute(&mut conn)?;
        Ok(())
    }
}
