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

use std::time::Duration;

use redis::Commands;

use super::{error::StorageError, LivenessStore};

/// Prefix for the ephemeral "a crawler currently holds a session with this peer" tags.
pub const ACTIVE_TAG_PREFIX: &str = "active_";
/// Prefix for advisory lock keys.
pub const LOCK_PREFIX: &str = "lock_";

const ACTIVE_TAG_VALUE: &str = "1";

/// Cluster coordination store backed by Redis (db 0) over a bounded r2d2 pool.
pub struct RedisLivenessStore {
    pool: r2d2::Pool<redis::Client>,
}

impl RedisLivenessStore {
    /// Connects the pool and verifies connectivity.
    pub fn connect(url: &str, max_open: u32, max_idle: u32) -> Result<Self, StorageError> {
        let client = redis::Client::open(url)?;
        let pool = r2d2::Pool::builder()
            .max_size(max_open)
            .min_idle(Some(max_idle.min(max_open)))
            .build(client)?;
        Ok(Self { pool })
    }

    fn active_key(conn_string: &str) -> String {
        format!("{}{}", ACTIVE_TAG_PREFIX, conn_string)
    }

    fn lock_key(resource: &str) -> String {
        format!("{}{}", LOCK_PREFIX, resource)
    }
}

impl LivenessStore for RedisLivenessStore {
    fn set_active(&self, conn_string: &str, ttl: Duration) -> Result<(), StorageError> {
        let mut conn = self.pool.get()?;
        conn.set_ex::<_, _, ()>(Self::active_key(conn_string), ACTIVE_TAG_VALUE, ttl.as_secs())?;
        Ok(())
    }

    fn remove_active(&self, conn_string: &str) -> Result<(), StorageError> {
        let mut conn = self.pool.get()?;
        conn.del::<_, ()>(Self::active_key(conn_string))?;
        Ok(())
    }

    fn check_active(&self, conn_string: &str) -> Result<bool, StorageError> {
        let mut conn = self.pool.get()?;
        let exists = conn.exists::<_, bool>(Self::active_key(conn_string))?;
        Ok(exists)
    }

    fn acquire_lock(&self, resource: &str, ttl: Duration, extend: bool) -> Result<bool, StorageError> {
        let key = Self::lock_key(resource);
        let mut conn = self.pool.get()?;
        if extend {
            conn.pset_ex::<_, _, ()>(key, ACTIVE_TAG_VALUE, ttl.as_millis() as u64)?;
            return Ok(true);
        }
        let acquired = redis::cmd("SET")
            .arg(&key)
            .arg(ACTIVE_TAG_VALUE)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query::<Option<String>>(&mut *conn)?;
        Ok(acquired.is_some())
    }

    fn release_lock(&self, resource: &str) -> Result<(), StorageError> {
        let mut conn = self.pool.get()?;
        conn.del::<_, ()>(Self::lock_key(resource))?;
        Ok(())
    }

    fn incr(&self, counter: &str) -> Result<i64, StorageError> {
        let mut conn = self.pool.get()?;
        let value = conn.incr::<_, _, i64>(counter, 1)?;
        Ok(value)
    }

    fn full_keys(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = self.pool.get()?;
        let keys = conn.keys::<_, Vec<String>>(pattern)?;
        Ok(keys)
    }

    fn flush_all(&self) -> Result<(), StorageError> {
        let mut conn = self.pool.get()?;
        redis::cmd("FLUSHDB").query::<()>(&mut *conn)?;
        Ok(())
    }
}
