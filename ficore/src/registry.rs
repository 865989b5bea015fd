use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::warn;
use redis::AsyncCommands;
use tokio::sync::Mutex;

use fise::admin::CatalogueEntry;
use fise::element::{CapacityEntry, HealthEntry, Mode};

use crate::finalize::FinalizeTransaction;
use crate::metrics::REGISTRY_FAILURE_TOTAL;

pub const DEFAULT_MAX_STALE: Duration = Duration::from_secs(90);

const KEY_LEADER: &str = "capacity:leader";
const KEY_CATALOGUE: &str = "storage:elements:registry";
const KEY_TXN_INDEX: &str = "finalize:txns";

fn key_capacity(element_id: &str) -> String {
    format!("capacity:{element_id}")
}

fn key_health(element_id: &str) -> String {
    format!("health:{element_id}")
}

fn key_available(mode: Mode) -> String {
    format!("capacity:{}:available", mode.as_str())
}

fn key_txn(transaction_id: &str) -> String {
    format!("finalize:txn:{transaction_id}")
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    Unavailable,
    InvalidValue,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<redis::RedisError> for RegistryError {
    fn from(_e: redis::RedisError) -> Self {
        REGISTRY_FAILURE_TOTAL.inc();
        RegistryError::Unavailable
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(_e: serde_json::Error) -> Self {
        RegistryError::InvalidValue
    }
}

/// Result of a capacity read. Stale still carries the entry so callers can
/// decide whether old data beats no data.
#[derive(Debug, Clone, PartialEq)]
pub enum CapacityLookup {
    Fresh(CapacityEntry),
    Stale(CapacityEntry),
    Missing,
}

/// Typed facade over the shared registry. Only the monitor leader writes
/// capacity data; everyone reads. The trait exists so the coordinators can
/// be tested against an in-memory store.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn ping(&self) -> bool;

    async fn get_capacity(&self, element_id: &str) -> Result<CapacityLookup, RegistryError>;
    async fn put_capacity(&self, entry: &CapacityEntry) -> Result<(), RegistryError>;
    async fn delete_capacity(&self, element_id: &str) -> Result<(), RegistryError>;

    async fn put_health(&self, entry: &HealthEntry) -> Result<(), RegistryError>;
    async fn delete_health(&self, element_id: &str) -> Result<(), RegistryError>;

    async fn add_available(
        &self,
        mode: Mode,
        element_id: &str,
        priority: i64,
    ) -> Result<(), RegistryError>;
    async fn remove_available(&self, mode: Mode, element_id: &str) -> Result<(), RegistryError>;
    async fn list_by_priority(&self, mode: Mode) -> Result<Vec<String>, RegistryError>;

    /// One element's full observation, written capacity first, then health,
    /// then set membership, serialized per element so a reader never sees a
    /// newer last_updated with older membership.
    async fn apply_observation(
        &self,
        entry: &CapacityEntry,
        mode: Mode,
        priority: i64,
        member: bool,
    ) -> Result<(), RegistryError>;

    /// Remove every key belonging to a de-registered element.
    async fn purge_element(&self, element_id: &str) -> Result<(), RegistryError>;

    /// The catalogue as stored in the registry, None when nobody has
    /// published one.
    async fn load_catalogue(&self) -> Result<Option<Vec<CatalogueEntry>>, RegistryError>;

    async fn acquire_leader(&self, replica_id: &str, ttl: Duration) -> Result<bool, RegistryError>;
    async fn renew_leader(&self, replica_id: &str, ttl: Duration) -> Result<bool, RegistryError>;
    async fn release_leader(&self, replica_id: &str) -> Result<(), RegistryError>;

    async fn txn_put(&self, txn: &FinalizeTransaction) -> Result<(), RegistryError>;
    async fn txn_get(
        &self,
        transaction_id: &str,
    ) -> Result<Option<FinalizeTransaction>, RegistryError>;
    async fn txn_list(&self) -> Result<Vec<FinalizeTransaction>, RegistryError>;
    async fn txn_delete(&self, transaction_id: &str) -> Result<(), RegistryError>;
}

/// Redis-backed store. Priority sets are sorted sets scored by priority so
/// ZRANGE hands back ids already ordered; the leader lock is SET NX EX with
/// compare-value scripts for renew and release.
pub struct RedisRegistry {
    manager: redis::aio::ConnectionManager,
    max_stale: Duration,
    renew_script: redis::Script,
    release_script: redis::Script,
    // per-element gates for the capacity -> health -> membership sequence
    element_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RedisRegistry {
    pub async fn connect(url: &str, max_stale: Duration) -> Result<Self, RegistryError> {
        let client = redis::Client::open(url).map_err(|_| RegistryError::Unavailable)?;
        let manager = redis::aio::ConnectionManager::new(client).await?;
        Ok(RedisRegistry {
            manager,
            max_stale,
            renew_script: redis::Script::new(
                r#"if redis.call('get', KEYS[1]) == ARGV[1] then
                       return redis.call('expire', KEYS[1], ARGV[2])
                   else
                       return 0
                   end"#,
            ),
            release_script: redis::Script::new(
                r#"if redis.call('get', KEYS[1]) == ARGV[1] then
                       return redis.call('del', KEYS[1])
                   else
                       return 0
                   end"#,
            ),
            element_locks: StdMutex::new(HashMap::new()),
        })
    }

    fn conn(&self) -> redis::aio::ConnectionManager {
        self.manager.clone()
    }

    fn element_lock(&self, element_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.element_locks.lock().unwrap();
        locks
            .entry(element_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl RegistryStore for RedisRegistry {
    async fn ping(&self) -> bool {
        let mut conn = self.conn();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }

    async fn get_capacity(&self, element_id: &str) -> Result<CapacityLookup, RegistryError> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(key_capacity(element_id)).await?;
        let Some(raw) = raw else {
            return Ok(CapacityLookup::Missing);
        };
        let entry: CapacityEntry = serde_json::from_str(&raw)?;
        let age = Utc::now().signed_duration_since(entry.last_updated);
        let stale = age.to_std().map(|a| a > self.max_stale).unwrap_or(false);
        if stale {
            Ok(CapacityLookup::Stale(entry))
        } else {
            Ok(CapacityLookup::Fresh(entry))
        }
    }

    async fn put_capacity(&self, entry: &CapacityEntry) -> Result<(), RegistryError> {
        let mut conn = self.conn();
        let raw = serde_json::to_string(entry)?;
        let _: () = conn.set(key_capacity(&entry.element_id), raw).await?;
        Ok(())
    }

    async fn delete_capacity(&self, element_id: &str) -> Result<(), RegistryError> {
        let mut conn = self.conn();
        let _: () = conn.del(key_capacity(element_id)).await?;
        Ok(())
    }

    async fn put_health(&self, entry: &HealthEntry) -> Result<(), RegistryError> {
        let mut conn = self.conn();
        let raw = serde_json::to_string(entry)?;
        let _: () = conn.set(key_health(&entry.element_id), raw).await?;
        Ok(())
    }

    async fn delete_health(&self, element_id: &str) -> Result<(), RegistryError> {
        let mut conn = self.conn();
        let _: () = conn.del(key_health(element_id)).await?;
        Ok(())
    }

    async fn add_available(
        &self,
        mode: Mode,
        element_id: &str,
        priority: i64,
    ) -> Result<(), RegistryError> {
        let mut conn = self.conn();
        let _: () = conn.zadd(key_available(mode), element_id, priority).await?;
        Ok(())
    }

    async fn remove_available(&self, mode: Mode, element_id: &str) -> Result<(), RegistryError> {
        let mut conn = self.conn();
        let _: () = conn.zrem(key_available(mode), element_id).await?;
        Ok(())
    }

    async fn list_by_priority(&self, mode: Mode) -> Result<Vec<String>, RegistryError> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn.zrange(key_available(mode), 0, -1).await?;
        Ok(ids)
    }

    async fn apply_observation(
        &self,
        entry: &CapacityEntry,
        mode: Mode,
        priority: i64,
        member: bool,
    ) -> Result<(), RegistryError> {
        let lock = self.element_lock(&entry.element_id);
        let _guard = lock.lock().await;
        self.put_capacity(entry).await?;
        self.put_health(&HealthEntry {
            element_id: entry.element_id.clone(),
            health_status: entry.health_status,
            last_updated: entry.last_updated,
        })
        .await?;
        if member {
            self.add_available(mode, &entry.element_id, priority).await?;
        } else {
            self.remove_available(mode, &entry.element_id).await?;
        }
        Ok(())
    }

    async fn purge_element(&self, element_id: &str) -> Result<(), RegistryError> {
        let lock = self.element_lock(element_id);
        let _guard = lock.lock().await;
        self.delete_capacity(element_id).await?;
        self.delete_health(element_id).await?;
        // membership is per writable mode only, but removing from all sets
        // costs nothing and survives mode changes we never observed
        for mode in [Mode::Edit, Mode::Rw] {
            self.remove_available(mode, element_id).await?;
        }
        Ok(())
    }

    async fn load_catalogue(&self) -> Result<Option<Vec<CatalogueEntry>>, RegistryError> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(KEY_CATALOGUE).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn acquire_leader(&self, replica_id: &str, ttl: Duration) -> Result<bool, RegistryError> {
        let mut conn = self.conn();
        let res: Option<String> = redis::cmd("SET")
            .arg(KEY_LEADER)
            .arg(replica_id)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(res.is_some())
    }

    async fn renew_leader(&self, replica_id: &str, ttl: Duration) -> Result<bool, RegistryError> {
        let mut conn = self.conn();
        let renewed: i64 = self
            .renew_script
            .key(KEY_LEADER)
            .arg(replica_id)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release_leader(&self, replica_id: &str) -> Result<(), RegistryError> {
        let mut conn = self.conn();
        let _: i64 = self
            .release_script
            .key(KEY_LEADER)
            .arg(replica_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn txn_put(&self, txn: &FinalizeTransaction) -> Result<(), RegistryError> {
        let mut conn = self.conn();
        let raw = serde_json::to_string(txn)?;
        let _: () = conn.set(key_txn(&txn.transaction_id), raw).await?;
        let _: () = conn.sadd(KEY_TXN_INDEX, &txn.transaction_id).await?;
        Ok(())
    }

    async fn txn_get(
        &self,
        transaction_id: &str,
    ) -> Result<Option<FinalizeTransaction>, RegistryError> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(key_txn(transaction_id)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn txn_list(&self) -> Result<Vec<FinalizeTransaction>, RegistryError> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn.smembers(KEY_TXN_INDEX).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.txn_get(&id).await {
                Ok(Some(txn)) => out.push(txn),
                Ok(None) => {
                    // index entry outlived its record; drop it
                    let _: Result<(), _> = conn.srem(KEY_TXN_INDEX, &id).await;
                }
                Err(e) => warn!("skipping unreadable transaction {id}: {e}"),
            }
        }
        Ok(out)
    }

    async fn txn_delete(&self, transaction_id: &str) -> Result<(), RegistryError> {
        let mut conn = self.conn();
        let _: () = conn.del(key_txn(transaction_id)).await?;
        let _: () = conn.srem(KEY_TXN_INDEX, transaction_id).await?;
        Ok(())
    }
}
