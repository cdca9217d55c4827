use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

const LEASE_KEY_PREFIX: &str = "bulk_verify:lease:";

const EXTEND_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// TTL-bound per-workspace lock. At most one worker runs a bulk job for a
/// given workspace at a time; a crashed holder's lease lapses on its own.
#[async_trait]
pub trait WorkspaceLease: Send + Sync {
    /// Take the lease if it is free or already held by `owner`.
    async fn try_acquire(&self, workspace_id: Uuid, owner: &str, ttl: Duration) -> Result<bool, LeaseError>;

    /// Push out the expiry. Returns false if `owner` no longer holds the lease.
    async fn extend(&self, workspace_id: Uuid, owner: &str, ttl: Duration) -> Result<bool, LeaseError>;

    async fn release(&self, workspace_id: Uuid, owner: &str) -> Result<(), LeaseError>;
}

fn lease_key(workspace_id: Uuid) -> String {
    format!("{LEASE_KEY_PREFIX}{workspace_id}")
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Lease held as a Redis key with `SET NX PX`.
pub struct RedisWorkspaceLease {
    client: redis::Client,
}

impl RedisWorkspaceLease {
    pub fn new(redis_url: &str) -> Result<Self, LeaseError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
        })
    }
}

#[async_trait]
impl WorkspaceLease for RedisWorkspaceLease {
    async fn try_acquire(&self, workspace_id: Uuid, owner: &str, ttl: Duration) -> Result<bool, LeaseError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = lease_key(workspace_id);

        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        if set.is_some() {
            return Ok(true);
        }

        // Re-entrant for the current holder, e.g. a redelivery to the same worker.
        let extended: i64 = redis::Script::new(EXTEND_SCRIPT)
            .key(&key)
            .arg(owner)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn extend(&self, workspace_id: Uuid, owner: &str, ttl: Duration) -> Result<bool, LeaseError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let extended: i64 = redis::Script::new(EXTEND_SCRIPT)
            .key(lease_key(workspace_id))
            .arg(owner)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn release(&self, workspace_id: Uuid, owner: &str) -> Result<(), LeaseError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::Script::new(RELEASE_SCRIPT)
            .key(lease_key(workspace_id))
            .arg(owner)
            .invoke_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }
}

/// In-process lease table on tokio's clock.
#[derive(Default)]
pub struct InMemoryWorkspaceLease {
    leases: Mutex<HashMap<Uuid, (String, Instant)>>,
}

impl InMemoryWorkspaceLease {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn holder(&self, workspace_id: Uuid) -> Option<String> {
        let leases = self.leases.lock().await;
        leases
            .get(&workspace_id)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(owner, _)| owner.clone())
    }
}

#[async_trait]
impl WorkspaceLease for InMemoryWorkspaceLease {
    async fn try_acquire(&self, workspace_id: Uuid, owner: &str, ttl: Duration) -> Result<bool, LeaseError> {
        let now = Instant::now();
        let mut leases = self.leases.lock().await;
        match leases.get(&workspace_id) {
            Some((holder, expires)) if *expires > now && holder != owner => Ok(false),
            _ => {
                leases.insert(workspace_id, (owner.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn extend(&self, workspace_id: Uuid, owner: &str, ttl: Duration) -> Result<bool, LeaseError> {
        let now = Instant::now();
        let mut leases = self.leases.lock().await;
        match leases.get_mut(&workspace_id) {
            Some((holder, expires)) if holder == owner && *expires > now => {
                *expires = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, workspace_id: Uuid, owner: &str) -> Result<(), LeaseError> {
        let mut leases = self.leases.lock().await;
        if leases.get(&workspace_id).is_some_and(|(holder, _)| holder == owner) {
            leases.remove(&workspace_id);
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
