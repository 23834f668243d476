use std::net::IpAddr;
use std::time::Duration;

use rocket::tokio::time::timeout;
use rocket_db_pools::deadpool_redis;
use rocket_db_pools::deadpool_redis::redis::AsyncCommands;
use tracing::{info, warn};

use crate::error::StoreError;

const WINDOW_SECS: i64 = 86400;

/// Buckets a client address. IPv6 clients usually own a whole /64, so the
/// prefix is the bucket.
pub fn client_key(client_ip: Option<IpAddr>) -> String {
    match client_ip {
        Some(IpAddr::V4(ip4)) => ip4.to_string(),
        Some(IpAddr::V6(ip6)) => {
            let ipb = ip6.segments();
            format!("{:04x}:{:04x}:{:04x}:{:04x}::/64", ipb[0], ipb[1], ipb[2], ipb[3])
        }
        None => "unknown".to_string(),
    }
}

/// Daily per-client submission counter kept in Redis.
pub struct Throttle {
    pool: deadpool_redis::Pool,
    limit: u32,
    timeout: Duration,
}

impl Throttle {
    pub fn new(pool: deadpool_redis::Pool, limit: u32, timeout: Duration) -> Self {
        Self {
            pool,
            limit,
            timeout,
        }
    }

    fn redis_key(client: &str) -> String {
        format!("rsvp:throttle:{client}")
    }

    /// Redis trouble never blocks a visitor.
    pub async fn is_blocked(&self, client: &str) -> bool {
        match self.count(client).await {
            Ok(count) => over_limit(count, self.limit),
            Err(e) => {
                warn!("Throttle check for {client} failed: {e}");
                false
            }
        }
    }

    /// Counts one submission against the client's daily allowance.
    pub async fn record(&self, client: &str) {
        if let Err(e) = self.incr(client).await {
            warn!("Could not count submission from {client}: {e}");
        }
    }

    async fn count(&self, client: &str) -> Result<u32, StoreError> {
        let key = Self::redis_key(client);
        let fut = async {
            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            let count: Option<u32> = conn.get(&key).await?;
            Ok(count.unwrap_or(0))
        };
        timeout(self.timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }

    async fn incr(&self, client: &str) -> Result<(), StoreError> {
        let key = Self::redis_key(client);
        let fut = async {
            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            let count: u32 = conn.incr(&key, 1).await?;
            if count == 1 {
                let _: bool = conn.expire(&key, WINDOW_SECS).await?;
            }
            if over_limit(count, self.limit) {
                info!("{client} reached {count} submissions today");
            }
            Ok(())
        };
        timeout(self.timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }
}

fn over_limit(count: u32, limit: u32) -> bool {
    limit > 0 && count >= limit
}
