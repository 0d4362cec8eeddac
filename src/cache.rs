// =============================================================================
// AVAILABILITY CACHE
// =============================================================================
// Optional Redis cache in front of `GET /parking-lots/{id}/available-slots`.
//
// NOTES:
// - Keys embed a per-lot generation counter; a write touching the lot bumps
//   the counter, which orphans every cached window of that lot at once
// - Entries expire after a short TTL, which bounds staleness from writers
//   that do not bump the generation (the background sweeper)
// - A miss reports the generation it read; the caller caches its answer
//   under that generation, so a write landing in between orphans the entry
// - Redis failures are logged and treated as cache misses
// =============================================================================

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use std::time::Instant;
use uuid::Uuid;

use crate::metrics;
use crate::models::AvailableSlotsResponse;
use crate::timerange::TimeRange;

#[derive(Debug)]
pub enum CacheLookup {
    Hit(AvailableSlotsResponse),
    /// `generation` is `None` when Redis could not be read
    Miss { generation: Option<u64> },
}

#[derive(Clone)]
pub struct AvailabilityCache {
    conn: ConnectionManager,
    ttl_secs: u64,
}

fn generation_key(lot_id: Uuid) -> String {
    format!("availability:{lot_id}:gen")
}

fn window_key(lot_id: Uuid, generation: u64, range: &TimeRange) -> String {
    format!(
        "availability:{lot_id}:{generation}:{}:{}",
        range.start.timestamp(),
        range.end.timestamp()
    )
}

impl AvailabilityCache {
    pub async fn connect(redis_url: &str, ttl_secs: u64) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Invalid REDIS_URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self { conn, ttl_secs })
    }

    pub async fn ping(&self) -> bool {
        redis::cmd("PING")
            .query_async::<_, String>(&mut self.conn.clone())
            .await
            .is_ok()
    }

    pub async fn get(&self, lot_id: Uuid, range: &TimeRange) -> CacheLookup {
        let started = Instant::now();
        let Some(generation) = self.generation(lot_id).await else {
            return CacheLookup::Miss { generation: None };
        };
        let cached: Option<String> = match redis::cmd("GET")
            .arg(window_key(lot_id, generation, range))
            .query_async(&mut self.conn.clone())
            .await
        {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!(error = %e, "Availability cache read failed");
                return CacheLookup::Miss { generation: None };
            }
        };
        metrics::record_redis_operation("get", started.elapsed().as_secs_f64());

        decode(cached, generation)
    }

    /// Store `response` under the generation its lookup reported.
    pub async fn put(
        &self,
        lot_id: Uuid,
        generation: u64,
        range: &TimeRange,
        response: &AvailableSlotsResponse,
    ) {
        let Ok(json) = serde_json::to_string(response) else {
            return;
        };

        let started = Instant::now();
        let result: redis::RedisResult<()> = redis::cmd("SETEX")
            .arg(window_key(lot_id, generation, range))
            .arg(self.ttl_secs.max(1))
            .arg(json)
            .query_async(&mut self.conn.clone())
            .await;
        metrics::record_redis_operation("set", started.elapsed().as_secs_f64());
        if let Err(e) = result {
            tracing::warn!(error = %e, lot_id = %lot_id, "Availability cache write failed");
        }
    }

    /// Drop every cached window of the lot.
    pub async fn invalidate(&self, lot_id: Uuid) {
        let started = Instant::now();
        let result: redis::RedisResult<u64> = redis::cmd("INCR")
            .arg(generation_key(lot_id))
            .query_async(&mut self.conn.clone())
            .await;
        metrics::record_redis_operation("incr", started.elapsed().as_secs_f64());
        if let Err(e) = result {
            tracing::warn!(error = %e, lot_id = %lot_id, "Availability cache invalidation failed");
        }
    }

    async fn generation(&self, lot_id: Uuid) -> Option<u64> {
        let generation: Option<u64> = redis::cmd("GET")
            .arg(generation_key(lot_id))
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| tracing::warn!(error = %e, "Availability cache generation read failed"))
            .ok()?;
        Some(generation.unwrap_or(0))
    }
}

fn decode(cached: Option<String>, generation: u64) -> CacheLookup {
    match cached.and_then(|json| serde_json::from_str(&json).ok()) {
        Some(hit) => CacheLookup::Hit(hit),
        None => CacheLookup::Miss {
            generation: Some(generation),
        },
    }
}
