//! Health probe: database liveness, process uptime, and outbox depth.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use sqlx::PgPool;
use tracing::instrument;

use causeway_core::DomainResult;

use crate::outbox::{OutboxMetrics, OutboxStore};

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub database: ComponentHealth,
    pub outbox: OutboxMetrics,
    pub uptime_secs: u64,
}

pub struct HealthProbe {
    pool: Option<PgPool>,
    outbox: Arc<dyn OutboxStore>,
    started: Instant,
}

impl HealthProbe {
    pub fn new(outbox: Arc<dyn OutboxStore>) -> Self {
        Self {
            pool: None,
            outbox,
            started: Instant::now(),
        }
    }

    pub fn with_pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    #[instrument(skip(self), err)]
    pub async fn check(&self) -> DomainResult<HealthReport> {
        let database = match &self.pool {
            Some(pool) => match sqlx::query("SELECT 1").execute(pool).await {
                Ok(_) => ComponentHealth::ok(),
                Err(e) => ComponentHealth::failed(e.to_string()),
            },
            // In-memory backend: no connection to probe.
            None => ComponentHealth::ok(),
        };

        let outbox = self.outbox.metrics().await?;

        Ok(HealthReport {
            healthy: database.ok,
            database,
            outbox,
            uptime_secs: self.started.elapsed().as_secs(),
        })
    }
}
