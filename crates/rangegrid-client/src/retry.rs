//! Relocation-aware retry loop around row operations.
//!
//! One attempt resolves the row's region and applies the operation there,
//! both under the same per-attempt deadline. When the server answers "not
//! serving" or "epoch stale", refuses the connection, or the attempt times
//! out, only the cache entry covering the row is dropped before the next
//! attempt re-resolves. A resolution that runs out of time drops the META
//! location it was walking through instead. Retryable failures pause between attempts, doubling
//! up to a cap; the attempt bound turns the last failure into
//! [`ClientError::RetriesExhausted`].
//!
//! Operations are assumed idempotent per row update, so re-applying one
//! that may have landed before a timeout is harmless.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, timeout_at};
use tracing::{debug, trace, warn};

use rangegrid_cluster::{RegionCallError, RowOp, RowOpOutput, Transport};
use rangegrid_core::config::ClientConfig;

use crate::cache::CachedLocation;
use crate::error::ClientError;
use crate::resolver::DirectoryResolver;

/// Where a row operation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    Resolving,
    Executing,
    RetryWait,
    Failed,
    Succeeded,
}

/// Bounds on a single row operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before giving up, including the first.
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    /// Pause after the first failed attempt.
    pub pause: Duration,
    pub pause_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            attempt_timeout: config.attempt_timeout(),
            pause: config.retry_pause(),
            pause_max: config.retry_pause_max(),
        }
    }

    /// Pause after failed attempt number `attempt` (1-based).
    pub fn pause_after(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.pause.saturating_mul(factor).min(self.pause_max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

/// Runs row operations against whichever server currently holds the row.
pub struct RowOpRunner {
    resolver: DirectoryResolver,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl RowOpRunner {
    pub fn new(resolver: DirectoryResolver, transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self {
            resolver,
            transport,
            policy,
        }
    }

    pub fn resolver(&self) -> &DirectoryResolver {
        &self.resolver
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Apply `op` to the region covering `row` of `table`.
    pub async fn run(
        &self,
        table: &str,
        row: &str,
        op: RowOp,
    ) -> Result<(CachedLocation, RowOpOutput), ClientError> {
        let (location, output) = self.drive(table, row, Some(op)).await?;
        let output = output.ok_or_else(|| {
            ClientError::UnexpectedResponse("operation produced no output".to_string())
        })?;
        Ok((location, output))
    }

    /// Locate the region covering `row` of `table`, retrying like `run`.
    pub async fn locate(&self, table: &str, row: &str) -> Result<CachedLocation, ClientError> {
        let (location, _) = self.drive(table, row, None).await?;
        Ok(location)
    }

    async fn drive(
        &self,
        table: &str,
        row: &str,
        op: Option<RowOp>,
    ) -> Result<(CachedLocation, Option<RowOpOutput>), ClientError> {
        let mut state = OpState::Resolving;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            enter(&mut state, OpState::Resolving, table, row, attempt);
            let deadline = Instant::now() + self.policy.attempt_timeout;

            let error = match self
                .attempt(table, row, op.as_ref(), deadline, &mut state, attempt)
                .await
            {
                Ok(done) => {
                    enter(&mut state, OpState::Succeeded, table, row, attempt);
                    return Ok(done);
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                enter(&mut state, OpState::Failed, table, row, attempt);
                return Err(error);
            }
            if attempt >= self.policy.max_attempts {
                enter(&mut state, OpState::Failed, table, row, attempt);
                warn!(table, row, attempts = attempt, error = %error, "row operation retries exhausted");
                return Err(ClientError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            enter(&mut state, OpState::RetryWait, table, row, attempt);
            let pause = self.policy.pause_after(attempt);
            debug!(table, row, attempt, error = %error, ?pause, "retrying row operation");
            tokio::time::sleep(pause).await;
        }
    }

    async fn attempt(
        &self,
        table: &str,
        row: &str,
        op: Option<&RowOp>,
        deadline: Instant,
        state: &mut OpState,
        attempt: u32,
    ) -> Result<(CachedLocation, Option<RowOpOutput>), ClientError> {
        let location = match timeout_at(deadline, self.resolver.resolve(table, row)).await {
            Ok(resolved) => resolved?,
            Err(_) => {
                // The walk hung on a directory server; do not go back to it.
                self.resolver.invalidate_parent(table, row);
                return Err(ClientError::Timeout);
            }
        };
        let Some(op) = op else {
            return Ok((location, None));
        };

        enter(state, OpState::Executing, table, row, attempt);
        let result = match self.transport.connect(&location.server) {
            Ok(service) => {
                let call = service.apply(&location.region, location.epoch, op.clone());
                match timeout_at(deadline, call).await {
                    Ok(applied) => applied.map_err(ClientError::from),
                    Err(_) => Err(ClientError::Timeout),
                }
            }
            Err(e) => Err(RegionCallError::from(e).into()),
        };

        match result {
            Ok(output) => Ok((location, Some(output))),
            Err(e) => {
                if e.is_retryable() {
                    self.resolver.invalidate(table, row);
                }
                Err(e)
            }
        }
    }
}

fn enter(state: &mut OpState, next: OpState, table: &str, row: &str, attempt: u32) {
    trace!(table, row, attempt, from = ?*state, to = ?next, "row operation state");
    *state = next;
}
