//! Strategy chain – ordered fallback over alternative techniques.
//!
//! Strategies are tried in the order given. The first successful result
//! wins and later strategies are never invoked. A strategy that does not
//! apply, or that faults, is recorded as skipped and the chain moves on.

use crate::context::SimContext;
use crate::traits::CapError;
use crate::types::{CommandResult, Coordinates, TunnelDescriptor};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Inputs shared by every location strategy.
#[derive(Debug, Clone)]
pub struct LocationRequest {
    pub device_id: String,
    /// `None` for clear operations.
    pub coordinates: Option<Coordinates>,
    /// Active tunnel, if one was stored.
    pub tunnel: Option<TunnelDescriptor>,
}

impl LocationRequest {
    pub fn set(device_id: impl Into<String>, coordinates: Coordinates) -> Self {
        Self {
            device_id: device_id.into(),
            coordinates: Some(coordinates),
            tunnel: None,
        }
    }

    pub fn clear(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            coordinates: None,
            tunnel: None,
        }
    }

    pub fn with_tunnel(mut self, tunnel: Option<TunnelDescriptor>) -> Self {
        self.tunnel = tunnel;
        self
    }
}

/// What a strategy reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    Ran(CommandResult),
    NotApplicable,
}

#[async_trait::async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Err` is an unexpected fault. The chain logs it and treats the
    /// strategy as not applicable.
    async fn attempt(&self, ctx: &SimContext, req: &LocationRequest) -> Result<Attempt, CapError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Ran { result: CommandResult },
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategyAttempt {
    pub name: &'static str,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone)]
pub struct ChainOutcome {
    pub result: CommandResult,
    /// Name of the winning strategy.
    pub method: Option<&'static str>,
    pub attempts: Vec<StrategyAttempt>,
}

/// The last strategy that actually ran and failed.
pub fn last_failure(attempts: &[StrategyAttempt]) -> Option<&CommandResult> {
    attempts.iter().rev().find_map(|a| match &a.outcome {
        AttemptOutcome::Ran { result } if !result.success => Some(result),
        _ => None,
    })
}

/// Run `strategies` in order. When none succeeds, `on_exhausted` builds
/// the chain-level result from the recorded attempts.
pub async fn run_chain<F>(
    strategies: &[Box<dyn Strategy>],
    ctx: &SimContext,
    req: &LocationRequest,
    on_exhausted: F,
) -> ChainOutcome
where
    F: FnOnce(&[StrategyAttempt]) -> CommandResult,
{
    let mut attempts = Vec::with_capacity(strategies.len());

    for strategy in strategies {
        let name = strategy.name();
        debug!(method = name, device_id = %req.device_id, "trying strategy");

        match strategy.attempt(ctx, req).await {
            Ok(Attempt::Ran(result)) if result.success => {
                info!(method = name, "strategy succeeded");
                attempts.push(StrategyAttempt {
                    name,
                    outcome: AttemptOutcome::Ran {
                        result: result.clone(),
                    },
                });
                return ChainOutcome {
                    result,
                    method: Some(name),
                    attempts,
                };
            }
            Ok(Attempt::Ran(result)) => {
                debug!(method = name, error = %result.error, "strategy failed");
                attempts.push(StrategyAttempt {
                    name,
                    outcome: AttemptOutcome::Ran { result },
                });
            }
            Ok(Attempt::NotApplicable) => {
                debug!(method = name, "strategy not applicable");
                attempts.push(StrategyAttempt {
                    name,
                    outcome: AttemptOutcome::Skipped,
                });
            }
            Err(e) => {
                warn!(method = name, error = %e, "strategy faulted - skipping");
                attempts.push(StrategyAttempt {
                    name,
                    outcome: AttemptOutcome::Skipped,
                });
            }
        }
    }

    warn!(device_id = %req.device_id, tried = attempts.len(), "all strategies exhausted");
    let result = on_exhausted(&attempts);
    ChainOutcome {
        result,
        method: None,
        attempts,
    }
}
