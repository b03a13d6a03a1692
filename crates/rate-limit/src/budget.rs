//! Budget evaluation.
//!
//! Principal budgets are checked against the spend read from the credential store on
//! every request. The [`ModelBudgetLimiter`] is a separate, process-local aggregate
//! capping the overall cost of a model, cleared on a fixed schedule.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The budget that was exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetScope {
    /// The virtual key.
    Key,
    /// The key's team.
    Team,
    /// The key's organization.
    Organization,
    /// A per-model budget, of a principal or of the whole fleet.
    Model(String),
}

impl fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetScope::Key => f.write_str("key"),
            BudgetScope::Team => f.write_str("team"),
            BudgetScope::Organization => f.write_str("organization"),
            BudgetScope::Model(model) => write!(f, "model {model}"),
        }
    }
}

/// Spend reached the configured cap.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Budget exceeded for {scope}: current spend {spend} reached max budget {max_budget}")]
pub struct BudgetExceeded {
    /// Which budget was exhausted.
    pub scope: BudgetScope,
    /// Cumulative spend in USD.
    pub spend: f64,
    /// Cap in USD.
    pub max_budget: f64,
}

/// Cumulative spend and caps of a principal, as read from the credential store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BudgetSnapshot {
    /// Spend of the key.
    pub key_spend: f64,
    /// Cap of the key.
    pub key_max_budget: Option<f64>,
    /// Spend of the team.
    pub team_spend: f64,
    /// Cap of the team.
    pub team_max_budget: Option<f64>,
    /// Spend of the organization.
    pub org_spend: f64,
    /// Cap of the organization.
    pub org_max_budget: Option<f64>,
    /// Spend per model.
    pub model_spend: BTreeMap<String, f64>,
    /// Cap per model.
    pub model_max_budget: BTreeMap<String, f64>,
}

fn check(scope: BudgetScope, spend: f64, max_budget: Option<f64>) -> Result<(), BudgetExceeded> {
    match max_budget {
        Some(max_budget) if spend >= max_budget => Err(BudgetExceeded {
            scope,
            spend,
            max_budget,
        }),
        _ => Ok(()),
    }
}

/// Admit iff every configured cap is above its spend. A missing cap is unlimited; a
/// per-model cap is only enforced when positive.
pub fn check_budget(snapshot: &BudgetSnapshot, model: &str) -> Result<(), BudgetExceeded> {
    check(BudgetScope::Key, snapshot.key_spend, snapshot.key_max_budget)?;
    check(BudgetScope::Team, snapshot.team_spend, snapshot.team_max_budget)?;
    check(BudgetScope::Organization, snapshot.org_spend, snapshot.org_max_budget)?;

    let model_cap = snapshot.model_max_budget.get(model).copied().filter(|cap| *cap > 0.0);
    let model_spend = snapshot.model_spend.get(model).copied().unwrap_or_default();

    check(BudgetScope::Model(model.to_string()), model_spend, model_cap)
}

/// Caps the cumulative cost of models across all principals of this process.
///
/// Every recorded cost counts, including imputed spend of cached responses.
#[derive(Debug, Default)]
pub struct ModelBudgetLimiter {
    caps: HashMap<String, f64>,
    spend: DashMap<String, f64>,
}

impl ModelBudgetLimiter {
    /// Create a limiter for the given `model → cap` pairs.
    pub fn new(caps: impl IntoIterator<Item = (String, f64)>) -> Self {
        Self {
            caps: caps.into_iter().collect(),
            spend: DashMap::new(),
        }
    }

    /// Fails when the model has a cap and its spend reached it.
    pub fn check(&self, model: &str) -> Result<(), BudgetExceeded> {
        let cap = self.caps.get(model).copied();
        check(BudgetScope::Model(model.to_string()), self.spend(model), cap)
    }

    /// Add a cost to the model's spend.
    pub fn record(&self, model: &str, cost: f64) {
        if cost <= 0.0 {
            return;
        }

        *self.spend.entry(model.to_string()).or_default() += cost;
    }

    /// Current spend of the model.
    pub fn spend(&self, model: &str) -> f64 {
        self.spend.get(model).map(|spend| *spend).unwrap_or_default()
    }

    /// Clear the spend of one model, or of every model.
    pub fn reset(&self, model: Option<&str>) {
        match model {
            Some(model) => {
                self.spend.remove(model);
            }
            None => self.spend.clear(),
        }

        log::info!("Model budget spend reset for {}", model.unwrap_or("all models"));
    }

    /// Clear the spend of every model on each tick until `shutdown` is cancelled.
    pub fn spawn_reset(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let limiter = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => limiter.reset(None),
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }
}
