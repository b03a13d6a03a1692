use std::sync::Arc;

use async_trait::async_trait;
use auth::{CredentialStore, SpendRecord};
use callbacks::{LogData, Sink};
use rate_limit::ModelBudgetLimiter;

/// Adds the cost of every finished call to the credential store and to the fleet
/// budget of its model.
///
/// Failed calls are charged too: a response blocked after the upstream call was
/// still paid for.
pub(crate) struct SpendSink {
    store: Arc<dyn CredentialStore>,
    model_budgets: Arc<ModelBudgetLimiter>,
}

impl SpendSink {
    pub fn new(store: Arc<dyn CredentialStore>, model_budgets: Arc<ModelBudgetLimiter>) -> Self {
        Self { store, model_budgets }
    }

    async fn record(&self, data: &LogData) {
        if data.spend <= 0.0 {
            return;
        }

        self.model_budgets.record(&data.model, data.spend);

        let Some(fingerprint) = &data.key_fingerprint else {
            return;
        };

        let record = SpendRecord {
            fingerprint: fingerprint.clone(),
            team_id: data.team_id.clone(),
            org_id: data.org_id.clone(),
            model: data.model.clone(),
            cost: data.spend,
        };

        if let Err(e) = self.store.record_spend(&record).await {
            log::warn!("Failed to record spend of request {}: {e}", data.request_id);
        }
    }
}

#[async_trait]
impl Sink for SpendSink {
    fn name(&self) -> &str {
        "spend"
    }

    async fn log_success(&self, data: &LogData) {
        self.record(data).await;
    }

    async fn log_failure(&self, data: &LogData) {
        self.record(data).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use auth::{StoreError, TokenInfo};

    use super::*;

    #[derive(Default)]
    struct Recording {
        records: Mutex<Vec<SpendRecord>>,
    }

    #[async_trait]
    impl CredentialStore for Recording {
        async fn get_verification_token(&self, _: &str) -> Result<Option<TokenInfo>, StoreError> {
            Ok(None)
        }

        async fn record_spend(&self, spend: &SpendRecord) -> Result<(), StoreError> {
            self.records.lock().unwrap().push(spend.clone());
            Ok(())
        }
    }

    fn data(spend: f64, fingerprint: Option<&str>) -> LogData {
        let mut data = LogData::new("req-1", "chat_completion", "gpt-4o");
        data.spend = spend;
        data.key_fingerprint = fingerprint.map(str::to_string);
        data.team_id = Some("team-a".to_string());
        data
    }

    #[tokio::test]
    async fn spend_reaches_store_and_model_budget() {
        let store = Arc::new(Recording::default());
        let budgets = Arc::new(ModelBudgetLimiter::new([("gpt-4o".to_string(), 1.0)]));
        let sink = SpendSink::new(store.clone(), budgets.clone());

        sink.log_success(&data(0.25, Some("abc"))).await;
        sink.log_failure(&data(0.5, Some("abc"))).await;

        assert_eq!(budgets.spend("gpt-4o"), 0.75);

        insta::assert_debug_snapshot!(store.records.lock().unwrap()[0], @r#"
        SpendRecord {
            fingerprint: "abc",
            team_id: Some(
                "team-a",
            ),
            org_id: None,
            model: "gpt-4o",
            cost: 0.25,
        }
        "#);
    }

    #[tokio::test]
    async fn free_and_anonymous_calls() {
        let store = Arc::new(Recording::default());
        let budgets = Arc::new(ModelBudgetLimiter::new([]));
        let sink = SpendSink::new(store.clone(), budgets.clone());

        sink.log_success(&data(0.0, Some("abc"))).await;
        sink.log_success(&data(0.1, None)).await;

        assert!(store.records.lock().unwrap().is_empty());
        assert_eq!(budgets.spend("gpt-4o"), 0.1);
    }
}
