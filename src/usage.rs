//! Per-customer spend metering for language model calls.
//!
//! Spend is accumulated per customer and calendar month (`YYYY-MM`, UTC) and
//! compared against a monthly cap.

use crate::error::UsageError;

use chrono::Utc;
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default monthly spend cap per customer, in USD.
pub const DEFAULT_MONTHLY_LIMIT: f64 = 2.0;

/// Cost of one token, in USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_token_cost: f64,
    pub output_token_cost: f64,
}

impl ModelPricing {
    /// Pricing from USD per million tokens.
    pub fn per_million(input: f64, output: f64) -> Self {
        Self {
            input_token_cost: input / 1_000_000.0,
            output_token_cost: output / 1_000_000.0,
        }
    }

    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        usage.input_tokens.unwrap_or(0) as f64 * self.input_token_cost
            + usage.output_tokens.unwrap_or(0) as f64 * self.output_token_cost
    }
}

/// Token counts reported for one model call. Missing counts are treated
/// as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// Accumulated usage of one customer in one month.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub customer_id: String,
    pub month: String,
    pub request_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_spent: f64,
}

/// In-memory usage ledger keyed by customer and month.
pub struct UsageMeter {
    pricing: HashMap<String, ModelPricing>,
    monthly_limit: f64,
    records: Mutex<HashMap<(String, String), UsageRecord>>,
}

impl UsageMeter {
    /// Create a meter with the built-in model prices.
    pub fn new(monthly_limit: f64) -> Self {
        let pricing = HashMap::from([
            (
                "llama-3.1-8b-instant".to_string(),
                ModelPricing::per_million(0.05, 0.08),
            ),
            (
                "openai/gpt-oss-20b".to_string(),
                ModelPricing::per_million(0.10, 0.50),
            ),
        ]);
        Self {
            pricing,
            monthly_limit,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Add or replace the price of a model.
    pub fn with_pricing(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.pricing.insert(model.into(), pricing);
        self
    }

    pub fn monthly_limit(&self) -> f64 {
        self.monthly_limit
    }

    /// Record one call for the current month and return its cost.
    pub fn track_usage(&self, customer_id: &str, model: &str, usage: TokenUsage) -> Result<f64, UsageError> {
        self.track_usage_in(&current_month(), customer_id, model, usage)
    }

    /// Record one call for `month` and return its cost.
    pub fn track_usage_in(
        &self,
        month: &str,
        customer_id: &str,
        model: &str,
        usage: TokenUsage,
    ) -> Result<f64, UsageError> {
        let pricing = self
            .pricing
            .get(model)
            .ok_or_else(|| UsageError::UnknownModel(model.to_string()))?;
        let spend = pricing.cost(&usage);

        let mut records = self.records.lock();
        let record = records
            .entry((customer_id.to_string(), month.to_string()))
            .or_insert_with(|| UsageRecord {
                customer_id: customer_id.to_string(),
                month: month.to_string(),
                request_count: 0,
                input_tokens: 0,
                output_tokens: 0,
                total_spent: 0.0,
            });
        record.request_count += 1;
        record.input_tokens += usage.input_tokens.unwrap_or(0);
        record.output_tokens += usage.output_tokens.unwrap_or(0);
        record.total_spent += spend;

        debug!(
            "Customer {} spent {:.6} on {} ({:.6} this month)",
            customer_id, spend, model, record.total_spent
        );
        if record.total_spent >= self.monthly_limit && record.total_spent - spend < self.monthly_limit {
            info!("Customer {} reached the monthly limit of {:.2}", customer_id, self.monthly_limit);
        }
        Ok(spend)
    }

    /// Whether the customer has spent at least the monthly limit this month.
    pub fn is_over_limit(&self, customer_id: &str) -> bool {
        self.is_over_limit_in(&current_month(), customer_id)
    }

    pub fn is_over_limit_in(&self, month: &str, customer_id: &str) -> bool {
        self.usage_for(customer_id, month)
            .is_some_and(|record| record.total_spent >= self.monthly_limit)
    }

    /// Usage of a customer in a month, if any was recorded.
    pub fn usage_for(&self, customer_id: &str, month: &str) -> Option<UsageRecord> {
        self.records
            .lock()
            .get(&(customer_id.to_string(), month.to_string()))
            .cloned()
    }
}

impl Default for UsageMeter {
    fn default() -> Self {
        Self::new(DEFAULT_MONTHLY_LIMIT)
    }
}

/// The current month as `YYYY-MM` in UTC.
pub fn current_month() -> String {
    Utc::now().format("%Y-%m").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u64, output: u64) -> TokenUsage {
        TokenUsage {
            input_tokens: Some(input),
            output_tokens: Some(output),
        }
    }

    #[test]
    fn accumulates_per_customer_and_month() {
        let meter = UsageMeter::default();
        meter
            .track_usage_in("2025-01", "c1", "llama-3.1-8b-instant", usage(1_000_000, 1_000_000))
            .unwrap();
        meter
            .track_usage_in("2025-01", "c1", "llama-3.1-8b-instant", usage(500, 0))
            .unwrap();
        meter
            .track_usage_in("2025-02", "c1", "llama-3.1-8b-instant", usage(1, 1))
            .unwrap();

        let january = meter.usage_for("c1", "2025-01").unwrap();
        assert_eq!(january.request_count, 2);
        assert_eq!(january.input_tokens, 1_000_500);
        assert_eq!(january.output_tokens, 1_000_000);
        assert!((january.total_spent - 0.130025).abs() < 1e-9);
        assert_eq!(meter.usage_for("c1", "2025-02").unwrap().request_count, 1);
        assert!(meter.usage_for("c2", "2025-01").is_none());
    }

    #[test]
    fn missing_token_counts_cost_nothing() {
        let meter = UsageMeter::default();
        let spend = meter
            .track_usage_in("2025-01", "c1", "openai/gpt-oss-20b", TokenUsage::default())
            .unwrap();
        assert_eq!(spend, 0.0);
        assert_eq!(meter.usage_for("c1", "2025-01").unwrap().request_count, 1);
    }

    #[test]
    fn limit_is_inclusive() {
        let meter = UsageMeter::new(1.0).with_pricing("flat", ModelPricing::per_million(1_000_000.0, 0.0));
        assert!(!meter.is_over_limit_in("2025-01", "c1"));
        meter.track_usage_in("2025-01", "c1", "flat", usage(1, 0)).unwrap();
        assert!(meter.is_over_limit_in("2025-01", "c1"));
        assert!(!meter.is_over_limit_in("2025-02", "c1"));
    }

    #[test]
    fn current_month_is_tracked_by_default() {
        let meter = UsageMeter::new(0.0);
        assert!(!meter.is_over_limit("c1"));
        meter.track_usage("c1", "openai/gpt-oss-20b", usage(10, 10)).unwrap();
        assert!(meter.is_over_limit("c1"));
        assert_eq!(current_month().len(), 7);
    }

    #[test]
    fn unknown_model_is_rejected() {
        let meter = UsageMeter::default();
        let err = meter.track_usage("c1", "gpt-9", usage(1, 1)).unwrap_err();
        assert_eq!(err, UsageError::UnknownModel("gpt-9".to_string()));
        assert!(meter.usage_for("c1", &current_month()).is_none());
    }
}
