//! Per-thread compression counters and cost estimates

use serde::{Deserialize, Serialize};

/// Overhead of embedding and vector search on top of a retrieval baseline
const RAG_OVERHEAD: f64 = 1.15;

/// Retrieval memory re-injects its context roughly twice per turn
const RAG_INJECTION_FACTOR: f64 = 2.0;

/// Token pricing used to estimate spend
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    pub enabled: bool,
    pub cost_per_1k_input_tokens: f64,
    pub cost_per_1k_output_tokens: f64,
    /// Fraction of the input price refunded for prefix-cached tokens
    pub cached_token_discount: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            enabled: true,
            cost_per_1k_input_tokens: 0.01,
            cost_per_1k_output_tokens: 0.03,
            cached_token_discount: 0.9,
        }
    }
}

impl CostModel {
    fn input_cost(&self, tokens: u64) -> f64 {
        tokens as f64 / 1000.0 * self.cost_per_1k_input_tokens
    }

    fn output_cost(&self, tokens: u64) -> f64 {
        tokens as f64 / 1000.0 * self.cost_per_1k_output_tokens
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadStats {
    pub messages_added: u64,
    pub observer_runs: u64,
    pub reflector_runs: u64,
    /// Passes abandoned because of provider failure, timeout or unusable output
    pub failures: u64,
    /// Estimated tokens sent to the provider
    pub provider_input_tokens: u64,
    /// Estimated tokens received from the provider
    pub provider_output_tokens: u64,
    pub messages_compressed: u64,
    /// Raw-message tokens folded into observations
    pub raw_tokens_compressed: u64,
    /// Observation tokens produced from them
    pub observation_tokens_created: u64,
    pub contexts_built: u64,
    /// Observation-block tokens served as a stable, cacheable prefix
    pub cached_tokens: u64,
    pub estimated_cost_with_om: f64,
    /// What a retrieval-based memory would have spent on the same traffic
    pub estimated_cost_without_om: f64,
    pub cost_savings: f64,
}

impl ThreadStats {
    /// Raw tokens per observation token, 0.0 until something was compressed
    pub fn compression_ratio(&self) -> f64 {
        if self.observation_tokens_created == 0 {
            return 0.0;
        }
        self.raw_tokens_compressed as f64 / self.observation_tokens_created as f64
    }

    pub(crate) fn record_observer_run(
        &mut self,
        input_tokens: usize,
        output_tokens: usize,
        messages: usize,
        raw_tokens: usize,
        observation_tokens: usize,
        costs: &CostModel,
    ) {
        self.observer_runs += 1;
        self.provider_input_tokens += input_tokens as u64;
        self.provider_output_tokens += output_tokens as u64;
        self.messages_compressed += messages as u64;
        self.raw_tokens_compressed += raw_tokens as u64;
        self.observation_tokens_created += observation_tokens as u64;
        self.recalculate_costs(costs);
    }

    pub(crate) fn record_reflector_run(
        &mut self,
        input_tokens: usize,
        output_tokens: usize,
        costs: &CostModel,
    ) {
        self.reflector_runs += 1;
        self.provider_input_tokens += input_tokens as u64;
        self.provider_output_tokens += output_tokens as u64;
        self.recalculate_costs(costs);
    }

    pub(crate) fn record_context_built(&mut self, observation_tokens: usize, costs: &CostModel) {
        self.contexts_built += 1;
        self.cached_tokens += observation_tokens as u64;
        self.recalculate_costs(costs);
    }

    fn recalculate_costs(&mut self, costs: &CostModel) {
        if !costs.enabled {
            return;
        }

        let spent = costs.input_cost(self.provider_input_tokens)
            + costs.output_cost(self.provider_output_tokens);
        let discount = costs.input_cost(self.cached_tokens) * costs.cached_token_discount;

        self.estimated_cost_with_om = (spent - discount).max(0.0);
        self.estimated_cost_without_om = costs.input_cost(self.provider_input_tokens)
            * RAG_INJECTION_FACTOR
            * RAG_OVERHEAD;
        self.cost_savings = (self.estimated_cost_without_om - self.estimated_cost_with_om).max(0.0);
    }

    pub fn savings_report(&self) -> SavingsReport {
        let savings_percentage = if self.estimated_cost_without_om > 0.0 {
            self.cost_savings / self.estimated_cost_without_om * 100.0
        } else {
            0.0
        };

        SavingsReport {
            om_cost: round_to(self.estimated_cost_with_om, 4),
            estimated_rag_cost: round_to(self.estimated_cost_without_om, 4),
            savings_dollars: round_to(self.cost_savings, 4),
            savings_percentage: round_to(savings_percentage, 1),
            compression_ratio: round_to(self.compression_ratio(), 1),
            observer_runs: self.observer_runs,
            reflector_runs: self.reflector_runs,
            messages_processed: self.messages_added,
        }
    }
}

/// Rounded spend summary for one thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavingsReport {
    pub om_cost: f64,
    pub estimated_rag_cost: f64,
    pub savings_dollars: f64,
    pub savings_percentage: f64,
    pub compression_ratio: f64,
    pub observer_runs: u64,
    pub reflector_runs: u64,
    pub messages_processed: u64,
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
