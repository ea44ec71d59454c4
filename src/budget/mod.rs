//! Budget module - cost estimation for provider calls.
//!
//! # Key Concepts
//! - Pricing: per-model token prices in cents per million tokens
//! - Estimate: cost of a single call from its reported token usage

mod pricing;

pub use pricing::{estimate_cost_cents, pricing_for, ModelPricing};
