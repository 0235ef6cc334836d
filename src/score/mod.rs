//! Composite risk (per entity), health (per service) and IP reputation scoring.

pub mod health;
pub mod reputation;
pub mod risk;

pub use health::{HealthScore, HealthStatus, SlaBreach, SlaMetric};
pub use reputation::IpReputation;
pub use risk::{RiskFactor, RiskFlag, RiskProfile};
