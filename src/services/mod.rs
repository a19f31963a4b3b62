pub mod loyalty;
pub mod orders;
pub mod payments;
pub mod reconciliation;
