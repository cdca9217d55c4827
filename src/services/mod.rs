pub mod classifier;
pub mod lease;
pub mod ledger;
pub mod queue;
pub mod store;
pub mod submission;
