pub mod election;
pub mod tab;
pub mod types;
