pub mod indicators;
pub mod reversal;
pub mod stop_policy;
