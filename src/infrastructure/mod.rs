pub mod binance;
pub mod cache;
pub mod coordinator;
pub mod gate;
