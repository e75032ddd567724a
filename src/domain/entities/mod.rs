pub mod account;
pub mod candle;
pub mod contract;
pub mod position;
