// Order execution, sizing and trade records
pub mod executor;
pub mod price_model;
pub mod risk;
pub mod trade_log;

pub use executor::TradeExecutor;
pub use price_model::ExecutionPriceModel;
pub use risk::RiskManager;
pub use trade_log::{TradeLog, TradeRecord};
