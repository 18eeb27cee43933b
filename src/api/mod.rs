pub mod clob;
pub mod gamma;

pub use clob::{
    ClobClient, ClobError, ClobResult, Exchange, ExchangeOrderStatus, FailureKind, OrderAck,
    OrderState, OrderType, RejectionCode,
};
pub use gamma::{GammaClient, MarketFeed, MarketSnapshot, PriceHistory, WindowPrices};
