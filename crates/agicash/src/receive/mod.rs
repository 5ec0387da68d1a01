//! Receive quote engines

mod cashu;
mod spark;

pub use cashu::CashuReceiveService;
pub use spark::SparkReceiveService;
