//! Send quote engines

mod cashu;
mod spark;

pub use cashu::CashuSendService;
pub use spark::SparkSendService;
