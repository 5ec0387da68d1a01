//! Same-mint swap engines

mod send;
mod token;

pub use send::SendSwapService;
pub use token::TokenSwapService;
