pub mod book;
pub mod bridge;
pub mod hyperliquid;
pub mod types;
