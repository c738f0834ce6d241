//! Shared data model and REST wire format for `MarketChat`.

pub mod message;
pub mod wire;
