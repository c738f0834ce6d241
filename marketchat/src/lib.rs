//! `MarketChat`: conversation engine for marketplace direct messages.

pub mod app;
pub mod chat;
pub mod config;
pub mod gateway;
