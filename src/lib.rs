pub mod types;
pub mod error;
pub mod config;
pub mod events;
pub mod utils;
pub mod time;
pub mod broker;
pub mod strategy;
pub mod cache;
pub mod analytics;
pub mod calendar;
pub mod regime;
pub mod strategy_builder;
pub mod risk;
pub mod circuit_breaker;
pub mod orchestrator;
pub mod monitor;
pub mod controller;
pub mod api;
pub mod persistence;
pub mod notify;
pub mod participant;

pub use config::Config;
pub use error::{Result, TradingError};
pub use types::*;
