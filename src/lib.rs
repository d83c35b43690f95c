// ===============================
// src/lib.rs
// ===============================
pub mod bus;
pub mod candle;
pub mod config;
pub mod domain;
pub mod error;
pub mod event;
pub mod feed;
pub mod ledger;
pub mod metrics;
pub mod notify;
pub mod processer;
pub mod processers;
pub mod recorder;
pub mod risk;
pub mod strategy;
pub mod vex;

pub use error::{Error, Result};
