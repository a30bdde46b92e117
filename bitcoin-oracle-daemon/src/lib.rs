//! Bitcoin Oracle Daemon - follows a Bitcoin node and keeps a rolling
//! on-chain BTC/USD estimate up to date

pub mod bitcoin;
pub mod cache;
pub mod cli;
pub mod config;
pub mod retry;
pub mod service;
