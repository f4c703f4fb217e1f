pub mod binance;
pub mod cache;
pub mod config;
pub mod credential;
pub mod decision;
pub mod ingest;
pub mod matching;
pub mod model;
pub mod report;
