pub mod app_config;
pub mod error;
pub mod reconcile;
pub mod time_util;
