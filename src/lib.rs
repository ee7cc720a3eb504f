pub mod catalog;
pub mod config;
pub mod logging;
pub mod present;
pub mod reconcile;
pub mod scheduler;
pub mod storage;
pub mod upstream;
