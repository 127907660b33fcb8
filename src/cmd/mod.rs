pub mod check;
pub mod config;
pub mod demo;
pub mod snapshots;
