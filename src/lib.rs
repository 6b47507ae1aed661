pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod join;
pub mod lease;
pub mod logging;
pub mod normalize;
pub mod provision;
pub mod reconcile;
pub mod retry;
pub mod roster;
pub mod submissions;
pub mod telegram;
