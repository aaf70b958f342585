pub mod clock;
pub mod codec;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod errors;
pub mod metrics;
pub mod model;
pub mod monitor;
pub mod persist;
pub mod registry;
pub mod rest;
pub mod session;
pub mod store;
pub mod validate;
