pub mod aggregator;
pub mod backoff;
pub mod capture;
pub mod config;
pub mod dispatcher;
pub mod dto;
pub mod live;
pub mod ports;
pub mod registry;
pub mod scheduler;
pub mod services;
pub mod session;
pub mod trigger;
