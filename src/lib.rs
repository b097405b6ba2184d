pub mod cluster;
pub mod config;
pub mod context;
pub mod control;
pub mod drift;
pub mod engine;
pub mod error;
pub mod fault;
pub mod gpu;
pub mod interconnect;
pub mod metrics;
pub mod parser;
pub mod router;
pub mod simulators;
pub mod store;
pub mod xid;
