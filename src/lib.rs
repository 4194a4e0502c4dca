//! fleetsync
//!
//! Deploy software and run operations on many machines from one place:
//! verified chunked/batched file sync, remote process and service control,
//! and per-node tracking of every operation.

pub mod auth;
pub mod checksum;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod error;
pub mod fs_enum;
pub mod fs_service;
pub mod log;
pub mod logger;
pub mod net_async;
pub mod node;
pub mod orchestrator;
pub mod paths;
pub mod plan;
pub mod process_service;
pub mod protocol;
pub mod protocol_core;
pub mod registry;
pub mod service_control;
pub mod services;
pub mod sync_client;
pub mod task_queue;
pub mod tls;
pub mod tracker;
pub mod wire;
