//! This crate exposes the internal functionality of the fragscan proxy
//! endpoint scanner.
//!
//! fragscan probes large candidate address sets through a local proxy
//! engine (such as xray) to find endpoints that stay reachable on hostile
//! networks, and can first tune the engine's TLS fragmentation settings
//! with a golden-ratio range search.
//!
//! ## Architecture Overview
//!
//! The scan runs in up to three phases, all sharing one
//! [`PortPool`](crate::port_pool::PortPool) of local SOCKS ports and one
//! [`ResultStore`](crate::results::ResultStore):
//!
//! 1. **Fragment optimization** (optional): [`RangeSearch`](crate::fragment::RangeSearch)
//!    walks fragmentation zones and converges on the size and interval
//!    ranges that survive the local network's interference.
//! 2. **Phase 1 - connectivity**: the [`WorkerPool`](crate::scanner::WorkerPool)
//!    spins up one engine instance per candidate and probes a health-check
//!    URL through it, concurrently across all workers.
//! 3. **Phase 2 - stability** (optional): the
//!    [`StabilityProfiler`](crate::stability::StabilityProfiler) re-tests the
//!    survivors sequentially over many rounds and scores each one out of 100.
//!
//! A lightweight ICMP/TCP [`Pinger`](crate::pinger::Pinger) can pre-filter
//! the candidate set before any engine is started.
//!
//! ## Basic Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use fragscan::engine::process::ProcessEngine;
//! use fragscan::port_pool::PortPool;
//! use fragscan::results::ResultStore;
//! use fragscan::scanner::{ScanConfig, WorkerPool};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = tokio::runtime::Runtime::new()?;
//!
//!     let engine = Arc::new(ProcessEngine::new("xray"));
//!     let ports = PortPool::new(40000, 40999);
//!     let store = Arc::new(ResultStore::new());
//!
//!     let mut config = ScanConfig::default();
//!     config.proxy.uuid = "11111111-2222-3333-4444-555555555555".to_owned();
//!     config.proxy.server_name = "cdn.example.net".to_owned();
//!
//!     let pool = WorkerPool::new(engine, ports, Arc::clone(&store), config);
//!     pool.set_candidates(vec!["172.64.0.1".to_owned(), "172.64.0.2".to_owned()]);
//!
//!     runtime.block_on(pool.run())?;
//!
//!     for result in store.sorted_by_latency() {
//!         println!("{} {}ms", result.address, result.latency_ms());
//!     }
//!     Ok(())
//! }
//! ```
#![allow(clippy::needless_doctest_main)]

pub mod candidates;

pub mod engine;

pub mod error;

pub mod fragment;

pub mod input;

pub mod pinger;

pub mod port_pool;

pub mod results;

pub mod scanner;

pub mod stability;
