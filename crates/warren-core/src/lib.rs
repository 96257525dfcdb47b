//! # warren-core
//!
//! Controllers for Warren sandboxes.
//!
//! Each controller is a level-triggered loop: store events are mapped to the
//! keys of the objects they affect, collapsed in a work queue and reconciled
//! by a bounded pool of workers. A reconcile reads the current state, makes
//! the children match, and writes status only when it changed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  ControllerManager                       │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  SandboxClaim ──▶ ClaimReconciler ──┐ adopts             │
//! │                        │            ▼                    │
//! │                        │      pool pods ◀── WarmPool-    │
//! │                        ▼                    Reconciler   │
//! │  Sandbox ──────▶ SandboxReconciler                       │
//! │                        │                                 │
//! │                        ▼                                 │
//! │              Pod, Service, PersistentVolumeClaim         │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//!                           │ watch / get / update
//!                           ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │             warren-api ObjectStore (MemoryStore)         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use warren_api::{MemoryStore, ObjectStore, Registry};
//! use warren_core::{ControllerConfig, ControllerManager, Telemetry};
//!
//! # async fn example() -> warren_core::Result<()> {
//! let registry = Arc::new(Registry::core().with_extensions());
//! let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new(registry));
//!
//! let config = ControllerConfig::builder()
//!     .workers(8)
//!     .extensions(true)
//!     .build()?;
//!
//! let mut manager = ControllerManager::new(store, Arc::new(Telemetry::noop()), config);
//! manager.start();
//! // ...
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Sandbox Lifecycle**: One Pod, one headless Service and per-template storage per Sandbox
//! - **Expiry**: Time-based teardown through delayed re-queues
//! - **Warm Pooling**: Pre-started pods adopted by claims with conditional writes
//! - **Tracing**: Optional OpenTelemetry spans resumed from object annotations

pub mod claim;
mod config;
mod error;
mod hash;
mod manager;
pub mod pool;
pub mod runtime;
pub mod sandbox;
pub mod telemetry;

pub use claim::ClaimReconciler;
pub use config::{ControllerConfig, ControllerConfigBuilder};
pub use error::{AggregateError, CoreError, Result};
pub use hash::name_hash;
pub use manager::ControllerManager;
pub use pool::{PoolStats, WarmPoolReconciler};
pub use sandbox::SandboxReconciler;
pub use telemetry::{Instrumenter, Telemetry};
