//! Resource model and object store for Warren.
//!
//! This crate defines the declarative resources the controllers operate on
//! (Sandbox and its extensions, plus the platform-native Pod, Service and
//! PersistentVolumeClaim), the [`ObjectStore`] seam with optimistic
//! concurrency, and an in-memory implementation of it.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use warren_api::{Api, MemoryStore, ObjectStore, Registry, Resource, Sandbox};
//!
//! #[tokio::main]
//! async fn main() -> warren_api::Result<()> {
//!     let store: Arc<dyn ObjectStore> =
//!         Arc::new(MemoryStore::new(Arc::new(Registry::core())));
//!     let sandboxes: Api<Sandbox> = Api::new(store);
//!
//!     let created = sandboxes.create(&Sandbox::new("default", "demo")).await?;
//!     println!("created {} at version {}", created.key(), created.metadata.resource_version);
//!     Ok(())
//! }
//! ```

pub mod condition;
mod error;
pub mod extensions;
pub mod keys;
mod memory;
pub mod meta;
pub mod platform;
mod registry;
mod resource;
pub mod sandbox;
mod selector;
mod store;

pub use condition::{find_condition, set_condition, Condition, ConditionStatus};
pub use error::{Result, StoreError};
pub use extensions::{NetworkPolicyRules, SandboxClaim, SandboxTemplate, SandboxWarmPool, ShutdownPolicy};
pub use memory::MemoryStore;
pub use platform::{NetworkPolicy, PersistentVolumeClaim, Pod, PodPhase, Service};
pub use meta::{ObjectKey, ObjectMeta, OwnerReference};
pub use registry::{KindInfo, Registry};
pub use resource::{set_controller_reference, DynamicObject, Resource};
pub use sandbox::Sandbox;
pub use selector::LabelSelector;
pub use store::{Api, EventType, ObjectStore, Preconditions, WatchEvent};
