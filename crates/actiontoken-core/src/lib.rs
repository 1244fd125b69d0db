//! ActionToken Core - grant model and permission evaluation
//!
//! Tokens are granted CRUD verbs on named resource types through a small
//! graph: Token → Rule → Action, with Action optionally narrowed by Field.
//! Storage and type registration are supplied by the host through the
//! [`GrantStore`] and [`TypeRegistry`] traits.

pub mod engine;
pub mod guard;
pub mod lifecycle;
pub mod model;
pub mod registry;
pub mod store;

pub use engine::PermissionEngine;
pub use guard::{AccessGuard, GuardError};
pub use lifecycle::{TokenLifecycle, DEFAULT_LIFETIME_SECS};
pub use model::{Action, ActionId, Field, FieldId, ModelError, Rule, RuleId, Target, Token, TokenId, Verb};
pub use registry::{StaticTypeRegistry, TypeDescriptor, TypeRegistry};
pub use store::{GrantStore, MemoryGrantStore, StoreError};
