//! # Pharmacy Domain Module
//!
//! The data-facing half of the voice agent: canonicalizing identifiers that
//! arrive mangled by speech transcription, the read-only order snapshot, and
//! the dispatcher that maps LLM tool calls onto lookups.
//!
//! ## Key Components:
//! - **Identifier Normalizer**: "m one zero zero one" → "M1001"
//! - **Pharmacy Store**: immutable in-memory index over members/orders/prescriptions
//! - **Function Dispatcher**: named tool invocations → store operations → JSON results

pub mod dispatcher;
pub mod normalize;
pub mod store;

pub use dispatcher::{AgentContext, FunctionDispatcher};
pub use normalize::{normalize_id, NormalizationError};
pub use store::PharmacyStore;
