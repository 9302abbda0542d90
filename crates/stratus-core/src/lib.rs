//! # Stratus Core
//!
//! Core library for the Stratus content-addressed edge CDN scheduler.
//!
//! This crate provides the scheduler's foundational components:
//!
//! - **[`registry`]**: Live edge/candidate session tracking with heartbeat,
//!   online/offline transitions, and the transport handles used to call back
//!   into nodes.
//!
//! - **[`election`]**: Periodic election of a validator subset from the
//!   candidate pool, persisted with a TTL equal to the election interval.
//!
//! - **[`validation`]**: The audit round engine — partition the online node
//!   set across validators, issue seeded challenges, collect and score
//!   results, and record per-device outcomes.
//!
//! - **[`replication`]**: The per-carfile replication state machine driving
//!   each content bundle to its target reliability across candidate and edge
//!   tiers.
//!
//! - **[`store`]**: Interfaces over the persistent system of record and the
//!   ephemeral key-value store, plus in-memory reference backends.
//!
//! - **[`auth`]**: Permissioned HMAC token issuance and verification for
//!   nodes, operators, and users.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         Scheduler                             │
//! │  ┌──────────────┐  ┌────────────────┐  ┌──────────────────┐   │
//! │  │ NodeRegistry │  │   Election     │  │ ValidationEngine │   │
//! │  └──────┬───────┘  └───────┬────────┘  └────────┬─────────┘   │
//! │         │                  │                    │             │
//! │  ┌──────▼───────┐  ┌───────▼────────────────────▼─────────┐   │
//! │  │ReplicaManager│  │  PersistentStore / EphemeralStore    │   │
//! │  └──────────────┘  └──────────────────────────────────────┘   │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nodes connect through the registry, the election periodically picks
//! validators from the candidate pool, and the validation engine uses both to
//! build each round's audit plan. Caching requests flow through the replica
//! manager, which selects nodes from the registry and advances replica state
//! as nodes report progress.

pub mod auth;
pub mod config;
pub mod download;
pub mod election;
pub mod error;
pub mod metrics;
pub mod quit;
pub mod registry;
pub mod replication;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod validation;

pub use error::CoreError;
pub use scheduler::Scheduler;
