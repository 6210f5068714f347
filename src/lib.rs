//! # Steward — local-first multi-agent personal assistant platform
//!
//! Steward is the orchestration plane for a small constellation of
//! cooperating agents over local data sources (mail, contacts, calendar,
//! messages, memory). The crate provides:
//!
//! - a three-tier **semantic cache** of interpretation results and entity
//!   relationships ([`cache`]);
//! - an **LLM query interpreter** that turns natural language into
//!   structured capability dispatches against a locally hosted model
//!   ([`llm`]);
//! - a **performance tracker** with SLA compliance, trend detection, and
//!   edge-transition alerts ([`monitor`]);
//! - the **agent service base** composing all of the above behind a uniform
//!   HTTP surface ([`service`]);
//! - a **background sync worker** pattern decoupling slow upstream sources
//!   from sub-second local reads ([`sync`]);
//! - the **agent registry**, **coordinator** pipeline, and **gateway**
//!   front door ([`registry`], [`coordinator`], [`gateway`]).
//!
//! Everything is local-first: no core component performs network egress to
//! third-party services, and all intelligence runs on a locally hosted
//! model endpoint.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod domain_types;
pub mod error;
pub mod gateway;
pub mod llm;
pub mod manifest;
pub mod monitor;
pub mod registry;
pub mod schema;
pub mod service;
pub mod sync;

pub use crate::config::{AgentMode, StewardConfig};
pub use crate::domain_types::{AgentId, CapabilityVerb, Confidence};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::manifest::{AgentManifest, AgentRegistration, Capability};
pub use crate::service::{AgentService, ConfidenceResult};
