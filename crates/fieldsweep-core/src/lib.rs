//! fieldsweep-core: resumable, idempotent search-field backfill sweeps
//!
//! A sweep finds index documents missing derived fields, re-reads the
//! authoritative aspect each one was projected from, and restates it so the
//! store's own pipeline regenerates the document. A completion marker makes
//! reruns a no-op once a full pass has finished.
//!
//! # Architecture
//!
//! ```text
//! SweepController ─→ CandidateScanner ─→ SearchService (scroll)
//!        │
//!        ├─→ FieldBackfiller ─→ EntityStore (get, restate) ─→ projection ─→ index
//!        │
//!        └─→ CompletionMarker ─→ EntityStore (dataHubUpgrade)
//! ```
//!
//! # Modules
//!
//! - `urn`: Typed entity references
//! - `aspect`: Versioned aspects, proposals, audit stamps
//! - `filter`: Index filter model and in-process evaluation
//! - `search`: Index boundary (`SearchService`) and scroll tokens
//! - `store`: Authoritative store boundary (`EntityStore`)
//! - `projection`: Aspect → search document derivation
//! - `memory`: In-memory store + index
//! - `sqlite`: SQLite store + index
//! - `scanner`: Candidate pages over a missing-field filter
//! - `backfiller`: Per-candidate restate with isolated outcomes
//! - `marker`: Completion markers
//! - `sweep`: Sweep definitions, reports, and the controller
//! - `step`, `runner`: Upgrade-step surface and retrying runner
//! - `retry`: Exponential backoff
//! - `config`: TOML configuration with environment overrides
//! - `logging`: `tracing` subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod aspect;
pub mod backfiller;
pub mod config;
pub mod error;
pub mod filter;
pub mod logging;
pub mod marker;
pub mod memory;
pub mod projection;
pub mod retry;
pub mod runner;
pub mod scanner;
pub mod search;
pub mod sqlite;
pub mod step;
pub mod store;
pub mod sweep;
pub mod urn;

pub use error::{Error, ErrorClass, Result, SearchError, StoreError};
pub use sweep::{POLICY_FIELDS_SWEEP, SweepController, SweepDefinition, SweepReport};
