//! # Build Log Indexer
//!
//! Indexes build metadata from a binary build cache into date-partitioned
//! OpenSearch indices.
//!
//! The build cache advertises each artifact with a small descriptor object
//! whose key encodes the artifact identity. For every descriptor the indexer
//! downloads the matching `.spack` bundle, pulls out the spec, install times
//! and per-phase build logs, and writes one document per build hash into
//! today's index partition. Hashes that are already indexed are skipped, so
//! re-running a backfill over an unchanged cache writes nothing.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────────────────────────────┐   ┌────────────┐
//! │ Object store │──▶│ Backfill (bounded worker pool)         │──▶│ OpenSearch │
//! │ list / fetch │   │ parse → dedup → extract → assemble     │   │ day index  │
//! └──────────────┘   └────────────────────────────────────────┘   └────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`models`] | Artifact identity and the indexed document |
//! | [`key`] | Descriptor key parsing |
//! | [`object_store`] | S3 listing and bundle download |
//! | [`extract`] | Selective bundle extraction |
//! | [`assemble`] | Document assembly and boolean normalization |
//! | [`search`] | Index partitions, dedup, document writes |
//! | [`backfill`] | Orchestration and per-item failure isolation |
//! | [`progress`] | Progress reporting on stderr |
//! | [`error`] | Per-item error taxonomy |

pub mod assemble;
pub mod backfill;
pub mod config;
pub mod error;
pub mod extract;
pub mod key;
pub mod models;
pub mod object_store;
pub mod progress;
pub mod search;
