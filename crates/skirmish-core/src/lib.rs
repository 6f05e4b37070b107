//! Processing topology, stream tasks, and victory detection for the
//! Skirmish combat telemetry pipeline.
//!
//! Arena reference data and per-round combat events flow through a small
//! stateful topology:
//!
//! ```text
//! arenas --> ArenaUpsert (arena registry)
//! rounds --> RoundIntake --> PlayerCorrelator --> VictoryDetector --> results
//! ```
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `skirmish-config.yaml`.
//! - [`feed`] -- Inbound and outbound records exchanged with the transport.
//! - [`time`] -- Event-time extraction and its fallback policy.
//! - [`processor`] -- The [`Processor`] seam, records, and contexts.
//! - [`topology`] -- [`TopologyBuilder`] and sub-topology splitting.
//! - [`stores`] -- Typed store handles and the per-process store set.
//! - [`task`] -- [`StreamTask`], one instance of a sub-topology.
//! - [`arena_upsert`], [`intake`], [`correlator`], [`victory`] -- The four
//!   processors.
//! - [`pipeline`] -- The combat topology wiring.
//! - [`partition`] -- Key to partition hashing.
//! - [`query`] -- [`VictoryQueryService`] over the victory windows.
//! - [`runner`] -- [`Pipeline`] startup, workers, and shutdown.
//!
//! [`Processor`]: processor::Processor
//! [`TopologyBuilder`]: topology::TopologyBuilder
//! [`StreamTask`]: task::StreamTask
//! [`VictoryQueryService`]: query::VictoryQueryService
//! [`Pipeline`]: runner::Pipeline

pub mod arena_upsert;
pub mod config;
pub mod correlator;
pub mod feed;
pub mod intake;
pub mod partition;
pub mod pipeline;
pub mod processor;
pub mod query;
pub mod runner;
pub mod stores;
pub mod task;
pub mod time;
pub mod topology;
pub mod victory;
