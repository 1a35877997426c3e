//! BlockSpool orchestration engine
//!
//! The engine drives an autonomous code-improvement loop: it scouts a
//! repository for opportunities, turns the best of them into tickets, runs
//! an external agent through a bounded PLAN→EXECUTE→QA→PR lifecycle per
//! ticket, and persists every state transition so a session can recover
//! cleanly from a crash or restart.
//!
//! This crate owns the state machine and its surrounding subsystems; it
//! never speaks to the agent directly — that's the `blockspool-cli`
//! binary's job over MCP.

#![allow(clippy::too_many_arguments)]

pub mod advance;
pub mod analytics;
pub mod config;
pub mod daemon;
pub mod dedup;
pub mod error;
pub mod event_processor;
pub mod eventlog;
pub mod git_controller;
pub mod learnings;
pub mod paths;
pub mod proposal;
pub mod qa;
pub mod run_state;
pub mod scheduler;
pub mod scope;
pub mod sector;
pub mod spindle;
pub mod ticket;
pub mod trajectory;
pub mod worker;

pub use advance::{advance, AdvanceContext, AdvanceResult, Digest, NextAction};
pub use config::{ConfigOverrides, Formula, RunConfig};
pub use error::{EngineError, EngineResult, StructuredError};
pub use event_processor::{process_event, ProcessContext, ProcessedOutcome};
pub use eventlog::{Event, EventLog, EventType, LoopState};
pub use paths::ProjectPaths;
pub use run_state::{Phase, Run, RunStateManager, WorkerState};
pub use ticket::{Category, Ticket, TicketStatus};
