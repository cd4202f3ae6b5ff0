//! Finalize Agent
//!
//! Turns a free-form request into a validated, contradiction-checked
//! requirements object. The deterministic gates live in `finalize-gates`;
//! this crate owns everything that awaits: the model gateway, the repair
//! loop, the semantic contradiction pass, run orchestration, artifacts and
//! telemetry.
//!
//! # Modules
//!
//! | Module | Role |
//! |--------|------|
//! | `config` | TOML + `FINALIZE_*` environment configuration |
//! | `gateway` | Budgeted, retried, cancellable model calls (OpenAI-compatible and offline clients) |
//! | `prompts` | Versioned system prompts and prompt builders |
//! | `validator` | Repair prompt construction |
//! | `contradiction` | Rule pass plus bounded semantic pass |
//! | `state_machine` | Run lifecycle with transition history |
//! | `orchestrator` | `run_finalize` |
//! | `artifacts` | Per-trace result files |
//! | `telemetry` | Sanitized per-run records and sinks |
//! | `otel` | Span helpers |
//! | `report` | Cost report over the usage ledger |

#![allow(clippy::uninlined_format_args)]

pub mod artifacts;
pub mod config;
pub mod contradiction;
pub mod gateway;
pub mod orchestrator;
pub mod otel;
pub mod prompts;
pub mod report;
pub mod state_machine;
pub mod telemetry;
pub mod validator;

pub use config::{FinalizeConfig, Provider};
pub use gateway::{CallPurpose, ModelClient, ModelGateway, ModelReply, ModelRequest};
pub use orchestrator::{FinalizeResult, FinalizeStatus, Orchestrator, UsageTotals};
pub use state_machine::{FinalizeState, StateMachine, TransitionRecord};
pub use telemetry::{TelemetryRecord, TelemetrySink};
