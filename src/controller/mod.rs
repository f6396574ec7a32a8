//! # Controller
//!
//! Reconcilers and the machinery that drives them.
//!
//! - `broker`, `class_plan`, `instance`, `binding`: one reconciler per resource kind
//! - `catalog`: catalog fetch, relist scheduling and class/plan materialization
//! - `queue`, `dispatcher`, `backoff`: per-kind work queues and worker pools
//! - `parameters`, `transform`: parameter resolution and credential shaping
//! - `status`, `finalizer`: condition and finalizer bookkeeping
//! - `server`: HTTP server for metrics and probes

pub mod backoff;
pub mod binding;
pub mod broker;
pub mod catalog;
pub mod class_plan;
pub mod dispatcher;
pub mod finalizer;
pub mod instance;
pub mod parameters;
pub mod queue;
pub mod server;
pub mod status;
pub mod transform;
pub mod types;

pub use types::{Context, ReconcileAction, ReconcileError, TriggerSource};
