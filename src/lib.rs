//! KarnEvil9 — an agentic task kernel behind an HTTP/WS control plane.
//!
//! The kernel accepts a natural-language task, asks a pluggable planner for
//! a step plan over registered tools, executes the plan as a dependency DAG
//! under strict resource budgets, and appends every state transition to a
//! journal. The control plane admits sessions, streams journal events to
//! SSE and WebSocket clients, and brokers human approvals for gated tool
//! calls.

#![allow(missing_docs)] // TODO: enforce once core types are stable

pub mod config;
pub mod journal;
pub mod kernel;
pub mod logging;
pub mod server;
pub mod tools;
pub mod types;
