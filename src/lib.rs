//! Execution and coordination core for the Gas Town multi-agent orchestrator.
//!
//! Gas Town runs autonomous workers that execute tasks in isolated git
//! worktrees, coordinate over a relay-based pub/sub event network (Nostr),
//! and call remote language models as planners. This crate is the core those
//! workers are built from:
//!
//! - [`llm`] — a uniform client over two provider wire dialects
//!   (chat-completions and messages), with streaming and a retry decorator.
//! - [`tools`] — the fixed tool catalog and the worktree-sandboxed executor
//!   that runs it.
//! - [`agent`] — the think-act-observe loop driving one worker, plus
//!   context-window management.
//! - [`server`] — an HTTP surface exposing the executor to remote agents,
//!   with bearer auth and an SSE liveness stream.
//! - [`nostr`] — event signing, relay fan-out, a local spool for offline
//!   resilience, lifecycle heartbeats, and the identity registry.
//! - [`events`] — the dual-write bridge that mirrors orchestrator activity
//!   onto the event network.
//!
//! Command-line parsing, workspace discovery, the issue store, and the
//! higher-level role agents (mayor, witness, refinery, deacon) live outside
//! this crate; they consume these modules through their public types.

pub mod agent;
pub mod config;
pub mod events;
pub mod llm;
pub mod nostr;
pub mod server;
pub mod tools;
