//! Watchtower is an authenticating gateway in front of observability
//! backends.
//!
//! One process fronts any combination of a tracing, a metrics and a
//! log-aggregation backend, selected at boot by profile. Every inbound
//! request is authenticated (signed bearer token), authorized against an
//! ordered default-deny policy, routed to exactly one module, and
//! streamed back from that module's backend.
//!
//! # Architecture
//!
//! - [`cli`] -- Command-line argument parsing with clap derive macros.
//! - [`cmd`] -- Subcommand dispatch and execution (run, validate, health).
//! - [`config`] -- Configuration loading, validation, and hot-reloading via the
//!   [`ConfigSource`](config::ConfigSource) trait.
//! - [`module`] -- Module identifiers and profile-driven module selection.
//! - [`registry`] -- Startup-time table of backend adapters.
//! - [`backend`] -- The [`BackendAdapter`](backend::BackendAdapter) trait and
//!   its HTTP implementation.
//! - [`auth`] -- Bearer token validation into a [`Principal`](auth::Principal).
//! - [`policy`] -- Ordered, default-deny access policy.
//! - [`proxy`] -- The per-request state machine: routing, forwarding with
//!   retries, bounded pools, and streamed relaying.
//! - [`audit`] -- One audit record per request.
//! - [`error`] -- Unified error types using `thiserror`.
//! - [`health`] -- `GET /health` endpoint handler returning runtime diagnostics.
//! - [`logging`] -- Structured tracing setup with JSON and pretty-print output.
//! - [`server`] -- Axum server setup, shared application state, HTTP client, and
//!   graceful shutdown.
//!
//! # Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `yaml` | YAML config file support _(enabled by default)_ |
//! | `json` | JSON config file support |
//! | `toml` | TOML config file support |
//! | `file-backends` | All file format backends |
//! | `full` | All features |

// Binary crate: public functions are internal, not consumed by external users.
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod auth;
pub mod backend;
pub mod cli;
pub mod cmd;
pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod module;
pub mod policy;
pub mod proxy;
pub mod registry;
pub mod server;
