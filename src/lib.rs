//! Job lifecycle and crash ingestion for a fleet of fuzzing workloads.
/// Application directory resolution.
pub mod app_dirs;
/// Crash classification seam and the exit status fallback.
pub mod classifier;
/// TOML configuration.
pub mod config;
/// Shared HTTP agent and retry helpers.
pub mod http_client;
/// Result scanning and crash import.
pub mod ingest;
/// Job identity, validation, reconciliation and the job service.
pub mod jobs;
/// Tracing setup.
pub mod logging;
/// Orchestrator trait and its Kubernetes and in-memory implementations.
pub mod orchestrator;
/// Startup connectivity retries.
pub mod startup;
/// SQLite persistence for jobs and crashes.
pub mod store;
