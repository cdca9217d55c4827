//! Bulk Email Verification Job Engine
//!
//! Accepts batches of email addresses, meters them against a per-workspace
//! credit ledger, classifies each address in order through an external
//! provider, and keeps a resumable, pollable job record of verdict counts
//! and credits spent.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod worker;
