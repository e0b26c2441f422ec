//! Feed harvester library.
//!
//! Discovers an account's posts on a Threads-style feed, extracts engagement
//! metrics, captions and media through network interception, request replay
//! and DOM parsing, escalates what is still missing through reader tiers, and
//! tracks per-account progress so each run only fetches new posts.

// Allow raw string hashes for safety - they're harmless and prevent issues if content changes
#![allow(clippy::needless_raw_string_hashes)]

pub mod browser;
pub mod cache;
pub mod config;
pub mod constants;
pub mod db;
pub mod dedup;
pub mod discovery;
pub mod error;
pub mod escalation;
pub mod extractor;
pub mod harvester;
pub mod normalize;
pub mod platform;
pub mod poller;
pub mod progress;
pub mod state;
pub mod vision;
