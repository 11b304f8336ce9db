//! Gator - an RSS feed aggregator
//!
//! The aggregation engine periodically picks the least recently fetched feeds,
//! fetches them concurrently and stores their posts, skipping ones already seen.

pub mod config;
pub mod db;
pub mod reader;
pub mod scheduler;
pub mod worker;
