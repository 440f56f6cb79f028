//! Shoal: protocol-agnostic mock serving engine.
//!
//! A request enters through a [`adapter::ProtocolAdapter`] as a
//! [`model::MatchContext`], the [`engine::MatchEngine`] selects at most one
//! rule (reading rule sets through the [`cache::CacheManager`]), and the
//! [`executor::ResponseExecutor`] turns it into a [`model::MockResponse`].

pub mod adapter;
pub mod admin;
pub mod cache;
pub mod config;
pub mod engine;
pub mod executor;
pub mod metrics;
pub mod model;
pub mod repository;
pub mod scripting;
pub mod service;

pub use service::MockService;
