//! Client-side data synchronization for the internship dashboards.
//!
//! A [`cache::TtlCache`] memoizes reads, a [`tabs::ViewDataController`]
//! tracks per-tab loading state on top of it, and a [`sync::SyncEngine`]
//! applies optimistic user mutations. [`dashboard::Dashboard`] wires all
//! three for one signed-in user.

pub mod api_types;
pub mod cache;
pub mod client;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod keys;
pub mod model;
pub mod scheduler;
pub mod sync;
pub mod tabs;
