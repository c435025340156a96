//! Configuration management for profiled
//!
//! This module provides the layered settings model:
//! - **settings**: section-delimited text store with atomic save
//! - **layers**: read-only Configuration layer and user Values layer
//! - **daemon_state**: resolution, active profile and persistence
//! - **paths**: service-root layout

pub mod daemon_state;
pub mod layers;
pub mod paths;
pub mod settings;

// Re-export commonly used types
pub use daemon_state::DaemonState;
pub use paths::ServicePaths;
