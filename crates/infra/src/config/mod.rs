//! Configuration loading
//!
//! Reads [`netguard_domain::Config`] from TOML/JSON files and overlays
//! environment variables.

pub mod loader;

// Re-export commonly used items
pub use loader::{
    apply_env_overrides, apply_overrides_from, load, load_from_file, probe_config_paths,
};
