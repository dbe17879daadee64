pub mod config;
pub mod logging;

// Pipeline modules, in flow order: classify, fetch, resolve, place, commit.
pub mod classifier;
pub mod content_type;
pub mod engine;
pub mod error;
pub mod placement;
pub mod saver;
pub mod store;
