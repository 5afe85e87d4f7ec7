pub mod classifier;
pub mod classify;
pub mod config;

pub use classifier::*;
pub use classify::*;
pub use config::*;
