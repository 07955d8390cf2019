pub mod config;
mod initial_setup;
mod start;

pub use initial_setup::*;
pub use start::*;
