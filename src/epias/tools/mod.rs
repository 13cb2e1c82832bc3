pub mod auth;
pub mod config;
pub mod error;
pub mod fetch;
pub mod io;
pub mod model;
pub mod pivot;
pub mod run;
pub mod testing;
pub mod transport;

pub use error::{Result, ToolError};
