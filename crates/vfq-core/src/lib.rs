pub mod builtin;
pub mod config;
pub mod error;
pub mod executor;
pub mod io;
pub mod mutex;
pub mod paths;
pub mod queue;
pub mod registry;
pub mod sanitize;
pub mod step;
pub mod wrapper;

pub use error::{Result, VfError};
