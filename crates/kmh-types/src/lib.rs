pub mod config;
pub mod errors;
pub mod job;
pub mod matrix;
pub mod row;

pub use config::*;
pub use errors::*;
pub use job::*;
pub use matrix::*;
pub use row::*;
