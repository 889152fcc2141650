//! Handlers 模块

pub mod data;
pub mod health;
pub mod stats;
pub mod write;

pub use data::*;
pub use health::*;
pub use stats::*;
pub use write::*;
