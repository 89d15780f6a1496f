pub mod catalog;
pub mod config;
pub mod downtime;
pub mod error;
pub mod extraction;
pub mod impact;
pub mod lifecycle;
pub mod models;
pub mod pipeline;
pub mod reconcile;
pub mod store;

pub use error::{Conflict, Error, Result};
pub use store::Store;
