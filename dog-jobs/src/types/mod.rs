pub mod ids;

pub use ids::{BatchId, JobId};
