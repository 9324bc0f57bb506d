//! Domain model: task configs, records, states and identifiers.

pub mod ids;
pub mod record;
pub mod state;
pub mod task;

pub use ids::RecordId;
pub use record::TaskRecord;
pub use state::TaskState;
pub use task::{BizType, TaskConfig};
