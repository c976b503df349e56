mod marker;
mod records;
mod schema;
mod types;

pub use marker::LAST_UPDATE_KEY;
pub use schema::Database;
pub use types::{DatabaseError, DueCounts, Record};
