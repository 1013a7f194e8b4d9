pub mod excerpt;
pub mod indexer;
pub mod query;
pub mod schema;

pub use indexer::Indexer;
pub use query::{SearchDb, SearchHit, SearchMode};
pub use schema::SqlDb;
