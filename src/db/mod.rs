pub mod models;
pub mod queries;

pub use models::*;
pub use queries::{init_db, ConfigRepo, DbPool};

#[cfg(test)]
pub use queries::setup_test_db;
