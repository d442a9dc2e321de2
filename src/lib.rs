pub mod assemble;
pub mod backend;
pub mod cache;
pub mod compactor;
pub mod config;
pub mod coordinator;
pub mod directory;
pub mod limits;
pub mod model;
pub mod observability;
pub mod store;
pub mod wal;
