pub mod chunks;
pub mod ddl;
pub mod recordings;
pub mod sessions;
