pub mod db;
pub mod jobdb;
pub mod memory;
pub mod query_timeout;
pub mod reliabilitydb;
