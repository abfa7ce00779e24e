pub mod kv;
pub mod pool;
pub mod redis_store;
pub mod schema;
