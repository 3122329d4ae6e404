//! sea-orm entities for the durable key/value table.

pub mod kv_entries;
