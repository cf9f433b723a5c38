pub mod agent_reference;
pub mod algorithms;
pub mod backend;
pub mod catalogue;
pub mod codec;
pub mod garbage_collector;
pub mod heartbeat;
pub mod helpers;
pub mod keys;
pub mod mem_queue;
pub mod objects;
pub mod retry;
pub mod scheduler_db;
pub mod settings;
pub mod sorter;
pub mod storage;
pub mod trace;

pub use ostoredb_macros::test;
