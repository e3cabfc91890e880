pub mod actor;
pub mod node;
pub mod redis_storage;
pub mod storage;

pub use actor::{TaskActor, TaskEvent, TaskHandle, TaskView};
pub use node::{NodeEvent, StartRequest, SyncNode};
pub use redis_storage::RedisReplicaStore;
pub use storage::{InMemoryReplicaStore, ReplicaStore};
