//! Task layer: long-running scans built from scheduler queries, the engine
//! that owns them, and the runtime that drives everything on one thread.

pub mod engine;
pub mod error;
pub mod registry;
pub mod runtime;
pub mod scan;
pub mod sink;
pub mod task;

pub use engine::{TaskEngine, TaskEvent, TaskInfo};
pub use error::TaskError;
pub use registry::{RegisteredTask, TaskArgs, TaskFactory, TaskRegistry};
pub use runtime::{
    AccountInfo, Command, RuleSnapshot, Runtime, RuntimeEvent, RuntimeHandle, Snapshot,
};
pub use scan::{BasicScan, HighwayScan};
pub use sink::{MemoryRecordSink, RecordSink};
pub use task::{ChunkObservation, Task, TaskContext, TaskId, TaskSettings, unix_millis};
