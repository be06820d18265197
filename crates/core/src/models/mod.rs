pub mod gateway;
pub mod message;
pub mod plan;
pub mod task;
pub mod task_run;
pub mod worker;

pub use gateway::{
    AckRequest, ControlAckRequest, ControlReplyRequest, CountResponse, EntriesResponse,
    HeartbeatRequest, PollRequest, ReclaimRequest, RenewRequest,
};
pub use message::{
    ControlMessage, LogChunk, LogLine, LogStream, PendingEntry, QueueEntry, ResultMessage,
    RuntimeReply, StatusChange, TaskReadyPayload,
};
pub use plan::{
    ArtifactRef, ExecutionPlan, ExecutionResult, ExitReason, ResourceUsage, SandboxPolicy,
};
pub use task::{
    ExecutionStrategy, ResourceLimits, RetryPolicy, RunOverrides, ScheduleSpec, TaskDefinition,
    TaskStatus,
};
pub use task_run::{DispatchStatus, RuntimeStatus, TaskRun, UpdateOrigin};
pub use worker::{HeartbeatMessage, TransportMode, WorkerNode, WorkerStatus};
