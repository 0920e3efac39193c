use crate::task::TaskId;

/// Errors from starting, stopping or configuring tasks.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("unknown task type '{0}'")]
    UnknownTaskType(String),
    #[error("no task with id {0}")]
    NoSuchTask(TaskId),
    #[error("{task}: missing parameter '{param}'")]
    MissingParameter { task: String, param: String },
    #[error("{task}: parameter '{param}' has the wrong type")]
    InvalidParameter { task: String, param: String },
    #[error("{task}: unknown parameter '{param}'")]
    UnknownParameter { task: String, param: String },
    #[error("{task}: {reason}")]
    InvalidArgument { task: String, reason: String },
}
