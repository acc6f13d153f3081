use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue worker is no longer running. queue: '{0}'")]
    Disconnected(String),
    #[error("Job panicked while running on queue. queue: '{0}'")]
    Panicked(String),
    #[error("Synchronous dispatch from the queue's own worker would deadlock. queue: '{0}'")]
    Reentrant(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to parse store configuration. cause: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid store name, names must not be blank")]
    BlankName,
}
