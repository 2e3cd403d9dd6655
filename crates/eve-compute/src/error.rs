use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComputeError {
    #[error(transparent)]
    Queue(#[from] eve_queue::QueueError),

    #[error(transparent)]
    Warehouse(#[from] eve_warehouse::WarehouseError),

    #[error(transparent)]
    Provider(#[from] eve_provider::ProviderError),

    #[error("malformed job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("prompt template not found: {0}")]
    PromptNotFound(String),

    #[error("prompt template io error: {0}")]
    PromptIo(String),

    #[error("analysis response could not be parsed against its declared schema: {0}")]
    InvalidAnalysisResponse(String),
}

pub type Result<T> = std::result::Result<T, ComputeError>;
