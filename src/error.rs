use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum AgentError {
    #[error("Cloud connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection attempt was cancelled")]
    ConnectCancelled,

    #[error("Session is not connected")]
    NotConnected,

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Sensor not found: {0}")]
    SensorNotFound(String),

    #[error("Sensor data source unavailable: {0}")]
    SensorUnavailable(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Malformed command payload: {0}")]
    MalformedCommand(String),

    #[error("Command payload is missing required field: {0}")]
    MissingCommandField(&'static str),

    #[error("Invalid property update: {0}")]
    InvalidPropertyUpdate(String),

    #[error("Property write already pending for: {0}")]
    PropertyWritePending(String),

    #[error("Property upload failed: {0}")]
    PropertyUploadFailed(String),

    #[error("Cloud send failed: {0}")]
    SendFailed(String),

    #[error("Reply channel closed before reply was sent")]
    ReplyChannelClosed,

    #[error("Twin fetch failed: {0}")]
    TwinFetchFailed(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
