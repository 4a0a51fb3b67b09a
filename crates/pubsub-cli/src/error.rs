#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("client error: {0}")]
    Client(#[from] pubsub_client::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CliResult<T> = Result<T, CliError>;
