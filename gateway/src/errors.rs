use engine::EngineError;
use http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("invalid config: {0}")]
    Config(#[from] engine::config::ConfigError),

    #[error("invalid listener config: {0}")]
    Listener(#[from] crate::config::ValidationError),

    #[error("could not build response: {0}")]
    Http(#[from] http::Error),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("{0} not found")]
    NotFound(String),

    #[error("method not allowed")]
    MethodNotAllowed,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Engine(error) => engine_status(error),
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::Io(_)
            | GatewayError::Http(_)
            | GatewayError::Config(_)
            | GatewayError::Listener(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

fn engine_status(error: &EngineError) -> StatusCode {
    match error {
        EngineError::UnknownScope(_) => StatusCode::NOT_FOUND,
        EngineError::NoItems | EngineError::TooManyItems { .. } => StatusCode::BAD_REQUEST,
        EngineError::NoClientsAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::ExhaustedAllClients { .. } | EngineError::ClientFailed { .. } => StatusCode::BAD_GATEWAY,
        EngineError::RaceTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
