pub mod capture;
pub mod control;
pub mod notify;
pub mod processor;
pub mod registry;
pub mod render;
pub mod snapshot;
pub mod state;
pub mod stream;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {0}: {1}")]
    Bind(String, std::io::Error),
    #[error("server I/O error: {0}")]
    Io(std::io::Error),
}
