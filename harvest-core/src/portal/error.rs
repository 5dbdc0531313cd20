use thiserror::Error;

pub type PortalResult<T> = Result<T, PortalError>;

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("profile error: {0}")]
    Profile(String),
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("unexpected page content: {0}")]
    UnexpectedShape(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
}
