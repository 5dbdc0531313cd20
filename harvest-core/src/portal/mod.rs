mod auth;
mod chromium;
mod error;
mod profile;
mod session;

pub use auth::{AuthGrant, Authenticator, PortalAuthenticator};
pub use chromium::{ChromiumLauncher, ChromiumSession};
pub use error::{PortalError, PortalResult};
pub use profile::ProfileManager;
pub use session::{
    cookie_header, PortalSession, RowSnapshot, SessionCookie, SessionFactory, SessionSpec,
};
