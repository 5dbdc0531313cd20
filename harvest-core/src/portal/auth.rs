use std::rc::Rc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::Credentials;
use crate::license::License;

use super::error::{PortalError, PortalResult};
use super::profile::ProfileManager;
use super::session::{PortalSession, SessionCookie, SessionFactory, SessionSpec};

const LOGIN_PROFILE: &str = "login";

const USERNAME_INPUT: &str = "#username";
const PASSWORD_INPUT: &str = "#password";
const EMAIL_INPUT: &str = "#email";
const LOGIN_BUTTON: &str = "#login_button";
const FACILITIES_TOGGLE: &str = ".facilities-dropdown a.dropdown-toggle";
const FACILITIES_MENU: &str = ".facilities-dropdown.open .dropdown-menu.pull-right";
const FACILITY_ENTRIES: &str = "div.facilities-dropdown.open ul.dropdown-menu.pull-right li";

/// Result of a successful login: the cookie set every job reuses and the
/// licenses the account can access.
#[derive(Debug, Clone)]
pub struct AuthGrant {
    pub cookies: Vec<SessionCookie>,
    pub licenses: Vec<License>,
}

#[async_trait(?Send)]
pub trait Authenticator {
    async fn login(&self, portal_root: &str, credentials: &Credentials) -> PortalResult<AuthGrant>;
}

/// Logs in through the portal's own form using a throwaway session.
pub struct PortalAuthenticator {
    factory: Rc<dyn SessionFactory>,
    profiles: ProfileManager,
}

impl PortalAuthenticator {
    pub fn new(factory: Rc<dyn SessionFactory>, profiles: ProfileManager) -> Self {
        Self { factory, profiles }
    }

    async fn login_with(
        session: &mut dyn PortalSession,
        portal_root: &str,
        credentials: &Credentials,
    ) -> PortalResult<AuthGrant> {
        session.goto(portal_root).await?;
        session.wait_for(USERNAME_INPUT).await?;
        session.type_text(USERNAME_INPUT, &credentials.username).await?;
        session.type_text(PASSWORD_INPUT, &credentials.password).await?;
        session.type_text(EMAIL_INPUT, &credentials.email).await?;
        session.click(LOGIN_BUTTON).await?;
        session.wait_for_idle().await?;

        let cookies = session.cookies().await?;

        info!("Reading available licenses");
        session.click(FACILITIES_TOGGLE).await.map_err(|err| {
            PortalError::Authentication(format!("facilities menu unavailable after login: {err}"))
        })?;
        session.wait_for(FACILITIES_MENU).await?;
        let entries = session.query_all(FACILITY_ENTRIES).await?;
        let mut licenses = Vec::with_capacity(entries.len());
        for entry in &entries {
            match License::from_menu_entry(entry) {
                Some(license) => licenses.push(license),
                None => warn!(entry = %entry.text, "skipping unparseable facility entry"),
            }
        }
        Ok(AuthGrant { cookies, licenses })
    }
}

#[async_trait(?Send)]
impl Authenticator for PortalAuthenticator {
    async fn login(&self, portal_root: &str, credentials: &Credentials) -> PortalResult<AuthGrant> {
        info!(portal = portal_root, user = %credentials.username, "Logging into portal");
        let profile_dir = self.profiles.prepare(LOGIN_PROFILE).await?;
        let spec = SessionSpec {
            profile_dir,
            download_dir: None,
        };
        let mut session = match self.factory.open(&spec).await {
            Ok(session) => session,
            Err(err) => {
                self.profiles.purge_blocking(LOGIN_PROFILE);
                return Err(err);
            }
        };
        let result = Self::login_with(session.as_mut(), portal_root, credentials).await;
        if let Err(err) = session.close().await {
            warn!(error = %err, "failed to close login session");
        }
        self.profiles.purge(LOGIN_PROFILE).await?;
        let grant = result?;
        info!(licenses = grant.licenses.len(), "Login succeeded");
        Ok(grant)
    }
}
