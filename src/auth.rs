use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Sink, SinkExt};
use pgwire::api::auth::{self, DefaultServerParameterProvider, LoginInfo, StartupHandler};
use pgwire::api::{ClientInfo, PgWireConnectionState};
use pgwire::error::{PgWireError, PgWireResult};
use pgwire::messages::startup::Authentication;
use pgwire::messages::{PgWireBackendMessage, PgWireFrontendMessage};
use ulid::Ulid;

use crate::model::Principal;
use crate::observability::AUTH_FAILURES_TOTAL;
use crate::tenant::TenantManager;

const GROWER_USER_PREFIX: &str = "grower_";

/// Role of a login name: `admin`, or `grower_<ULID>` for that grower.
pub fn principal_for(user: &str) -> Option<Principal> {
    if user == "admin" {
        return Some(Principal::Admin);
    }
    let id = user.strip_prefix(GROWER_USER_PREFIX)?;
    Ulid::from_string(id).ok().map(Principal::Grower)
}

/// Cleartext password login, checked against the credentials stored in the
/// tenant named by the connection's `database`.
///
/// A grower logs in only with its own password in its own packhouse. The
/// configured admin password opens a packhouse until that packhouse sets an
/// admin credential of its own.
pub struct PackslotStartupHandler {
    tenant_manager: Arc<TenantManager>,
    bootstrap_admin_password: String,
    parameters: DefaultServerParameterProvider,
}

impl PackslotStartupHandler {
    pub fn new(tenant_manager: Arc<TenantManager>, bootstrap_admin_password: String) -> Self {
        Self {
            tenant_manager,
            bootstrap_admin_password,
            parameters: DefaultServerParameterProvider::default(),
        }
    }

    /// Does `password` log `user` into `tenant`?
    pub async fn verify(&self, user: &str, tenant: &str, password: &str) -> bool {
        let Some(principal) = principal_for(user) else {
            refused("unknown_user", user, tenant);
            return false;
        };
        let engine = match self.tenant_manager.get_or_create(tenant).await {
            Ok(engine) => engine,
            Err(e) => {
                tracing::warn!("login to tenant {tenant:?} failed: {e}");
                refused("tenant", user, tenant);
                return false;
            }
        };
        let ok = match engine.login_matches(principal, password) {
            Some(ok) => ok,
            None => principal.is_admin() && password == self.bootstrap_admin_password,
        };
        if !ok {
            refused("bad_password", user, tenant);
        }
        ok
    }
}

fn refused(reason: &'static str, user: &str, tenant: &str) {
    metrics::counter!(AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
    tracing::warn!("login refused for {user:?} on {tenant:?}: {reason}");
}

#[async_trait]
impl StartupHandler for PackslotStartupHandler {
    async fn on_startup<C>(
        &self,
        client: &mut C,
        message: PgWireFrontendMessage,
    ) -> PgWireResult<()>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<<C as Sink<PgWireBackendMessage>>::Error>,
    {
        match message {
            PgWireFrontendMessage::Startup(ref startup) => {
                auth::protocol_negotiation(client, startup).await?;
                auth::save_startup_parameters_to_metadata(client, startup);
                client.set_state(PgWireConnectionState::AuthenticationInProgress);
                client
                    .send(PgWireBackendMessage::Authentication(
                        Authentication::CleartextPassword,
                    ))
                    .await?;
            }
            PgWireFrontendMessage::PasswordMessageFamily(pwd) => {
                let pwd = pwd.into_password()?;
                let (user, tenant) = {
                    let login = LoginInfo::from_client_info(client);
                    (
                        login.user().unwrap_or_default().to_string(),
                        login.database().unwrap_or("default").to_string(),
                    )
                };
                if !self.verify(&user, &tenant, &pwd.password).await {
                    return Err(PgWireError::InvalidPassword(user));
                }
                auth::finish_authentication(client, &self.parameters).await?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_offset;

    #[test]
    fn admin_and_grower_logins() {
        assert_eq!(principal_for("admin"), Some(Principal::Admin));
        let id = Ulid::from_string("01ARZ3NDEKTSV4RRFFQ69G5FAV").unwrap();
        assert_eq!(
            principal_for("grower_01ARZ3NDEKTSV4RRFFQ69G5FAV"),
            Some(Principal::Grower(id))
        );
    }

    #[test]
    fn other_logins_have_no_role() {
        assert_eq!(principal_for("postgres"), None);
        assert_eq!(principal_for("grower_"), None);
        assert_eq!(principal_for("grower_not-a-ulid"), None);
        assert_eq!(principal_for("Admin"), None);
    }

    fn handler(name: &str) -> (Arc<TenantManager>, PackslotStartupHandler) {
        let dir = std::env::temp_dir().join("packslot_test_auth").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let tm = Arc::new(TenantManager::new(dir, 1000, default_offset()));
        (tm.clone(), PackslotStartupHandler::new(tm, "bootstrap".into()))
    }

    #[tokio::test]
    async fn grower_password_is_its_own_and_scoped_to_its_packhouse() {
        let (tm, auth) = handler("grower_scope");
        let north = tm.get_or_create("north").await.unwrap();
        let (hill, river) = (Ulid::new(), Ulid::new());
        north.register_grower(hill, "Hill".into(), Some("hill-pw".into())).await.unwrap();
        north.register_grower(river, "River".into(), Some("river-pw".into())).await.unwrap();
        let hill_login = format!("grower_{hill}");

        assert!(auth.verify(&hill_login, "north", "hill-pw").await);
        assert!(!auth.verify(&hill_login, "north", "river-pw").await);
        assert!(!auth.verify(&format!("grower_{}", Ulid::new()), "north", "hill-pw").await);
        // Same login, another packhouse: unknown there.
        assert!(!auth.verify(&hill_login, "south", "hill-pw").await);
        assert!(!auth.verify("postgres", "north", "bootstrap").await);
    }

    #[tokio::test]
    async fn tenant_admin_password_replaces_bootstrap() {
        let (tm, auth) = handler("admin_scope");
        assert!(auth.verify("admin", "north", "bootstrap").await);
        assert!(auth.verify("admin", "south", "bootstrap").await);

        let north = tm.get_or_create("north").await.unwrap();
        north.set_credential(Principal::Admin, "north-gate".into()).await.unwrap();
        assert!(auth.verify("admin", "north", "north-gate").await);
        assert!(!auth.verify("admin", "north", "bootstrap").await);
        assert!(!auth.verify("admin", "south", "north-gate").await);
        assert!(auth.verify("admin", "south", "bootstrap").await);
    }
}
