//! Dashboard and CLI users

use super::password::{hash_password, verify_password};
use serde::Deserialize;
use tracing::{info, warn};
use wgmesh_common::{db::tables, AuthSource, Database, Error, Result, User};

const MIN_PASSWORD_LEN: usize = 5;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateUser {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub networks: Vec<String>,
}

#[derive(Clone)]
pub struct UserStore {
    db: Database,
}

impl UserStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn has_superadmin(&self) -> Result<bool> {
        Ok(self.list()?.iter().any(|u| u.is_superadmin))
    }

    /// Bootstrap the single superadmin. Refused once one exists.
    pub fn create_superadmin(&self, username: &str, password: &str) -> Result<User> {
        let user = self.build(username, password)?;
        let user = User {
            is_admin: true,
            is_superadmin: true,
            ..user
        };

        self.db.batch(|tx| {
            let users: Vec<User> = tx.list(tables::USERS)?;
            if users.iter().any(|u| u.is_superadmin) {
                return Err(Error::conflict("a superadmin already exists"));
            }
            tx.create(tables::USERS, &user.username, &user)
        })?;

        info!("Created superadmin {}", user.username);
        Ok(user.redacted())
    }

    pub fn create(&self, req: CreateUser) -> Result<User> {
        let user = User {
            is_admin: req.is_admin,
            networks: req.networks,
            ..self.build(&req.username, &req.password)?
        };
        self.db.create(tables::USERS, &user.username, &user)?;

        info!("Created user {} (admin: {})", user.username, user.is_admin);
        Ok(user.redacted())
    }

    pub fn get(&self, username: &str) -> Result<User> {
        self.db
            .get(tables::USERS, username)?
            .ok_or_else(|| Error::not_found("user", username))
    }

    pub fn list(&self) -> Result<Vec<User>> {
        Ok(self
            .db
            .list::<User>(tables::USERS)?
            .into_iter()
            .map(|u| u.redacted())
            .collect())
    }

    /// Grant a non-admin user access to networks
    pub fn set_networks(&self, username: &str, networks: Vec<String>) -> Result<User> {
        let user = self.db.update(tables::USERS, username, |user: &mut User| {
            user.networks = networks;
            Ok(())
        })?;
        Ok(user.redacted())
    }

    pub fn delete(&self, username: &str) -> Result<()> {
        let user = self.get(username)?;
        if user.is_superadmin {
            return Err(Error::PermissionDenied("the superadmin cannot be deleted".into()));
        }
        self.db.delete(tables::USERS, username)?;
        info!("Deleted user {}", username);
        Ok(())
    }

    /// Check basic credentials
    pub fn authenticate(&self, username: &str, password: &str) -> Result<User> {
        let denied = || Error::Unauthorized("invalid username or password".into());
        if username.is_empty() || password.is_empty() {
            return Err(denied());
        }
        let Some(user) = self.db.get::<User>(tables::USERS, username)? else {
            return Err(denied());
        };
        if user.auth_source != AuthSource::Basic || user.password.is_empty() {
            return Err(denied());
        }
        if !verify_password(password, &user.password)? {
            warn!("Failed login for {}", username);
            return Err(denied());
        }
        Ok(user)
    }

    /// Local user for an OAuth principal, created on first login
    pub fn resolve_oauth(&self, username: &str) -> Result<User> {
        if username.is_empty() {
            return Err(Error::validation("identity provider returned no user name"));
        }
        if let Some(user) = self.db.get::<User>(tables::USERS, username)? {
            return Ok(user);
        }

        let user = User {
            username: username.to_string(),
            password: String::new(),
            is_admin: false,
            is_superadmin: false,
            networks: Vec::new(),
            auth_source: AuthSource::Oauth,
            created_at: chrono::Utc::now().timestamp(),
        };
        match self.db.create(tables::USERS, username, &user) {
            Ok(()) => {
                info!("Created user {} from OAuth login", username);
                Ok(user)
            }
            // lost a race with a concurrent callback for the same user
            Err(Error::AlreadyExists { .. }) => self.get(username),
            Err(e) => Err(e),
        }
    }

    fn build(&self, username: &str, password: &str) -> Result<User> {
        if username.is_empty() || username.len() > 64 || username.chars().any(char::is_whitespace) {
            return Err(Error::validation(format!("invalid username {:?}", username)));
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(Error::validation(format!(
                "password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }
        Ok(User {
            username: username.to_string(),
            password: hash_password(password)?,
            is_admin: false,
            is_superadmin: false,
            networks: Vec::new(),
            auth_source: AuthSource::Basic,
            created_at: chrono::Utc::now().timestamp(),
        })
    }
}
