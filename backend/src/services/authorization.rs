//! Role checks for workflow actions

use std::collections::HashMap;
use std::future::Future;

use issue_shared::{Role, User};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Resolves users and checks that they hold a role
pub trait Authorizer: Send + Sync {
    /// Load the user when they hold `role`.
    ///
    /// # Errors
    ///
    /// `AppError::NotAuthorized` when the user is unknown or lacks the role.
    fn require_role(
        &self,
        user_id: Uuid,
        role: Role,
    ) -> impl Future<Output = AppResult<User>> + Send;
}

fn check(user: Option<User>, user_id: Uuid, role: Role) -> AppResult<User> {
    match user {
        Some(user) if user.has_role(role) => Ok(user),
        _ => {
            warn!(%user_id, role = role.as_str(), "Role check failed");
            Err(AppError::NotAuthorized { user_id, role })
        }
    }
}

/// Fixed user directory, for embedding and tests
#[derive(Debug, Clone, Default)]
pub struct StaticAuthorizer {
    users: HashMap<Uuid, User>,
}

impl StaticAuthorizer {
    pub fn new(users: impl IntoIterator<Item = User>) -> Self {
        Self {
            users: users.into_iter().map(|u| (u.id, u)).collect(),
        }
    }

    pub fn with_user(mut self, user: User) -> Self {
        self.users.insert(user.id, user);
        self
    }
}

impl Authorizer for StaticAuthorizer {
    async fn require_role(&self, user_id: Uuid, role: Role) -> AppResult<User> {
        check(self.users.get(&user_id).cloned(), user_id, role)
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    name: String,
    department: Option<String>,
    roles: Vec<String>,
}

impl From<UserRow> for User {
    /// Role names this build does not know are ignored
    fn from(row: UserRow) -> Self {
        let roles = row
            .roles
            .iter()
            .filter_map(|name| {
                let role = Role::from_str(name);
                if role.is_none() {
                    warn!(user_id = %row.id, role = %name, "Ignoring unknown role grant");
                }
                role
            })
            .collect();

        User {
            id: row.id,
            name: row.name,
            department: row.department,
            roles,
        }
    }
}

/// Reads users and role grants from `app_users` and `user_roles`
#[derive(Clone)]
pub struct PgAuthorizer {
    db: PgPool,
}

impl PgAuthorizer {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

impl Authorizer for PgAuthorizer {
    async fn require_role(&self, user_id: Uuid, role: Role) -> AppResult<User> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT u.id, u.name, u.department,
                   COALESCE(ARRAY_AGG(ur.role) FILTER (WHERE ur.role IS NOT NULL), '{}') AS roles
            FROM app_users u
            LEFT JOIN user_roles ur ON ur.user_id = u.id
            WHERE u.id = $1 AND u.is_active = TRUE
            GROUP BY u.id, u.name, u.department
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;

        check(row.map(User::from), user_id, role)
    }
}
