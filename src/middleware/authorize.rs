//! Role and permission checks against the authenticated identity.

use async_trait::async_trait;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::error::AppError;
use crate::pipeline::{AuthenticatedIdentity, Next, RequestContext, Stage};

/// Authorization stage.
///
/// Passes when the identity holds at least one of `any_role` (if any are
/// listed) and every entry of `all_permissions`. With both lists empty any
/// authenticated identity passes.
#[derive(Debug, Clone, Default)]
pub struct AuthorizationStage {
    any_role: Vec<String>,
    all_permissions: Vec<String>,
}

impl AuthorizationStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn any_role<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.any_role = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn all_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.all_permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    fn permits(&self, identity: &AuthenticatedIdentity) -> bool {
        let role_ok =
            self.any_role.is_empty() || self.any_role.iter().any(|r| identity.has_role(r));
        let permissions_ok = self
            .all_permissions
            .iter()
            .all(|p| identity.has_permission(p));
        role_ok && permissions_ok
    }
}

#[async_trait]
impl Stage for AuthorizationStage {
    fn name(&self) -> &'static str {
        "authorize"
    }

    async fn handle(&self, cx: &mut RequestContext, next: Next<'_>) -> anyhow::Result<Response> {
        let Some(identity) = cx.identity() else {
            return Ok(
                AppError::Unauthorized("Authentication required".to_string()).into_response(),
            );
        };

        if !self.permits(identity) {
            warn!(
                request_id = %cx.request_id(),
                user_id = %identity.user_id,
                path = cx.path(),
                "Insufficient privileges"
            );
            return Ok(AppError::Forbidden("Insufficient privileges".to_string()).into_response());
        }

        next.run(cx).await
    }
}
