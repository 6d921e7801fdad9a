//! Role-based access control over path patterns.
//!
//! Reads the `X-User-Role` header injected by an earlier auth stage.
//! Missing role → 401; a role whose patterns do not cover the path → 403.

use std::collections::HashMap;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use tower::{Layer, Service};
use tracing::warn;

use crate::auth::path_pattern_matches;
use crate::error::error_response;

use super::request_id::request_id_of;

/// Role → allowed path patterns.
pub type RolePermissions = HashMap<String, Vec<String>>;

/// Stock permission table used when none is configured.
pub fn default_role_permissions() -> RolePermissions {
    HashMap::from([
        (
            "admin".to_string(),
            vec![
                "/admin/*".to_string(),
                "/api/*".to_string(),
                "/metrics".to_string(),
                "/health".to_string(),
            ],
        ),
        (
            "operator".to_string(),
            vec![
                "/admin/policies".to_string(),
                "/api/*".to_string(),
                "/health".to_string(),
            ],
        ),
        (
            "viewer".to_string(),
            vec![
                "/metrics".to_string(),
                "/health".to_string(),
                "/status".to_string(),
            ],
        ),
        (
            "user".to_string(),
            vec!["/api/*".to_string(), "/health".to_string()],
        ),
    ])
}

#[derive(Clone)]
pub struct RbacLayer {
    permissions: Arc<RolePermissions>,
}

impl RbacLayer {
    pub fn new(permissions: RolePermissions) -> Self {
        Self {
            permissions: Arc::new(permissions),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(default_role_permissions())
    }

    /// Whether `role` may access `path`.
    pub fn allows(&self, role: &str, path: &str) -> bool {
        self.permissions
            .get(role)
            .is_some_and(|patterns| patterns.iter().any(|p| path_pattern_matches(p, path)))
    }
}

impl<S> Layer<S> for RbacLayer {
    type Service = RbacService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RbacService {
            inner,
            permissions: self.permissions.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RbacService<S> {
    inner: S,
    permissions: Arc<RolePermissions>,
}

impl<S> Service<Request<Body>> for RbacService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let permissions = self.permissions.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let request_id = request_id_of(req.headers());

            let Some(role) = req
                .headers()
                .get("x-user-role")
                .and_then(|v| v.to_str().ok())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
            else {
                return Ok(error_response(
                    StatusCode::UNAUTHORIZED,
                    "unauthorized",
                    "no role specified",
                    request_id,
                ));
            };

            let path = req.uri().path();
            let allowed = permissions
                .get(&role)
                .is_some_and(|patterns| patterns.iter().any(|p| path_pattern_matches(p, path)));

            if !allowed {
                warn!(role = %role, path = %path, "RBAC denied");
                return Ok(error_response(
                    StatusCode::FORBIDDEN,
                    "forbidden",
                    "insufficient permissions",
                    request_id,
                ));
            }

            inner.call(req).await
        })
    }
}
