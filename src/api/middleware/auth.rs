//! Shared-secret authentication with loopback fallback.
//!
//! With a secret configured, the request must carry it in the route's key
//! header. Without one (and unless keys are required), only same-host
//! callers are admitted, and any proxy-forwarding header disqualifies the
//! request. Every failure looks the same to the client.

use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, Caller};

pub const API_KEY_HEADER: &str = "X-Api-Key";
pub const ADMIN_KEY_HEADER: &str = "X-Admin-Key";

/// Headers whose presence means the peer address cannot be trusted.
const PROXY_HEADERS: &[&str] = &[
    "forwarded",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-real-ip",
];

pub fn has_proxy_headers(headers: &HeaderMap) -> bool {
    PROXY_HEADERS.iter().any(|h| headers.contains_key(*h))
}

/// Loopback peer with no proxy headers.
pub fn is_direct_loopback(peer: Option<SocketAddr>, headers: &HeaderMap) -> bool {
    peer.is_some_and(|addr| addr.ip().is_loopback()) && !has_proxy_headers(headers)
}

/// Constant-time comparison over digests, so length is not leaked either.
pub fn keys_match(presented: &str, expected: &str) -> bool {
    let a: [u8; 32] = Sha256::digest(presented.as_bytes()).into();
    let b: [u8; 32] = Sha256::digest(expected.as_bytes()).into();
    a.ct_eq(&b).into()
}

pub fn peer_addr<B>(req: &Request<B>) -> Option<SocketAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

/// Resolve the caller for one guarded route family.
pub fn resolve_caller(
    secret: Option<&str>,
    require_key: bool,
    header: &str,
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
) -> Result<Caller, ApiError> {
    match secret {
        Some(expected) => {
            let presented = headers
                .get(header)
                .and_then(|v| v.to_str().ok())
                .ok_or(ApiError::Unauthorized)?;
            if keys_match(presented, expected) {
                Ok(Caller::from_key(presented))
            } else {
                Err(ApiError::Unauthorized)
            }
        }
        None if !require_key && is_direct_loopback(peer, headers) => Ok(Caller::Loopback),
        None => Err(ApiError::Unauthorized),
    }
}

/// Guard for data routes (`X-Api-Key`).
pub async fn require_api_key(req: Request<axum::body::Body>, next: Next) -> Response {
    guard(req, next, GuardKind::Data).await
}

/// Guard for admin routes (`X-Admin-Key`).
pub async fn require_admin_key(req: Request<axum::body::Body>, next: Next) -> Response {
    guard(req, next, GuardKind::Admin).await
}

#[derive(Clone, Copy)]
enum GuardKind {
    Data,
    Admin,
}

async fn guard(mut req: Request<axum::body::Body>, next: Next, kind: GuardKind) -> Response {
    let ctx = match req.extensions().get::<ApiContext>().cloned() {
        Some(ctx) => ctx,
        None => return ApiError::Internal("missing API context".into()).into_response(),
    };
    let security = &ctx.core.config().security;
    let (secret, header) = match kind {
        GuardKind::Data => (security.api_key.as_deref(), API_KEY_HEADER),
        GuardKind::Admin => (security.admin_api_key.as_deref(), ADMIN_KEY_HEADER),
    };

    let caller = match resolve_caller(
        secret,
        security.require_api_key,
        header,
        req.headers(),
        peer_addr(&req),
    ) {
        Ok(caller) => caller,
        Err(err) => {
            tracing::warn!(path = %req.uri().path(), "Rejected unauthenticated request");
            return err.into_response();
        }
    };

    req.extensions_mut().insert(caller.clone());
    let mut response = next.run(req).await;
    // Outer layers (admin audit) read the caller from the response.
    response.extensions_mut().insert(caller);
    response
}
