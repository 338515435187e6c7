//! Who is making a request. Authentication happens upstream; this only
//! reads what the fronting proxy stamped on the request.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::HeaderMap;

use crate::app::AppState;

pub const USER_HEADER: &str = "x-user-id";
/// Actor recorded when no identity header is present.
pub const ANONYMOUS: &str = "api";

pub trait IdentityProvider: Send + Sync {
    fn actor(&self, headers: &HeaderMap) -> String;
}

/// Trusts `X-User-Id` as set by the proxy.
#[derive(Debug, Default, Clone)]
pub struct HeaderIdentity;

impl IdentityProvider for HeaderIdentity {
    fn actor(&self, headers: &HeaderMap) -> String {
        headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(ANONYMOUS)
            .to_string()
    }
}

/// Caller identity and address, for audit entries and `triggered_by`.
#[derive(Debug, Clone)]
pub struct Actor {
    pub name: String,
    pub ip: Option<String>,
}

/// First hop of `X-Forwarded-For`, then `X-Real-IP`, then the peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').next().unwrap_or("").trim().to_string())
            .filter(|v| !v.is_empty())
    };
    header("x-forwarded-for")
        .or_else(|| header("x-real-ip"))
        .or_else(|| peer.map(|p| p.ip().to_string()))
}

impl FromRequestParts<Arc<AppState>> for Actor {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(Actor {
            name: state.identity.actor(&parts.headers),
            ip: client_ip(&parts.headers, peer),
        })
    }
}
