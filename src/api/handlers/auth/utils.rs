//! Small helpers for credential parsing, token generation and client identification.

use axum::http::{
    header::{AUTHORIZATION, COOKIE},
    HeaderMap,
};
use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, RngCore};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::net::{IpAddr, SocketAddr};

use super::error::AuthError;

pub(crate) const UNKNOWN_CLIENT: &str = "unknown";

/// Normalize an email for lookup/uniqueness checks.
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
pub(crate) fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

/// 32 bytes from the OS RNG, base64url without padding.
///
/// Used for session tokens and the OAuth `state` value.
pub(crate) fn generate_token() -> Result<String, AuthError> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| AuthError::Internal(format!("failed to generate token: {err}")))?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

/// Hash a session token so raw values never touch the database.
pub(crate) fn hash_session_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

/// Value of the cookie `name`, if present and non-empty.
pub(crate) fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|header| header.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| {
            let mut parts = pair.trim().splitn(2, '=');
            let key = parts.next()?.trim();
            let val = parts.next()?.trim();
            (key == name && !val.is_empty()).then(|| val.to_string())
        })
        .next()
}

pub(crate) fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Identify the client for throttling.
///
/// The socket peer is the identity. Forwarding headers are only read when
/// that peer is one of `trusted_proxies`; the client is then the right-most
/// `X-Forwarded-For` hop that is not itself a trusted proxy, falling back to
/// `X-Real-IP` and finally the proxy address.
pub(crate) fn client_identifier(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trusted_proxies: &[IpAddr],
) -> String {
    let Some(peer) = peer.map(|addr| addr.ip()) else {
        return UNKNOWN_CLIENT.to_string();
    };
    if !trusted_proxies.contains(&peer) {
        return peer.to_string();
    }

    let forwarded = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|hop| hop.trim().parse::<IpAddr>().ok())
        .collect::<Vec<_>>();
    if let Some(ip) = forwarded
        .into_iter()
        .rev()
        .find(|hop| !trusted_proxies.contains(hop))
    {
        return ip.to_string();
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<IpAddr>().ok())
        .unwrap_or(peer)
        .to_string()
}
