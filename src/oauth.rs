//! OAuth login and GitHub App installation callbacks (§4.13).
//!
//! The signed-state scheme generalizes `webhook::verify_signature`'s constant-time
//! HMAC check to a second purpose: proving a redirect URL and (once logged in) a user
//! id round-tripped through the forge's OAuth redirect unmodified.

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Redirect};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use conductor_common::UserId;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::http::AppState;

pub(crate) const SESSION_COOKIE_NAME: &str = "conductor_session";
const STATE_TTL_SECONDS: i64 = 600;
const SESSION_TTL_DAYS: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatePayload {
    redirect: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    nonce: String,
    timestamp: i64,
}

fn hmac_hex(secret: &str, data: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts a key of any length");
    mac.update(data);
    mac.finalize().into_bytes().iter().map(|b| format!("{b:02x}")).collect()
}

fn encode_state(secret: &str, payload: &StatePayload) -> String {
    let json = serde_json::to_vec(payload).expect("StatePayload always serializes");
    let encoded = URL_SAFE_NO_PAD.encode(json);
    let sig = hmac_hex(secret, encoded.as_bytes());
    format!("{encoded}.{sig}")
}

/// Rejects anything but an exact HMAC match and a timestamp that is neither in the
/// future nor more than ten minutes old (§4.13).
fn decode_state(secret: &str, state: &str) -> Option<StatePayload> {
    let (encoded, sig) = state.split_once('.')?;
    let expected = hmac_hex(secret, encoded.as_bytes());
    if expected.len() != sig.len() || expected.as_bytes().ct_eq(sig.as_bytes()).unwrap_u8() != 1 {
        return None;
    }
    let json = URL_SAFE_NO_PAD.decode(encoded).ok()?;
    let payload: StatePayload = serde_json::from_slice(&json).ok()?;
    let now = Utc::now().timestamp();
    if payload.timestamp > now || now - payload.timestamp > STATE_TTL_SECONDS {
        return None;
    }
    Some(payload)
}

fn random_hex(len_bytes: usize) -> String {
    let mut bytes = vec![0u8; len_bytes];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub(crate) fn hash_session_token(token: &str) -> String {
    Sha256::digest(token.as_bytes()).iter().map(|b| format!("{b:02x}")).collect()
}

fn new_session_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn session_cookie(token: String, secure: bool) -> Cookie<'static> {
    let mut cookie = Cookie::new(SESSION_COOKIE_NAME, token);
    cookie.set_http_only(true);
    cookie.set_same_site(SameSite::Lax);
    cookie.set_secure(secure);
    cookie.set_path("/");
    cookie
}

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    #[serde(default)]
    redirect: Option<String>,
}

/// `GET /auth/login` (§4.13, §6). Issues signed state and redirects to GitHub's
/// authorize page; the state carries no `user_id` yet since the caller is anonymous.
pub async fn login(State(state): State<AppState>, Query(query): Query<LoginQuery>) -> impl IntoResponse {
    let payload = StatePayload {
        redirect: query.redirect.unwrap_or_else(|| "/".to_string()),
        user_id: None,
        nonce: random_hex(16),
        timestamp: Utc::now().timestamp(),
    };
    let encoded_state = encode_state(&state.config.session_secret, &payload);
    let client_id = state.config.github_client_id.clone().unwrap_or_default();
    let url = format!("https://github.com/login/oauth/authorize?client_id={client_id}&state={encoded_state}");
    Redirect::to(&url)
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    #[serde(default)]
    installation_id: Option<i64>,
}

/// `GET /auth/callback` (§4.13). A missing/invalid/expired `state`, or a forge error
/// exchanging the code, redirects to `/login?error=...` without touching the store.
/// If the redirect carries `installation_id` (GitHub appends this when the user
/// installs the app as part of the same OAuth round trip), the freshly authenticated
/// user is forwarded straight into the installation-claim logic rather than round
/// tripping through a second request.
pub async fn login_callback(State(state): State<AppState>, Query(query): Query<CallbackQuery>) -> impl IntoResponse {
    let (Some(code), Some(raw_state)) = (query.code, query.state) else {
        return Redirect::to("/login?error=missing_parameters").into_response();
    };
    let Some(payload) = decode_state(&state.config.session_secret, &raw_state) else {
        return Redirect::to("/login?error=invalid_state").into_response();
    };

    let token = match state.forge.exchange_code(&code).await {
        Ok(t) => t,
        Err(_) => return Redirect::to("/login?error=exchange_failed").into_response(),
    };
    let forge_user = match state.forge.fetch_user(&token.access_token).await {
        Ok(u) => u,
        Err(_) => return Redirect::to("/login?error=user_fetch_failed").into_response(),
    };

    let access_token = token.access_token.clone();
    let user = match state
        .store
        .call(move |db| db.upsert_user_by_forge_id(forge_user.id, &forge_user.login, &access_token))
        .await
    {
        Ok(u) => u,
        Err(_) => return Redirect::to("/login?error=internal").into_response(),
    };

    let session_token = new_session_token();
    let token_hash = hash_session_token(&session_token);
    let user_id = user.id.clone();
    if state
        .store
        .call(move |db| db.create_session(&user_id, &token_hash, Duration::days(SESSION_TTL_DAYS)))
        .await
        .is_err()
    {
        return Redirect::to("/login?error=internal").into_response();
    }

    let jar = CookieJar::new().add(session_cookie(session_token, state.config.environment.is_production()));

    let redirect = if let Some(installation_id) = query.installation_id {
        resolve_installation_redirect(&state, &user.id, installation_id, &payload.redirect).await
    } else {
        Redirect::to(&payload.redirect)
    };

    (jar, redirect).into_response()
}

#[derive(Debug, Deserialize)]
pub struct InstallationCallbackQuery {
    installation_id: Option<i64>,
    state: Option<String>,
}

/// `GET /auth/installation/callback` (§4.13). Used when a logged-in user installs the
/// app from a link we generated ourselves (so `state` always carries `user_id` — a
/// missing one is rejected before any database access).
pub async fn installation_callback(
    State(state): State<AppState>,
    Query(query): Query<InstallationCallbackQuery>,
) -> impl IntoResponse {
    let Some(raw_state) = query.state else {
        return Redirect::to("/settings?error=invalid_state").into_response();
    };
    let Some(payload) = decode_state(&state.config.session_secret, &raw_state) else {
        return Redirect::to("/settings?error=invalid_state").into_response();
    };
    let Some(user_id) = payload.user_id else {
        return Redirect::to("/settings?error=invalid_state").into_response();
    };
    let Some(installation_id) = query.installation_id else {
        return Redirect::to("/settings?error=missing_installation").into_response();
    };

    resolve_installation_redirect(&state, &UserId::from(user_id.as_str()), installation_id, "/settings")
        .await
        .into_response()
}

/// Claims a forge installation for `user_id`, rejecting a cross-user hijack attempt
/// with a 307 to `/settings?error=installation_owned` and no write to the store — the
/// installation already belongs to someone else (§4.13 scenario S6).
async fn resolve_installation_redirect(
    state: &AppState,
    user_id: &UserId,
    forge_installation_id: i64,
    success_redirect: &str,
) -> Redirect {
    let existing = state
        .store
        .call(move |db| db.find_project_for_installation(forge_installation_id))
        .await;

    match existing {
        Ok(Some(project)) if project.user_id != *user_id => Redirect::temporary("/settings?error=installation_owned"),
        Ok(_) => {
            let user_id = user_id.clone();
            let _ = state
                .store
                .call(move |db| db.create_pending_installation(&user_id, forge_installation_id))
                .await;
            Redirect::to(success_redirect)
        }
        Err(_) => Redirect::to("/settings?error=internal"),
    }
}

/// `POST /auth/logout`. Deletes the session row if the cookie names one, then clears
/// the cookie regardless — logout always succeeds from the client's point of view.
pub async fn logout(State(state): State<AppState>, jar: CookieJar) -> impl IntoResponse {
    if let Some(cookie) = jar.get(SESSION_COOKIE_NAME) {
        let token_hash = hash_session_token(cookie.value());
        let _ = state
            .store
            .call(move |db| {
                if let Some(session) = db.find_session_by_token_hash(&token_hash)? {
                    db.delete_session(&session.id)?;
                }
                Ok(())
            })
            .await;
    }
    let jar = jar.remove(Cookie::from(SESSION_COOKIE_NAME));
    (jar, Redirect::to("/")).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_encode_and_decode() {
        let payload = StatePayload {
            redirect: "/dashboard".into(),
            user_id: Some("user_1".into()),
            nonce: random_hex(8),
            timestamp: Utc::now().timestamp(),
        };
        let encoded = encode_state("secret", &payload);
        let decoded = decode_state("secret", &encoded).unwrap();
        assert_eq!(decoded.redirect, "/dashboard");
        assert_eq!(decoded.user_id.as_deref(), Some("user_1"));
    }

    #[test]
    fn tampered_state_is_rejected() {
        let payload = StatePayload { redirect: "/".into(), user_id: None, nonce: random_hex(8), timestamp: Utc::now().timestamp() };
        let mut encoded = encode_state("secret", &payload);
        encoded.push('x');
        assert!(decode_state("secret", &encoded).is_none());
    }

    #[test]
    fn expired_state_is_rejected() {
        let payload = StatePayload {
            redirect: "/".into(),
            user_id: None,
            nonce: random_hex(8),
            timestamp: Utc::now().timestamp() - STATE_TTL_SECONDS - 1,
        };
        let encoded = encode_state("secret", &payload);
        assert!(decode_state("secret", &encoded).is_none());
    }

    #[test]
    fn state_signed_with_a_different_secret_is_rejected() {
        let payload = StatePayload { redirect: "/".into(), user_id: None, nonce: random_hex(8), timestamp: Utc::now().timestamp() };
        let encoded = encode_state("secret_a", &payload);
        assert!(decode_state("secret_b", &encoded).is_none());
    }
}
