//! Cache-backed sessions and CSRF tokens.
//!
//! A session is a JSON object persisted through the shared cache under
//! `<key_prefix><id>`. Nothing is written and no cookie is issued until the
//! session is first mutated; a mutated session without an id gets a fresh
//! UUID v7.

use std::sync::Arc;

use http::header::{HeaderMap, COOKIE};
use keel_cache::{CacheBackend, PrefixedCache, SharedCache};
use keel_config::SessionSettings;
use keel_core::{KeelError, KeelResult};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use subtle::ConstantTimeEq;
use tracing::debug;
use uuid::Uuid;

const CSRF_KEY: &str = "csrf";

#[derive(Debug, Default)]
struct State {
    id: Option<String>,
    previous_id: Option<String>,
    data: Map<String, Value>,
    dirty: bool,
}

/// A request's session.
///
/// Cloning yields another handle to the same data, so the session frame and
/// the handler observe each other's writes.
#[derive(Debug, Clone, Default)]
pub struct Session {
    state: Arc<Mutex<State>>,
}

impl Session {
    /// An empty session with no id.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn existing(id: String, data: Map<String, Value>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                id: Some(id),
                data,
                ..State::default()
            })),
        }
    }

    /// The session id, once one has been issued.
    #[must_use]
    pub fn id(&self) -> Option<String> {
        self.state.lock().id.clone()
    }

    /// Reads and deserializes a value.
    ///
    /// Returns `None` if the key is missing or holds a different type.
    #[must_use]
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let state = self.state.lock();
        state
            .data
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Stores a value.
    pub fn insert<T: Serialize>(&self, key: impl Into<String>, value: T) -> KeelResult<()> {
        let value = serde_json::to_value(value)
            .map_err(|e| KeelError::internal_with_source("session value is not serializable", e))?;
        let mut state = self.state.lock();
        state.data.insert(key.into(), value);
        state.dirty = true;
        Ok(())
    }

    /// Removes a value, returning whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        let removed = state.data.remove(key).is_some();
        state.dirty |= removed;
        removed
    }

    /// Removes every value.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        if !state.data.is_empty() {
            state.data.clear();
            state.dirty = true;
        }
    }

    /// Whether the session changed since it was loaded.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Drops the current id so the next save issues a new one.
    ///
    /// The data is kept; the old entry is deleted on save.
    pub fn regenerate(&self) {
        let mut state = self.state.lock();
        if let Some(old) = state.id.take() {
            state.previous_id = Some(old);
        }
        state.dirty = true;
    }

    /// The CSRF token for `namespace`, issuing one if none exists yet.
    pub fn csrf_token(&self, namespace: &str) -> String {
        let mut state = self.state.lock();
        let tokens = state
            .data
            .entry(CSRF_KEY)
            .or_insert_with(|| Value::Object(Map::new()));
        if !tokens.is_object() {
            *tokens = Value::Object(Map::new());
        }

        if let Some(Value::String(token)) = tokens.get(namespace) {
            return token.clone();
        }

        let token = Uuid::new_v4().simple().to_string();
        if let Value::Object(map) = tokens {
            map.insert(namespace.to_string(), Value::String(token.clone()));
        }
        state.dirty = true;
        token
    }

    /// Checks `token` against the token stored for `namespace`.
    pub fn verify_csrf(&self, namespace: &str, token: &str) -> KeelResult<()> {
        let state = self.state.lock();
        let expected = state
            .data
            .get(CSRF_KEY)
            .and_then(|tokens| tokens.get(namespace))
            .and_then(Value::as_str);

        match expected {
            Some(expected) if bool::from(expected.as_bytes().ct_eq(token.as_bytes())) => Ok(()),
            _ => Err(KeelError::csrf("CSRF Validation Error")),
        }
    }
}

/// Loads and persists sessions.
#[derive(Debug, Clone)]
pub struct SessionStore {
    cache: Arc<PrefixedCache>,
    settings: SessionSettings,
}

impl SessionStore {
    /// A store writing into `cache` under the configured key prefix.
    pub fn new(cache: SharedCache, settings: SessionSettings) -> Self {
        Self {
            cache: Arc::new(PrefixedCache::new(cache, settings.key_prefix.clone())),
            settings,
        }
    }

    /// The session settings.
    #[must_use]
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Loads a session by id.
    ///
    /// Unknown, expired, or corrupt entries read as `None`.
    pub async fn load(&self, id: &str) -> KeelResult<Option<Session>> {
        let Some(raw) = self.cache.get(id).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<Map<String, Value>>(&raw) {
            Ok(data) => Ok(Some(Session::existing(id.to_string(), data))),
            Err(e) => {
                debug!(error = %e, "discarding unreadable session");
                Ok(None)
            }
        }
    }

    /// Loads the session named by the request's cookie, or a fresh one.
    pub async fn load_from_headers(&self, headers: &HeaderMap) -> KeelResult<Session> {
        match cookie_value(headers, &self.settings.cookie_name) {
            Some(id) => Ok(self.load(&id).await?.unwrap_or_default()),
            None => Ok(Session::new()),
        }
    }

    /// Persists a mutated session.
    ///
    /// Returns the id to send back in a cookie, or `None` if the session was
    /// not mutated and nothing was written.
    pub async fn save(&self, session: &Session) -> KeelResult<Option<String>> {
        let (id, previous, payload) = {
            let mut state = session.state.lock();
            if !state.dirty {
                return Ok(None);
            }
            let id = state
                .id
                .get_or_insert_with(|| Uuid::now_v7().to_string())
                .clone();
            let payload = serde_json::to_string(&state.data)
                .map_err(|e| KeelError::internal_with_source("cannot encode session", e))?;
            (id, state.previous_id.take(), payload)
        };

        if let Some(previous) = previous {
            self.cache.delete(&previous).await?;
        }
        self.cache
            .set(&id, &payload, Some(self.settings.ttl()))
            .await?;
        session.state.lock().dirty = false;
        Ok(Some(id))
    }

    /// Deletes a session's stored data.
    pub async fn destroy(&self, session: &Session) -> KeelResult<()> {
        let id = session.state.lock().id.take();
        if let Some(id) = id {
            self.cache.delete(&id).await?;
        }
        Ok(())
    }

    /// The `Set-Cookie` value carrying `id`.
    #[must_use]
    pub fn set_cookie_header(&self, id: &str) -> String {
        let mut cookie = format!(
            "{}={}; Path={}; Max-Age={}; HttpOnly; SameSite=Lax",
            self.settings.cookie_name, id, self.settings.cookie_path, self.settings.ttl_secs
        );
        if self.settings.secure_cookie {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

/// Reads one cookie from the `Cookie` headers.
#[must_use]
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use keel_cache::MemoryCache;

    fn store() -> (SharedCache, SessionStore) {
        let cache: SharedCache = Arc::new(MemoryCache::new());
        let store = SessionStore::new(Arc::clone(&cache), SessionSettings::default());
        (cache, store)
    }

    #[test]
    fn test_cookie_value() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("theme=dark; app_session=abc"));
        assert_eq!(cookie_value(&headers, "app_session").as_deref(), Some("abc"));
        assert_eq!(cookie_value(&headers, "theme").as_deref(), Some("dark"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[tokio::test]
    async fn test_clean_session_is_not_saved() {
        let (_, store) = store();
        let session = Session::new();
        let _ = session.get::<String>("anything");
        assert_eq!(store.save(&session).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (cache, store) = store();
        let session = Session::new();
        session.insert("user_id", 42).unwrap();

        let id = store.save(&session).await.unwrap().unwrap();
        assert!(!session.is_dirty());
        assert!(cache.get(&format!("session|{id}")).await.unwrap().is_some());

        let loaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.get::<i64>("user_id"), Some(42));
        assert_eq!(loaded.id().as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn test_regenerate_replaces_id() {
        let (cache, store) = store();
        let session = Session::new();
        session.insert("k", "v").unwrap();
        let first = store.save(&session).await.unwrap().unwrap();

        session.regenerate();
        let second = store.save(&session).await.unwrap().unwrap();

        assert_ne!(first, second);
        assert!(cache.get(&format!("session|{first}")).await.unwrap().is_none());
        assert_eq!(
            store.load(&second).await.unwrap().unwrap().get::<String>("k").as_deref(),
            Some("v")
        );
    }

    #[tokio::test]
    async fn test_corrupt_entry_reads_as_missing() {
        let (cache, store) = store();
        cache.set("session|bad", "not json", None).await.unwrap();
        assert!(store.load("bad").await.unwrap().is_none());
    }

    #[test]
    fn test_csrf_token_is_stable_per_namespace() {
        let session = Session::new();
        let a = session.csrf_token("form.login");
        assert_eq!(session.csrf_token("form.login"), a);
        assert_ne!(session.csrf_token("form.other"), a);
        assert!(session.is_dirty());
    }

    #[test]
    fn test_verify_csrf() {
        let session = Session::new();
        let token = session.csrf_token("form");

        assert!(session.verify_csrf("form", &token).is_ok());
        let err = session.verify_csrf("form", "forged").unwrap_err();
        assert!(matches!(err, KeelError::CsrfValidation { .. }));
        assert!(session.verify_csrf("never-issued", &token).is_err());
    }

    #[test]
    fn test_verify_csrf_rejects_near_misses() {
        let session = Session::new();
        let token = session.csrf_token("form");

        let mut flipped = token.clone().into_bytes();
        flipped[0] = if flipped[0] == b'a' { b'b' } else { b'a' };
        let flipped = String::from_utf8(flipped).unwrap();

        assert!(session.verify_csrf("form", &flipped).is_err());
        assert!(session.verify_csrf("form", &token[..token.len() - 1]).is_err());
        assert!(session.verify_csrf("form", &format!("{token}0")).is_err());
        assert!(session.verify_csrf("form", "").is_err());
    }

    #[test]
    fn test_set_cookie_header() {
        let (_, store) = store();
        assert_eq!(
            store.set_cookie_header("abc"),
            "app_session=abc; Path=/; Max-Age=43200; HttpOnly; SameSite=Lax"
        );
    }
}
