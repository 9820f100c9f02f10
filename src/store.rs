//! The in-memory session store: insertion-ordered, FIFO-capped, searchable.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{Error, Result};
use crate::session::Session;

/// Shared handle to a stored session. Handlers keep mutating a session
/// (WebSocket messages, close state) after it is published, so the store
/// hands out lock-guarded references.
pub type SessionHandle = Arc<Mutex<Session>>;

type Subscriber = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, SessionHandle>,
    order: VecDeque<SessionHandle>,
}

/// Insertion-ordered session storage with an id index and FIFO eviction
/// once `max_size` is exceeded.
pub struct SessionStore {
    inner: RwLock<Inner>,
    subscribers: RwLock<Vec<Subscriber>>,
    max_size: usize,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("len", &self.len())
            .field("max_size", &self.max_size)
            .finish()
    }
}

impl SessionStore {
    /// Creates a store retaining at most `max_size` sessions.
    pub fn new(max_size: usize) -> Self {
        SessionStore {
            inner: RwLock::new(Inner::default()),
            subscribers: RwLock::new(Vec::new()),
            max_size,
        }
    }

    /// Registers a change-notification callback. Subscribers are append-only
    /// and invoked concurrently, with no ordering guarantees.
    pub fn subscribe<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        self.subscribers
            .write()
            .expect("subscriber list poisoned")
            .push(Arc::new(callback));
    }

    /// Wraps `session` in a handle and publishes it, evicting the oldest
    /// entry when the cap is exceeded.
    pub fn store(&self, session: Session) -> SessionHandle {
        let handle: SessionHandle = Arc::new(Mutex::new(session));
        self.insert(handle.clone());
        handle
    }

    /// Publishes an already-shared session handle.
    pub fn insert(&self, handle: SessionHandle) {
        {
            let mut inner = self.inner.write().expect("session store poisoned");
            let id = handle.lock().expect("session poisoned").id.clone();
            inner.sessions.insert(id, handle.clone());
            inner.order.push_back(handle);

            if inner.order.len() > self.max_size {
                if let Some(oldest) = inner.order.pop_front() {
                    let id = oldest.lock().expect("session poisoned").id.clone();
                    inner.sessions.remove(&id);
                }
            }
        }

        self.notify_subscribers();
    }

    /// Looks a session up by id.
    pub fn get(&self, id: &str) -> Result<SessionHandle> {
        let inner = self.inner.read().expect("session store poisoned");
        inner
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(id))
    }

    /// Snapshot of all sessions in insertion order.
    pub fn get_all(&self) -> Vec<SessionHandle> {
        let inner = self.inner.read().expect("session store poisoned");
        inner.order.iter().cloned().collect()
    }

    /// Number of retained sessions.
    pub fn len(&self) -> usize {
        self.inner.read().expect("session store poisoned").order.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every stored session.
    pub fn clear(&self) {
        {
            let mut inner = self.inner.write().expect("session store poisoned");
            inner.sessions.clear();
            inner.order.clear();
        }
        self.notify_subscribers();
    }

    fn notify_subscribers(&self) {
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .read()
            .expect("subscriber list poisoned")
            .clone();
        if subscribers.is_empty() {
            return;
        }

        // One task per subscriber; nothing orders one against another.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                for subscriber in subscribers {
                    handle.spawn(async move { subscriber() });
                }
            }
            Err(_) => {
                for subscriber in subscribers {
                    subscriber();
                }
            }
        }
    }

    /// Returns the sessions matching every given predicate, in insertion
    /// order. Refuses fully-empty options.
    pub fn search(&self, options: &SearchOptions) -> Result<Vec<SessionHandle>> {
        if options.is_empty() {
            return Err(Error::protocol("no search criteria provided"));
        }

        let matches: Vec<SessionHandle> = self
            .get_all()
            .into_iter()
            .filter(|handle| {
                let session = handle.lock().expect("session poisoned");
                options.matches(&session)
            })
            .collect();

        Ok(matches)
    }
}

/// Search predicates; all that are present must match (AND semantics).
///
/// String predicates match as case-insensitive substrings, or as a regular
/// expression when wrapped in `/.../`.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Matches the request URL.
    pub url: Option<String>,
    /// Matches some header name.
    pub headers_key: Option<String>,
    /// Matches some header value (independently of `headers_key`).
    pub headers_val: Option<String>,
    /// Matches some cookie name.
    pub cookies_key: Option<String>,
    /// Matches some cookie value (independently of `cookies_key`).
    pub cookies_val: Option<String>,
    /// Matches the request body or the response body.
    pub body: Option<String>,
}

impl SearchOptions {
    fn is_empty(&self) -> bool {
        self.url.is_none()
            && self.headers_key.is_none()
            && self.headers_val.is_none()
            && self.cookies_key.is_none()
            && self.cookies_val.is_none()
            && self.body.is_none()
    }

    fn matches(&self, session: &Session) -> bool {
        if let Some(url) = &self.url {
            if !match_string(&session.request.url, url) {
                return false;
            }
        }

        if self.headers_key.is_some() || self.headers_val.is_some() {
            if !self.match_headers(session) {
                return false;
            }
        }

        if self.cookies_key.is_some() || self.cookies_val.is_some() {
            if !self.match_cookies(session) {
                return false;
            }
        }

        if let Some(body) = &self.body {
            let request_hit = match_string(&session.request.body_text(), body);
            let response_hit = session
                .response
                .as_ref()
                .map(|r| match_string(&r.body, body))
                .unwrap_or(false);
            if !request_hit && !response_hit {
                return false;
            }
        }

        true
    }

    // Key and value may match in different header entries; each predicate is
    // an independent existence check.
    fn match_headers(&self, session: &Session) -> bool {
        let mut found_key = self.headers_key.is_none();
        let mut found_val = self.headers_val.is_none();

        for (key, value) in session.request.headers.iter() {
            if !found_key {
                if let Some(pattern) = &self.headers_key {
                    if match_string(key, pattern) {
                        found_key = true;
                    }
                }
            }
            if !found_val {
                if let Some(pattern) = &self.headers_val {
                    if match_string(&value.as_joined(), pattern) {
                        found_val = true;
                    }
                }
            }
            if found_key && found_val {
                return true;
            }
        }

        found_key && found_val
    }

    fn match_cookies(&self, session: &Session) -> bool {
        let mut found_key = self.cookies_key.is_none();
        let mut found_val = self.cookies_val.is_none();

        for (key, value) in &session.request.cookies {
            if !found_key {
                if let Some(pattern) = &self.cookies_key {
                    if match_string(key, pattern) {
                        found_key = true;
                    }
                }
            }
            if !found_val {
                if let Some(pattern) = &self.cookies_val {
                    if match_string(value, pattern) {
                        found_val = true;
                    }
                }
            }
            if found_key && found_val {
                return true;
            }
        }

        found_key && found_val
    }
}

fn match_string(text: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }

    if let Some(inner) = regex_pattern(pattern) {
        match regex::Regex::new(inner) {
            Ok(re) => return re.is_match(text),
            // Unusable regex degrades to a substring match on the raw query.
            Err(_) => return contains_ignore_case(text, pattern),
        }
    }

    contains_ignore_case(text, pattern)
}

fn regex_pattern(query: &str) -> Option<&str> {
    if query.len() > 2 && query.starts_with('/') && query.ends_with('/') {
        Some(&query[1..query.len() - 1])
    } else {
        None
    }
}

fn contains_ignore_case(text: &str, pattern: &str) -> bool {
    text.to_lowercase().contains(&pattern.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::OrderedHeaderMap;
    use crate::session::{RequestRecord, ResponseRecord};
    use bytes::Bytes;

    fn make_session(url: &str, headers: &[(&str, &str)], body: &str) -> Session {
        let mut map = OrderedHeaderMap::new();
        for (key, value) in headers {
            map.append(key, value);
        }
        let record = RequestRecord::new("GET", url, map, Bytes::copy_from_slice(body.as_bytes()));
        Session::new(record, None, "HTTP/1.1")
    }

    #[test]
    fn get_returns_stored_session() {
        let store = SessionStore::new(10);
        let handle = store.store(make_session("https://example.com/", &[], ""));
        let id = handle.lock().unwrap().id.clone();

        let fetched = store.get(&id).unwrap();
        assert!(Arc::ptr_eq(&handle, &fetched));
        assert!(store.get("missing").unwrap_err().is_not_found());
    }

    #[test]
    fn fifo_eviction_keeps_the_last_max_size() {
        let store = SessionStore::new(3);
        let mut ids = Vec::new();
        for i in 0..5 {
            let handle = store.store(make_session(&format!("https://e.com/{i}"), &[], ""));
            ids.push(handle.lock().unwrap().id.clone());
        }

        assert_eq!(store.len(), 3);
        assert!(store.get(&ids[0]).is_err());
        assert!(store.get(&ids[1]).is_err());
        for id in &ids[2..] {
            assert!(store.get(id).is_ok());
        }

        let order: Vec<String> = store
            .get_all()
            .iter()
            .map(|h| h.lock().unwrap().request.url.clone())
            .collect();
        assert_eq!(order, ["https://e.com/2", "https://e.com/3", "https://e.com/4"]);
    }

    #[test]
    fn clear_empties_the_store() {
        let store = SessionStore::new(10);
        store.store(make_session("https://e.com/", &[], ""));
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn subscribers_fire_on_store() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let store = SessionStore::new(10);
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        store.subscribe(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        store.store(make_session("https://e.com/", &[], ""));
        store.clear();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn search_refuses_empty_options() {
        let store = SessionStore::new(10);
        assert!(store.search(&SearchOptions::default()).is_err());
    }

    #[test]
    fn search_combines_predicates_with_and() {
        let store = SessionStore::new(10);
        store.store(make_session(
            "https://example.com/api",
            &[("Content-Type", "application/json")],
            "",
        ));
        store.store(make_session(
            "https://example.com/page",
            &[("Content-Type", "text/html")],
            "",
        ));
        store.store(make_session(
            "https://other.net/api",
            &[("Content-Type", "application/json")],
            "",
        ));
        store.store(make_session("https://example.com/bare", &[], ""));

        let results = store
            .search(&SearchOptions {
                url: Some("example".into()),
                headers_key: Some("content-type".into()),
                headers_val: Some("json".into()),
                ..SearchOptions::default()
            })
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].lock().unwrap().request.url,
            "https://example.com/api"
        );
    }

    #[test]
    fn search_header_key_and_value_may_hit_different_entries() {
        let store = SessionStore::new(10);
        store.store(make_session(
            "https://example.com/",
            &[("X-Request-Id", "abc"), ("Accept", "application/json")],
            "",
        ));

        let results = store
            .search(&SearchOptions {
                headers_key: Some("x-request-id".into()),
                headers_val: Some("json".into()),
                ..SearchOptions::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn search_url_as_regex() {
        let store = SessionStore::new(10);
        store.store(make_session("https://example.com/v1/users", &[], ""));
        store.store(make_session("https://example.com/v2/users", &[], ""));

        let results = store
            .search(&SearchOptions {
                url: Some("/v[0-9]+/users/".into()),
                ..SearchOptions::default()
            })
            .unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn search_body_matches_request_or_response() {
        let store = SessionStore::new(10);

        let with_request_body = make_session("https://e.com/a", &[], "needle in request");
        store.store(with_request_body);

        let mut with_response_body = make_session("https://e.com/b", &[], "");
        with_response_body.response = Some(ResponseRecord {
            status_code: 200,
            body: "needle in response".into(),
            ..ResponseRecord::default()
        });
        store.store(with_response_body);

        store.store(make_session("https://e.com/c", &[], "nothing"));

        let results = store
            .search(&SearchOptions {
                body: Some("needle".into()),
                ..SearchOptions::default()
            })
            .unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn search_cookies() {
        let store = SessionStore::new(10);
        store.store(make_session(
            "https://e.com/",
            &[("Cookie", "sid=secret-token; theme=dark")],
            "",
        ));

        let hit = store
            .search(&SearchOptions {
                cookies_key: Some("sid".into()),
                cookies_val: Some("secret".into()),
                ..SearchOptions::default()
            })
            .unwrap();
        assert_eq!(hit.len(), 1);

        let miss = store
            .search(&SearchOptions {
                cookies_key: Some("missing".into()),
                ..SearchOptions::default()
            })
            .unwrap();
        assert!(miss.is_empty());
    }
}
