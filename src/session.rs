use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::SessionError;

/// One cookie in the browser export format. Fields we don't use are kept
/// so `save` writes back what `load` read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Unix seconds. Zero or negative marks a session cookie.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Cookie {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            expires: None,
            extra: Map::new(),
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires {
            Some(exp) if exp > 0.0 => exp < now.timestamp() as f64,
            _ => false,
        }
    }
}

/// Logged-in cookie jar handed to the fetch collaborator.
#[derive(Debug, Clone)]
pub struct Session {
    path: PathBuf,
    cookies: Vec<Cookie>,
}

impl Session {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Session {
            path: path.into(),
            cookies: Vec::new(),
        }
    }

    /// Read a cookie file. A missing file is an empty session.
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("Cookie file {} not found, continuing without session", path.display());
                return Ok(Session::empty(path));
            }
            Err(source) => {
                return Err(SessionError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let cookies: Vec<Cookie> =
            serde_json::from_str(&raw).map_err(|source| SessionError::Invalid {
                path: path.to_path_buf(),
                source,
            })?;
        info!("Loaded {} cookies from {}", cookies.len(), path.display());
        Ok(Session {
            path: path.to_path_buf(),
            cookies,
        })
    }

    pub fn save(&self) -> Result<(), SessionError> {
        let io_err = |source| SessionError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(&self.cookies).map_err(|source| {
            SessionError::Invalid {
                path: self.path.clone(),
                source,
            }
        })?;
        fs::write(&self.path, json).map_err(io_err)?;
        info!("Saved {} cookies to {}", self.cookies.len(), self.path.display());
        Ok(())
    }

    /// Fail with [`SessionError::Missing`] when there is nothing to send.
    pub fn require(self) -> Result<Self, SessionError> {
        if self.cookies.is_empty() {
            return Err(SessionError::Missing(self.path));
        }
        Ok(self)
    }

    /// Insert or replace a cookie by name and domain.
    pub fn set(&mut self, cookie: Cookie) {
        match self
            .cookies
            .iter_mut()
            .find(|c| c.name == cookie.name && c.domain == cookie.domain)
        {
            Some(existing) => *existing = cookie,
            None => self.cookies.push(cookie),
        }
    }

    /// Fold another jar into this one. Returns how many cookies were taken.
    pub fn absorb(&mut self, other: Session) -> usize {
        let n = other.cookies.len();
        for cookie in other.cookies {
            self.set(cookie);
        }
        n
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Cookie` header value from the unexpired cookies.
    pub fn cookie_header(&self, now: DateTime<Utc>) -> Option<String> {
        let pairs: Vec<String> = self
            .cookies
            .iter()
            .filter(|c| !c.is_expired(now))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();
        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::scratch_dir;
    use chrono::TimeZone;

    #[test]
    fn missing_file_is_empty_session() {
        let dir = scratch_dir("session-missing");
        let s = Session::load(&dir.join("cookies.json")).unwrap();
        assert!(s.is_empty());
        assert_eq!(s.cookie_header(Utc::now()), None);
        assert!(matches!(s.require(), Err(SessionError::Missing(_))));
    }

    #[test]
    fn header_skips_expired_cookies() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let mut s = Session::empty("unused.json");
        s.set(Cookie::new("a1", "x"));
        let mut stale = Cookie::new("web_session", "old");
        stale.expires = Some((now.timestamp() - 10) as f64);
        s.set(stale);
        let mut session_only = Cookie::new("webId", "y");
        session_only.expires = Some(-1.0);
        s.set(session_only);

        assert_eq!(s.cookie_header(now).as_deref(), Some("a1=x; webId=y"));
    }

    #[test]
    fn set_replaces_same_cookie() {
        let mut s = Session::empty("unused.json");
        s.set(Cookie::new("a1", "x"));
        s.set(Cookie::new("a1", "z"));
        assert_eq!(s.len(), 1);
        assert_eq!(s.cookie_header(Utc::now()).as_deref(), Some("a1=z"));
    }

    #[test]
    fn absorb_merges_by_name_and_domain() {
        let mut s = Session::empty("unused.json");
        s.set(Cookie::new("a1", "old"));
        let mut other = Session::empty("export.json");
        other.set(Cookie::new("a1", "new"));
        other.set(Cookie::new("web_session", "w"));

        assert_eq!(s.absorb(other), 2);
        assert_eq!(s.len(), 2);
        assert_eq!(
            s.cookie_header(Utc::now()).as_deref(),
            Some("a1=new; web_session=w")
        );
    }

    #[test]
    fn save_then_load_keeps_browser_fields() {
        let dir = scratch_dir("session-save");
        let path = dir.join("cookies.json");
        fs::write(
            &path,
            r#"[{"name":"a1","value":"x","domain":".example.com","path":"/","expires":-1,"httpOnly":true}]"#,
        )
        .unwrap();

        let s = Session::load(&path).unwrap();
        s.save().unwrap();
        let again = Session::load(&path).unwrap();
        assert_eq!(again.cookies, s.cookies);
        assert_eq!(again.cookies[0].extra["httpOnly"], Value::Bool(true));
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = scratch_dir("session-bad");
        let path = dir.join("cookies.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(Session::load(&path), Err(SessionError::Invalid { .. })));
    }
}
