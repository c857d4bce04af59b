//! Request templates and the per-iteration request instances cloned from
//! them.

use crate::error::{Error, Result};
use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE, USER_AGENT};
use hyper::{HeaderMap, Method};
use std::sync::Arc;
use url::Url;

/// Placeholders replaced by a per-iteration tag when the uniqueness marker
/// is enabled. `HEY` is the legacy spelling.
pub const UNIQUE_MARKERS: [&str; 2] = ["RANDMARK", "HEY"];

pub const DEFAULT_USER_AGENT: &str = concat!("loadmaster/", env!("CARGO_PKG_VERSION"));

/// Produces a fresh request for every iteration instead of cloning the
/// template.
pub type RequestGenerator = Arc<dyn Fn() -> PreparedRequest + Send + Sync>;

/// Immutable description of the request issued by every worker.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Bytes,
    basic_auth: Option<(String, String)>,
    host: Option<String>,
}

/// A request owned by one iteration, free to be mutated.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub basic_auth: Option<(String, String)>,
    /// Overrides the Host header, HTTP/2 authority and TLS server name
    pub host: Option<String>,
}

impl RequestTemplate {
    pub fn builder(method: &str, url: &str) -> TemplateBuilder {
        TemplateBuilder::new(method, url)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn host_override(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Deep copy for one iteration. The header map is rebuilt; the body is
    /// shared immutable bytes, so every instance reads it from the start.
    pub fn instantiate(&self) -> PreparedRequest {
        PreparedRequest {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            basic_auth: self.basic_auth.clone(),
            host: self.host.clone(),
        }
    }
}

impl PreparedRequest {
    /// Replaces every occurrence of the [`UNIQUE_MARKERS`] in the URL host,
    /// URL path, header values and body with `tag`.
    pub fn apply_marker(&mut self, tag: &str) -> Result<()> {
        for marker in UNIQUE_MARKERS {
            self.replace_marker(marker, tag)?;
        }
        Ok(())
    }

    fn replace_marker(&mut self, marker: &str, tag: &str) -> Result<()> {
        if let Some(host) = self.url.host_str() {
            // Hosts are lowercased by the URL parser.
            let lowered = marker.to_ascii_lowercase();
            if host.contains(&lowered) {
                let replaced = host.replace(&lowered, tag);
                self.url
                    .set_host(Some(&replaced))
                    .map_err(|e| Error::Config(format!("invalid host {:?}: {}", replaced, e)))?;
            }
        }

        if self.url.path().contains(marker) {
            let path = self.url.path().replace(marker, tag);
            self.url.set_path(&path);
        }

        for value in self.headers.values_mut() {
            let replaced = match value.to_str() {
                Ok(text) if text.contains(marker) => text.replace(marker, tag),
                _ => continue,
            };
            *value = HeaderValue::from_str(&replaced)
                .map_err(|e| Error::Config(format!("invalid header value: {}", e)))?;
        }

        if let Some(body) = replace_bytes(&self.body, marker.as_bytes(), tag.as_bytes()) {
            self.body = Bytes::from(body);
        }
        Ok(())
    }
}

/// Byte-level replace-all. Returns None when `needle` does not occur.
fn replace_bytes(haystack: &[u8], needle: &[u8], with: &[u8]) -> Option<Vec<u8>> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut found = false;
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            out.extend_from_slice(with);
            i += needle.len();
            found = true;
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    found.then_some(out)
}

#[derive(Debug, Clone)]
pub struct TemplateBuilder {
    method: String,
    url: String,
    headers: Vec<(String, String)>,
    body: Bytes,
    basic_auth: Option<(String, String)>,
    host: Option<String>,
    content_type: Option<String>,
    accept: Option<String>,
    user_agent: Option<String>,
}

impl TemplateBuilder {
    pub fn new(method: &str, url: &str) -> Self {
        Self {
            method: method.to_string(),
            url: url.to_string(),
            headers: Vec::new(),
            body: Bytes::new(),
            basic_auth: None,
            host: None,
            content_type: None,
            accept: None,
            user_agent: None,
        }
    }

    /// Same template pointed at another target.
    pub fn url(mut self, url: &str) -> Self {
        self.url = url.to_string();
        self
    }

    /// Sets a header, replacing an earlier value for the same name.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (name, value) in headers {
            self = self.header(name.as_ref(), value.as_ref());
        }
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn basic_auth(mut self, username: &str, password: &str) -> Self {
        self.basic_auth = Some((username.to_string(), password.to_string()));
        self
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string()).filter(|h| !h.is_empty());
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string()).filter(|c| !c.is_empty());
        self
    }

    pub fn accept(mut self, accept: &str) -> Self {
        self.accept = Some(accept.to_string()).filter(|a| !a.is_empty());
        self
    }

    pub fn user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = Some(user_agent.to_string()).filter(|u| !u.is_empty());
        self
    }

    pub fn build(self) -> Result<RequestTemplate> {
        let method = Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::Config(format!("invalid HTTP method {:?}", self.method)))?;

        let url = Url::parse(self.url.trim())
            .map_err(|e| Error::Config(format!("invalid url {:?}: {}", self.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "unsupported scheme {:?}, expected http or https",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(Error::Config(format!("url {:?} has no host", self.url)));
        }

        let mut headers = HeaderMap::new();
        if let Some(content_type) = &self.content_type {
            headers.insert(CONTENT_TYPE, header_value(content_type)?);
        }
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::Config(format!("invalid header name {:?}", name)))?;
            headers.insert(name, header_value(value)?);
        }
        if let Some(accept) = &self.accept {
            headers.insert(ACCEPT, header_value(accept)?);
        }

        let agent = match (&self.user_agent, headers.get(USER_AGENT)) {
            (Some(agent), _) => format!("{} {}", agent, DEFAULT_USER_AGENT),
            (None, Some(existing)) => format!(
                "{} {}",
                existing.to_str().unwrap_or_default(),
                DEFAULT_USER_AGENT
            ),
            (None, None) => DEFAULT_USER_AGENT.to_string(),
        };
        headers.insert(USER_AGENT, header_value(agent.trim())?);

        Ok(RequestTemplate {
            method,
            url,
            headers,
            body: self.body,
            basic_auth: self.basic_auth,
            host: self.host,
        })
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| Error::Config(format!("invalid header value {:?}", value)))
}
