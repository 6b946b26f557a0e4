//! WebDAV-backed `RemoteStore`. Pairs with `FileSyncProvider` for
//! syncing against Nextcloud-style servers.

use anyhow::{anyhow, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, CACHE_CONTROL, PRAGMA};
use reqwest::Method;

use crate::error::TransportError;
use crate::provider::files::{normalize_dir, normalize_file, NotFound, RemoteStore};

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:resourcetype/>
  </d:prop>
</d:propfind>
"#;

fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn xml_local_name(name: &[u8]) -> &[u8] {
    name.rsplit(|b| *b == b':').next().unwrap_or(name)
}

fn href_to_path(href: &str) -> Result<String> {
    if href.contains("://") {
        let url = reqwest::Url::parse(href).map_err(|_| anyhow!("invalid href url"))?;
        return Ok(url.path().to_string());
    }
    Ok(href.to_string())
}

fn transport(status: reqwest::StatusCode, what: &str, body: String) -> anyhow::Error {
    // Auth and client-side errors won't get better on retry.
    if status.as_u16() == 401 || status.as_u16() == 403 {
        TransportError::fatal(format!("{what}: HTTP {status} {body}")).into()
    } else {
        TransportError::retryable(format!("{what}: HTTP {status} {body}")).into()
    }
}

/// Depth-1 multistatus listing: returns virtual paths under
/// `requested_dir`, directories with a trailing slash, the requested
/// directory itself excluded.
fn parse_multistatus(base_path: &str, requested_dir: &str, xml: &[u8]) -> Result<Vec<String>> {
    let requested_dir = normalize_dir(requested_dir);

    let mut reader = Reader::from_reader(xml);
    reader.trim_text(true);
    let mut buf: Vec<u8> = Vec::new();

    let mut in_response = false;
    let mut in_href = false;
    let mut href: Option<String> = None;
    let mut is_collection = false;
    let mut out: Vec<String> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match xml_local_name(e.name().as_ref()) {
                b"response" => {
                    in_response = true;
                    in_href = false;
                    href = None;
                    is_collection = false;
                }
                b"href" if in_response => in_href = true,
                b"collection" if in_response => is_collection = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if in_response && xml_local_name(e.name().as_ref()) == b"collection" {
                    is_collection = true;
                }
            }
            Ok(Event::Text(e)) if in_response && in_href => {
                let text = e.unescape().map_err(|_| anyhow!("invalid xml"))?;
                href = Some(text.to_string());
            }
            Ok(Event::End(e)) => match xml_local_name(e.name().as_ref()) {
                b"href" => in_href = false,
                b"response" if in_response => {
                    in_response = false;
                    in_href = false;
                    if let Some(href) = href.take() {
                        let href_path = href_to_path(&href)?;
                        if let Some(rest) = href_path.strip_prefix(base_path) {
                            let rest = rest.trim_matches('/');
                            if !rest.is_empty() {
                                let virtual_path = if is_collection {
                                    format!("/{rest}/")
                                } else {
                                    format!("/{rest}")
                                };
                                if normalize_dir(&virtual_path) != requested_dir {
                                    out.push(virtual_path);
                                }
                            }
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(anyhow!("xml parse error: {e}")),
            _ => {}
        }
        buf.clear();
    }

    Ok(out)
}

pub struct WebDavStore {
    client: Client,
    target_id: String,
    base_url: String,
    base_path: String,
    username: Option<String>,
    password: Option<String>,
}

impl WebDavStore {
    pub fn new(base_url: String, username: Option<String>, password: Option<String>) -> Result<Self> {
        let parsed = reqwest::Url::parse(&base_url).map_err(|_| anyhow!("invalid base_url"))?;
        let mut base_path = parsed.path().to_string();
        if !base_path.ends_with('/') {
            base_path.push('/');
        }

        let mut sanitized = parsed;
        let _ = sanitized.set_username("");
        let _ = sanitized.set_password(None);
        sanitized.set_query(None);
        sanitized.set_fragment(None);
        sanitized.set_path(&base_path);
        let target_id = format!("webdav:{sanitized}");

        Ok(Self {
            client: Client::new(),
            target_id,
            base_url,
            base_path,
            username,
            password,
        })
    }

    fn request(&self, method: Method, virtual_path: &str) -> reqwest::blocking::RequestBuilder {
        let url = join_url(&self.base_url, virtual_path);
        let mut builder = self
            .client
            .request(method, url)
            .header(CACHE_CONTROL, "no-cache")
            .header(PRAGMA, "no-cache");
        if let Some(user) = &self.username {
            builder = builder.basic_auth(user, self.password.as_deref());
        }
        builder
    }
}

impl RemoteStore for WebDavStore {
    fn target_id(&self) -> &str {
        &self.target_id
    }

    fn mkdir_all(&self, path: &str) -> Result<()> {
        let dir = normalize_dir(path);
        if dir == "/" {
            return Ok(());
        }

        let mut cur = String::new();
        for part in dir.trim_matches('/').split('/') {
            if part.is_empty() {
                continue;
            }
            cur.push('/');
            cur.push_str(part);
            cur.push('/');

            let resp = self
                .request(Method::from_bytes(b"MKCOL")?, &cur)
                .send()
                .map_err(|e| TransportError::retryable(format!("MKCOL: {e}")))?;
            match resp.status().as_u16() {
                // 405 = collection already exists.
                200 | 201 | 204 | 405 => {}
                _ => {
                    let status = resp.status();
                    let body = resp.text().unwrap_or_default();
                    return Err(transport(status, "MKCOL failed", body));
                }
            }
        }
        Ok(())
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let dir = normalize_dir(dir);

        let mut headers = HeaderMap::new();
        headers.insert("Depth", HeaderValue::from_static("1"));
        headers.insert("Content-Type", HeaderValue::from_static("application/xml"));

        let resp = self
            .request(Method::from_bytes(b"PROPFIND")?, &dir)
            .headers(headers)
            .body(PROPFIND_BODY)
            .send()
            .map_err(|e| TransportError::retryable(format!("PROPFIND: {e}")))?;

        if resp.status().as_u16() == 404 {
            return Ok(vec![]);
        }
        if !resp.status().is_success() && resp.status().as_u16() != 207 {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(transport(status, "PROPFIND failed", body));
        }

        let bytes = resp.bytes()?.to_vec();
        parse_multistatus(&self.base_path, &dir, &bytes)
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        if path.ends_with('/') {
            return Err(anyhow!("GET expects file path, got dir: {path}"));
        }
        let path = normalize_file(path);

        let resp = self
            .request(Method::GET, &path)
            .send()
            .map_err(|e| TransportError::retryable(format!("GET: {e}")))?;
        if resp.status().as_u16() == 404 {
            return Err(NotFound { path }.into());
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(transport(status, "GET failed", body));
        }
        Ok(resp.bytes()?.to_vec())
    }

    fn put(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        if path.ends_with('/') {
            return Err(anyhow!("PUT expects file path, got dir: {path}"));
        }

        let resp = self
            .request(Method::PUT, &normalize_file(path))
            .body(bytes)
            .send()
            .map_err(|e| TransportError::retryable(format!("PUT: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(transport(status, "PUT failed", body));
        }
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<()> {
        let is_dir = path.ends_with('/');
        let path = if is_dir {
            normalize_dir(path)
        } else {
            normalize_file(path)
        };
        if path == "/" {
            return Err(anyhow!("refusing to delete root dir"));
        }

        let resp = self
            .request(Method::DELETE, &path)
            .send()
            .map_err(|e| TransportError::retryable(format!("DELETE: {e}")))?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Err(NotFound { path }.into());
        }
        if status.is_success() {
            return Ok(());
        }

        // Some servers 405 a collection DELETE with a trailing slash but
        // accept the same URL without it.
        if is_dir && status.as_u16() == 405 {
            let alt = path.trim_end_matches('/');
            if !alt.is_empty() {
                let alt_resp = self
                    .request(Method::DELETE, alt)
                    .send()
                    .map_err(|e| TransportError::retryable(format!("DELETE: {e}")))?;
                if alt_resp.status().is_success() {
                    return Ok(());
                }
            }
        }

        let body = resp.text().unwrap_or_default();
        Err(transport(status, "DELETE failed", body))
    }
}
