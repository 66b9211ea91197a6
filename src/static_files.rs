//! Static files from a virtual filesystem, with an SPA-aware variant.
//!
//! The file server only needs lookup-by-path, so storage is abstracted as
//! [`Vfs`]. [`MemoryFs`] covers embedded assets (and tests); [`DirFs`] reads
//! a directory on disk.
//!
//! # SPA fallback rule
//!
//! A path is *asset-shaped* when its last segment contains a `.` anywhere
//! but the first character: `app.js`, `logo.png`, `archive.tar.gz`. Anything
//! else (`dashboard`, `users/42`, `.well-known`) is *route-shaped*.
//!
//! On a miss, [`App::file_server_spa`](crate::App::file_server_spa) answers
//! route-shaped paths with the root `index.html` so the client-side router
//! can take over. Asset-shaped misses still 404: a missing bundle should
//! fail loudly, not come back as HTML.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::{HeaderValue, Method, StatusCode, header};

use crate::app::App;
use crate::context::Context;
use crate::encoder::{HttpError, Response};
use crate::error::Error;
use crate::request::Request;
use crate::router;

const INDEX: &str = "index.html";

// ── Vfs ───────────────────────────────────────────────────────────────────────

/// A file as seen through a [`Vfs`].
#[derive(Clone, Debug)]
pub struct VfsFile {
    pub contents: Bytes,
    pub modified: Option<SystemTime>,
}

/// Read-only map from relative path (`css/site.css`, no leading slash) to file.
pub trait Vfs: Send + Sync + 'static {
    fn open(&self, path: &str) -> Option<VfsFile>;

    fn exists(&self, path: &str) -> bool {
        self.open(path).is_some()
    }
}

/// In-memory [`Vfs`].
#[derive(Clone, Debug, Default)]
pub struct MemoryFs {
    files: HashMap<String, VfsFile>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, contents: impl Into<Bytes>) -> Self {
        self.insert(path, contents, None);
        self
    }

    pub fn insert(&mut self, path: &str, contents: impl Into<Bytes>, modified: Option<SystemTime>) {
        let file = VfsFile { contents: contents.into(), modified };
        self.files.insert(path.trim_start_matches('/').to_owned(), file);
    }
}

impl Vfs for MemoryFs {
    fn open(&self, path: &str) -> Option<VfsFile> {
        self.files.get(path).cloned()
    }

    fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }
}

/// [`Vfs`] over a directory on disk.
///
/// Reads are synchronous; meant for the small asset bundles an SPA ships.
#[derive(Clone, Debug)]
pub struct DirFs {
    root: PathBuf,
}

impl DirFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Vfs for DirFs {
    fn open(&self, path: &str) -> Option<VfsFile> {
        let full = self.root.join(path);
        let meta = std::fs::metadata(&full).ok()?;
        if !meta.is_file() {
            return None;
        }
        let contents = std::fs::read(&full).ok()?;
        Some(VfsFile { contents: contents.into(), modified: meta.modified().ok() })
    }
}

// ── Serving ───────────────────────────────────────────────────────────────────

struct FileServer {
    vfs: Arc<dyn Vfs>,
    dir: String,
    spa: bool,
}

impl FileServer {
    fn serve(&self, req: &Request) -> Result<Response, HttpError> {
        let raw = req.param("path").unwrap_or("");
        let Some((rel, dir_shaped)) = clean_path(raw) else {
            return Err(HttpError::not_found());
        };

        let key = match (dir_shaped, rel.is_empty()) {
            (false, _) => self.key(&rel),
            (true, true) => self.key(INDEX),
            (true, false) => self.key(&format!("{rel}/{INDEX}")),
        };
        if let Some(file) = self.vfs.open(&key) {
            return Ok(file_response(req, &key, file));
        }

        if self.spa && !is_asset_path(&rel) {
            let index = self.key(INDEX);
            if let Some(file) = self.vfs.open(&index) {
                return Ok(file_response(req, &index, file));
            }
        }
        Err(HttpError::not_found())
    }

    fn key(&self, rel: &str) -> String {
        if self.dir.is_empty() { rel.to_owned() } else { format!("{}/{rel}", self.dir) }
    }
}

/// Percent-decode and normalise a request path.
///
/// Returns the relative path and whether it names a directory (empty or
/// trailing `/`). `None` for anything that tries to leave the root.
fn clean_path(raw: &str) -> Option<(String, bool)> {
    let decoded = urlencoding::decode(raw).ok()?;
    if decoded.contains(['\\', '\0']) {
        return None;
    }

    let mut segments = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => return None,
            s => segments.push(s),
        }
    }
    let dir_shaped = segments.is_empty() || decoded.ends_with('/');
    Some((segments.join("/"), dir_shaped))
}

/// Whether the last segment has an extension (a `.` past its first char).
pub fn is_asset_path(path: &str) -> bool {
    let last = path.rsplit('/').next().unwrap_or(path);
    last.rfind('.').is_some_and(|i| i > 0)
}

fn file_response(req: &Request, key: &str, file: VfsFile) -> Response {
    let last_modified = file.modified.map(httpdate::fmt_http_date);

    if let (Some(modified), Some(since)) = (file.modified, req.header("if-modified-since")) {
        if let Ok(since) = httpdate::parse_http_date(since) {
            if unix_secs(modified) <= unix_secs(since) {
                let mut resp = Response::builder().status(StatusCode::NOT_MODIFIED);
                if let Some(value) = last_modified.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
                    resp = resp.header(header::LAST_MODIFIED, value);
                }
                return resp.no_body();
            }
        }
    }

    let mime = mime_guess::from_path(key).first_or_octet_stream();
    let mut resp = Response::builder();
    if let Some(value) = last_modified.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
        resp = resp.header(header::LAST_MODIFIED, value);
    }
    resp.typed(mime.essence_str().to_owned(), file.contents)
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Register GET and HEAD routes at `prefix`, `prefix/` and `prefix/{*path}`.
///
/// The catch-all never matches an empty tail, so `prefix/` needs its own route.
pub(crate) fn mount(app: &mut App, vfs: Arc<dyn Vfs>, dir: &str, prefix: &str, spa: bool) -> Result<(), Error> {
    let server = Arc::new(FileServer { vfs, dir: dir.trim_matches('/').to_owned(), spa });
    let root = router::join(prefix, "");
    let rest = router::join(prefix, "{*path}");

    let mut patterns = vec![root.clone(), rest];
    if root != "/" {
        patterns.push(format!("{root}/"));
    }

    for method in [Method::GET, Method::HEAD] {
        for pattern in &patterns {
            let server = Arc::clone(&server);
            let handler = move |_ctx: Context, req: Request| {
                let server = Arc::clone(&server);
                async move { server.serve(&req) }
            };
            app.register(method.clone(), "", pattern, handler, &[])?;
        }
    }
    Ok(())
}
