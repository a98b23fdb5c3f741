//! Mock npm registry and project helpers shared by the integration tests.

#![allow(dead_code)]

use axum::{
    body::Body,
    extract::{Path as UrlPath, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tar::Builder;
use tempfile::TempDir;
use vlt_core::pkg::Integrity;
use vlt_core::Config;

/// One published version.
#[derive(Clone)]
pub struct Published {
    pub manifest: Value,
    pub tarball: Vec<u8>,
    /// Integrity advertised in the packument; defaults to the real one.
    pub advertised: Option<String>,
}

#[derive(Default)]
struct Inner {
    packages: BTreeMap<String, BTreeMap<String, Published>>,
    hits: BTreeMap<String, usize>,
    /// Remaining 503 answers per request path.
    failures: BTreeMap<String, usize>,
}

/// An in-process registry serving packuments and tarballs.
#[derive(Clone)]
pub struct MockRegistry {
    inner: Arc<Mutex<Inner>>,
    pub url: String,
}

impl MockRegistry {
    /// Bind to an ephemeral port and start serving.
    pub async fn start() -> Self {
        let inner = Arc::new(Mutex::new(Inner::default()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());

        let app = Router::new()
            .route("/:name", get(packument))
            .route("/:name/-/:file", get(tarball))
            .with_state(Arc::clone(&inner));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { inner, url }
    }

    /// Publish `name@version` with the given `package.json` fields merged in
    /// and `files` in the tarball.
    pub fn publish(&self, name: &str, version: &str, fields: Value, files: &[(&str, &str)]) {
        let mut manifest = json!({ "name": name, "version": version });
        if let (Some(target), Value::Object(extra)) = (manifest.as_object_mut(), fields) {
            target.extend(extra);
        }
        let tarball = package_tarball(&manifest, files);
        self.inner
            .lock()
            .unwrap()
            .packages
            .entry(name.to_string())
            .or_default()
            .insert(
                version.to_string(),
                Published {
                    manifest,
                    tarball,
                    advertised: None,
                },
            );
    }

    /// Advertise a wrong integrity for `name@version`.
    pub fn corrupt_integrity(&self, name: &str, version: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(published) = inner.packages.get_mut(name).and_then(|v| v.get_mut(version)) {
            published.advertised = Some(Integrity::compute(b"something else").to_string());
        }
    }

    /// Answer the next `count` requests for `path` (e.g. `"/lodash"`) with 503.
    pub fn fail_next(&self, path: &str, count: usize) {
        self.inner.lock().unwrap().failures.insert(path.to_string(), count);
    }

    /// Requests seen for `path`, failed ones included.
    pub fn hits(&self, path: &str) -> usize {
        self.inner.lock().unwrap().hits.get(path).copied().unwrap_or(0)
    }

    pub fn tarball_path(name: &str, version: &str) -> String {
        format!("/{name}/-/{name}-{version}.tgz")
    }
}

type Shared = Arc<Mutex<Inner>>;

/// Record a hit; `true` if this request should fail.
fn record(inner: &mut Inner, path: &str) -> bool {
    *inner.hits.entry(path.to_string()).or_default() += 1;
    match inner.failures.get_mut(path) {
        Some(left) if *left > 0 => {
            *left -= 1;
            true
        }
        _ => false,
    }
}

async fn packument(State(inner): State<Shared>, UrlPath(name): UrlPath<String>) -> Response {
    let mut inner = inner.lock().unwrap();
    if record(&mut inner, &format!("/{name}")) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let Some(versions) = inner.packages.get(&name) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let mut doc = serde_json::Map::new();
    let mut latest = None;
    for (version, published) in versions {
        let mut manifest = published.manifest.clone();
        let integrity = published
            .advertised
            .clone()
            .unwrap_or_else(|| Integrity::compute(&published.tarball).to_string());
        manifest["dist"] = json!({ "integrity": integrity });
        doc.insert(version.clone(), manifest);
        latest = Some(version.clone());
    }
    let body = json!({
        "name": name,
        "dist-tags": { "latest": latest },
        "versions": doc,
    });
    (
        [(header::CONTENT_TYPE, "application/json")],
        serde_json::to_vec(&body).unwrap(),
    )
        .into_response()
}

async fn tarball(
    State(inner): State<Shared>,
    UrlPath((name, file)): UrlPath<(String, String)>,
) -> Response {
    let mut inner = inner.lock().unwrap();
    if record(&mut inner, &format!("/{name}/-/{file}")) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let version = file
        .strip_prefix(&format!("{name}-"))
        .and_then(|rest| rest.strip_suffix(".tgz"))
        .unwrap_or_default();
    let Some(published) = inner.packages.get(&name).and_then(|v| v.get(version)) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from(published.tarball.clone()))
        .unwrap()
}

/// Gzipped tarball with everything under `package/`.
pub fn package_tarball(manifest: &Value, files: &[(&str, &str)]) -> Vec<u8> {
    let pkg_json = serde_json::to_vec(manifest).unwrap();
    let mut entries: Vec<(&str, &[u8])> = vec![("package.json", &pkg_json)];
    entries.extend(files.iter().map(|(path, content)| (*path, content.as_bytes())));

    let mut tar_bytes = Vec::new();
    {
        let mut builder = Builder::new(&mut tar_bytes);
        for (path, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_path(format!("package/{path}")).unwrap();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, content).unwrap();
        }
        builder.finish().unwrap();
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes).unwrap();
    encoder.finish().unwrap()
}

/// A project directory plus a cache directory outside of it.
pub struct Project {
    pub dir: TempDir,
    pub cache: TempDir,
    pub registry: String,
}

impl Project {
    pub fn new(registry: &MockRegistry, manifest: Value) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        write_json(&dir.path().join("package.json"), &manifest);
        Self {
            dir,
            cache,
            registry: registry.url.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn config(&self) -> Config {
        let mut config = Config::new(self.root().to_path_buf())
            .with_cache_dir(self.cache.path().to_path_buf())
            .with_registry(self.registry.clone());
        config.fetch_retry_mintimeout = 1;
        config.fetch_retry_maxtimeout = 5;
        config
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.root().join(rel)).unwrap()
    }
}

pub fn write_json(path: &Path, value: &Value) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut text = serde_json::to_string_pretty(value).unwrap();
    text.push('\n');
    std::fs::write(path, text).unwrap();
}
