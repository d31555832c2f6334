//! Resource retrieval: turning a resolved URL into bytes.

use crate::error::BlockLoaderError;
use std::path::PathBuf;
use tracing::debug;

/// Bytes of one fetched resource plus the content type it was served with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResource {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

impl FetchedResource {
    pub fn new(bytes: impl Into<Vec<u8>>, content_type: Option<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type,
        }
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Retrieves resources by URL.
pub trait ResourceFetcher {
    fn fetch(&self, url: &str) -> Result<FetchedResource, BlockLoaderError>;
}

/// Guesses a content type from a file name's extension.
pub fn content_type_for(name: &str) -> Option<&'static str> {
    let path = name.split(['?', '#']).next().unwrap_or(name);
    let ext = path.rsplit_once('.')?.1.to_ascii_lowercase();
    Some(match ext.as_str() {
        "js" | "mjs" | "cjs" => "text/javascript",
        "css" => "text/css",
        "html" | "htm" => "text/html",
        "wasm" => "application/wasm",
        "wat" => "text/plain",
        "json" => "application/json",
        _ => return None,
    })
}

/// Reads `file://` URLs and plain filesystem paths. Query strings (cache
/// busting tags) are ignored.
#[derive(Debug, Default, Clone)]
pub struct FileFetcher;

impl FileFetcher {
    fn to_path(url: &str) -> Result<PathBuf, BlockLoaderError> {
        if url.starts_with("file:") {
            let parsed = url::Url::parse(url).map_err(|e| BlockLoaderError::Fetch {
                url: url.to_string(),
                message: format!("invalid file url: {e}"),
            })?;
            return parsed.to_file_path().map_err(|_| BlockLoaderError::Fetch {
                url: url.to_string(),
                message: "file url has no local path".into(),
            });
        }
        let plain = url.split('?').next().unwrap_or(url);
        Ok(PathBuf::from(plain))
    }
}

impl ResourceFetcher for FileFetcher {
    fn fetch(&self, url: &str) -> Result<FetchedResource, BlockLoaderError> {
        let path = Self::to_path(url)?;
        debug!(path = %path.display(), "Reading local resource");
        let bytes = std::fs::read(&path).map_err(|e| BlockLoaderError::Fetch {
            url: url.to_string(),
            message: format!("read {}: {e}", path.display()),
        })?;
        let content_type = content_type_for(&path.to_string_lossy()).map(str::to_string);
        Ok(FetchedResource::new(bytes, content_type))
    }
}

/// Fetches `http(s)://` URLs with a blocking client.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, BlockLoaderError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent("Vivafolio/0.3")
            .build()
            .map_err(|e| BlockLoaderError::Fetch {
                url: String::new(),
                message: format!("http client: {e}"),
            })?;
        Ok(Self { client })
    }
}

impl ResourceFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<FetchedResource, BlockLoaderError> {
        let fetch_err = |message: String| BlockLoaderError::Fetch {
            url: url.to_string(),
            message,
        };

        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| fetch_err(format!("fetch failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(fetch_err(format!("HTTP {}", resp.status())));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = resp
            .bytes()
            .map_err(|e| fetch_err(format!("read body: {e}")))?;
        Ok(FetchedResource::new(bytes.to_vec(), content_type))
    }
}

/// Dispatches on URL scheme: `http(s)` goes over the network, anything else
/// is read from disk.
pub struct DefaultFetcher {
    file: FileFetcher,
    http: Option<HttpFetcher>,
}

impl DefaultFetcher {
    pub fn new() -> Self {
        Self {
            file: FileFetcher,
            http: HttpFetcher::new().ok(),
        }
    }
}

impl Default for DefaultFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceFetcher for DefaultFetcher {
    fn fetch(&self, url: &str) -> Result<FetchedResource, BlockLoaderError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            match &self.http {
                Some(http) => http.fetch(url),
                None => Err(BlockLoaderError::Fetch {
                    url: url.to_string(),
                    message: "http client unavailable".into(),
                }),
            }
        } else {
            self.file.fetch(url)
        }
    }
}
