//! # Fetch Module
//!
//! Idempotently materialises one remote file in a target directory.
//!
//! The final file name is the last segment of the URL. If a file of that name
//! already exists the fetch is a no-op and no network request is issued. New
//! downloads are streamed into `<name>.part` and renamed into place only after
//! the transport reports success, so a truncated body can never be mistaken
//! for a finished download on a later run. Concurrent fetches that land on the
//! same file name are serialised: the first one downloads, the rest find the
//! finished file.
//!
//! ```rust,no_run
//! use ncmirror::config::TransportSettings;
//! use ncmirror::fetch::{Fetch, Fetcher, HttpTransport};
//! use std::path::Path;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let fetcher = Fetcher::new(HttpTransport::new(&TransportSettings::default())?);
//! let raw = fetcher.fetch("http://example/tas_hist_X.nc", Path::new("/data/raw")).await?;
//! println!("{}", raw.path.display());
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::config::TransportSettings;
use crate::error::{Classify, ErrorKind};
use crate::resolve::url_filename;

/// Suffix of in-flight downloads and subsets.
pub const PART_SUFFIX: &str = ".part";

/// Errors raised while moving bytes from a URL into a local sink.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server responded with status {0}")]
    Status(reqwest::StatusCode),

    #[error("Write failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("URL has no file name component: {0}")]
    NoFileName(String),

    #[error("Download of {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: TransportError,
    },

    #[error("Filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Classify for FetchError {
    fn kind(&self) -> ErrorKind {
        match self {
            FetchError::NoFileName(_) => ErrorKind::Parse,
            FetchError::Transport { .. } | FetchError::Io { .. } => ErrorKind::Transport,
        }
    }
}

pub type FetchResult<T> = Result<T, FetchError>;

/// Whether a fetch hit the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Downloaded { bytes: u64 },
    AlreadyPresent,
}

/// A raw file that exists locally after a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFile {
    pub path: PathBuf,
    pub filename: String,
    pub status: FetchStatus,
}

/// Moves the body of `url` into `sink`, returning the number of bytes written.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn download(&self, url: &str, sink: &mut fs::File) -> Result<u64, TransportError>;
}

/// Fetch stage as seen by the orchestrator.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, url: &str, target_dir: &Path) -> FetchResult<RawFile>;
}

/// HTTP(S) transport. The configured timeout bounds connecting and each wait
/// for more body bytes, never the whole transfer.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(settings: &TransportSettings) -> Result<Self, TransportError> {
        if settings.accept_invalid_certs {
            warn!("TLS certificate verification is disabled for downloads");
        }
        let timeout = Duration::from_secs(settings.timeout_secs);
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn download(&self, url: &str, sink: &mut fs::File) -> Result<u64, TransportError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status));
        }

        let mut len: u64 = 0;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            len += chunk.len() as u64;
            sink.write_all(&chunk).await?;
        }
        sink.flush().await?;
        Ok(len)
    }
}

/// Idempotent fetcher over any [`Transport`].
pub struct Fetcher<T> {
    transport: T,
    destinations: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl<T: Transport> Fetcher<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            destinations: Mutex::new(HashMap::new()),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The lock owning `path`; held from the existence check to the rename.
    fn destination_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut destinations = self.destinations.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(destinations.entry(path.to_path_buf()).or_default())
    }
}

#[async_trait]
impl<T: Transport> Fetch for Fetcher<T> {
    async fn fetch(&self, url: &str, target_dir: &Path) -> FetchResult<RawFile> {
        let filename = url_filename(url)
            .ok_or_else(|| FetchError::NoFileName(url.to_string()))?
            .to_string();
        let path = target_dir.join(&filename);

        let lock = self.destination_lock(&path);
        let _writer = lock.lock().await;

        if fs::metadata(&path).await.is_ok() {
            info!("File already exists, skipping download: {filename}");
            return Ok(RawFile {
                path,
                filename,
                status: FetchStatus::AlreadyPresent,
            });
        }

        fs::create_dir_all(target_dir).await.map_err(|source| FetchError::Io {
            path: target_dir.to_path_buf(),
            source,
        })?;

        let part = target_dir.join(format!("{filename}{PART_SUFFIX}"));
        let mut sink = fs::File::create(&part).await.map_err(|source| FetchError::Io {
            path: part.clone(),
            source,
        })?;

        info!("Downloading {filename} from {url}");
        let outcome = self.transport.download(url, &mut sink).await;
        drop(sink);

        let bytes = match outcome {
            Ok(bytes) => bytes,
            Err(source) => {
                discard_partial(&part).await;
                error!("Failed to download {url}. Error: {source}");
                return Err(FetchError::Transport {
                    url: url.to_string(),
                    source,
                });
            }
        };

        if let Err(source) = fs::rename(&part, &path).await {
            discard_partial(&part).await;
            return Err(FetchError::Io { path, source });
        }

        info!("Successfully downloaded {filename} ({bytes} bytes)");
        Ok(RawFile {
            path,
            filename,
            status: FetchStatus::Downloaded { bytes },
        })
    }
}

/// Removes an unfinished `.part` file, logging instead of failing.
pub(crate) async fn discard_partial(part: &Path) {
    match fs::remove_file(part).await {
        Ok(()) => debug!("Removed partial file {}", part.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove partial file {}: {e}", part.display()),
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// A one-shot HTTP server on a loopback port.
    ///
    /// Answers the first request with `status` and `body`, pausing `pause`
    /// before every body byte. Returns the base URL and a handle yielding the
    /// request head as received.
    pub async fn serve_once(
        status: &'static str,
        body: Vec<u8>,
        pause: Duration,
    ) -> std::io::Result<(String, JoinHandle<String>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let base = format!("http://{}", listener.local_addr()?);
        let handle = tokio::spawn(async move {
            let Ok((mut socket, _)) = listener.accept().await else {
                return String::new();
            };
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => head.extend_from_slice(&buf[..n]),
                }
            }
            let reply = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = socket.write_all(reply.as_bytes()).await;
            if pause.is_zero() {
                let _ = socket.write_all(&body).await;
            } else {
                for byte in &body {
                    tokio::time::sleep(pause).await;
                    if socket.write_all(&[*byte]).await.is_err() {
                        break;
                    }
                }
            }
            let _ = socket.flush().await;
            String::from_utf8_lossy(&head).into_owned()
        });
        Ok((base, handle))
    }

    /// Serves a fixed body. With `fail_after` set, writes that many bytes and
    /// then reports a dropped connection.
    pub struct MockTransport {
        pub body: Vec<u8>,
        pub fail_after: Option<usize>,
        calls: AtomicUsize,
    }

    impl MockTransport {
        pub fn serving(body: &[u8]) -> Self {
            Self {
                body: body.to_vec(),
                fail_after: None,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn failing_after(body: &[u8], written: usize) -> Self {
            Self {
                fail_after: Some(written),
                ..Self::serving(body)
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn download(&self, _url: &str, sink: &mut fs::File) -> Result<u64, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_after {
                Some(n) => {
                    sink.write_all(&self.body[..n.min(self.body.len())]).await?;
                    sink.flush().await?;
                    Err(TransportError::Io(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "connection reset by peer",
                    )))
                }
                None => {
                    sink.write_all(&self.body).await?;
                    sink.flush().await?;
                    Ok(self.body.len() as u64)
                }
            }
        }
    }
}
