use crate::types::{CounterConfig, CounterError, Result};
use futures::stream;
use reqwest::{header, Client, Response};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::StreamReader;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};
use url::Url;

const SCHEME_HTTP: &str = "http";
const SCHEME_HTTPS: &str = "https";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    File,
    Url,
}

type Content = Pin<Box<dyn AsyncRead + Send>>;

/// Turns origin lines into [`Source`]s. Holds the HTTP client shared by every URL source.
#[derive(Debug, Clone)]
pub struct SourceLoader {
    client: Client,
    load_attempts: u32,
}

impl SourceLoader {
    pub fn new(config: &CounterConfig) -> Result<Self> {
        // No gzip/brotli features are enabled, so bodies are never decoded on the fly.
        let client = Client::builder().timeout(config.request_timeout).build()?;

        Ok(Self {
            client,
            load_attempts: config.load_attempts,
        })
    }

    /// Decides what kind of source an origin names. Only touches the filesystem
    /// metadata, never the content.
    pub fn classify(origin: &str) -> Result<SourceKind> {
        if origin.is_empty() {
            return Err(CounterError::EmptyOrigin);
        }
        if is_regular_file(origin) {
            return Ok(SourceKind::File);
        }
        if is_http_url(origin) {
            return Ok(SourceKind::Url);
        }
        Err(CounterError::UnknownSource {
            origin: origin.to_string(),
        })
    }

    pub fn source(&self, origin: &str) -> Result<Source> {
        let backend = match Self::classify(origin)? {
            SourceKind::File => Backend::File,
            SourceKind::Url => Backend::Url {
                client: self.client.clone(),
                attempts: self.load_attempts,
            },
        };

        Ok(Source {
            origin: origin.to_string(),
            backend,
            loaded: false,
            content: None,
            request: None,
        })
    }
}

enum Backend {
    File,
    Url { client: Client, attempts: u32 },
}

/// Lazily loaded content of one origin.
///
/// Reading before [`Source::load`] succeeds yields zero bytes. The content is
/// loaded at most once, even across [`Source::close`]. Closing releases the
/// content and aborts an outstanding HTTP request; a closed source reads as empty.
pub struct Source {
    origin: String,
    backend: Backend,
    loaded: bool,
    content: Option<Content>,
    request: Option<DropGuard>,
}

impl Source {
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn kind(&self) -> SourceKind {
        match self.backend {
            Backend::File => SourceKind::File,
            Backend::Url { .. } => SourceKind::Url,
        }
    }

    /// True once a load has succeeded. Stays true after [`Source::close`].
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub async fn load(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.loaded {
            return Ok(());
        }

        match &self.backend {
            Backend::File => {
                let file = tokio::fs::File::open(&self.origin)
                    .await
                    .map_err(|e| load_failure(&self.origin, e))?;
                self.content = Some(Box::pin(file));
            }
            Backend::Url { client, attempts } => {
                let (content, request) = load_from_url(client, &self.origin, *attempts, cancel).await?;
                self.content = Some(content);
                self.request = Some(request);
            }
        }

        self.loaded = true;
        debug!("Loaded source {}", self.origin);
        Ok(())
    }

    pub fn close(&mut self) {
        // Dropping the guard cancels the request token, aborting any pending body read.
        self.request.take();
        self.content.take();
    }
}

impl AsyncRead for Source {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().content.as_mut() {
            Some(content) => content.as_mut().poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("origin", &self.origin)
            .field("kind", &self.kind())
            .field("loaded", &self.loaded)
            .field("open", &self.content.is_some())
            .finish()
    }
}

async fn load_from_url(
    client: &Client,
    origin: &str,
    attempts: u32,
    cancel: &CancellationToken,
) -> Result<(Content, DropGuard)> {
    let mut last_error = None;

    for attempt in 1..=attempts {
        let request = cancel.child_token();
        let outcome = tokio::select! {
            biased;
            _ = request.cancelled() => return Err(CounterError::Cancelled),
            outcome = get(client, origin) => outcome,
        };

        match outcome {
            Ok(response) => {
                let content: Content = Box::pin(body_reader(response, request.clone()));
                return Ok((content, request.drop_guard()));
            }
            Err(e) => {
                warn!("Attempt {}/{} failed for {}: {}", attempt, attempts, origin, e);
                last_error = Some(e);
            }
        }
    }

    let cause: Box<dyn std::error::Error + Send + Sync> = match last_error {
        Some(e) => Box::new(e),
        None => "no load attempts were made".into(),
    };
    Err(CounterError::LoadFailure {
        origin: origin.to_string(),
        source: cause,
    })
}

async fn get(client: &Client, origin: &str) -> reqwest::Result<Response> {
    // Identity encoding avoids truncated reads of compressed bodies.
    client
        .get(origin)
        .header(header::ACCEPT_ENCODING, "identity")
        .send()
        .await?
        .error_for_status()
}

fn load_failure(origin: &str, cause: io::Error) -> CounterError {
    CounterError::LoadFailure {
        origin: origin.to_string(),
        source: Box::new(cause),
    }
}

fn is_regular_file(path: &str) -> bool {
    std::fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

fn is_http_url(raw: &str) -> bool {
    match Url::parse(raw) {
        Ok(url) => url.scheme() == SCHEME_HTTP || url.scheme() == SCHEME_HTTPS,
        Err(_) => false,
    }
}

/// Adapts a response body into an [`AsyncRead`] that fails with `Interrupted`
/// once `request` is cancelled.
fn body_reader(response: Response, request: CancellationToken) -> impl AsyncRead + Send {
    let chunks = stream::unfold(Some((response, request)), |state| async move {
        let (mut response, request) = state?;
        let next = tokio::select! {
            biased;
            _ = request.cancelled() => None,
            chunk = response.chunk() => Some(chunk),
        };

        match next {
            None => Some((
                Err(io::Error::new(io::ErrorKind::Interrupted, "request cancelled")),
                None,
            )),
            Some(Ok(Some(bytes))) => Some((Ok(bytes), Some((response, request)))),
            Some(Ok(None)) => None,
            Some(Err(e)) => Some((Err(io::Error::other(e)), None)),
        }
    });
    StreamReader::new(Box::pin(chunks))
}
