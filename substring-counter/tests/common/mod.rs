#![allow(dead_code)]

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use substring_counter::CounterConfig;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const SUBSTRING: &[u8] = b"SomeSubstring";

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Collects formatted log lines for the current thread. Tasks spawned on a
/// current-thread runtime log into it as well.
#[derive(Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("log buffer lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_default(&self) -> tracing::subscriber::DefaultGuard {
        let buffer = self.buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .without_time()
            .with_writer(move || CaptureWriter(buffer.clone()))
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().expect("log buffer lock")).into_owned()
    }
}

pub fn test_config(max_workers: usize) -> CounterConfig {
    CounterConfig {
        max_workers,
        substring: SUBSTRING.to_vec(),
        request_timeout: Duration::from_secs(60),
        worker_idle_timeout: Duration::from_secs(60),
        buffer_size: 64,
        shutdown_grace: Duration::from_millis(200),
        ..CounterConfig::default()
    }
}

pub fn repeated(data: &[u8], times: usize) -> Vec<u8> {
    data.repeat(times)
}

pub fn tmp_file_filled_with(data: &[u8], times: usize) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp file");
    file.write_all(&repeated(data, times)).expect("write temp file");
    file.flush().expect("flush temp file");
    file
}

pub fn path_of(file: &NamedTempFile) -> String {
    file.path().to_str().expect("temp path is utf-8").to_string()
}

#[derive(Clone, Copy)]
enum Reply {
    Body,
    Status(u16),
    Hang,
}

/// Minimal HTTP/1.1 fixture. Every request head is recorded.
pub struct TestServer {
    pub url: String,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    /// Answers every request with `200 OK` and `body`.
    pub async fn serving(body: Vec<u8>) -> Self {
        Self::spawn(Reply::Body, body).await
    }

    /// Answers every request with an empty response of the given status.
    pub async fn failing_with(status: u16) -> Self {
        Self::spawn(Reply::Status(status), Vec::new()).await
    }

    /// Reads the request and never answers.
    pub async fn slow() -> Self {
        Self::spawn(Reply::Hang, Vec::new()).await
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("requests lock").clone()
    }

    async fn spawn(reply: Reply, body: Vec<u8>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test server");
        let url = format!("http://{}/", listener.local_addr().expect("local addr"));
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let body = Arc::new(body);

        let handle = {
            let hits = hits.clone();
            let requests = requests.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let hits = hits.clone();
                    let requests = requests.clone();
                    let body = body.clone();
                    tokio::spawn(async move {
                        serve(stream, reply, &body, &hits, &requests).await;
                    });
                }
            })
        };

        Self {
            url,
            hits,
            requests,
            handle,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    reply: Reply,
    body: &[u8],
    hits: &AtomicUsize,
    requests: &Mutex<Vec<String>>,
) {
    let head = read_request_head(&mut stream).await;
    hits.fetch_add(1, Ordering::SeqCst);
    requests.lock().expect("requests lock").push(head);

    let response = match reply {
        Reply::Body => {
            let mut response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            )
            .into_bytes();
            response.extend_from_slice(body);
            response
        }
        Reply::Status(status) => {
            format!("HTTP/1.1 {} Test\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", status).into_bytes()
        }
        Reply::Hang => {
            tokio::time::sleep(Duration::from_secs(60)).await;
            return;
        }
    };

    let _ = stream.write_all(&response).await;
    let _ = stream.shutdown().await;
}

async fn read_request_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                head.extend_from_slice(&buf[..n]);
                if head.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}
