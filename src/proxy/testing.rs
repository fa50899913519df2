//! Test doubles: a local forward proxy and a scripted prober

use crate::error::ProbeFailure;
use crate::proxy::checker::Prober;
use crate::proxy::models::{CandidateAddress, ProbeResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// How the fake proxy answers every request
#[derive(Debug, Clone)]
pub(crate) enum FakeProxy {
    Respond {
        status: u16,
        body: &'static str,
        delay: Duration,
    },
    /// Promise `promised` body bytes, send `sent`, wait `delay`, then close
    Truncated {
        status: u16,
        promised: usize,
        sent: &'static str,
        delay: Duration,
    },
    /// Accept the connection and never answer
    Hang,
}

impl FakeProxy {
    pub(crate) fn respond(status: u16, body: &'static str) -> Self {
        FakeProxy::Respond {
            status,
            body,
            delay: Duration::ZERO,
        }
    }

    pub(crate) fn delayed(status: u16, body: &'static str, delay: Duration) -> Self {
        FakeProxy::Respond {
            status,
            body,
            delay,
        }
    }
}

pub(crate) struct RunningProxy {
    pub(crate) address: SocketAddr,
    /// Raw request text (head and body) of every request received
    pub(crate) requests: mpsc::UnboundedReceiver<String>,
}

impl RunningProxy {
    pub(crate) fn candidate(&self) -> CandidateAddress {
        CandidateAddress::new(self.address.to_string())
    }
}

pub(crate) async fn spawn_fake_proxy(behavior: FakeProxy) -> RunningProxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let (tx, requests) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let behavior = behavior.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _ = serve(stream, behavior, tx).await;
            });
        }
    });

    RunningProxy { address, requests }
}

async fn serve(
    mut stream: TcpStream,
    behavior: FakeProxy,
    tx: mpsc::UnboundedSender<String>,
) -> std::io::Result<()> {
    let request = read_request(&mut stream).await?;
    let _ = tx.send(request);

    match behavior {
        FakeProxy::Hang => {
            std::future::pending::<()>().await;
            Ok(())
        }
        FakeProxy::Respond {
            status,
            body,
            delay,
        } => {
            tokio::time::sleep(delay).await;
            let response = format!(
                "HTTP/1.1 {} Fake\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await?;
            stream.shutdown().await
        }
        FakeProxy::Truncated {
            status,
            promised,
            sent,
            delay,
        } => {
            let response = format!(
                "HTTP/1.1 {} Fake\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
                status, promised, sent
            );
            stream.write_all(response.as_bytes()).await?;
            stream.flush().await?;
            tokio::time::sleep(delay).await;
            stream.shutdown().await
        }
    }
}

async fn read_request(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(String::from_utf8_lossy(&buf).into_owned());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
    let content_length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < head_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// A local address with nothing listening on it
pub(crate) async fn unused_local_address() -> CandidateAddress {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);
    CandidateAddress::new(address.to_string())
}

/// Scripted outcome for one address
#[derive(Debug, Clone)]
pub(crate) enum Script {
    Work(Duration),
    Fail(Duration, ProbeFailure),
}

/// Prober that sleeps and answers from a script, recording peak concurrency
#[derive(Debug, Default)]
pub(crate) struct ScriptedProber {
    scripts: HashMap<String, Script>,
    default: Option<Script>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: Mutex<Vec<CandidateAddress>>,
}

impl ScriptedProber {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with(mut self, address: &str, script: Script) -> Self {
        self.scripts.insert(address.to_string(), script);
        self
    }

    pub(crate) fn otherwise(mut self, script: Script) -> Self {
        self.default = Some(script);
        self
    }

    pub(crate) fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn calls(&self) -> Vec<CandidateAddress> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, address: &CandidateAddress) -> ProbeResult {
        self.calls.lock().unwrap().push(address.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let script = self
            .scripts
            .get(address.as_str())
            .or(self.default.as_ref())
            .cloned()
            .unwrap_or(Script::Work(Duration::ZERO));

        let result = match address.endpoint() {
            Err(failure) => ProbeResult::failed(address.clone(), Duration::ZERO, failure),
            Ok(_) => match script {
                Script::Work(latency) => {
                    tokio::time::sleep(latency).await;
                    ProbeResult::working(address.clone(), latency, 200, 0)
                }
                Script::Fail(latency, failure) => {
                    tokio::time::sleep(latency).await;
                    ProbeResult::failed(address.clone(), latency, failure)
                }
            },
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub(crate) fn addresses(raw: &[&str]) -> Vec<CandidateAddress> {
    raw.iter().map(|a| CandidateAddress::new(*a)).collect()
}
