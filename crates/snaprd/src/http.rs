//! HTTP retrieval, grounded on the same shape as a background-thread fetch
//! client: a dedicated Tokio runtime thread drives the request and streams
//! chunks to a bounded channel, so the single-threaded state machine can
//! drain progress non-blockingly from `advance()`. An [`AbortHandle`] lets
//! the state machine cancel an in-flight download (e.g. on a malformed
//! downstream signal) without waiting on the background thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use hyper::{Body, Client, Request, Uri};
use url::Url;

#[derive(Debug)]
pub enum HttpEvent {
    Data(Vec<u8>),
    Redirect(Url),
    Eof { total_size: Option<u64> },
    Error(String),
}

#[derive(Clone)]
pub struct AbortHandle {
    abort: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}

/// An injectable fetch source, so the state machine can be exercised with a
/// deterministic test double instead of real sockets.
pub trait Transport {
    fn start(&mut self, url: Url);
    fn poll(&mut self) -> Option<HttpEvent>;
    fn cancel(&mut self);
}

#[derive(Default)]
pub struct HyperTransport {
    channel: Option<(Receiver<HttpEvent>, AbortHandle)>,
}

impl Transport for HyperTransport {
    fn start(&mut self, url: Url) {
        self.cancel();
        self.channel = Some(spawn_fetch(url));
    }

    fn poll(&mut self) -> Option<HttpEvent> {
        let (rx, _) = self.channel.as_ref()?;
        rx.try_recv().ok()
    }

    fn cancel(&mut self) {
        if let Some((_, abort)) = self.channel.take() {
            abort.abort();
        }
    }
}

fn spawn_fetch(url: Url) -> (Receiver<HttpEvent>, AbortHandle) {
    let (tx, rx) = bounded(64);
    let abort = Arc::new(AtomicBool::new(false));
    let handle = AbortHandle { abort: abort.clone() };

    thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                let _ = tx.send(HttpEvent::Error(e.to_string()));
                return;
            }
        };
        rt.block_on(fetch_loop(url, tx, abort));
    });

    (rx, handle)
}

async fn fetch_loop(url: Url, tx: Sender<HttpEvent>, abort: Arc<AtomicBool>) {
    use futures::StreamExt;

    let uri: Uri = match url.as_str().parse() {
        Ok(u) => u,
        Err(e) => {
            let _ = tx.send(HttpEvent::Error(e.to_string()));
            return;
        }
    };

    let client = Client::new();
    let req = match Request::get(uri).body(Body::empty()) {
        Ok(r) => r,
        Err(e) => {
            let _ = tx.send(HttpEvent::Error(e.to_string()));
            return;
        }
    };

    let resp = match client.request(req).await {
        Ok(r) => r,
        Err(e) => {
            let _ = tx.send(HttpEvent::Error(e.to_string()));
            return;
        }
    };

    if let Some(loc) = resp.headers().get(hyper::header::LOCATION) {
        if let Ok(loc) = loc.to_str() {
            if let Ok(redirect) = url.join(loc) {
                let _ = tx.send(HttpEvent::Redirect(redirect));
                return;
            }
        }
    }

    let total_size = resp
        .headers()
        .get(hyper::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let mut body = resp.into_body();
    while let Some(chunk) = body.next().await {
        if abort.load(Ordering::SeqCst) {
            return;
        }
        match chunk {
            Ok(bytes) => {
                if tx.send(HttpEvent::Data(bytes.to_vec())).is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(HttpEvent::Error(e.to_string()));
                return;
            }
        }
    }
    let _ = tx.send(HttpEvent::Eof { total_size });
}
