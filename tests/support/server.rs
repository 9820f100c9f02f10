//! A small upstream HTTP server for proxy tests.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use tokio::sync::oneshot;

pub struct TestServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn uri(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Number of requests the server has answered.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Spawns an upstream server answering every request with `handler`.
pub async fn http<F>(handler: F) -> TestServer
where
    F: Fn(Request<Body>) -> Response<Body> + Clone + Send + Sync + 'static,
{
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_in_service = hits.clone();

    let make_service = make_service_fn(move |_conn| {
        let handler = handler.clone();
        let hits = hits_in_service.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |request| {
                hits.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Ok::<_, Infallible>(handler(request)))
            }))
        }
    });

    let server = hyper::Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_service);
    let addr = server.local_addr();

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        if let Err(err) = graceful.await {
            eprintln!("test server error: {err}");
        }
    });

    TestServer {
        addr,
        hits,
        shutdown: Some(shutdown_tx),
    }
}
