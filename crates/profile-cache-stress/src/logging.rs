use std::collections::BTreeMap;
use std::env;
use std::future::Future;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::pin::Pin;

use anyhow::{Context, Result};
use profile_cache::{logging, metrics};

#[derive(Debug, Default)]
pub struct Config {
    pub backtraces: bool,
    pub sentry: bool,
    pub tracing: bool,
    pub metrics: bool,
}

/// A local endpoint swallowing whatever sentry or statsd send to it.
type Sink = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Default)]
pub struct Guard {
    sentry: Option<sentry::ClientInitGuard>,
    pub http_sink: Option<Sink>,
    pub udp_sink: Option<Sink>,
}

/// Enables sentry, tracing and metrics as requested, reporting into local sinks.
///
/// The sinks in the returned [`Guard`] need to be spawned once a runtime exists.
pub fn init(config: Config) -> Result<Guard> {
    if config.backtraces {
        // SAFETY: called at startup, before any other thread is spawned.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let mut guard = Guard::default();
    if config.sentry {
        let (client, sink) = init_sentry()?;
        guard.sentry = Some(client);
        guard.http_sink = Some(sink);
    }

    if config.tracing {
        // the full JSON formatting runs for every event, but the output is discarded
        logging::init_json_logging("INFO", || NoopWriter);
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("WARN")
            .with_writer(std::io::stderr)
            .init();
    }

    if config.metrics {
        guard.udp_sink = Some(init_metrics()?);
    }

    Ok(guard)
}

fn init_sentry() -> Result<(sentry::ClientInitGuard, Sink)> {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .context("failed to bind sentry sink")?;
    listener.set_nonblocking(true)?;
    let port = listener.local_addr()?.port();

    let sink: Sink = Box::pin(async move {
        use axum::handler::HandlerWithoutStateExt;

        async fn accept() -> &'static str {
            "OK"
        }

        let Ok(listener) = tokio::net::TcpListener::from_std(listener) else {
            return;
        };
        if let Err(error) = axum::serve(listener, accept.into_make_service()).await {
            tracing::error!(error = &error as &dyn std::error::Error, "Sentry sink failed");
        }
    });

    let client = sentry::init((
        format!("http://stress@127.0.0.1:{port}/1"),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            traces_sample_rate: 1.0,
            ..Default::default()
        },
    ));
    Ok((client, sink))
}

fn init_metrics() -> Result<Sink> {
    let socket = UdpSocket::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .context("failed to bind metrics sink")?;
    socket.set_nonblocking(true)?;
    let host = format!("127.0.0.1:{}", socket.local_addr()?.port());

    let sink: Sink = Box::pin(async move {
        let Ok(socket) = tokio::net::UdpSocket::from_std(socket) else {
            return;
        };
        let mut buf = Vec::with_capacity(1024);
        loop {
            buf.clear();
            if socket.recv_buf(&mut buf).await.is_err() {
                break;
            }
        }
    });

    let tags = BTreeMap::from([("env".to_owned(), "stresstest".to_owned())]);
    metrics::configure_statsd("profile_cache", host, tags)
        .context("failed to configure metrics")?;
    Ok(sink)
}

struct NoopWriter;

impl Write for NoopWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // keep the formatted output observable so it is not optimized out
        Ok(std::hint::black_box(buf).len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
