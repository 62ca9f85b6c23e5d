//! `tenon serve`: run the HTTP server

use crate::config::Settings;
use crate::routes;
use anyhow::Context;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tenon_core::Executor;
use tenon_web::{
    Components, ConnectionHandler, HttpConnectionHandler, Server, TcpConnectionProvider,
};

/// Command-line overrides for `serve`
#[derive(Debug, Default)]
pub struct ServeOptions {
    pub config: Option<PathBuf>,
    pub addr: Option<SocketAddr>,
    pub threads: Option<usize>,
    pub duration: Option<u64>,
}

pub fn execute(options: ServeOptions) -> anyhow::Result<()> {
    let mut settings = match &options.config {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Settings::default(),
    };
    if let Some(addr) = options.addr {
        settings.listen.addr = addr;
    }
    if let Some(threads) = options.threads {
        settings.executor.workers = Some(threads);
    }
    settings.validate()?;

    let executor = Arc::new(Executor::new(settings.executor.to_executor_config())?);
    executor.start()?;

    let components = Components::builder(routes::router(executor.clone()))
        .interceptor(routes::access_log)
        .config(settings.server.clone())
        .build();
    let handler = Arc::new(HttpConnectionHandler::with_executor(
        components,
        executor.clone(),
    ));
    let provider = TcpConnectionProvider::bind(settings.listen.addr)
        .with_context(|| format!("binding {}", settings.listen.addr))?
        .with_accept_wait(settings.listen.accept_wait);

    println!(
        "tenon listening on http://{} ({} workers)",
        provider.local_addr(),
        executor.worker_count()
    );

    let server = Server::new(Arc::new(provider), handler.clone());
    match options.duration {
        Some(secs) => {
            server.run(true)?;
            thread::sleep(Duration::from_secs(secs));
            server.stop();
        }
        None => server.run(false)?,
    }

    handler.stop();
    let stats = executor.stats();
    log::info!(
        "served {} connection(s): {} completed, {} failed, {} cancelled",
        stats.spawned,
        stats.completed,
        stats.failed,
        stats.cancelled
    );
    Ok(())
}
