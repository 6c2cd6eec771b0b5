//! Forward HTTP/1.1 proxy server.
//!
//! The server owns the accept loop and per-connection orchestration:
//! parse, authenticate, consult the block-list, serve from cache or
//! forward upstream, and record one access-log line per connection.
//! Dispatch is either task-per-connection or a bounded worker pool,
//! selected by configuration. Shutdown is cooperative: the accept loop
//! polls a watch channel on a one-second accept deadline, then drains
//! in-flight handlers before returning.

use std::io;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{timeout, Duration};

use portway_core::cache::{is_cacheable, make_key, CacheEntry, ResponseCache};
use portway_core::config::{ConcurrencyModel, ConfigError, ProxyConfig};
use portway_http::parse_request;
use portway_observe::{AccessAction, AccessLogger, AccessRecord};
use portway_policy::HostFilter;

mod forwarder;
mod worker_pool;

use worker_pool::WorkerPool;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to load block rules from {path}: {source}")]
    FilterLoad { path: String, source: io::Error },
    #[error("failed to open access log {path}: {source}")]
    LoggerOpen { path: String, source: io::Error },
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("accept failed: {0}")]
    Accept(io::Error),
}

/// Shared per-server state handed to every connection handler.
struct SharedState {
    config: ProxyConfig,
    filter: HostFilter,
    logger: AccessLogger,
    cache: Option<ResponseCache>,
}

pub struct ProxyServer {
    shared: Arc<SharedState>,
}

impl ProxyServer {
    /// Builds the server: loads block rules, opens the access log, and
    /// constructs the cache when caching is enabled.
    pub fn new(config: ProxyConfig) -> Result<Self, ServerError> {
        let filter = HostFilter::new();
        filter
            .load_rules(&config.blocked_domains_file)
            .map_err(|source| ServerError::FilterLoad {
                path: config.blocked_domains_file.clone(),
                source,
            })?;
        let (domain_rules, ip_rules) = filter.rule_counts();
        tracing::info!(domain_rules, ip_rules, "block rules loaded");

        let logger = AccessLogger::open(&config.log_file_path, config.log_max_size_mb).map_err(
            |source| ServerError::LoggerOpen {
                path: config.log_file_path.clone(),
                source,
            },
        )?;

        let cache = config
            .enable_caching
            .then(|| ResponseCache::new(config.cache_max_entries));

        Ok(Self {
            shared: Arc::new(SharedState {
                config,
                filter,
                logger,
                cache,
            }),
        })
    }

    /// Binds the configured listen endpoint.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = format!(
            "{}:{}",
            self.shared.config.listen_address, self.shared.config.listen_port
        );
        TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })
    }

    /// Runs the accept loop until `shutdown_rx` observes `true` or the
    /// listener fails. In-flight connections are drained before this
    /// returns, in both dispatch modes.
    pub async fn run(
        self,
        listener: TcpListener,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        let pool = match self.shared.config.concurrency_model {
            ConcurrencyModel::ThreadPool => {
                let shared = Arc::clone(&self.shared);
                Some(WorkerPool::start(
                    self.shared.config.thread_pool_size,
                    shutdown_rx.clone(),
                    move |stream| handle_connection(Arc::clone(&shared), stream),
                ))
            }
            ConcurrencyModel::ThreadPerConnection => None,
        };

        let mut tasks = JoinSet::new();
        let result = loop {
            if *shutdown_rx.borrow() {
                break Ok(());
            }
            while tasks.try_join_next().is_some() {}

            // The accept deadline is what lets shutdown be observed on
            // an otherwise idle listener.
            match timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
                Err(_elapsed) => continue,
                Ok(Err(error)) => break Err(ServerError::Accept(error)),
                Ok(Ok((stream, _peer))) => match &pool {
                    Some(pool) => pool.submit(stream),
                    None => {
                        let shared = Arc::clone(&self.shared);
                        tasks.spawn(handle_connection(shared, stream));
                    }
                },
            }
        };

        drop(listener);
        if let Some(pool) = pool {
            pool.shutdown().await;
        }
        while tasks.join_next().await.is_some() {}
        if let Err(error) = self.shared.logger.flush() {
            tracing::warn!("access log flush failed during shutdown: {error}");
        }
        result
    }
}

include!("connection.rs");
