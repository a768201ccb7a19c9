//! PwaKit Smoke Harness
//!
//! Drives an offline worker through install, activation, fetches, an
//! offline fallback and a push notification click against a live origin,
//! then prints a JSON summary on stdout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use futures::future::BoxFuture;
use pwakit_common::{init_logging, LogConfig, LogFormat};
use pwakit_net::{LoaderConfig, NetError, NetworkFetcher, Request, ResourceLoader, Response};
use pwakit_sw::{
    CacheStorage, FetchEvent, HostEvent, NotificationClickEvent, NotificationTray, PushEvent,
    ServiceWorkerRegistration, WorkerConfig, WorkerHost,
};
use serde_json::json;
use tracing::{info, warn};
use url::Url;

/// Performance timing collector for tracking operation durations.
#[derive(Default)]
struct PerfTiming {
    timings: Mutex<HashMap<&'static str, Vec<Duration>>>,
}

impl PerfTiming {
    fn record(&self, operation: &'static str, duration: Duration) {
        if let Ok(mut timings) = self.timings.lock() {
            timings.entry(operation).or_default().push(duration);
        }
    }

    fn summary(&self) -> serde_json::Value {
        let mut summary = serde_json::Map::new();
        let Ok(timings) = self.timings.lock() else {
            return serde_json::Value::Object(summary);
        };

        for (op, durations) in timings.iter() {
            if durations.is_empty() {
                continue;
            }

            let count = durations.len();
            let total_ms: f64 = durations.iter().map(|d| d.as_secs_f64() * 1000.0).sum();
            let max_ms = durations
                .iter()
                .map(|d| d.as_secs_f64() * 1000.0)
                .fold(f64::NEG_INFINITY, f64::max);

            summary.insert(
                op.to_string(),
                json!({
                    "count": count,
                    "total_ms": (total_ms * 100.0).round() / 100.0,
                    "avg_ms": (total_ms / count as f64 * 100.0).round() / 100.0,
                    "max_ms": (max_ms * 100.0).round() / 100.0,
                }),
            );
        }

        serde_json::Value::Object(summary)
    }
}

/// Real network with a switch to cut it.
struct SwitchableFetcher {
    inner: ResourceLoader,
    offline: AtomicBool,
}

impl NetworkFetcher for SwitchableFetcher {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
        if self.offline.load(Ordering::SeqCst) {
            let url = request.url.to_string();
            return Box::pin(async move { Err(NetError::Offline(url)) });
        }
        self.inner.fetch(request)
    }
}

/// Parse command line arguments
struct Args {
    origin: Option<String>,
    config: Option<String>,
    db: Option<String>,
    offline: bool,
    push: Option<String>,
    verbose: bool,
    json_logs: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut parsed = Self {
            origin: None,
            config: None,
            db: None,
            offline: false,
            push: None,
            verbose: false,
            json_logs: false,
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--origin" => parsed.origin = args.next(),
                "--config" => parsed.config = args.next(),
                "--db" => parsed.db = args.next(),
                "--offline" => parsed.offline = true,
                "--push" => parsed.push = args.next(),
                "--verbose" | "-v" => parsed.verbose = true,
                "--json-logs" => parsed.json_logs = true,
                _ => {}
            }
        }
        parsed
    }

    fn worker_config(&self) -> anyhow::Result<WorkerConfig> {
        let mut config = match &self.config {
            Some(path) => WorkerConfig::from_file(path)
                .with_context(|| format!("loading worker config from {}", path))?,
            None => WorkerConfig::default(),
        };
        if let Some(origin) = &self.origin {
            config.scope = origin.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_config = if args.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    let log_config = if args.json_logs {
        LogConfig {
            format: LogFormat::Json,
            ..log_config
        }
    } else {
        log_config
    };
    init_logging(log_config)?;

    let config = args.worker_config()?;
    let scope: Url = config.scope_url()?;
    info!(
        scope = %scope,
        cache = %config.cache_name,
        db = ?args.db,
        offline = args.offline,
        "Starting PwaKit smoke harness"
    );

    let storage = match &args.db {
        Some(path) => CacheStorage::open_sqlite(path)?,
        None => CacheStorage::in_memory(),
    };
    let fetcher = Arc::new(SwitchableFetcher {
        inner: ResourceLoader::new(LoaderConfig::default())?,
        offline: AtomicBool::new(false),
    });
    let tray = Arc::new(NotificationTray::new());
    let (host, mut host_events) = WorkerHost::new(storage.clone(), fetcher.clone(), tray.clone());
    let registration = ServiceWorkerRegistration::new(host.clone(), scope.clone());
    let perf = PerfTiming::default();

    let page = host.open_page(scope.clone()).await;

    let started = Instant::now();
    let (worker, report) = registration.register(config.clone()).await?;
    perf.record("register", started.elapsed());
    if !report.is_complete() {
        warn!(failed = report.failed.len(), "App shell not fully cached");
    }

    let mut fetches = Vec::new();
    for url in config.app_shell_urls()? {
        let started = Instant::now();
        let outcome = registration
            .handle_fetch(FetchEvent::from_client(Request::get(url.clone()), page.id.clone()))
            .await;
        perf.record("fetch", started.elapsed());
        fetches.push(json!({
            "url": url.as_str(),
            "source": outcome.source().map(|s| format!("{:?}", s)),
            "status": outcome.response().map(|r| r.status.as_u16()),
        }));
    }
    worker.wait_until_idle().await;

    let offline_probe = if args.offline {
        fetcher.offline.store(true, Ordering::SeqCst);
        let probe = scope.join("pwakit-smoke-offline-probe")?;
        let started = Instant::now();
        let outcome = registration
            .handle_fetch(FetchEvent::new(Request::navigate(probe.clone())))
            .await;
        perf.record("offline_fetch", started.elapsed());
        Some(json!({
            "url": probe.as_str(),
            "source": outcome.source().map(|s| format!("{:?}", s)),
            "network_error": outcome.is_network_error(),
        }))
    } else {
        None
    };

    let started = Instant::now();
    let push = match &args.push {
        Some(text) => PushEvent::new(text.clone()),
        None => PushEvent::new(r#"{"title":"PwaKit smoke","body":"Push delivered"}"#),
    };
    worker.handle_push(push).await?;
    perf.record("push", started.elapsed());

    let Some(shown) = tray.displayed().pop() else {
        bail!("push did not display a notification");
    };
    let started = Instant::now();
    worker
        .handle_notification_click(NotificationClickEvent::new(shown.clone()))
        .await?;
    perf.record("click", started.elapsed());
    worker.wait_until_idle().await;

    let mut events = Vec::new();
    while let Ok(event) = host_events.try_recv() {
        events.push(match event {
            HostEvent::StateChange { worker_id, state } => {
                json!({ "type": "state", "worker": worker_id.to_string(), "state": state })
            }
            HostEvent::CachesDeleted { names } => json!({ "type": "caches_deleted", "names": names }),
            HostEvent::ClientsClaimed { count, .. } => json!({ "type": "claimed", "count": count }),
            HostEvent::NotificationShown { title, tag, .. } => {
                json!({ "type": "notification_shown", "title": title, "tag": tag })
            }
            HostEvent::NotificationClosed { id } => {
                json!({ "type": "notification_closed", "id": id.to_string() })
            }
            HostEvent::ClientNavigated { client_id, url } => {
                json!({ "type": "navigated", "client": client_id, "url": url.as_str() })
            }
            HostEvent::ClientFocused { client_id } => json!({ "type": "focused", "client": client_id }),
            HostEvent::WindowOpened { client_id, url } => {
                json!({ "type": "window_opened", "client": client_id, "url": url.as_str() })
            }
        });
    }

    let summary = json!({
        "scope": scope.as_str(),
        "cache_name": report.cache_name,
        "caches": storage.keys().await?,
        "install": {
            "cached": report.cached.iter().map(Url::as_str).collect::<Vec<_>>(),
            "failed": report
                .failed
                .iter()
                .map(|(url, reason)| json!({ "url": url.as_str(), "reason": reason }))
                .collect::<Vec<_>>(),
        },
        "fetches": fetches,
        "offline_probe": offline_probe,
        "notification": {
            "title": shown.title,
            "tag": shown.options.tag,
            "target": shown.target_url(&config.notifications.url),
        },
        "host_events": events,
        "timings": perf.summary(),
    });

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
