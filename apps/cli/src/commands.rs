//! CLI command implementations

use crate::config::{self, ConfigStore};
use crate::notify::ConsoleNotifier;
use crate::output::{format_bytes, format_limit};
use crate::progress::DownloadProgress;
use crate::{ConfigAction, OutputFormat};
use anyhow::{bail, Context, Result};
use chunkfetch_core::{DownloadManager, HttpTransport, Transport};
use chunkfetch_types::{CoreEvent, DownloadInfo, DownloadState, EngineConfig};
use console::style;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};
use uuid::Uuid;

// ============================================================================
// Download Commands
// ============================================================================

/// Per-invocation settings that win over the stored config
#[derive(Debug, Default, Clone, Copy)]
pub struct Overrides {
    pub speed_limit: Option<u64>,
    pub max_concurrent: Option<usize>,
    pub chunk_size: Option<u64>,
}

impl Overrides {
    fn apply(&self, mut config: EngineConfig) -> EngineConfig {
        if let Some(limit) = self.speed_limit {
            config.speed_limit = limit;
        }
        if let Some(max) = self.max_concurrent {
            config.max_concurrent = max.max(1);
        }
        if let Some(chunk) = self.chunk_size.filter(|&c| c > 0) {
            config.chunk_size = chunk;
        }
        config
    }
}

#[derive(Debug, Serialize)]
struct DownloadResult {
    id: String,
    url: String,
    path: Option<PathBuf>,
    size: u64,
    error: Option<String>,
}

pub async fn get(
    store: &ConfigStore,
    urls: Vec<String>,
    output_dir: Option<PathBuf>,
    overrides: Overrides,
    format: OutputFormat,
) -> Result<()> {
    let config = overrides.apply(store.load().await?);

    let output_dir = match output_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to resolve the current directory")?,
    };
    tokio::fs::create_dir_all(&output_dir)
        .await
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    let progress = Arc::new(DownloadProgress::new(format == OutputFormat::Human));
    let notifier = Arc::new(ConsoleNotifier::new(progress.multi(), format != OutputFormat::Human));
    let transport = Arc::new(HttpTransport::new(&config)?);
    let manager = Arc::new(DownloadManager::with_parts(config, transport, notifier));

    let pump = spawn_event_pump(manager.clone(), progress.clone());
    let interrupt = spawn_interrupt_handler(manager.clone());

    let mut results = Vec::new();
    let mut downloads = JoinSet::new();
    for url in urls {
        let id = Uuid::new_v4().to_string();
        let name = file_name_for(&url);
        let info = DownloadInfo::new(id.clone(), url.clone(), 0).with_name(name.clone());
        progress.add_download(&id, &name);

        let handle = match manager.start_download(info).await {
            Ok(handle) => handle,
            Err(e) => {
                progress.handle_event(&CoreEvent::StateChanged {
                    id: id.clone(),
                    state: DownloadState::Failed,
                    error: Some(e.to_string()),
                });
                results.push(DownloadResult {
                    id,
                    url,
                    path: None,
                    size: 0,
                    error: Some(e.to_string()),
                });
                continue;
            }
        };

        let dir = output_dir.clone();
        downloads.spawn(async move {
            let written = match handle.wait().await {
                Ok(payload) => save_payload(&dir, &name, &payload)
                    .await
                    .map(|path| (path, payload.len() as u64)),
                Err(e) => Err(e.into()),
            };
            match written {
                Ok((path, size)) => DownloadResult {
                    id,
                    url,
                    path: Some(path),
                    size,
                    error: None,
                },
                Err(e) => DownloadResult {
                    id,
                    url,
                    path: None,
                    size: 0,
                    error: Some(format!("{:#}", e)),
                },
            }
        });
    }

    while let Some(joined) = downloads.join_next().await {
        results.push(joined.context("Download task panicked")?);
    }
    pump.abort();
    interrupt.abort();

    print_results(&results, format)?;

    let failed = results.iter().filter(|r| r.error.is_some()).count();
    if failed > 0 {
        bail!("{} of {} download(s) failed", failed, results.len());
    }
    Ok(())
}

/// Forward engine events to the progress bars
fn spawn_event_pump(manager: Arc<DownloadManager>, progress: Arc<DownloadProgress>) -> JoinHandle<()> {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let CoreEvent::StateChanged {
                        id,
                        state: DownloadState::Active,
                        ..
                    } = &event
                    {
                        if let Ok(snapshot) = manager.snapshot(id).await {
                            progress.set_total(id, snapshot.total);
                        }
                    }
                    progress.handle_event(&event);
                }
                Err(RecvError::Lagged(skipped)) => debug!("Progress display skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Cancel everything on Ctrl-C
fn spawn_interrupt_handler(manager: Arc<DownloadManager>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling downloads");
            for snapshot in manager.list().await {
                if let Err(e) = manager.cancel_download(&snapshot.id).await {
                    debug!("Cancel of {} skipped: {}", snapshot.id, e);
                }
            }
        }
    })
}

/// File name for a URL: its last path segment, else its host
fn file_name_for(url: &str) -> String {
    let Ok(parsed) = url::Url::parse(url) else {
        return "download".to_string();
    };

    parsed
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(str::to_string))
        .or_else(|| parsed.host_str().map(str::to_string))
        .unwrap_or_else(|| "download".to_string())
}

/// `dir/name`, or `dir/name (n).ext` if that already exists
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let path = Path::new(name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
    let extension = path.extension().and_then(|e| e.to_str());
    (1..)
        .map(|n| match extension {
            Some(ext) => dir.join(format!("{} ({}).{}", stem, n, ext)),
            None => dir.join(format!("{} ({})", stem, n)),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

async fn save_payload(dir: &Path, name: &str, payload: &[u8]) -> Result<PathBuf> {
    let path = unique_path(dir, name);
    tokio::fs::write(&path, payload)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

fn print_results(results: &[DownloadResult], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(results)?);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct ResultRow {
                file: String,
                size: String,
                status: String,
            }

            let rows: Vec<ResultRow> = results
                .iter()
                .map(|r| ResultRow {
                    file: r
                        .path
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| r.url.clone()),
                    size: format_bytes(r.size),
                    status: r.error.clone().unwrap_or_else(|| "ok".to_string()),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            for result in results {
                match (&result.path, &result.error) {
                    (Some(path), None) => println!(
                        "{} {} ({})",
                        style("✓").green().bold(),
                        path.display(),
                        format_bytes(result.size)
                    ),
                    (_, error) => println!(
                        "{} {}: {}",
                        style("✗").red().bold(),
                        result.url,
                        style(error.as_deref().unwrap_or("failed")).red()
                    ),
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// Probe Commands
// ============================================================================

#[derive(Debug, Serialize)]
struct ProbeResult {
    url: String,
    size: Option<u64>,
    error: Option<String>,
}

pub async fn probe_urls(store: &ConfigStore, urls: Vec<String>, format: OutputFormat) -> Result<()> {
    let config = store.load().await?;
    let transport = HttpTransport::new(&config)?;

    let mut results = Vec::new();
    for url in urls {
        let result = match url::Url::parse(&url) {
            Err(e) => ProbeResult {
                url,
                size: None,
                error: Some(format!("Invalid URL: {}", e)),
            },
            Ok(_) => match transport.probe_size(&url).await {
                Ok(size) => ProbeResult {
                    url,
                    size: Some(size),
                    error: None,
                },
                Err(reason) => ProbeResult {
                    url,
                    size: None,
                    error: Some(reason.to_string()),
                },
            },
        };
        results.push(result);
    }

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct ProbeRow {
                url: String,
                size: String,
            }

            let rows: Vec<ProbeRow> = results
                .iter()
                .map(|r| ProbeRow {
                    url: r.url.clone(),
                    size: match (r.size, &r.error) {
                        (Some(size), _) => format_bytes(size),
                        (None, Some(error)) => error.clone(),
                        (None, None) => "?".to_string(),
                    },
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            for result in &results {
                match (result.size, &result.error) {
                    (Some(size), _) => println!(
                        "{} {}\n    Size: {} ({} bytes)",
                        style("✓").green(),
                        result.url,
                        format_bytes(size),
                        size
                    ),
                    (None, error) => println!(
                        "{} {}: {}",
                        style("✗").red(),
                        result.url,
                        style(error.as_deref().unwrap_or("unknown error")).red()
                    ),
                }
            }
        }
    }

    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn config_action(store: &ConfigStore, action: Option<ConfigAction>, format: OutputFormat) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            let config = store.load().await?;

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&config)?);
                }
                _ => {
                    println!("chunkfetch configuration ({}):", store.path().display());
                    println!();
                    println!("  Chunk size: {}", format_bytes(config.chunk_size));
                    println!("  Max concurrent downloads: {}", config.max_concurrent);
                    println!("  Speed limit: {}", format_limit(config.speed_limit));
                    println!("  Progress interval: {} ms", config.progress_interval_ms);
                    println!("  Connect timeout: {} s", config.connect_timeout_secs);
                    println!("  Request timeout: {} s", config.request_timeout_secs);
                    println!("  User agent: {}", config.user_agent);
                }
            }
        }

        Some(ConfigAction::Get { key }) => {
            let config = store.load().await?;
            match config::get_value(&config, &key)? {
                serde_json::Value::String(s) => println!("{}", s),
                value => println!("{}", value),
            }
        }

        Some(ConfigAction::Set { key, value }) => {
            let config = config::set_value(&store.load().await?, &key, &value)?;
            store.save(&config).await?;
            println!("{} Config updated", style("✓").green().bold());
        }

        Some(ConfigAction::Reset { yes }) => {
            let confirmed = yes
                || dialoguer::Confirm::new()
                    .with_prompt("Reset all settings to defaults?")
                    .default(false)
                    .interact()?;

            if confirmed {
                store.save(&EngineConfig::default()).await?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}
