use std::{
    env, fs, io,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

use dispatchx::{
    DispatcherDeps, DispatcherService, PluginLoader, ServiceRecord,
    config::{Config, ConfigUpdate, load_or_default},
    delivery::HttpSouthDelivery,
    logging,
    registry::{CoreClient, STORAGE_TYPE, ServiceRegistry},
    server,
    service::SERVICE_TYPE,
    storage::HttpStorageTables,
};

const DAEMON_ENV: &str = "DISPATCHX_DAEMON";

/// Control dispatcher service: accepts control writes and operations,
/// runs them through filter pipelines and delivers them to southbound
/// services.
#[derive(Parser)]
#[command(name = "dispatchx", version, about)]
struct Cli {
    /// Run in the foreground instead of daemonising
    #[arg(short = 'd', long = "foreground")]
    foreground: bool,

    /// Address of the core registry service
    #[arg(long)]
    address: Option<String>,

    /// Port of the core registry service
    #[arg(long)]
    port: Option<u16>,

    /// Name this service registers under
    #[arg(long)]
    name: Option<String>,

    /// Minimum log level (error, warning, info, debug)
    #[arg(long = "logLevel", alias = "log-level")]
    log_level: Option<String>,

    /// Bearer token presented to the core when registering
    #[arg(long)]
    token: Option<String>,

    /// Validate configuration, storage and pipelines, then exit
    #[arg(long = "dryrun", alias = "dry-run")]
    dryrun: bool,

    /// Path to the configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, _config_path) = load_or_default(cli.config.clone())?;
    config.apply_update(ConfigUpdate {
        name: cli.name.clone(),
        core_address: cli.address.clone(),
        core_port: cli.port,
        log_level: cli.log_level.clone(),
        token: cli.token.clone(),
    });

    if !cli.foreground && !cli.dryrun && env::var(DAEMON_ENV).is_err() {
        return daemonize(&config);
    }

    run(config, cli.dryrun).await
}

async fn run(config: Config, dryrun: bool) -> Result<()> {
    let log_handle = logging::init(Some(config.log_dir()), &config.log_level)?;

    let pid_path = config.pid_file_path();
    let _pid_guard = PidFileGuard::new(&pid_path)?;

    let service = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || build_service(config)).await??
    };
    service.set_log_handle(log_handle);

    if dryrun {
        let service = service.clone();
        tokio::task::spawn_blocking(move || service.dry_run())
            .await?
            .context("dry run failed")?;
        info!("dry run completed");
        return Ok(());
    }

    let listener = TcpListener::bind((config.listen_address.as_str(), config.listen_port))
        .await
        .with_context(|| {
            format!(
                "unable to bind {}:{}",
                config.listen_address, config.listen_port
            )
        })?;
    let local_addr = listener.local_addr()?;
    info!("dispatcher ingress listening on {}", local_addr);

    let record = {
        let mut record = ServiceRecord::new(&config.name, SERVICE_TYPE, "localhost", local_addr.port());
        if let Some(token) = &config.token {
            record = record.with_token(token);
        }
        record
    };
    {
        let service = service.clone();
        tokio::task::spawn_blocking(move || service.start(record))
            .await?
            .context("dispatcher service failed to start")?;
    }

    let remove_from_core = server::run(service.clone(), listener, config.auth_enabled).await?;
    tokio::task::spawn_blocking(move || service.shutdown(remove_from_core)).await?;
    info!("dispatcher service '{}' stopped", config.name);
    Ok(())
}

/// Wire the HTTP collaborators and assemble the service. Runs off the
/// async runtime because the clients are blocking.
fn build_service(config: Config) -> Result<Arc<DispatcherService>> {
    let core = Arc::new(CoreClient::new(
        &config.core_address,
        config.core_port,
        config.token.clone(),
    )?);

    let storage_record = core
        .services_by_type(STORAGE_TYPE)?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no storage service registered with the core"))?;
    info!(
        "connecting to storage on {}:{}",
        storage_record.address, storage_record.port
    );
    let storage = Arc::new(HttpStorageTables::new(storage_record.base_url())?);

    let delivery = Arc::new(HttpSouthDelivery::new(Duration::from_secs(
        config.outbound_timeout_secs,
    ))?);

    let deps = DispatcherDeps {
        registry: core.clone(),
        config_store: core.clone(),
        assets: core,
        storage,
        delivery,
    };
    Ok(DispatcherService::new(
        config.name.clone(),
        deps,
        Arc::new(PluginLoader::new()),
    ))
}

/// Detach by re-exec'ing this binary with a marker in the environment,
/// then report the child pid once it survives its first moments.
fn daemonize(config: &Config) -> Result<()> {
    let pid_path = config.pid_file_path();
    ensure_pid_slot(&pid_path)?;

    let args: Vec<String> = env::args().skip(1).collect();
    let mut command = Command::new(env::current_exe()?);
    command
        .args(&args)
        .env(DAEMON_ENV, "1")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let mut child = command.spawn()?;
    let pid = child.id();

    let wait_deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if let Some(status) = child.try_wait()? {
            return Err(anyhow!(
                "dispatcher failed to start (process exited with status {}). \
                 Re-run with -d for details.",
                status.code().unwrap_or(-1)
            ));
        }
        if Instant::now() >= wait_deadline {
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }

    write_pid_record(&pid_path, &PidRecord { pid })?;
    drop(child);

    println!("dispatcher service '{}' running (pid {})", config.name, pid);
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct PidRecord {
    pid: u32,
}

struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    fn new(path: &Path) -> Result<Self> {
        write_pid_record(
            path,
            &PidRecord {
                pid: std::process::id(),
            },
        )?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn write_pid_record(path: &Path, record: &PidRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string(record)?)?;
    Ok(())
}

fn read_pid_record(path: &Path) -> Result<Option<PidRecord>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if let Ok(record) = serde_json::from_str::<PidRecord>(trimmed) {
        return Ok(Some(record));
    }
    if let Ok(pid) = trimmed.parse::<u32>() {
        return Ok(Some(PidRecord { pid }));
    }
    Err(anyhow!("invalid pid file at {}", path.display()))
}

fn ensure_pid_slot(pid_path: &Path) -> Result<()> {
    if let Some(existing) = read_pid_record(pid_path)? {
        if process_is_running(existing.pid) {
            return Err(anyhow!(
                "dispatcher already running (pid {})",
                existing.pid
            ));
        }
        fs::remove_file(pid_path)?;
    }
    Ok(())
}

#[cfg(unix)]
fn process_is_running(pid: u32) -> bool {
    unsafe {
        if libc::kill(pid as libc::pid_t, 0) == 0 {
            true
        } else {
            let err = io::Error::last_os_error();
            !matches!(err.raw_os_error(), Some(libc::ESRCH))
        }
    }
}

#[cfg(not(unix))]
fn process_is_running(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn pid_records_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dispatchx.pid");

        assert!(read_pid_record(&path).unwrap().is_none());
        write_pid_record(&path, &PidRecord { pid: 4242 }).unwrap();
        assert_eq!(read_pid_record(&path).unwrap().unwrap().pid, 4242);
    }

    #[test]
    fn bare_pid_files_are_accepted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dispatchx.pid");
        fs::write(&path, "1234").unwrap();
        assert_eq!(read_pid_record(&path).unwrap().unwrap().pid, 1234);
    }

    #[test]
    fn pid_guard_cleans_up_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dispatchx.pid");
        {
            let _guard = PidFileGuard::new(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
