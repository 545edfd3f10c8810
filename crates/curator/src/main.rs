use std::env;
use std::path::PathBuf;

use curator::activity::ActivityLog;
use curator::config::{config_path_from_env, TaskId};
use curator::state::ScanStatus;
use curator::{bootstrap, init_tracing, scan, scheduler, tasks};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let activity = ActivityLog::default();
    init_tracing(&activity);

    let config_path = config_path_from_env();
    let state = bootstrap(&config_path, activity)?;

    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        None | Some("serve") => {
            scheduler::start_scheduler(&state).await?;
            info!("Curator running; waiting for scheduled tasks");
            shutdown_signal().await;
            scheduler::stop_scheduler(&state).await;
        }
        Some("scan") => {
            let target = args.next().map(PathBuf::from);
            scan::start_scan(&state, target)?.await?;
            print_status(&state);
            for group in &state.working.read().candidates {
                println!("--- {}", group.token());
                for file in &group.files {
                    println!("    {}", file.path);
                }
            }
        }
        Some("analyze") => {
            let groups = scan::regroup(&state);
            info!("Analyzing {} groups from the cached library", groups);
            scan::start_analysis(&state)?.await?;
            print_status(&state);
            for result in &state.working.read().results {
                let keeper = result.keeper().map(|f| f.path.as_str()).unwrap_or("-");
                println!("--- keep {} ({})", keeper, result.reason);
                for file in &result.files {
                    println!("    {}", file.path);
                }
            }
        }
        Some("run") => {
            let name = args.next().ok_or("usage: curator run <task>")?;
            let id = TaskId::parse(&name).ok_or_else(|| format!("unknown task {}", name))?;
            let report = tasks::run_task(&state, id).await?;
            println!(
                "{}: examined {}, deleted {}, written {}, failed {}",
                id,
                report.examined,
                report.deleted.len(),
                report.written.len(),
                report.failed.len()
            );
        }
        Some(other) => {
            return Err(format!("unknown command {} (serve | scan [path] | analyze | run <task>)", other).into());
        }
    }
    Ok(())
}

fn print_status(state: &curator::state::AppState) {
    let scan = state.scan_state();
    if scan.status == ScanStatus::Error {
        warn!("{}", scan.message);
    }
    println!("{}", scan.message);
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("Failed to install terminate signal handler: {}", err);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", err);
        }
    }

    info!("Shutdown signal received.");
}
