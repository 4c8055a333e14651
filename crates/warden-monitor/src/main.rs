//! # wardenmon
//!
//! Offline diagnostics for the sandbox observation core: replays a recorded
//! JSON-lines event trace through a [`Sandbox`] and prints the reports each
//! client would have received, plus the final tracker snapshot.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use warden_config::logging::{init_logging, LogLevel};
use warden_config::Config;
use warden_core::{FileOperation, Sandbox};
use warden_manifest::FileAccessManifest;
use warden_report::AccessReport;

#[derive(Parser)]
#[command(name = "wardenmon")]
#[command(version, about = "Warden sandbox monitor", long_about = None)]
struct Cli {
    /// Config file to use instead of the standard locations
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSON-lines event trace through the sandbox core
    Replay {
        /// Trace file, one event object per line
        #[arg(value_name = "TRACE")]
        trace: PathBuf,

        /// Emit reports and the snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration as TOML
    Config,
}

/// One recorded hook invocation.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum TraceEvent {
    ClientConnected {
        client_pid: u32,
    },
    ClientDisconnected {
        client_pid: u32,
    },
    PipStarted {
        root_pid: u32,
        manifest: FileAccessManifest,
    },
    Forked {
        parent_pid: u32,
        child_pid: u32,
    },
    Execed {
        pid: u32,
        #[serde(default)]
        manifest: Option<FileAccessManifest>,
    },
    Exited {
        pid: u32,
    },
    FileOp {
        pid: u32,
        path: String,
        op: FileOpKind,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FileOpKind {
    Lookup,
    Probe,
    Read,
    Write,
    Enumerate,
    Mkdir,
}

impl From<FileOpKind> for FileOperation {
    fn from(kind: FileOpKind) -> Self {
        match kind {
            FileOpKind::Lookup => FileOperation::Lookup,
            FileOpKind::Probe => FileOperation::Probe,
            FileOpKind::Read => FileOperation::Read,
            FileOpKind::Write => FileOperation::Write,
            FileOpKind::Enumerate => FileOperation::Enumerate,
            FileOpKind::Mkdir => FileOperation::CreateDirectory,
        }
    }
}

/// Flattened report view for machine-readable output.
#[derive(Debug, Serialize)]
struct ReportView {
    operation: String,
    status: u32,
    client_pid: u32,
    pid: u32,
    root_pid: u32,
    pip_id: u64,
    path: String,
}

impl From<&AccessReport> for ReportView {
    fn from(report: &AccessReport) -> Self {
        ReportView {
            operation: report
                .operation()
                .map(|op| op.name().to_string())
                .unwrap_or_else(|| format!("unknown({})", report.operation)),
            status: report.status,
            client_pid: report.client_pid,
            pid: report.pid,
            root_pid: report.root_pid,
            pip_id: report.pip_id,
            path: report.path_str().to_string(),
        }
    }
}

fn main() -> Result<()> {
    init_logging(LogLevel::Info);
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };

    match cli.command {
        Commands::Replay { trace, json } => replay(config, &trace, json),
        Commands::Config => {
            print!("{}", toml_of(&config)?);
            Ok(())
        }
    }
}

fn toml_of(config: &Config) -> Result<String> {
    let rendered = toml::to_string_pretty(config).context("failed to render configuration")?;
    Ok(rendered)
}

fn parse_trace(contents: &str) -> Result<Vec<TraceEvent>> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(number, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("malformed trace event on line {}", number + 1))
        })
        .collect()
}

fn replay(config: Config, trace: &Path, json: bool) -> Result<()> {
    let contents = std::fs::read_to_string(trace)
        .with_context(|| format!("failed to read trace {}", trace.display()))?;
    let events = parse_trace(&contents)?;

    let sandbox = Sandbox::new(config);
    let mut clients = BTreeSet::new();

    for event in events {
        apply(&sandbox, &mut clients, event);
    }

    // Drain every queue each client still owns.
    let mut reports: Vec<ReportView> = Vec::new();
    for &client_pid in &clients {
        while let Ok(handle) = sandbox.memory_handle(client_pid) {
            let mut batch = Vec::new();
            handle.pop_batch(&mut batch, handle.capacity());
            reports.extend(batch.iter().map(ReportView::from));
        }
    }

    let snapshot = sandbox.introspect();
    if json {
        let pips: Vec<serde_json::Value> = snapshot
            .pips
            .iter()
            .map(|pip| {
                serde_json::json!({
                    "pid": pip.pid,
                    "client_pid": pip.client_pid,
                    "pip_id": pip.pip_id.0,
                    "tree_size": pip.tree_size,
                    "cache_entries": pip.cache_entries,
                    "process_path": pip.process_path,
                })
            })
            .collect();
        let output = serde_json::json!({
            "reports": reports,
            "snapshot": {
                "pips": pips,
                "tracked_processes": snapshot.tracked_processes,
                "connected_clients": snapshot.connected_clients,
            },
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{} report(s):", reports.len());
        for report in &reports {
            println!(
                "  {:<22} client={} pid={} root={} pip={:#x} status={} {}",
                report.operation,
                report.client_pid,
                report.pid,
                report.root_pid,
                report.pip_id,
                report.status,
                report.path
            );
        }
        println!(
            "snapshot: {} tracked process(es), {} connected client(s)",
            snapshot.tracked_processes, snapshot.connected_clients
        );
        for pip in &snapshot.pips {
            println!(
                "  pip {:#x} root={} client={} tree_size={} cached_paths={} {}",
                pip.pip_id.0,
                pip.pid,
                pip.client_pid,
                pip.tree_size,
                pip.cache_entries,
                pip.process_path
            );
        }
    }
    Ok(())
}

fn apply(sandbox: &Sandbox, clients: &mut BTreeSet<u32>, event: TraceEvent) {
    match event {
        TraceEvent::ClientConnected { client_pid } => {
            if let Err(err) = sandbox.on_client_connected(client_pid) {
                warden_config::log_monitor_info!("client connect failed", error = err.to_string());
            } else {
                clients.insert(client_pid);
            }
        }
        TraceEvent::ClientDisconnected { client_pid } => {
            let _ = sandbox.on_client_disconnected(client_pid);
            clients.remove(&client_pid);
        }
        TraceEvent::PipStarted { root_pid, manifest } => {
            sandbox.on_pip_started(root_pid, std::sync::Arc::new(manifest));
        }
        TraceEvent::Forked {
            parent_pid,
            child_pid,
        } => {
            sandbox.on_process_forked(parent_pid, child_pid);
        }
        TraceEvent::Execed { pid, manifest } => {
            sandbox.on_process_execed(pid, manifest.map(std::sync::Arc::new));
        }
        TraceEvent::Exited { pid } => {
            sandbox.on_process_exited(pid);
        }
        TraceEvent::FileOp { pid, path, op } => {
            sandbox.on_file_operation(pid, &path, op.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trace_events() {
        let trace = r#"
{"event":"client_connected","client_pid":50}
{"event":"pip_started","root_pid":100,"manifest":{"pip_id":10,"client_pid":50,"process_path":"/usr/bin/make","scopes":[],"default_policy":{"allowed":63,"report":true}}}
{"event":"forked","parent_pid":100,"child_pid":101}
{"event":"file_op","pid":101,"path":"/src/main.c","op":"read"}
{"event":"exited","pid":101}
{"event":"exited","pid":100}
"#;
        let events = parse_trace(trace).unwrap();
        assert_eq!(events.len(), 6);
        assert!(matches!(events[0], TraceEvent::ClientConnected { client_pid: 50 }));
        assert!(matches!(
            events[3],
            TraceEvent::FileOp {
                op: FileOpKind::Read,
                ..
            }
        ));
    }

    #[test]
    fn test_malformed_trace_line_is_an_error() {
        let err = parse_trace("{\"event\":\"exited\"}").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_replay_end_to_end() {
        let trace = r#"
{"event":"client_connected","client_pid":50}
{"event":"pip_started","root_pid":100,"manifest":{"pip_id":10,"client_pid":50,"process_path":"/usr/bin/make","scopes":[],"default_policy":{"allowed":63,"report":true}}}
{"event":"forked","parent_pid":100,"child_pid":101}
{"event":"file_op","pid":101,"path":"/src/main.c","op":"read"}
{"event":"file_op","pid":101,"path":"/src/main.c","op":"read"}
{"event":"exited","pid":101}
{"event":"exited","pid":100}
"#;
        let events = parse_trace(trace).unwrap();
        let mut config = Config::default();
        config.queue.size_mb = 1;
        let sandbox = Sandbox::new(config);
        let mut clients = BTreeSet::new();
        for event in events {
            apply(&sandbox, &mut clients, event);
        }

        let handle = sandbox.memory_handle(50).unwrap();
        let mut batch = Vec::new();
        handle.pop_batch(&mut batch, 64);
        let ops: Vec<_> = batch.iter().filter_map(|r| r.operation()).collect();
        // One fork, one deduplicated read, two exits, one completion.
        assert_eq!(ops.len(), 5);
        assert_eq!(
            ops.last().copied(),
            Some(warden_report::ReportOperation::ProcessTreeCompleted)
        );
        assert_eq!(sandbox.introspect().tracked_processes, 0);
    }
}
