//! Sync CLI commands for exchanging changes with the table service.

use clap::{Args, Subcommand};

use tablesync_core::{OperationOutcome, PushReport, SyncContext, SyncResult};

use super::OutputFormat;
use crate::config::Config;

/// Sync with remote server
#[derive(Args)]
pub struct SyncCommand {
    /// Table to sync (defaults to the configured table)
    #[arg(long, short, global = true)]
    table: Option<String>,

    #[command(subcommand)]
    command: SyncSubcommand,
}

#[derive(Subcommand)]
enum SyncSubcommand {
    /// Send pending operations to the server
    Push {
        /// Push every table instead of one
        #[arg(long)]
        all: bool,
    },

    /// Fetch rows changed on the server since the last pull
    Pull,

    /// List queued operations
    Pending {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Drop a queued operation
    Discard {
        /// Sequence number of the operation
        seq: i64,

        /// Also remove the local row the operation refers to
        #[arg(long)]
        drop_row: bool,
    },

    /// Show sync configuration and queue state
    Status,
}

impl SyncCommand {
    pub async fn run(
        &self,
        ctx: &SyncContext,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let table = ctx.table(self.table.as_deref().unwrap_or(&config.table.value))?;

        match &self.command {
            SyncSubcommand::Push { all } => {
                println!("Pushing to {}...", config.remote.server_url.value);
                let report = if *all {
                    ctx.push().await?
                } else {
                    table.push().await?
                };
                print_report(&report);
                Ok(())
            }

            SyncSubcommand::Pull => {
                println!(
                    "Pulling '{}' from {}...",
                    table.name(),
                    config.remote.server_url.value
                );
                let report = table.pull().await?;
                println!(
                    "  ✓ {} received, {} upserted, {} deleted, {} skipped (pending local changes)",
                    report.received, report.upserted, report.deleted, report.skipped
                );
                Ok(())
            }

            SyncSubcommand::Pending { format } => {
                let ops = ctx.pending_operations().await?;
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&ops)?);
                    }
                    OutputFormat::Text => {
                        if ops.is_empty() {
                            println!("No pending operations");
                            return Ok(());
                        }
                        for op in &ops {
                            println!("{}", op);
                        }
                        println!("\nTotal: {} operation(s)", ops.len());
                    }
                }
                Ok(())
            }

            SyncSubcommand::Discard { seq, drop_row } => {
                if *drop_row {
                    ctx.cancel_and_discard(*seq).await?;
                    println!("Discarded operation #{} and its local row", seq);
                } else {
                    ctx.discard_operation(*seq).await?;
                    println!("Discarded operation #{}", seq);
                }
                Ok(())
            }

            SyncSubcommand::Status => {
                println!("Sync Configuration");
                println!("==================");
                println!();
                println!("Server:    {}", config.remote.server_url.value);
                println!("Client ID: {}", ctx.client_id());
                println!("Table:     {}", table.name());
                println!();
                println!("Pending (table): {}", table.pending().await?.len());
                println!("Pending (all):   {}", ctx.pending_operations().await?.len());
                Ok(())
            }
        }
    }
}

/// Print one line per drained operation and a summary.
pub fn print_report(report: &PushReport) {
    for outcome in &report.outcomes {
        println!("  {}", describe(outcome));
    }
    if report.outcomes.is_empty() {
        println!("  Nothing to push.");
    }
    println!();
    println!(
        "Push {}: {} applied, {} not applied, {} still queued{}",
        if report.is_success() {
            "succeeded"
        } else {
            "partially failed"
        },
        report.applied(),
        report.errors().count(),
        report.remaining,
        if report.cancelled { " (cancelled)" } else { "" }
    );
}

fn describe(outcome: &OperationOutcome) -> String {
    let target = format!(
        "#{} {} {}/{}",
        outcome.seq, outcome.kind, outcome.table, outcome.row_id
    );
    match &outcome.result {
        SyncResult::Applied { version: Some(v) } => format!("✓ {} -> version {}", target, v),
        SyncResult::Applied { version: None } => format!("✓ {}", target),
        SyncResult::Conflicted(conflict) => format!(
            "✗ {} conflict: local {} vs server {}",
            target, conflict.local, conflict.server.row
        ),
        SyncResult::Failed { reason, retryable } => format!(
            "✗ {} {}: {}",
            target,
            if *retryable { "will retry" } else { "failed" },
            reason
        ),
    }
}
