use clap::Args;
use serde_json::json;
use std::io;

use tablesync_core::{Payload, SyncContext, SyncError};

use super::sync_cmd::print_report;
use crate::config::Config;

/// Walk through a full offline edit and push
#[derive(Args)]
pub struct DemoCommand {
    /// Force-purge the edited row before pushing, to show recovery from a
    /// queue that references a missing row
    #[arg(long)]
    purge: bool,

    /// Exit right after the push instead of waiting for Enter
    #[arg(long)]
    no_wait: bool,
}

impl DemoCommand {
    pub async fn run(
        &self,
        ctx: &SyncContext,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let table = ctx.table(&config.table.value)?;

        let mut fields = Payload::new();
        fields.insert("name".to_string(), json!("24"));
        let row = table.insert(fields).await?;
        println!("Inserted: {}", row);

        let row = table.update(&row.with_field("name", "42")).await?;
        println!("Updated:  {}", row);

        if self.purge {
            table.force_purge(&row.id).await?;
            println!("Force purged {} from the local store", row.id);
        }

        println!();
        println!("Local rows in '{}':", table.name());
        for row in table.list().await? {
            println!("  {}", row);
        }
        println!();

        println!("Pushing to {}...", config.remote.server_url.value);
        match ctx.push().await {
            Ok(report) => {
                print_report(&report);
                for failed in report.errors() {
                    ctx.cancel_and_discard(failed.seq).await?;
                    println!("Cancelled and discarded operation #{}", failed.seq);
                }
            }
            Err(SyncError::Consistency { seq, report, .. }) => {
                print_report(&report);
                println!("Operation #{} refers to a row no longer stored locally", seq);
                ctx.cancel_and_discard(seq).await?;
                println!("Cancelled and discarded operation #{}", seq);
            }
            Err(e) => return Err(e.into()),
        }

        if !self.no_wait {
            println!();
            println!("Press Enter to exit.");
            let mut line = String::new();
            io::stdin().read_line(&mut line)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        demo: DemoCommand,
    }

    #[test]
    fn test_waits_for_operator_by_default() {
        let cli = Cli::parse_from(["demo"]);
        assert!(!cli.demo.no_wait);
        assert!(!cli.demo.purge);

        let cli = Cli::parse_from(["demo", "--purge", "--no-wait"]);
        assert!(cli.demo.no_wait);
        assert!(cli.demo.purge);
    }
}
