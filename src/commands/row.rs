use clap::{Args, Subcommand};
use serde_json::Value;
use std::io::{self, Write};

use tablesync_core::{Payload, SyncContext};

use super::OutputFormat;
use crate::config::Config;

#[derive(Args)]
pub struct RowCommand {
    /// Table to operate on (defaults to the configured table)
    #[arg(long, short, global = true)]
    pub table: Option<String>,

    #[command(subcommand)]
    pub command: RowSubcommand,
}

#[derive(Subcommand)]
pub enum RowSubcommand {
    /// Insert a new row
    Insert {
        /// Fields as key=value (string) or key:=json
        #[arg(required = true, value_name = "FIELD")]
        fields: Vec<String>,
    },

    /// Replace fields of an existing row
    Update {
        /// Row ID
        id: String,

        /// Fields as key=value (string) or key:=json
        #[arg(required = true, value_name = "FIELD")]
        fields: Vec<String>,

        /// Drop fields not given instead of keeping them
        #[arg(long)]
        replace: bool,
    },

    /// Delete a row (synced on next push)
    Delete {
        /// Row ID
        id: String,
    },

    /// Remove rows from the local store only, bypassing sync
    Purge {
        /// Row ID; purges the whole table when omitted
        id: Option<String>,

        /// Also discard pending operations when purging a table
        #[arg(long)]
        discard_pending: bool,

        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
    },

    /// Show a row
    Show {
        /// Row ID
        id: String,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// List rows
    List {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,

        /// Only rows where FIELD equals VALUE (key=value or key:=json)
        #[arg(long = "where", value_name = "FIELD")]
        filter: Option<String>,
    },
}

impl RowCommand {
    pub async fn run(
        &self,
        ctx: &SyncContext,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let table = ctx.table(self.table.as_deref().unwrap_or(&config.table.value))?;

        match &self.command {
            RowSubcommand::Insert { fields } => {
                let row = table.insert(parse_fields(fields)?).await?;
                println!("Inserted row:");
                println!("{}", row);
                Ok(())
            }

            RowSubcommand::Update {
                id,
                fields,
                replace,
            } => {
                let mut row = match table.get(id).await? {
                    Some(row) => row,
                    None => return Err(format!("Row not found: {}", id).into()),
                };

                let changes = parse_fields(fields)?;
                if *replace {
                    row.fields = changes;
                } else {
                    row.fields.extend(changes);
                }

                let updated = table.update(&row).await?;
                println!("Updated row:");
                println!("{}", updated);
                Ok(())
            }

            RowSubcommand::Delete { id } => {
                table.delete(id).await?;
                println!("Deleted row: {}", id);
                Ok(())
            }

            RowSubcommand::Purge {
                id,
                discard_pending,
                force,
            } => {
                let prompt = match id {
                    Some(id) => format!("Purge row '{}' from the local store?", id),
                    None => format!("Purge every local row of '{}'?", table.name()),
                };
                if !force && !confirm(&prompt)? {
                    println!("Purge cancelled.");
                    return Ok(());
                }

                match id {
                    Some(id) => {
                        if table.force_purge(id).await? {
                            println!("Purged row: {}", id);
                        } else {
                            println!("No local row: {}", id);
                        }
                    }
                    None => {
                        let removed = table.purge(*discard_pending).await?;
                        println!("Purged {} row(s) from '{}'", removed, table.name());
                    }
                }
                Ok(())
            }

            RowSubcommand::Show { id, format } => match table.get(id).await? {
                Some(row) => {
                    match format {
                        OutputFormat::Json => {
                            println!("{}", serde_json::to_string_pretty(&row)?);
                        }
                        OutputFormat::Text => {
                            println!("{}", row);
                        }
                    }
                    Ok(())
                }
                None => Err(format!("Row not found: {}", id).into()),
            },

            RowSubcommand::List { format, filter } => {
                let rows = match filter {
                    Some(filter) => {
                        let (key, expected) = parse_field(filter)?;
                        table
                            .list_where(|row| row.field(&key) == Some(&expected))
                            .await?
                    }
                    None => table.list().await?,
                };

                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&rows)?);
                    }
                    OutputFormat::Text => {
                        if rows.is_empty() {
                            println!("No rows found");
                            return Ok(());
                        }
                        println!("{:<36}  {:<14}  FIELDS", "ID", "VERSION");
                        println!("{}", "-".repeat(80));
                        for row in &rows {
                            let version = row
                                .version
                                .as_ref()
                                .map(|v| v.to_string())
                                .unwrap_or_else(|| "(local)".to_string());
                            println!(
                                "{:<36}  {:<14}  {}",
                                row.id,
                                version,
                                Value::Object(row.fields.clone())
                            );
                        }
                        println!("\nTotal: {} row(s)", rows.len());
                    }
                }
                Ok(())
            }
        }
    }
}

fn confirm(prompt: &str) -> io::Result<bool> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

/// Parse `key=value` (string) and `key:=json` arguments into a payload.
pub fn parse_fields(args: &[String]) -> Result<Payload, FieldError> {
    let mut fields = Payload::new();
    for arg in args {
        let (key, value) = parse_field(arg)?;
        fields.insert(key, value);
    }
    Ok(fields)
}

fn parse_field(arg: &str) -> Result<(String, Value), FieldError> {
    let Some((key, raw)) = arg.split_once('=') else {
        return Err(FieldError::MissingValue(arg.to_string()));
    };
    let (key, value) = match key.strip_suffix(':') {
        Some(key) => {
            let value = serde_json::from_str(raw)
                .map_err(|e| FieldError::InvalidJson(arg.to_string(), e))?;
            (key, value)
        }
        None => (key, Value::String(raw.to_string())),
    };

    let key = key.trim();
    if key.is_empty() {
        return Err(FieldError::EmptyKey(arg.to_string()));
    }
    Ok((key.to_string(), value))
}

#[derive(Debug)]
pub enum FieldError {
    MissingValue(String),
    EmptyKey(String),
    InvalidJson(String, serde_json::Error),
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldError::MissingValue(arg) => {
                write!(f, "Field '{}' must be key=value or key:=json", arg)
            }
            FieldError::EmptyKey(arg) => write!(f, "Field '{}' has an empty name", arg),
            FieldError::InvalidJson(arg, e) => write!(f, "Field '{}' is not valid JSON: {}", arg, e),
        }
    }
}

impl std::error::Error for FieldError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_string_and_json_fields() {
        let fields = parse_fields(&args(&[
            "name=42",
            "count:=3",
            "tags:=[\"a\",\"b\"]",
            "note=a=b",
        ]))
        .unwrap();

        assert_eq!(fields["name"], json!("42"));
        assert_eq!(fields["count"], json!(3));
        assert_eq!(fields["tags"], json!(["a", "b"]));
        assert_eq!(fields["note"], json!("a=b"));
    }

    #[test]
    fn test_invalid_fields() {
        assert!(matches!(
            parse_fields(&args(&["name"])),
            Err(FieldError::MissingValue(_))
        ));
        assert!(matches!(
            parse_fields(&args(&["=x"])),
            Err(FieldError::EmptyKey(_))
        ));
        let err = parse_fields(&args(&["count:=nope"])).unwrap_err();
        assert!(err.to_string().contains("not valid JSON"));
    }
}
