//! The `lager` command line: fetch records over HTTP and print them as JSON lines.

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use thiserror::Error;

use lager_core::Adapter;
use lager_store::{FindOptions, RecordRef, Store, StoreError};

#[derive(Parser, Debug)]
#[command(
    name = "lager",
    version,
    about = "Fetch JSON:API records and print them as JSON lines",
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Fetch one record by type and id.
    Find { model: String, id: String },
    /// Fetch every record of a type.
    All { model: String },
}

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Run `command` against `store`, returning one JSON object per record.
pub async fn run<A: Adapter>(store: &Store<A>, command: &Command) -> Result<Vec<Value>, CliError> {
    let records = match command {
        Command::Find { model, id } => {
            vec![store.find_record(model.as_str(), id, FindOptions::default()).await?]
        }
        Command::All { model } => store
            .find_all(model.as_str(), FindOptions::reload())
            .await?
            .records(),
    };
    tracing::info!("Fetched {} record(s)", records.len());
    Ok(records.iter().map(record_line).collect())
}

/// `{"type": .., "id": .., "attributes": {..}}`
pub fn record_line<A: Adapter>(record: &RecordRef<A>) -> Value {
    json!({
        "type": record.model().as_str(),
        "id": record.id().map(|id| id.to_string()),
        "attributes": record.attributes(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;
    use clap::CommandFactory;
    use lager_core::{InMemoryAdapter, ResourceObject, Schema};

    fn store() -> Store<InMemoryAdapter> {
        let adapter = InMemoryAdapter::new();
        adapter.seed(ResourceObject::new("car", "1").with_attribute("make", "BMC"));
        adapter.seed(ResourceObject::new("car", "2").with_attribute("make", "Jeep"));
        Store::new(adapter, Schema::new())
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_commands() {
        let cli = Cli::try_parse_from(["lager", "find", "car", "1"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Find {
                model: "car".to_string(),
                id: "1".to_string()
            }
        );

        let cli = Cli::try_parse_from(["lager", "all", "car"]).unwrap();
        assert_eq!(
            cli.command,
            Command::All {
                model: "car".to_string()
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        let err = Cli::try_parse_from(["lager", "find", "car"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);

        let err = Cli::try_parse_from(["lager", "drop", "car"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);

        let err = Cli::try_parse_from(["lager"]).unwrap_err();
        assert_eq!(
            err.kind(),
            ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
        );
    }

    #[tokio::test]
    async fn test_run_find() {
        let store = store();
        let lines = run(
            &store,
            &Command::Find {
                model: "car".to_string(),
                id: "2".to_string(),
            },
        )
        .await
        .unwrap();

        assert_eq!(
            lines,
            vec![json!({"type": "car", "id": "2", "attributes": {"make": "Jeep"}})]
        );
    }

    #[tokio::test]
    async fn test_run_all() {
        let store = store();
        let lines = run(
            &store,
            &Command::All {
                model: "car".to_string(),
            },
        )
        .await
        .unwrap();

        let ids: Vec<&Value> = lines.iter().map(|l| &l["id"]).collect();
        assert_eq!(ids, vec![&json!("1"), &json!("2")]);
    }

    #[tokio::test]
    async fn test_run_surfaces_store_errors() {
        let store = store();
        let err = run(
            &store,
            &Command::Find {
                model: "car".to_string(),
                id: "404".to_string(),
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, CliError::Store(StoreError::Transport(_))));
    }
}
