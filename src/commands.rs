//! Subcommands of the inspection CLI.

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use rescache::{Cache, Journal, RecordId, ResourceActions};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::config::Config;

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Show the local copy and pending baseline of every record
  Cache {
    resource: String,
    /// Query parameters of the scope, as JSON
    #[arg(short, long)]
    scope: Option<String>,
  },
  /// Show one record from the working view
  Get {
    resource: String,
    id: String,
    #[arg(short, long)]
    scope: Option<String>,
  },
  /// List the working view of a scope
  List {
    resource: String,
    #[arg(short, long)]
    scope: Option<String>,
  },
  /// List the scopes a resource has cached
  Scopes { resource: String },
  /// Show pending journal deltas
  Pending { resource: String },
  /// Remove one delta from the journal
  Flush { resource: String, id: String },
  /// Mark records as reconciled with the server
  Sync {
    resource: String,
    #[arg(required = true)]
    ids: Vec<String>,
    #[arg(short, long)]
    scope: Option<String>,
  },
  /// Print journal snapshots as they change, until Ctrl-C
  Watch { resource: String },
}

/// Parse a `--scope` argument into query parameters.
fn parse_scope(scope: Option<&str>) -> Result<Option<Value>> {
  scope
    .map(|s| serde_json::from_str(s).map_err(|e| eyre!("Invalid --scope JSON '{}': {}", s, e)))
    .transpose()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn actions(cache: &Cache, config: &Config, resource: &str, scope: Option<&str>) -> Result<ResourceActions> {
  let actions = cache.resource(resource, &config.cache_options())?;
  match parse_scope(scope)? {
    Some(params) => Ok(actions.scoped(&params)?),
    None => Ok(actions),
  }
}

pub async fn run(command: Command, config: &Config) -> Result<()> {
  let registry = config.registry()?;
  let db = registry.open(&config.database.name)?;
  let cache = Cache::new(db.clone());
  let journal = Journal::new(db);

  match command {
    Command::Cache { resource, scope } => {
      let actions = actions(&cache, config, &resource, scope.as_deref())?;
      print_json(&actions.get_cache().await?)?;
    }
    Command::Get {
      resource,
      id,
      scope,
    } => {
      let actions = actions(&cache, config, &resource, scope.as_deref())?;
      let id = RecordId::parse_lenient(&id);
      match actions.refresh_one(&id).await? {
        Some(record) => print_json(&record)?,
        None => return Err(eyre!("{}: no local record with id {}", resource, id)),
      }
    }
    Command::List { resource, scope } => {
      let actions = actions(&cache, config, &resource, scope.as_deref())?;
      print_json(&actions.refresh_all().await?)?;
    }
    Command::Scopes { resource } => {
      let actions = actions(&cache, config, &resource, None)?;
      for params in actions.scopes().await? {
        println!("{}", params);
      }
    }
    Command::Pending { resource } => {
      print_json(&journal.pending(&resource).await?)?;
    }
    Command::Flush { resource, id } => {
      let id = RecordId::parse_lenient(&id);
      if journal.flush(&resource, &id).await? {
        info!(resource = %resource, id = %id, "flushed delta");
      } else {
        return Err(eyre!("{}: no pending delta for id {}", resource, id));
      }
    }
    Command::Sync {
      resource,
      ids,
      scope,
    } => {
      let actions = actions(&cache, config, &resource, scope.as_deref())?;
      let ids: Vec<RecordId> = ids.iter().map(|id| RecordId::parse_lenient(id)).collect();
      actions.sync(&ids).await?;
    }
    Command::Watch { resource } => {
      let mut feed = journal.read(&resource)?;
      loop {
        tokio::select! {
          next = feed.next() => match next {
            Some(entries) => print_json(&entries?)?,
            None => break,
          },
          _ = tokio::signal::ctrl_c() => break,
        }
      }
    }
  }

  Ok(())
}
