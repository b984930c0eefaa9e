mod api;
mod cache;
mod config;
mod db;
mod http;
mod logging;
mod models;
mod network;
mod router;
mod store;
mod sync;
#[cfg(test)]
mod test_support;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use api::{OfflineApi, Submitted};
use cache::SqliteStorage;
use config::Config;
use db::Database;
use http::{resolve, Method, Request};
use network::HttpNetwork;
use router::Router;
use store::{NewOperation, OfflineStore, OperationKind, PendingOperation, Sale, SaleItem, StoreName};
use sync::{ConnectivityMonitor, Reconciler, RetryPolicy, SyncOutcome, SyncTrigger};
use worker::{MessageReply, Worker};

#[derive(Parser, Debug)]
#[command(name = "erp-offline")]
#[command(about = "Offline cache, write queue and sync for the ERP point of sale")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./erp-offline.yaml, then $XDG_CONFIG_HOME/erp-offline/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Server origin, overrides the config file
  #[arg(short, long)]
  origin: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the app shell and activate
  Install,
  /// Route a GET request through the caches
  Fetch {
    url: String,
    /// Treat as a page navigation (offline page fallback)
    #[arg(long)]
    navigate: bool,
  },
  /// Deliver a worker message, e.g. '{"type":"SKIP_WAITING"}'
  Message { json: String },
  /// Show the notification a push payload produces
  Push { json: Option<String> },
  /// Inspect and manage the pending-operation queue
  #[command(subcommand)]
  Queue(QueueCommand),
  /// Record a sale from a JSON file, sending it if the server is reachable
  Sale { file: PathBuf },
  /// Replay queued operations now
  Sync {
    /// Only replay offline sales
    #[arg(long)]
    sales: bool,
  },
  /// Read and write the local entity stores
  #[command(subcommand)]
  Cache(CacheCommand),
  /// Watch connectivity and sync on reconnect until Ctrl-C
  Watch,
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// Operations waiting to be replayed
  List,
  /// Operations that gave up
  Failed,
  /// Put a failed operation back in the queue
  Retry { id: i64 },
  /// Delete synced operations and sales
  Purge,
  /// Queue a write, sending it first if possible
  Add {
    #[arg(long, default_value = "POST")]
    method: String,
    #[arg(long)]
    url: String,
    /// JSON body
    #[arg(long)]
    body: Option<String>,
    #[arg(long, default_value = "create")]
    kind: String,
  },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  Get { store: String, id: String },
  List { store: String },
  /// Store a JSON record; it must carry an `id`
  Put { store: String, json: String },
  Clear { store: String },
}

/// Sale as written by the POS, before an id is assigned.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaleInput {
  items: Vec<SaleItem>,
  payment_method: String,
  #[serde(default)]
  client_id: Option<String>,
}

/// Everything a command needs, opened once per run.
struct Services {
  config: Config,
  store: OfflineStore,
  storage: Arc<SqliteStorage>,
  network: Arc<HttpNetwork>,
}

impl Services {
  fn open(config: Config) -> Result<Self> {
    let db = Arc::new(Database::open(&config.database_path()?)?);
    let store = OfflineStore::with_claim_lease(Arc::clone(&db), config.sync.claim_lease())?;
    Ok(Self {
      store,
      storage: Arc::new(SqliteStorage::new(db)),
      network: Arc::new(HttpNetwork::new()?),
      config,
    })
  }

  fn router(&self) -> Result<Router<SqliteStorage, HttpNetwork>> {
    Router::new(&self.config, Arc::clone(&self.storage), Arc::clone(&self.network))
  }

  fn reconciler(&self) -> Reconciler<HttpNetwork> {
    Reconciler::new(
      self.store.clone(),
      Arc::clone(&self.network),
      RetryPolicy::from_config(&self.config.sync),
    )
  }

  fn worker(&self) -> Result<Worker<SqliteStorage, HttpNetwork>> {
    Ok(Worker::new(&self.config, self.router()?, self.reconciler()))
  }

  fn api(&self) -> Result<OfflineApi<SqliteStorage, HttpNetwork>> {
    Ok(OfflineApi::new(&self.config, self.router()?, self.store.clone()))
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration; an explicit --origin is enough without a file
  let mut config = match Config::load(args.config.as_deref()) {
    Ok(config) => config,
    Err(_) if args.config.is_none() && args.origin.is_some() => Config::with_origin(""),
    Err(e) => return Err(e),
  };
  if let Some(origin) = args.origin {
    url::Url::parse(&origin).map_err(|e| eyre!("Invalid origin '{}': {}", origin, e))?;
    config.origin = origin;
  }

  let _log_guard = logging::init(&config.logging);
  info!(origin = %config.origin, "erp-offline starting");

  let services = Services::open(config)?;
  run(&services, args.command).await
}

async fn run(services: &Services, command: Command) -> Result<()> {
  match command {
    Command::Install => {
      let report = services.worker()?.install().await?;
      println!("cached {} assets", report.cached);
      for url in &report.failed {
        println!("failed: {}", url);
      }
      for name in &report.removed {
        println!("removed cache: {}", name);
      }
    }
    Command::Fetch { url, navigate } => {
      let url = resolve(&services.config.origin, &url)?;
      let request = if navigate {
        Request::navigation(url)
      } else {
        Request::get(url)
      };
      let result = services.worker()?.fetch(&request).await;
      eprintln!("{} ({})", result.data.status, result.source.label());
      println!("{}", result.data.text());
      if let Some(revalidation) = result.revalidation {
        let _ = revalidation.await;
      }
    }
    Command::Message { json } => {
      let message = Worker::<SqliteStorage, HttpNetwork>::parse_message(&json)?;
      match services.worker()?.handle_message(message).await? {
        MessageReply::Activated(true) => println!("activated"),
        MessageReply::Activated(false) => println!("not waiting, nothing to do"),
        MessageReply::Cached(count) => println!("cached {} urls", count),
      }
    }
    Command::Push { json } => {
      let notification = services.worker()?.handle_push(json.as_deref());
      println!(
        "{}",
        serde_json::to_string_pretty(&notification)
          .map_err(|e| eyre!("Failed to serialize notification: {}", e))?
      );
    }
    Command::Queue(command) => run_queue(services, command).await?,
    Command::Sale { file } => {
      let contents = std::fs::read_to_string(&file)
        .map_err(|e| eyre!("Failed to read {}: {}", file.display(), e))?;
      let input: SaleInput = serde_json::from_str(&contents)
        .map_err(|e| eyre!("Invalid sale in {}: {}", file.display(), e))?;

      let mut sale = Sale::new(input.items, input.payment_method);
      sale.client_id = input.client_id;
      let id = sale.id.clone();
      print_submitted(&id, services.api()?.record_sale(sale).await?);
    }
    Command::Sync { sales } => {
      let reconciler = services.reconciler();
      let outcome = if sales {
        reconciler.sync_offline_sales(SyncTrigger::Manual).await
      } else {
        reconciler.sync_pending_operations(SyncTrigger::Manual).await
      };
      print_outcome(&outcome);
    }
    Command::Cache(command) => run_cache(services, command)?,
    Command::Watch => {
      let monitor = ConnectivityMonitor::new(&services.config, Arc::clone(&services.network))?;
      let reconciler = services.reconciler();
      println!("watching {} (Ctrl-C to stop)", services.config.origin);
      monitor
        .run(&reconciler, services.config.sync.interval(), async {
          let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    }
  }

  Ok(())
}

async fn run_queue(services: &Services, command: QueueCommand) -> Result<()> {
  let store = &services.store;
  match command {
    QueueCommand::List => {
      let pending = store.get_pending_operations()?;
      if pending.is_empty() {
        println!("queue is empty");
      }
      pending.iter().for_each(print_operation);
    }
    QueueCommand::Failed => store.failed_operations()?.iter().for_each(print_operation),
    QueueCommand::Retry { id } => {
      if store.requeue_failed(id)? {
        println!("operation {} queued again", id);
      } else {
        return Err(eyre!("No failed operation with id {}", id));
      }
    }
    QueueCommand::Purge => println!("purged {} synced operations", store.purge_synced()?),
    QueueCommand::Add {
      method,
      url,
      body,
      kind,
    } => {
      let method: Method = method.parse()?;
      let kind: OperationKind = kind.parse()?;
      let mut operation = NewOperation::new(kind, method, url.as_str());
      if let Some(body) = body {
        let body =
          serde_json::from_str(&body).map_err(|e| eyre!("Body is not valid JSON: {}", e))?;
        operation = operation.with_body(body);
      }
      print_submitted(&url, services.api()?.submit(operation).await?);
    }
  }
  Ok(())
}

fn run_cache(services: &Services, command: CacheCommand) -> Result<()> {
  let store = &services.store;
  match command {
    CacheCommand::Get { store: name, id } => {
      let name: StoreName = name.parse()?;
      match store.get_from_cache::<serde_json::Value>(name, &id)? {
        Some(entity) => println!("{}", to_pretty(&entity)?),
        None => return Err(eyre!("{} not found in {}", id, name)),
      }
    }
    CacheCommand::List { store: name } => {
      let entities = store.get_all_from_cache::<serde_json::Value>(name.parse()?)?;
      println!("{}", to_pretty(&entities)?);
    }
    CacheCommand::Put { store: name, json } => {
      let name: StoreName = name.parse()?;
      let entity: serde_json::Value =
        serde_json::from_str(&json).map_err(|e| eyre!("Record is not valid JSON: {}", e))?;
      store.save_to_cache(name, &entity)?;
      println!("stored in {}", name);
    }
    CacheCommand::Clear { store: name } => {
      let name: StoreName = name.parse()?;
      println!("removed {} entries from {}", store.clear_cache(name)?, name);
    }
  }
  Ok(())
}

fn to_pretty<T: serde::Serialize>(value: &T) -> Result<String> {
  serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to serialize: {}", e))
}

fn print_operation(op: &PendingOperation) {
  let mut line = format!(
    "#{} {} {} {} [{}] attempts={}",
    op.id,
    op.kind.as_str(),
    op.method,
    op.url,
    op.status.as_str(),
    op.attempts
  );
  if let Some(at) = op.next_attempt_at {
    line.push_str(&format!(" next={}", db::format_datetime(at)));
  }
  if let Some(error) = &op.last_error {
    line.push_str(&format!(" error=\"{}\"", error));
  }
  println!("{}", line);
}

fn print_submitted(what: &str, submitted: Submitted) {
  match submitted {
    Submitted::Sent => println!("{}: sent", what),
    Submitted::Queued(id) => println!("{}: offline, queued as operation {}", what, id),
  }
}

fn print_outcome(outcome: &SyncOutcome) {
  if outcome.already_running {
    println!("a sync is already running");
  } else {
    println!(
      "synced {}, failed {} ({} gave up)",
      outcome.success, outcome.failed, outcome.abandoned
    );
  }
}
