use std::sync::Arc;

use serde::Serialize;

use crate::broker::{issue_decision, Broker, IssueOutcome};
use crate::cli::{Cli, Command};
use crate::display;
use crate::mcp::McpHandler;
use crate::paths::keygate_root_dir;
use crate::secrets::{FileSecretStore, SecretStore};
use crate::server;
use crate::store::PolicyStore;
use crate::sync::FileConfigSync;

pub fn run(cli: Cli) -> Result<(), String> {
    let root = keygate_root_dir();
    let secrets: Arc<dyn SecretStore> = Arc::new(FileSecretStore::open_under(&root)?);
    let sync = Box::new(FileConfigSync::under(&root));
    let store = Arc::new(PolicyStore::open_under(&root, secrets.clone(), sync)?);

    match cli.command {
        Command::Proxy { port } => {
            let broker = Arc::new(Broker::new(store.clone(), secrets)?);
            server::serve(port, broker, store)
        }
        Command::Mcp => {
            let broker = Broker::new(store.clone(), secrets)?;
            let handler = McpHandler::new(&broker, &store);
            handler.serve_stdio()
        }
        Command::Issue {
            scope,
            reason,
            host,
        } => match issue_decision(&store, &scope, &host, &reason) {
            IssueOutcome::Approved => {
                println!("approved");
                Ok(())
            }
            IssueOutcome::Queued { request_id } => Err(format!(
                "queued: request {} awaits manual approval",
                request_id
            )),
            IssueOutcome::Denied { message } => Err(format!("denied: {}", message)),
        },
        Command::List => {
            let policies = store.policies();
            let recent = store.recent_audit(500);
            display::print_policies(&policies, &recent);
            Ok(())
        }
        Command::Pending => {
            display::print_pending(&store.pending_requests());
            Ok(())
        }
        Command::Audit { limit } => print_json(&store.recent_audit(limit)),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let rendered = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", rendered);
    Ok(())
}
