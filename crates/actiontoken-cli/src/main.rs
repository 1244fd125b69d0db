//! ActionToken CLI - issue tokens and manage their grants
//!
//! Usage:
//!   actiontoken token issue     - Issue a new bearer token
//!   actiontoken rule add        - Scope a token to a resource type
//!   actiontoken field add       - Narrow a rule to one attribute
//!   actiontoken action add      - Grant a verb on a rule or field
//!   actiontoken check           - Ask whether a secret may perform an operation

mod config;

use actiontoken_core::{
    AccessGuard, Action, ActionId, Field, FieldId, GuardError, PermissionEngine, Rule, RuleId,
    TokenId, Token, TokenLifecycle, TypeRegistry, Verb,
};
use actiontoken_store::SqliteGrantStore;
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use config::Settings;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "actiontoken")]
#[command(author = "HeyBattle1")]
#[command(version)]
#[command(about = "Bearer tokens with CRUD grants on resource types", long_about = None)]
struct Cli {
    /// Config file (default ~/.actiontoken/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Grant database, overrides the config file
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Issue, list and revoke tokens
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Manage rules (type-level grant scopes)
    Rule {
        #[command(subcommand)]
        action: RuleAction,
    },

    /// Manage fields (attribute-level narrowing)
    Field {
        #[command(subcommand)]
        action: FieldAction,
    },

    /// Attach verbs to rules or fields
    Action {
        #[command(subcommand)]
        action: ActionAction,
    },

    /// Check whether a secret grants an operation
    Check {
        #[arg(long)]
        secret: String,
        #[arg(long)]
        verb: Verb,
        /// Fully-qualified resource type, e.g. app.Doc
        #[arg(long = "type")]
        resource_type: String,
        #[arg(long)]
        attribute: Option<String>,
    },

    /// List registered resource types
    Types,
}

#[derive(Subcommand)]
enum TokenAction {
    /// Issue a new token
    Issue {
        #[arg(long)]
        principal: Option<String>,
        /// Lifetime in seconds, overrides the configured default
        #[arg(long)]
        lifetime: Option<u64>,
    },

    /// List all tokens
    List,

    /// Revoke a token and everything granted through it
    Revoke { id: TokenId },
}

#[derive(Subcommand)]
enum RuleAction {
    Add {
        #[arg(long)]
        token: TokenId,
        #[arg(long = "type")]
        resource_type: String,
    },
    Remove { id: RuleId },
}

#[derive(Subcommand)]
enum FieldAction {
    Add {
        #[arg(long)]
        rule: RuleId,
        #[arg(long)]
        name: String,
    },
    Remove { id: FieldId },
}

#[derive(Subcommand)]
enum ActionAction {
    /// Grant a verb; give exactly one of --rule or --field
    Add {
        #[arg(long, default_value = "read")]
        verb: Verb,
        #[arg(long)]
        rule: Option<RuleId>,
        #[arg(long)]
        field: Option<FieldId>,
    },

    /// Reattach an action; give exactly one of --rule or --field
    Move {
        id: ActionId,
        #[arg(long)]
        rule: Option<RuleId>,
        #[arg(long)]
        field: Option<FieldId>,
    },

    Remove { id: ActionId },
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let settings = match cli.config.clone().or_else(Settings::default_path) {
        Some(path) => Settings::load(&path)?,
        None => Settings::default(),
    };
    let lifecycle = settings.lifecycle()?;
    let registry: Arc<dyn TypeRegistry> = Arc::new(settings.registry()?);

    let store = Arc::new(match cli.database.or_else(|| settings.database.clone()) {
        Some(path) => SqliteGrantStore::open(path, registry.clone()),
        None => SqliteGrantStore::open_default(registry.clone()),
    }
    .context("Failed to open grant database")?);

    match cli.command {
        Commands::Token { action } => match action {
            TokenAction::Issue { principal, lifetime } => {
                let lifecycle = match lifetime {
                    Some(secs) => config::lifecycle_for(secs)?,
                    None => lifecycle,
                };
                let mut token = Token::new();
                token.principal = principal;
                store.save_token(&mut token, &lifecycle)?;
                println!("id:      {}", token.id);
                println!("secret:  {}", token.secret);
                if let Some(expires) = token.expires {
                    println!("expires: {}", expires.to_rfc3339());
                }
            }
            TokenAction::List => {
                let now = chrono::Utc::now();
                for token in store.tokens()? {
                    let state = if lifecycle.is_live(&token, now) { "live" } else { "expired" };
                    println!("[{}] {}", state, token);
                }
            }
            TokenAction::Revoke { id } => {
                if !store.delete_token(id)? {
                    bail!("Token not found: {}", id);
                }
                println!("Revoked {}", id);
            }
        },

        Commands::Rule { action } => match action {
            RuleAction::Add { token, resource_type } => {
                let rule = Rule::new(token, resource_type);
                store.save_rule(&rule)?;
                println!("{}", rule);
            }
            RuleAction::Remove { id } => {
                if !store.delete_rule(id)? {
                    bail!("Rule not found: {}", id);
                }
                println!("Removed rule {}", id);
            }
        },

        Commands::Field { action } => match action {
            FieldAction::Add { rule, name } => {
                let field = Field::new(rule, name);
                store.save_field(&field)?;
                println!("{}", field);
            }
            FieldAction::Remove { id } => {
                if !store.delete_field(id)? {
                    bail!("Field not found: {}", id);
                }
                println!("Removed field {}", id);
            }
        },

        Commands::Action { action } => match action {
            ActionAction::Add { verb, rule, field } => {
                let action = Action {
                    rule,
                    field,
                    ..Action::new(verb)
                };
                store.save_action(&action)?;
                println!("{} ({})", action, action.id);
            }
            ActionAction::Move { id, rule, field } => {
                let mut action = store
                    .action(id)?
                    .with_context(|| format!("Action not found: {}", id))?;
                action.rule = rule;
                action.field = field;
                store.save_action(&action)?;
                println!("{} ({})", action, action.id);
            }
            ActionAction::Remove { id } => {
                if !store.delete_action(id)? {
                    bail!("Action not found: {}", id);
                }
                println!("Removed action {}", id);
            }
        },

        Commands::Check {
            secret,
            verb,
            resource_type,
            attribute,
        } => {
            let Some(token) = store.token_by_secret(&secret)? else {
                println!("deny");
                return Ok(ExitCode::FAILURE);
            };
            let guard = guard(lifecycle, store.clone(), registry);
            return Ok(match guard.authorize(&token, verb, &resource_type, attribute.as_deref()) {
                Ok(true) => {
                    println!("allow");
                    ExitCode::SUCCESS
                }
                Ok(false) => {
                    println!("deny");
                    ExitCode::FAILURE
                }
                Err(GuardError::TokenExpired { .. }) => {
                    println!("expired");
                    ExitCode::FAILURE
                }
            });
        }

        Commands::Types => {
            let registry = settings.registry()?;
            if registry.is_empty() {
                println!("No types registered. Add [[types]] entries to the config file.");
            }
            for descriptor in registry.descriptors() {
                let attributes: Vec<&str> =
                    descriptor.attributes.iter().map(String::as_str).collect();
                println!("{} [{}]", descriptor.name, attributes.join(", "));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn guard(
    lifecycle: TokenLifecycle,
    store: Arc<SqliteGrantStore>,
    registry: Arc<dyn TypeRegistry>,
) -> AccessGuard {
    AccessGuard::new(lifecycle, PermissionEngine::new(store, registry))
}
