mod config;
mod echo;
mod error;
mod store;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agentforum_core::{Forum, Hash, Message, Metadata};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{load_config, resolve_store_config, Config};
use crate::echo::EchoAgent;
use crate::error::AfError;
use crate::store::{AppContext, StoreType};

#[derive(Parser)]
#[command(name = "af")]
#[command(about = "Agentforum message tree tools", long_about = None)]
struct Cli {
    /// Store type: memory or rocks
    #[arg(long, global = true)]
    store_type: Option<StoreType>,

    /// Path to the message store
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Do not record agent responses in the persistent cache
    #[arg(long, global = true)]
    no_cache: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print one message
    Show { hash: String },

    /// Print the branch ending at a message, root first
    History {
        /// Message hash or alias
        reference: String,
    },

    /// List direct successors of a message
    Children { hash: String },

    /// Manage named branch tips
    Alias {
        #[command(subcommand)]
        command: AliasCommand,
    },

    /// Store a user message
    Post {
        text: String,

        /// Parent message hash or alias
        #[arg(long)]
        on: Option<String>,

        /// Move this alias to the new message
        #[arg(long)]
        alias: Option<String>,
    },

    /// Post a message and stream the echo agent's reply
    Echo {
        text: String,

        /// Parent message hash or alias
        #[arg(long)]
        on: Option<String>,

        /// Move this alias to the reply
        #[arg(long)]
        alias: Option<String>,

        /// Delay between streamed words, in milliseconds
        #[arg(long, default_value_t = 50)]
        delay_ms: u64,
    },
}

#[derive(Subcommand)]
enum AliasCommand {
    /// Point an alias at a message
    Set { name: String, hash: String },
    /// Print the message an alias points at
    Get { name: String },
    /// List all aliases
    List,
}

fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .ok();
}

fn parse_hash(s: &str) -> Result<Hash, AfError> {
    Ok(s.parse::<Hash>()?)
}

fn resolve(forum: &Forum, reference: &str) -> Result<Hash, AfError> {
    forum
        .tree()
        .resolve(reference)?
        .ok_or_else(|| AfError::UnknownReference(reference.to_string()))
}

fn resolve_parent(forum: &Forum, on: Option<&str>) -> Result<Option<Hash>, AfError> {
    on.map(|reference| resolve(forum, reference)).transpose()
}

fn print_message(message: &Message) {
    println!("message  {}", message.identity());
    match message.previous() {
        Some(previous) => println!("previous {previous}"),
        None => println!("previous (root)"),
    }
    for (key, value) in message.metadata().iter() {
        match value.as_str() {
            Some(text) => println!("{key}: {text}"),
            None => println!("{key}: {value:?}"),
        }
    }
    println!();
    println!("{}", message.content());
}

fn move_alias(forum: &Forum, alias: Option<&str>, target: Hash) -> Result<(), AfError> {
    if let Some(alias) = alias {
        forum.tree().forward(alias, target)?;
        println!("{alias} -> {target}");
    }
    Ok(())
}

async fn echo(
    forum: &Forum,
    text: String,
    on: Option<&str>,
    alias: Option<&str>,
    delay: Duration,
) -> Result<(), AfError> {
    let parent = resolve_parent(forum, on)?;
    let question = forum.post(parent, text, Metadata::new())?;
    println!("{} USER", question.identity());

    let reply = forum.invoke_cached(
        Arc::new(EchoAgent::new(delay)),
        &question,
        Metadata::new(),
    );

    let mut cursor = reply.cursor();
    let mut last = None;
    while let Some(promise) = cursor.next().await? {
        let mut tokens = promise.tokens();
        let mut stdout = std::io::stdout();
        while let Some(token) = tokens.next().await {
            print!("{}", token?);
            stdout.flush()?;
        }
        println!();
        let message = promise.resolve().await?;
        println!("{} {}", message.identity(), message.sender());
        last = Some(message.identity());
    }

    if let Some(last) = last {
        move_alias(forum, alias, last)?;
    }
    forum.cache().settle().await;
    Ok(())
}

async fn run(cli: Cli, config: Config) -> Result<(), AfError> {
    let (store_type, store_path) = resolve_store_config(&config, cli.store_type, cli.store);
    let ctx = AppContext::open(store_type, store_path, config.cache.persist && !cli.no_cache)?;
    let forum = &ctx.forum;

    match cli.command {
        Command::Show { hash } => {
            let hash = parse_hash(&hash)?;
            let message = forum
                .tree()
                .get(&hash)?
                .ok_or(AfError::MessageNotFound(hash))?;
            if message.forwarded_from().is_some() {
                let original = forum.tree().original(hash)?;
                println!("original {} [{}]", original.identity(), original.sender());
            }
            print_message(&message);
        }
        Command::History { reference } => {
            let tip = resolve(forum, &reference)?;
            for message in forum.tree().history(tip)? {
                println!("{} [{}] {}", message.identity().short(), message.sender(), message.content());
            }
        }
        Command::Children { hash } => {
            let hash = parse_hash(&hash)?;
            for child in forum.tree().children(&hash)? {
                println!("{child}");
            }
        }
        Command::Alias { command } => match command {
            AliasCommand::Set { name, hash } => {
                let hash = parse_hash(&hash)?;
                forum.tree().forward(&name, hash)?;
                println!("{name} -> {hash}");
            }
            AliasCommand::Get { name } => {
                let target = forum
                    .tree()
                    .alias(&name)?
                    .ok_or(AfError::UnknownReference(name))?;
                println!("{target}");
            }
            AliasCommand::List => {
                for (name, target) in forum.tree().aliases()? {
                    println!("{name} {target}");
                }
            }
        },
        Command::Post { text, on, alias } => {
            let parent = resolve_parent(forum, on.as_deref())?;
            let message = forum.post(parent, text, Metadata::new())?;
            println!("{}", message.identity());
            move_alias(forum, alias.as_deref(), message.identity())?;
        }
        Command::Echo {
            text,
            on,
            alias,
            delay_ms,
        } => {
            echo(
                forum,
                text,
                on.as_deref(),
                alias.as_deref(),
                Duration::from_millis(delay_ms),
            )
            .await?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (config, config_error) = match load_config() {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };
    init_logging(&config);
    if let Some(e) = config_error {
        tracing::warn!(error = %e, "ignoring config file");
    }

    run(cli, config).await?;
    Ok(())
}
