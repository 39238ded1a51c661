use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chat_core::{paths, Config, ProjectRef, WorkspaceContext};
use chat_llm::{build_registry, AVAILABLE_PROVIDERS};
use chat_pipeline::{
    ChatPipeline, FilePersistence, PipelineConfig, PipelineError, PipelineEvent, SendOutcome,
};

#[derive(Parser)]
#[command(name = "workspace-chat")]
#[command(about = "Streaming chat over your workspace")]
#[command(version)]
struct Cli {
    /// Provider id (echo, openai)
    #[arg(long, env = "CHAT_PROVIDER")]
    provider: Option<String>,

    /// Model override passed to the provider
    #[arg(long, env = "CHAT_MODEL")]
    model: Option<String>,

    /// Directory holding persisted conversations
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Do not prepend workspace context to prompts
    #[arg(long, default_value = "false")]
    no_context: bool,

    /// Project name included in the context block
    #[arg(long)]
    project: Option<String>,

    /// Active file included in the context block (repeatable)
    #[arg(long = "file")]
    files: Vec<String>,

    /// Recent terminal command included in the context block (repeatable)
    #[arg(long = "terminal")]
    terminal: Vec<String>,

    /// Enable debug mode
    #[arg(long, short, default_value = "false")]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start interactive chat
    Chat,
    /// Send a single message to the active conversation
    Send {
        /// Message content
        message: String,
        /// Start a new conversation first
        #[arg(long)]
        new: bool,
    },
    /// List conversations, newest first
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Export a conversation as JSON
    Export {
        /// Conversation id (defaults to the active conversation)
        id: Option<String>,
        /// Write to a file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

enum Turn {
    Send(String),
    Regenerate(String),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let mut config = Config::new();
    if let Some(provider) = &cli.provider {
        config.provider = provider.clone();
    }
    if let Some(model) = &cli.model {
        config.model = Some(model.clone());
    }
    if cli.no_context {
        config.context_enabled = false;
    }

    let data_dir = paths::data_dir_or_default(cli.data_dir.as_deref().or(config.data_dir.as_deref()));
    let persistence = FilePersistence::new(&data_dir);
    persistence
        .init()
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

    if cli.debug {
        eprintln!("{}", "[DEBUG] Debug mode enabled".dimmed());
        eprintln!(
            "{}",
            format!("[DEBUG] Data directory: {}", data_dir.display()).dimmed()
        );
        eprintln!(
            "{}",
            format!(
                "[DEBUG] Provider: {} (available: {})",
                config.provider,
                AVAILABLE_PROVIDERS.join(", ")
            )
            .dimmed()
        );
    }

    let registry = Arc::new(build_registry(&config));
    let pipeline = Arc::new(ChatPipeline::with_persistence(
        registry,
        Arc::new(persistence),
        PipelineConfig::from(&config),
    ));
    pipeline.set_workspace_context(workspace_from(&cli));

    let result = match cli.command {
        Commands::Chat => run_interactive_chat(&pipeline, cli.debug).await,
        Commands::Send { message, new } => {
            if new {
                pipeline.new_conversation();
            }
            run_turn(&pipeline, Turn::Send(message), cli.debug)
                .await
                .map(|_| ())
        }
        Commands::List { json } => list_conversations(&pipeline, json),
        Commands::Export { id, output } => export_conversation(&pipeline, id, output),
    };

    pipeline.shutdown();
    result
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .init();
}

fn workspace_from(cli: &Cli) -> WorkspaceContext {
    WorkspaceContext {
        project: cli
            .project
            .as_ref()
            .map(|name| ProjectRef::new(name.to_lowercase().replace(' ', "-"), name.clone())),
        files: cli.files.clone(),
        selection: None,
        terminal: cli.terminal.clone(),
    }
}

/// Run one send or regeneration, printing chunks as they arrive.
/// Ctrl-C cancels every live stream.
async fn run_turn(
    pipeline: &Arc<ChatPipeline>,
    turn: Turn,
    debug: bool,
) -> anyhow::Result<Option<SendOutcome>> {
    let mut events = pipeline.subscribe();
    let mut task = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            match turn {
                Turn::Send(text) => pipeline.send(&text).await.map(Some),
                Turn::Regenerate(message_id) => pipeline.regenerate(&message_id).await,
            }
        })
    };

    let result = loop {
        tokio::select! {
            result = &mut task => break result?,
            event = events.recv() => match event {
                Ok(event) => print_event(&event, debug)?,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Display lagged; skipped {} events", skipped);
                }
                Err(RecvError::Closed) => {}
            },
            _ = tokio::signal::ctrl_c() => {
                let cancelled = pipeline.cancel_all();
                println!();
                println!("{}", format!("⏹ Cancelled {} stream(s)", cancelled).yellow());
            }
        }
    };

    while let Ok(event) = events.try_recv() {
        print_event(&event, debug)?;
    }

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(PipelineError::EmptyMessage) => {
            println!("{}", "❌ Message is empty".red());
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(outcome) = &outcome {
        print_outcome(pipeline, outcome);
    }
    Ok(outcome)
}

fn print_event(event: &PipelineEvent, debug: bool) -> io::Result<()> {
    match event {
        PipelineEvent::Chunk { content, .. } => {
            print!("{}", content.green());
            io::stdout().flush()?;
        }
        PipelineEvent::StreamStarted { message_id, .. } if debug => {
            eprintln!("{}", format!("[DEBUG] Stream started: {}", message_id).dimmed());
        }
        PipelineEvent::StreamEnded {
            message_id, phase, ..
        } if debug => {
            eprintln!(
                "{}",
                format!("[DEBUG] Stream ended: {} ({:?})", message_id, phase).dimmed()
            );
        }
        _ => {}
    }
    Ok(())
}

fn print_outcome(pipeline: &ChatPipeline, outcome: &SendOutcome) {
    println!();
    match outcome {
        SendOutcome::Finalized { metadata, .. } => {
            let mut summary = format!(
                "📊 {} tokens in {} ms",
                metadata.token_count.unwrap_or(0),
                metadata.response_time.unwrap_or(0)
            );
            if let Some(cost) = metadata.cost {
                summary.push_str(&format!(", ${:.4}", cost));
            }
            println!("{}", summary.dimmed());
        }
        SendOutcome::Cancelled { .. } => {
            println!("{}", "⏹ Response cancelled".yellow());
        }
        SendOutcome::Errored {
            conversation_id,
            message_id,
            ..
        } => {
            let text = pipeline
                .store()
                .message(conversation_id, message_id)
                .map(|m| m.content)
                .unwrap_or_default();
            println!("{}", format!("❌ {}", text).red());
        }
    }
}

async fn run_interactive_chat(pipeline: &Arc<ChatPipeline>, debug: bool) -> anyhow::Result<()> {
    println!("{}", "🤖 Workspace Chat".cyan().bold());
    match pipeline.active_conversation() {
        Some(conversation) => println!(
            "{}",
            format!("Conversation: {} ({})", conversation.title, conversation.id).dimmed()
        ),
        None => println!("{}", "A new conversation starts with your first message".dimmed()),
    }
    println!(
        "{}",
        "Commands: /new, /regen, /quit. Ctrl-C cancels a response.".dimmed()
    );
    println!();

    loop {
        print!("{} ", "You:".cyan().bold());
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();

        match input {
            "" => continue,
            "/quit" | "/exit" => {
                println!("{}", "👋 Goodbye!".cyan());
                break;
            }
            "/new" => {
                let conversation = pipeline.new_conversation();
                println!(
                    "{}",
                    format!("✨ New conversation {}", conversation.id).green()
                );
                continue;
            }
            "/regen" => {
                let Some(message_id) = last_assistant_message(pipeline) else {
                    println!("{}", "Nothing to regenerate".yellow());
                    continue;
                };
                println!("{}", "Assistant:".green().bold());
                if run_turn(pipeline, Turn::Regenerate(message_id), debug)
                    .await?
                    .is_none()
                {
                    println!("{}", "Nothing to regenerate".yellow());
                }
            }
            text => {
                println!("{}", "Assistant:".green().bold());
                if let Err(e) = run_turn(pipeline, Turn::Send(text.to_string()), debug).await {
                    if debug {
                        eprintln!("{}", format!("[DEBUG] Error: {:?}", e).dimmed());
                    }
                    println!("{}", format!("❌ Error: {}", e).red());
                }
            }
        }

        println!();
    }

    Ok(())
}

/// Last reply that directly answers a user message. After a stream error this
/// is the partial response, not the error message that follows it.
fn last_assistant_message(pipeline: &ChatPipeline) -> Option<String> {
    pipeline
        .active_conversation()?
        .messages
        .windows(2)
        .rev()
        .find(|pair| pair[0].is_user() && pair[1].is_assistant())
        .map(|pair| pair[1].id.clone())
}

fn list_conversations(pipeline: &ChatPipeline, json: bool) -> anyhow::Result<()> {
    let conversations = pipeline.conversations();

    if json {
        println!("{}", serde_json::to_string_pretty(&conversations)?);
        return Ok(());
    }

    if conversations.is_empty() {
        println!("{}", "No conversations yet".dimmed());
        return Ok(());
    }

    let active = pipeline.store().active_id();
    for conversation in conversations {
        let marker = if active.as_deref() == Some(conversation.id.as_str()) {
            "*".green().bold()
        } else {
            " ".normal()
        };
        println!(
            "{} {}  {}  {}",
            marker,
            conversation.id.dimmed(),
            conversation.title.bold(),
            format!(
                "{} messages, updated {}",
                conversation.messages.len(),
                conversation.updated_at.format("%Y-%m-%d %H:%M")
            )
            .dimmed()
        );
    }
    Ok(())
}

fn export_conversation(
    pipeline: &ChatPipeline,
    id: Option<String>,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let id = match id.or_else(|| pipeline.store().active_id()) {
        Some(id) => id,
        None => anyhow::bail!("no conversation id given and no active conversation"),
    };
    let json = pipeline.store().export_json(&id)?;

    match output {
        Some(path) => {
            std::fs::write(&path, json)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("{}", format!("✅ Exported to {}", path.display()).green());
        }
        None => println!("{}", json),
    }
    Ok(())
}
