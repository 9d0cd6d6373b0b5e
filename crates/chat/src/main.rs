use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use gemchat::conversation::{Conversation, ExchangeError, SkipReason, SubmitOutcome, ViewTurn};
use gemchat::settings::{ChatSettings, SettingsError, SettingsStore};
use gemchat_llm::{Backend, CompletionError, DEFAULT_GEMINI_MODEL, default_gemini_models, find_model};
use gemchat_storage::{
    MemoryTurnStore, SqliteTurnStore, StorageError, TurnAuthor, TurnStore, format_timestamp,
};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

const WELCOME: &str = "Hello! How can I help you today?";
const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Parser)]
#[command(
    name = "gemchat",
    about = "Chat with Gemini from the terminal, keeping recent history on this machine",
    version
)]
struct Cli {
    /// Settings file to use instead of the one in the platform config directory.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive session (default). `/clear`, `/history`, `/retry` and `/quit` are understood.
    Chat,
    /// Ask a single question and print the reply.
    Ask(AskArgs),
    /// Print the stored conversation.
    History(HistoryArgs),
    /// Delete the stored conversation.
    Clear,
    /// Import a JSON export of an older chat history.
    Import(ImportArgs),
    /// List the selectable Gemini models.
    Models,
    /// Inspect or change settings.
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Args, Debug)]
struct AskArgs {
    /// Question text; multiple words are joined with spaces.
    #[arg(required = true, num_args = 1..)]
    question: Vec<String>,
}

#[derive(Args, Debug)]
struct HistoryArgs {
    /// Print turns as JSON instead of text.
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct ImportArgs {
    /// Path to the exported JSON array.
    #[arg(value_name = "PATH")]
    path: PathBuf,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective settings with the API key hidden.
    Show,
    SetKey {
        key: String,
    },
    ClearKey,
    SetModel {
        model: String,
    },
    /// Completion proxy URL for the `proxy` backend.
    SetEndpoint {
        url: String,
    },
    /// `proxy` or `gemini`.
    SetBackend {
        backend: String,
    },
}

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("{source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("{source}"))]
    Exchange {
        stage: &'static str,
        source: ExchangeError,
    },
    #[snafu(display("failed to create completion client: {source}"))]
    CreateClient {
        stage: &'static str,
        source: CompletionError,
    },
    #[snafu(display("history database is unavailable: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("import needs the history database, which could not be opened"))]
    ImportWithoutDatabase { stage: &'static str },
    #[snafu(display("unknown backend `{value}`, expected `proxy` or `gemini`"))]
    InvalidBackend { stage: &'static str, value: String },
    #[snafu(display("failed to read from stdin: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to write to stdout: {source}"))]
    WriteOutput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to encode history: {source}"))]
    EncodeHistory {
        stage: &'static str,
        source: serde_json::Error,
    },
}

type CliResult<T> = Result<T, CliError>;

/// Everything a command needs once settings are known.
struct Session {
    conversation: Conversation,
    // Present only when the database opened; the in-memory fallback cannot import.
    database: Option<SqliteTurnStore>,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> CliResult<()> {
    let settings = Arc::new(match cli.config {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::load(),
    });

    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Chat => run_chat(open_session(settings).await?).await,
        Commands::Ask(args) => run_ask(open_session(settings).await?, args).await,
        Commands::History(args) => run_history(open_session(settings).await?, args),
        Commands::Clear => {
            let session = open_session(settings).await?;
            session
                .conversation
                .clear_history()
                .await
                .context(ExchangeSnafu {
                    stage: "cli-clear",
                })?;
            println!("history cleared");
            Ok(())
        }
        Commands::Import(args) => run_import(open_session(settings).await?, args).await,
        Commands::Models => {
            run_models(&settings.settings());
            Ok(())
        }
        Commands::Config { action } => run_config(&settings, action),
    }
}

async fn open_session(settings: Arc<SettingsStore>) -> CliResult<Session> {
    let current = settings.settings();
    let client = gemchat_llm::create_client(current.client_config()).context(CreateClientSnafu {
        stage: "open-session-client",
    })?;

    let location = current.database_location();
    let (store, database): (Arc<dyn TurnStore>, Option<SqliteTurnStore>) =
        match SqliteTurnStore::open(&location.to_string_lossy(), current.max_turns).await {
            Ok(database) => {
                tracing::debug!(database_url = database.database_url(), "history database opened");
                (Arc::new(database.clone()), Some(database))
            }
            Err(error) => {
                tracing::warn!(
                    %error,
                    location = ?location,
                    "history database unavailable, this session will not be saved"
                );
                (Arc::new(MemoryTurnStore::new(current.max_turns)), None)
            }
        };

    let conversation = Conversation::new(store, client, settings.clone());
    if let Err(error) = conversation.restore().await {
        tracing::warn!(%error, "failed to restore history, starting empty");
    }

    Ok(Session {
        conversation,
        database,
    })
}

async fn run_chat(session: Session) -> CliResult<()> {
    let conversation = session.conversation;
    if session.database.is_none() {
        println!("(history could not be opened; this session will not be saved)");
    }
    print_transcript(&conversation.turns());
    if conversation.is_welcome() {
        println!("gemini: {WELCOME}");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"> ").await.context(WriteOutputSnafu {
            stage: "chat-prompt",
        })?;
        stdout.flush().await.context(WriteOutputSnafu {
            stage: "chat-prompt-flush",
        })?;

        let Some(line) = lines.next_line().await.context(ReadInputSnafu {
            stage: "chat-read-line",
        })?
        else {
            break;
        };

        match parse_repl_line(&line, &conversation.draft()) {
            ReplAction::Quit => break,
            ReplAction::Idle => continue,
            ReplAction::ShowHistory => {
                print_transcript(&conversation.turns());
                continue;
            }
            ReplAction::Clear => {
                match conversation.clear_history().await {
                    Ok(()) => println!("gemini: {WELCOME}"),
                    Err(error) => eprintln!("error: {error}"),
                }
                continue;
            }
            ReplAction::Send(text) => conversation.set_draft(text),
            ReplAction::Resend => {}
        }

        match conversation.submit().await {
            Ok(SubmitOutcome::Answered { text }) => println!("gemini: {text}\n"),
            Ok(SubmitOutcome::Skipped(SkipReason::EmptyInput)) => {
                println!("(nothing to resend)");
            }
            Ok(SubmitOutcome::Skipped(SkipReason::InFlight)) => {
                println!("(still waiting for the previous reply)");
            }
            Err(error) => {
                report_exchange_error(&error);
                println!(
                    "(kept \"{}\": press Enter or /retry to resend, or type a new message)",
                    conversation.draft().trim()
                );
            }
        }
    }

    Ok(())
}

async fn run_ask(session: Session, args: AskArgs) -> CliResult<()> {
    session.conversation.set_draft(args.question.join(" "));
    match session.conversation.submit().await {
        Ok(SubmitOutcome::Answered { text }) => {
            println!("{text}");
            Ok(())
        }
        Ok(SubmitOutcome::Skipped(reason)) => {
            tracing::debug!(?reason, "question skipped");
            Ok(())
        }
        Err(error) => {
            report_hint(&error);
            Err(error).context(ExchangeSnafu { stage: "cli-ask" })
        }
    }
}

fn run_history(session: Session, args: HistoryArgs) -> CliResult<()> {
    let turns = session.conversation.turns();
    if args.json {
        let rows = turns
            .iter()
            .map(|turn| {
                serde_json::json!({
                    "id": turn.stored_id.map(|id| id.get()),
                    "isUser": turn.is_user(),
                    "content": turn.content,
                    "timestamp": format_timestamp(&turn.timestamp),
                })
            })
            .collect::<Vec<_>>();
        let encoded = serde_json::to_string_pretty(&rows).context(EncodeHistorySnafu {
            stage: "history-json",
        })?;
        println!("{encoded}");
        return Ok(());
    }

    if turns.is_empty() {
        println!("no stored history");
    } else {
        print_transcript(&turns);
    }
    Ok(())
}

async fn run_import(session: Session, args: ImportArgs) -> CliResult<()> {
    let database = session.database.context(ImportWithoutDatabaseSnafu {
        stage: "import-open-database",
    })?;

    let report = database
        .import_legacy_export(&args.path)
        .await
        .context(StorageSnafu {
            stage: "import-legacy-export",
        })?;

    if report.source_missing {
        println!("nothing to import: {} does not exist", report.source_path);
    } else if report.already_migrated {
        println!("history already contains turns; import skipped");
    } else {
        println!(
            "imported {} turns from {} ({} skipped)",
            report.imported_turns, report.source_path, report.skipped_rows
        );
    }
    for warning in &report.warnings {
        println!("  entry {}: {}", warning.line_number, warning.reason);
    }
    Ok(())
}

fn run_models(settings: &ChatSettings) {
    for model in default_gemini_models() {
        let marker = if model.id == settings.model { "*" } else { " " };
        let default = if model.id == DEFAULT_GEMINI_MODEL {
            " (default)"
        } else {
            ""
        };
        let description = model.description.as_deref().unwrap_or_default();
        println!("{marker} {:<24} {:<24} {description}{default}", model.id, model.name);
    }
}

fn run_config(settings: &SettingsStore, action: ConfigCommand) -> CliResult<()> {
    let saved = match action {
        ConfigCommand::Show => {
            let current = settings.settings();
            println!("settings file : {}", settings.path().display());
            println!("backend       : {}", current.backend.as_str());
            println!(
                "api key       : {}",
                if current.api_key.is_empty() { "not set" } else { "set" }
            );
            println!("model         : {}", current.model);
            println!("endpoint      : {}", current.endpoint);
            if let Some(base_url) = &current.gemini_base_url {
                println!("gemini url    : {base_url}");
            }
            println!("timeout       : {}s", current.request_timeout_secs);
            println!("max turns     : {}", current.max_turns);
            println!("database      : {}", current.database_location().display());
            return Ok(());
        }
        ConfigCommand::SetKey { key } => settings.modify(|current| current.api_key = key),
        ConfigCommand::ClearKey => settings.modify(|current| current.api_key.clear()),
        ConfigCommand::SetModel { model } => {
            if find_model(model.trim()).is_none() {
                tracing::warn!(model = %model, "model is not in the built-in catalog");
            }
            settings.modify(|current| current.model = model)
        }
        ConfigCommand::SetEndpoint { url } => settings.modify(|current| current.endpoint = url),
        ConfigCommand::SetBackend { backend } => {
            let parsed = Backend::parse(&backend).context(InvalidBackendSnafu {
                stage: "config-set-backend",
                value: backend.clone(),
            })?;
            settings.modify(|current| current.backend = parsed)
        }
    };
    saved.context(SettingsSnafu {
        stage: "config-update",
    })?;

    println!("saved {}", settings.path().display());
    Ok(())
}

/// What one line typed at the chat prompt asks for.
#[derive(Debug, PartialEq, Eq)]
enum ReplAction {
    Quit,
    ShowHistory,
    Clear,
    /// Replace the draft with this text and submit it.
    Send(String),
    /// Submit the draft as it is, typically a question kept after a failed exchange.
    Resend,
    Idle,
}

fn parse_repl_line(line: &str, draft: &str) -> ReplAction {
    match line.trim() {
        "" if draft.trim().is_empty() => ReplAction::Idle,
        "" | "/retry" => ReplAction::Resend,
        "/quit" | "/exit" => ReplAction::Quit,
        "/history" => ReplAction::ShowHistory,
        "/clear" => ReplAction::Clear,
        _ => ReplAction::Send(line.to_string()),
    }
}

fn print_transcript(turns: &[ViewTurn]) {
    for turn in turns {
        let speaker = match turn.author {
            TurnAuthor::User => "you",
            TurnAuthor::Model => "gemini",
        };
        println!(
            "[{}] {speaker}: {}",
            turn.timestamp.format("%Y-%m-%d %H:%M"),
            turn.content
        );
    }
}

fn report_exchange_error(error: &ExchangeError) {
    eprintln!("error: {error}");
    report_hint(error);
}

fn report_hint(error: &ExchangeError) {
    if matches!(error, ExchangeError::ConfigurationRequired { .. }) {
        eprintln!("hint: run `gemchat config set-key <API_KEY>` first");
    }
}
