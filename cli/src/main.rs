use anyhow::Context;
use clap::Parser;
use config::load_env_file;
use docchat_api::{ApiClient, ApiError, ChatMode, DEFAULT_BASE_URL, HttpTransport};
use docchat_core::{
    AuthContext, AuthError, Authenticator, Capability, ChatController, HttpConversationStore,
    PreferenceStore, Role, StoreError, TurnEvent, TurnOutcome,
};

use clap_derive::{Parser, ValueEnum};
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast;

mod logging;

#[derive(Copy, Clone, ValueEnum, Debug, PartialEq, Eq)]
#[clap(rename_all = "lowercase")]
enum ModeArg {
    Auto,
    Documents,
    General,
}

impl From<ModeArg> for ChatMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Auto => ChatMode::Auto,
            ModeArg::Documents => ChatMode::DocumentsOnly,
            ModeArg::General => ChatMode::GeneralKnowledge,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Chat with your documents", long_about = None)]
struct Args {
    /// Backend origin (saved for later runs)
    #[arg(long, env = "DOCCHAT_BASE_URL")]
    base_url: Option<String>,

    /// Chat mode for this and later runs
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Mirror logs to stderr
    #[arg(long, short)]
    tracing: bool,

    /// Directory for settings and logs
    #[arg(long, env = "DOCCHAT_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

type InputLines = Lines<BufReader<Stdin>>;

struct AppState {
    client: ApiClient,
    controller: Arc<ChatController>,
    auth: Authenticator,
    user: Option<AuthContext>,
    turns: broadcast::Receiver<TurnEvent>,
}

impl AppState {
    /// Capability check against the signed-in user. Without a sign-in the
    /// backend decides.
    fn require(&self, capability: Capability) -> Result<(), AuthError> {
        match &self.user {
            Some(user) => user.require(capability),
            None => Ok(()),
        }
    }

    fn sign_out(&mut self) {
        self.auth.sign_out();
        self.user = None;
    }
}

fn flush_stdout() {
    let _ = std::io::stdout().flush();
}

fn render_turn_event(event: &TurnEvent) {
    match event {
        TurnEvent::Started { .. } => {
            print!("< ");
            flush_stdout();
        }
        TurnEvent::Token(token) => {
            print!("{}", token);
            flush_stdout();
        }
        TurnEvent::Sources(_) => {}
        TurnEvent::Completed(message) => {
            println!();
            if let Some(sources) = message.sources.as_ref().filter(|s| !s.is_empty()) {
                println!("Sources:");
                for source in sources {
                    println!("  - {} ({:.0}%)", source.document, source.relevance * 100.0);
                }
            }
        }
        TurnEvent::Failed(error) => {
            println!();
            eprintln!("Error: {}", error);
            println!("Type /retry to send it again.");
        }
        TurnEvent::Cancelled => {
            println!();
            println!("(cancelled)");
        }
    }
}

/// Drive `turn` to completion, printing its events as they arrive. Ctrl-C
/// cancels the stream.
async fn run_turn<F>(state: &mut AppState, turn: F) -> TurnOutcome
where
    F: Future<Output = TurnOutcome>,
{
    tokio::pin!(turn);
    let outcome = loop {
        tokio::select! {
            outcome = &mut turn => break outcome,
            event = state.turns.recv() => {
                if let Ok(event) = event {
                    render_turn_event(&event);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                state.controller.cancel_current();
            }
        }
    };
    while let Ok(event) = state.turns.try_recv() {
        render_turn_event(&event);
    }

    if outcome == TurnOutcome::Unauthorized {
        state.sign_out();
        println!("Your session has expired. Sign in with /login <username>.");
    }
    outcome
}

fn is_unauthorized(error: &anyhow::Error) -> bool {
    if let Some(e) = error.downcast_ref::<ApiError>() {
        return e.is_unauthorized();
    }
    if let Some(e) = error.downcast_ref::<StoreError>() {
        return matches!(e, StoreError::Unauthorized);
    }
    matches!(
        error.downcast_ref::<AuthError>(),
        Some(AuthError::Api(ApiError::Unauthorized))
    )
}

fn print_status_bar(state: &AppState) {
    let terminal_width: usize = 80;
    let conversation = state
        .controller
        .conversation_id()
        .map(|id| id.as_str().chars().take(8).collect::<String>())
        .unwrap_or_else(|| "-".to_string());
    let user = state
        .user
        .as_ref()
        .map(|u| u.username.as_str())
        .unwrap_or("signed out");
    let status = format!(
        " {} • {} • {} • {} ",
        state.client.base_url(),
        conversation,
        state.controller.mode(),
        user
    );
    let width = status.chars().count();
    let padding = terminal_width.saturating_sub(width + 2);
    let left_pad = padding / 2;
    let right_pad = padding - left_pad;

    println!("┌{}┐", "─".repeat(terminal_width - 2));
    println!("│{}{}{}│", " ".repeat(left_pad), status, " ".repeat(right_pad));
    println!("└{}┘", "─".repeat(terminal_width - 2));
}

// Slash command parsing and handling
mod commands {
    use super::*;

    pub enum Command {
        Quit,
        Help,
        New,
        List,
        Open(String),
        Delete(String),
        ClearConversations,
        Retry,
        Mode(Option<ChatMode>),
        Docs,
        Upload(PathBuf),
        DeleteDoc(String),
        ClearDocs,
        ClearAllDocs,
        Logs(Option<String>),
        Status,
        ClearCache,
        Models,
        SetModel(String),
        Login(String),
        Logout,
        WhoAmI,
    }

    pub enum CommandResult {
        Continue,
        Exit,
    }

    fn argument(parts: &[&str], usage: &str) -> Result<String, String> {
        if parts.len() < 2 {
            return Err(format!("Usage: {}", usage));
        }
        Ok(parts[1..].join(" "))
    }

    impl Command {
        pub fn parse(input: &str) -> Result<Self, String> {
            let Some(rest) = input.strip_prefix('/') else {
                return Err("Not a command".to_string());
            };

            let parts: Vec<&str> = rest.split_whitespace().collect();
            if parts.is_empty() {
                return Err("Empty command".to_string());
            }

            match parts[0] {
                "quit" | "exit" => Ok(Command::Quit),
                "help" => Ok(Command::Help),
                "new" => Ok(Command::New),
                "list" => Ok(Command::List),
                "open" => argument(&parts, "/open <conversation id>").map(Command::Open),
                "delete" => argument(&parts, "/delete <conversation id>").map(Command::Delete),
                "clear-conversations" => Ok(Command::ClearConversations),
                "retry" => Ok(Command::Retry),
                "mode" => match parts.get(1) {
                    None => Ok(Command::Mode(None)),
                    Some(mode) => mode
                        .parse::<ChatMode>()
                        .map(|m| Command::Mode(Some(m)))
                        .map_err(|_| format!("Unknown mode: {}. Available: auto, documents, general", mode)),
                },
                "docs" => Ok(Command::Docs),
                "upload" => argument(&parts, "/upload <path>").map(|p| Command::Upload(PathBuf::from(p))),
                "delete-doc" => argument(&parts, "/delete-doc <file name>").map(Command::DeleteDoc),
                "clear-docs" => Ok(Command::ClearDocs),
                "clear-all-docs" => Ok(Command::ClearAllDocs),
                "logs" => Ok(Command::Logs(parts.get(1).map(|s| s.to_string()))),
                "status" => Ok(Command::Status),
                "clear-cache" => Ok(Command::ClearCache),
                "models" => Ok(Command::Models),
                "model" => argument(&parts, "/model <name>").map(Command::SetModel),
                "login" => argument(&parts, "/login <username>").map(Command::Login),
                "logout" => Ok(Command::Logout),
                "whoami" => Ok(Command::WhoAmI),
                _ => Err(format!("Unknown command: /{}. Type /help for available commands.", parts[0])),
            }
        }

        pub async fn execute(self, state: &mut AppState, input: &mut InputLines) -> anyhow::Result<CommandResult> {
            match self {
                Command::Quit => {
                    println!("Goodbye!");
                    return Ok(CommandResult::Exit);
                }
                Command::Help => print_help(),
                Command::New => {
                    let id = state.controller.new_conversation().await?;
                    println!("Started conversation {}", id);
                }
                Command::List => {
                    let active = state.controller.conversation_id();
                    let conversations = state.controller.list_conversations().await?;
                    if conversations.is_empty() {
                        println!("No conversations yet.");
                    }
                    for c in conversations {
                        let marker = if active.as_ref() == Some(&c.id) { "*" } else { " " };
                        println!(
                            "{} {}  {:<52} {:>3} msgs  {}",
                            marker,
                            c.id,
                            c.preview,
                            c.message_count,
                            c.last_updated.as_deref().unwrap_or("")
                        );
                    }
                }
                Command::Open(id) => {
                    let opened = state.controller.select_conversation(id.clone().into()).await?;
                    if opened.as_str() != id {
                        println!("Conversation {} no longer exists; started {}", id, opened);
                    } else {
                        for message in state.controller.messages() {
                            let who = match message.role {
                                Role::User => ">",
                                Role::Assistant => "<",
                            };
                            println!("{} {}", who, message.content);
                        }
                    }
                }
                Command::Delete(id) => {
                    state.require(Capability::ManageConversations)?;
                    state.controller.delete_conversation(&id.clone().into()).await?;
                    println!("Deleted conversation {}", id);
                }
                Command::ClearConversations => {
                    state.require(Capability::ManageConversations)?;
                    let id = state.controller.clear_conversations().await?;
                    println!("All conversations deleted. Started {}", id);
                }
                Command::Retry => {
                    if !state.controller.can_retry() {
                        println!("Nothing to retry.");
                    } else {
                        let controller = state.controller.clone();
                        run_turn(state, controller.retry()).await;
                    }
                }
                Command::Mode(None) => println!("Mode: {}", state.controller.mode()),
                Command::Mode(Some(mode)) => {
                    state.controller.set_mode(mode);
                    println!("Mode set to {}", mode);
                }
                Command::Docs => {
                    let documents = state.client.list_documents().await?;
                    if documents.is_empty() {
                        println!("No documents uploaded.");
                    }
                    for doc in documents {
                        let chunks = doc.chunks.map(|c| format!("{} chunks", c)).unwrap_or_default();
                        println!("  {}  {}", doc.name, chunks);
                    }
                }
                Command::Upload(path) => {
                    state.require(Capability::UploadDocuments)?;
                    let name = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .map(str::to_string)
                        .with_context(|| format!("Not a file: {}", path.display()))?;
                    let contents = tokio::fs::read(&path)
                        .await
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    let response = state.client.upload_document(&name, contents).await?;
                    match response.chunks {
                        Some(chunks) => println!("Uploaded {} ({} chunks)", name, chunks),
                        None => println!("Uploaded {}", name),
                    }
                }
                Command::DeleteDoc(name) => {
                    state.require(Capability::DeleteDocuments)?;
                    state.client.delete_document(&name).await?;
                    println!("Deleted {}", name);
                }
                Command::ClearDocs => {
                    state.require(Capability::DeleteDocuments)?;
                    state.client.clear_documents().await?;
                    println!("Documents cleared.");
                }
                Command::ClearAllDocs => {
                    state.require(Capability::DeleteDocuments)?;
                    state.client.clear_all_documents().await?;
                    println!("All documents and indexes cleared.");
                }
                Command::Logs(None) => {
                    state.require(Capability::ViewLogs)?;
                    for log in state.client.list_logs().await? {
                        let size = log.size.map(|s| format!("{} bytes", s)).unwrap_or_default();
                        println!("  {}  {}", log.filename, size);
                    }
                }
                Command::Logs(Some(file)) => {
                    state.require(Capability::ViewLogs)?;
                    let log = state.client.read_log(&file).await?;
                    println!("{}", log.content);
                }
                Command::Status => {
                    state.require(Capability::ViewStatus)?;
                    let status = state.client.status().await?;
                    println!("Backend: {}", status.status);
                    if let Some(model) = &status.model {
                        println!("Model: {}", model);
                    }
                    if let Some(count) = status.document_count {
                        println!("Documents: {}", count);
                    }
                    for (key, value) in &status.extra {
                        println!("{}: {}", key, value);
                    }
                    match state.client.check_ollama().await {
                        Ok(ollama) => println!(
                            "Ollama: {}{}",
                            ollama.status,
                            ollama.message.map(|m| format!(" ({})", m)).unwrap_or_default()
                        ),
                        Err(e) => println!("Ollama: unreachable ({})", e),
                    }
                }
                Command::ClearCache => {
                    state.require(Capability::ManageSettings)?;
                    state.client.clear_cache().await?;
                    println!("Cache cleared.");
                }
                Command::Models => {
                    let models = state.client.list_models().await?;
                    for model in models.models {
                        let marker = if models.current.as_deref() == Some(model.as_str()) { "*" } else { " " };
                        println!("{} {}", marker, model);
                    }
                }
                Command::SetModel(model) => {
                    state.require(Capability::ManageModels)?;
                    state.client.set_model(&model).await?;
                    println!("Model set to {}", model);
                }
                Command::Login(username) => {
                    print!("Password: ");
                    flush_stdout();
                    let password = input.next_line().await?.unwrap_or_default();
                    let user = state.auth.sign_in(&username, password.trim_end()).await?;
                    println!("Signed in as {} ({})", user.username, user.role);
                    state.user = Some(user);
                    state.controller.bootstrap().await?;
                }
                Command::Logout => {
                    state.sign_out();
                    println!("Signed out.");
                }
                Command::WhoAmI => match &state.user {
                    Some(user) => {
                        println!("{} ({})", user.username, user.role);
                        let caps: Vec<&str> = user.capabilities().iter().map(|c| c.as_str()).collect();
                        println!("Capabilities: {}", caps.join(", "));
                    }
                    None => println!("Not signed in."),
                },
            }
            println!();
            Ok(CommandResult::Continue)
        }
    }

    fn print_help() {
        println!("Available commands:");
        println!("  /new                    - Start a new conversation");
        println!("  /list                   - List conversations");
        println!("  /open <id>              - Switch to a conversation");
        println!("  /delete <id>            - Delete a conversation");
        println!("  /clear-conversations    - Delete every conversation");
        println!("  /retry                  - Resend the last failed message");
        println!("  /mode [auto|documents|general] - Show or set the chat mode");
        println!("  /docs                   - List uploaded documents");
        println!("  /upload <path>          - Upload a document");
        println!("  /delete-doc <name>      - Delete a document");
        println!("  /clear-docs             - Clear documents");
        println!("  /clear-all-docs         - Clear documents and indexes");
        println!("  /logs [file]            - List backend logs or show one");
        println!("  /status                 - Backend status");
        println!("  /clear-cache            - Clear the backend cache");
        println!("  /models                 - List models");
        println!("  /model <name>           - Switch model");
        println!("  /login <user>           - Sign in");
        println!("  /logout                 - Sign out");
        println!("  /whoami                 - Show the signed-in user");
        println!("  /quit, /exit            - Exit");
        println!("  Ctrl+C                  - Cancel the answer being streamed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env_file();
    let args = Args::parse();

    if let Some(dir) = &args.data_dir {
        config::PathManager::set_data_dir(dir.clone());
    }
    if let Err(e) = config::PathManager::ensure_dirs_exist() {
        eprintln!("[docchat] Failed to create data directories: {}", e);
    }
    let _log_guard = logging::init_logging(args.tracing);

    let preferences = Arc::new(PreferenceStore::load());
    if let Some(url) = &args.base_url {
        preferences.set_base_url(Some(url));
    }
    if let Some(mode) = args.mode {
        preferences.set_mode(mode.into());
    }
    let base_url = preferences
        .base_url()
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    tracing::info!(base_url = %base_url, "Starting docchat");

    let client = ApiClient::new(base_url);
    let auth = Authenticator::new(client.clone(), preferences.clone());
    let user = match auth.restore().await {
        Ok(user) => user,
        Err(e) => {
            tracing::warn!("Could not restore session: {}", e);
            None
        }
    };

    let controller = Arc::new(ChatController::new(
        Arc::new(HttpTransport::new(client.clone())),
        Arc::new(HttpConversationStore::new(client.clone())),
        preferences.clone(),
    ));

    let mut conversation_events = controller.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = conversation_events.recv().await {
            tracing::debug!(?event, "Conversation event");
        }
    });

    let mut state = AppState {
        client,
        turns: controller.subscribe_turns(),
        controller,
        auth,
        user,
    };

    match state.controller.bootstrap().await {
        Ok(_) => {}
        Err(StoreError::Unauthorized) => {
            state.sign_out();
            println!("Sign in with /login <username>.");
        }
        Err(e) => eprintln!("Could not open a conversation: {}", e),
    }

    println!();
    println!("Type /help for commands, Ctrl+D or /quit to exit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print_status_bar(&state);
        print!("> ");
        flush_stdout();

        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Goodbye!");
                break;
            }
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                println!();
                println!("Goodbye!");
                break;
            }
            Err(e) => {
                eprintln!("Error reading input: {}", e);
                break;
            }
        };

        let input = line.trim();

        if input.is_empty() {
            continue;
        }

        if input.starts_with('/') {
            match commands::Command::parse(input) {
                Ok(cmd) => match cmd.execute(&mut state, &mut lines).await {
                    Ok(commands::CommandResult::Exit) => break,
                    Ok(commands::CommandResult::Continue) => continue,
                    Err(e) => {
                        if is_unauthorized(&e) {
                            state.sign_out();
                            println!("Not signed in. Use /login <username>.");
                        } else {
                            eprintln!("Error: {:#}", e);
                        }
                        println!();
                        continue;
                    }
                },
                Err(err) => {
                    println!("{}", err);
                    println!();
                    continue;
                }
            }
        }

        let controller = state.controller.clone();
        run_turn(&mut state, controller.submit(input)).await;
        println!();
    }

    state.controller.cancel_current();
    state.controller.flush_saves().await;
    Ok(())
}
