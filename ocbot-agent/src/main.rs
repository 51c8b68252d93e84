use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use ocbot_agent::clients::{create_llm_client, LLMClient, Message, ProviderConfig, ProviderType, ToolCall};
use ocbot_agent::core::{AgentCallbacks, AgentLoop, AgentOutcome, AgentState, MAX_ITERATIONS};
use ocbot_agent::memory::{Conversation, TranscriptStore};
use ocbot_agent::settings::{load_settings, save_settings, template_for, templates, Settings};
use ocbot_agent::tools::{default_tools, normalize_url, truncate_chars, BrowserPage, HttpPage};
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const API_KEY_ENV: &str = "OCBOT_API_KEY";
const RESULT_PREVIEW: usize = 160;

#[derive(Parser, Debug)]
#[command(name = "ocbot")]
#[command(version)]
#[command(about = "Browser assistant driven by a tool-calling LLM", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, help = "Provider id from settings, or a provider type")]
    provider: Option<String>,

    #[arg(short, long, global = true)]
    api_key: Option<String>,

    #[arg(short, long, global = true)]
    model: Option<String>,

    #[arg(short, long, global = true, help = "Override the provider's API base URL")]
    base_url: Option<String>,

    #[arg(long, global = true, default_value = "ocbot_settings.json")]
    settings: PathBuf,

    #[arg(long, global = true, default_value = ".ocbot/transcripts")]
    transcripts: PathBuf,

    #[arg(long, global = true, default_value_t = MAX_ITERATIONS, help = "Model turns allowed per task")]
    max_iterations: usize,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Run a single task")]
    Run {
        #[arg(short, long, help = "Task description")]
        task: String,

        #[arg(short, long, help = "Page to open before starting")]
        url: Option<String>,
    },

    #[command(about = "Chat with the assistant, keeping history between prompts")]
    Interactive {
        #[arg(short, long, help = "Page to open before starting")]
        url: Option<String>,
    },

    #[command(about = "List provider templates and configured providers, or edit them")]
    Providers {
        #[command(subcommand)]
        action: Option<ProviderAction>,
    },

    #[command(about = "List saved conversations")]
    Transcripts,
}

#[derive(Subcommand, Debug)]
enum ProviderAction {
    #[command(about = "Add or replace a provider, using --api-key, --model and --base-url")]
    Add {
        id: String,

        #[arg(long = "type", help = "Provider type, e.g. openai or anthropic")]
        provider_type: String,
    },

    #[command(about = "Remove a configured provider")]
    Remove { id: String },

    #[command(about = "Make a configured provider the default")]
    Select { id: String },
}

/// Routes Ctrl-C to the running task, or exits when nothing is running.
#[derive(Clone, Default)]
struct Interrupt {
    active: Arc<Mutex<Option<CancellationToken>>>,
}

impl Interrupt {
    /// Installs the one process-wide Ctrl-C handler.
    fn listen() -> Self {
        let interrupt = Self::default();
        let handler = interrupt.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if !handler.trigger() {
                    println!();
                    std::process::exit(130);
                }
            }
        });
        interrupt
    }

    fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.slot() = Some(token.clone());
        token
    }

    fn end(&self) {
        self.slot().take();
    }

    /// Cancels the active run. Returns false when idle.
    fn trigger(&self) -> bool {
        match self.slot().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Streams text to stdout and tool activity to the terminal in color.
struct ConsolePrinter {
    mid_line: bool,
}

impl ConsolePrinter {
    fn new() -> Self {
        Self { mid_line: false }
    }

    fn break_line(&mut self) {
        if self.mid_line {
            println!();
            self.mid_line = false;
        }
    }
}

impl AgentCallbacks for ConsolePrinter {
    fn on_text_delta(&mut self, text: &str) {
        print!("{}", text);
        let _ = std::io::stdout().flush();
        self.mid_line = !text.ends_with('\n');
    }

    fn on_tool_call_start(&mut self, _id: &str, name: &str) {
        self.break_line();
        println!("{} {}", "▶".cyan(), name.cyan().bold());
    }

    fn on_assistant_message(&mut self, _content: &str, _tool_calls: &[ToolCall]) {
        self.break_line();
    }

    fn on_tool_call_end(&mut self, _id: &str, name: &str, result: &str) {
        let preview = truncate_chars(&result.replace('\n', " "), RESULT_PREVIEW);
        if result.starts_with("Error") {
            println!("  {} {}", name.red(), preview.red());
        } else {
            println!("  {} {}", name.green(), preview.dimmed());
        }
    }

    fn on_error(&mut self, error: &str) {
        self.break_line();
        eprintln!("{} {}", "error:".red().bold(), error);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Settings entry or bare provider type, then command-line overrides.
fn resolve_provider(args: &Args, settings: &Settings) -> Result<ProviderConfig> {
    let mut config = match args.provider.as_deref() {
        Some(id) => match settings.provider(id) {
            Some(config) => config.clone(),
            None => {
                let provider_type = ProviderType::from_str(id)?;
                let model = template_for(provider_type)
                    .map(|t| t.default_model_id)
                    .unwrap_or_default();
                ProviderConfig::new(provider_type, "", model)
            }
        },
        None => settings.selected().cloned().with_context(|| {
            format!(
                "No provider configured. Pass --provider or add one to {}",
                args.settings.display()
            )
        })?,
    };

    if let Some(key) = &args.api_key {
        config.api_key = key.clone();
    } else if config.api_key.is_empty() {
        config.api_key = std::env::var(API_KEY_ENV).unwrap_or_default();
    }
    if let Some(model) = &args.model {
        config.model_id = model.clone();
    }
    if let Some(base_url) = &args.base_url {
        config.base_url = Some(base_url.clone());
    }

    if config.model_id.is_empty() {
        bail!("No model set for provider {}. Pass --model", config.provider_type);
    }
    Ok(config)
}

fn apply_provider_action(settings: &mut Settings, action: &ProviderAction, args: &Args) -> Result<String> {
    match action {
        ProviderAction::Add { id, provider_type } => {
            let provider_type = ProviderType::from_str(provider_type)?;
            let model = args
                .model
                .clone()
                .or_else(|| template_for(provider_type).map(|t| t.default_model_id.to_string()))
                .filter(|m| !m.is_empty())
                .with_context(|| format!("No default model for {}. Pass --model", provider_type))?;

            let mut config = ProviderConfig::new(provider_type, args.api_key.clone().unwrap_or_default(), model);
            config.id = id.clone();
            config.name = id.clone();
            config.base_url = args.base_url.clone();
            settings.save_provider(config);
            Ok(format!("Saved provider {}", id))
        }
        ProviderAction::Remove { id } => {
            let removed = settings.delete_provider(id)?;
            Ok(format!("Removed provider {}", removed.id))
        }
        ProviderAction::Select { id } => {
            settings.select_provider(id)?;
            Ok(format!("Default provider is now {}", id))
        }
    }
}

struct Session {
    agent: AgentLoop,
    page: Arc<dyn BrowserPage>,
    store: TranscriptStore,
    conversation: Conversation,
    interrupt: Interrupt,
}

impl Session {
    async fn start(args: &Args) -> Result<Self> {
        let settings = load_settings(&args.settings)
            .await
            .with_context(|| format!("loading {}", args.settings.display()))?;
        let config = resolve_provider(args, &settings)?;
        let client: Arc<dyn LLMClient> = Arc::from(create_llm_client(config));

        let page: Arc<dyn BrowserPage> = Arc::new(HttpPage::new());
        let agent = AgentLoop::new(client, default_tools(Arc::clone(&page)))
            .with_page(Arc::clone(&page))
            .with_max_iterations(args.max_iterations);

        Ok(Self {
            agent,
            page,
            store: TranscriptStore::new(&args.transcripts),
            conversation: Conversation::new(),
            interrupt: Interrupt::listen(),
        })
    }

    async fn open(&self, url: Option<&str>) -> Result<()> {
        if let Some(url) = url {
            let url = normalize_url(url);
            self.page
                .navigate(&url)
                .await
                .with_context(|| format!("opening {}", url))?;
            if let Some(context) = self.page.context().await {
                println!("{} {} ({})", "page:".dimmed(), context.title, context.url);
            }
        }
        Ok(())
    }

    /// One agent run. Ctrl-C cancels it without leaving the process.
    async fn ask(&mut self, prompt: &str) -> Result<AgentOutcome> {
        let mut history = self.conversation.messages.clone();
        history.push(Message::user(prompt));

        let cancel = self.interrupt.begin();
        let mut printer = ConsolePrinter::new();
        let outcome = self.agent.run(&history, &mut printer, cancel).await;
        self.interrupt.end();
        printer.break_line();

        if outcome.state == AgentState::Cancelled {
            println!("{}", "cancelled".yellow());
        }

        self.conversation.update(&outcome.messages);
        let path = self.store.save(&self.conversation).await?;
        tracing::debug!(path = %path.display(), "conversation saved");

        Ok(outcome)
    }
}

async fn interactive(mut session: Session) -> Result<()> {
    println!("Interactive mode started. Type 'exit' or 'quit' to end.");
    println!();

    let mut reader = tokio::io::BufReader::new(tokio::io::stdin());
    let mut line = String::new();

    loop {
        print!("{} ", ">".bold());
        std::io::stdout().flush()?;

        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
            println!("Goodbye!");
            break;
        }

        session.ask(input).await?;
        println!();
    }

    Ok(())
}

fn print_providers(settings: &Settings) {
    println!("{}", "Templates".bold());
    for template in templates() {
        let model = if template.default_model_id.is_empty() {
            "(set with --model)"
        } else {
            template.default_model_id
        };
        println!(
            "  {:<18} {:<50} {}",
            template.provider_type.as_str().cyan(),
            template.default_base_url,
            model
        );
        for info in template.models {
            println!("      {} - {} ({} tokens)", info.id, info.name, info.context_window);
        }
    }

    let untemplated: Vec<&str> = ProviderType::ALL
        .iter()
        .filter(|t| template_for(**t).is_none())
        .map(|t| t.as_str())
        .collect();
    println!("  also accepted: {}", untemplated.join(", "));

    println!();
    println!("{}", "Configured".bold());
    if settings.providers.is_empty() {
        println!("  none");
    }
    let selected = settings.selected().map(|p| p.id.as_str());
    for provider in &settings.providers {
        let marker = if Some(provider.id.as_str()) == selected { "*" } else { " " };
        println!(
            "{} {:<16} {:<18} {} @ {}",
            marker.green(),
            provider.id,
            provider.provider_type.as_str(),
            provider.model_id,
            provider.resolved_base_url()
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let args = Args::parse();

    match &args.command {
        Commands::Run { task, url } => {
            let mut session = Session::start(&args).await?;
            session.open(url.as_deref()).await?;

            let outcome = session.ask(task).await?;
            if let AgentState::Errored(e) = outcome.state {
                bail!(e);
            }
        }

        Commands::Interactive { url } => {
            let session = Session::start(&args).await?;
            session.open(url.as_deref()).await?;
            interactive(session).await?;
        }

        Commands::Providers { action } => {
            let mut settings = load_settings(&args.settings).await?;
            match action {
                Some(action) => {
                    let message = apply_provider_action(&mut settings, action, &args)?;
                    save_settings(&args.settings, &settings)
                        .await
                        .with_context(|| format!("writing {}", args.settings.display()))?;
                    println!("{}", message.green());
                }
                None => print_providers(&settings),
            }
        }

        Commands::Transcripts => {
            let store = TranscriptStore::new(&args.transcripts);
            let conversations = store.list().await?;
            if conversations.is_empty() {
                println!("No transcripts in {}", store.dir().display());
            }
            for conversation in conversations {
                println!(
                    "{}  {}  {:>3} messages  {}",
                    conversation.id.to_string().dimmed(),
                    conversation.updated_at.format("%Y-%m-%d %H:%M"),
                    conversation.messages.len(),
                    conversation.title
                );
            }
        }
    }

    Ok(())
}
