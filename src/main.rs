use anyhow::{Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use orderdesk::backend::BackendClient;
use orderdesk::catalog::{self, SchemaDialect};
use orderdesk::config::{Config, LlmConfig};
use orderdesk::llm::{self, LlmClient, Provider};
use orderdesk::orchestrator::{Orchestrator, TurnState};
use orderdesk::retry::RetryPolicy;
use orderdesk::session::SessionState;
use serde_json::{Value, json};
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "orderdesk",
    about = "Customer support assistant that answers through the order backend"
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, default_value = "orderdesk.toml")]
    config: PathBuf,

    /// LLM provider override: gemini, anthropic, openrouter, openai
    #[arg(long, global = true)]
    provider: Option<String>,

    /// LLM model override
    #[arg(long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive chat on stdin/stdout
    Chat,

    /// Answer a single message and exit
    Ask {
        /// The customer message
        #[arg(required = true)]
        text: Vec<String>,
    },

    /// Print the operation catalog as tool declarations
    Tools {
        #[arg(long, value_enum, default_value_t = ToolFormat::Json)]
        format: ToolFormat,
    },

    /// Compare the backend's advertised operations with the catalog
    Check,
}

#[derive(Clone, Copy, ValueEnum)]
enum ToolFormat {
    Json,
    Gemini,
    Openai,
    Anthropic,
}

/// Apply `--provider` / `--model` on top of the config file.
fn apply_llm_override(
    llm_config: &mut LlmConfig,
    provider: Option<String>,
    model: Option<String>,
) -> Result<()> {
    if let Some(name) = provider {
        let Some(provider) = Provider::parse(&name) else {
            bail!("unknown provider '{name}' (expected gemini, anthropic, openrouter or openai)");
        };
        if provider != llm_config.provider && model.is_none() {
            llm_config.model = provider.default_model().into();
        }
        llm_config.provider = provider;
    }
    if let Some(model) = model {
        llm_config.model = model;
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load_or_default(&cli.config)?;
    apply_llm_override(&mut config.llm, cli.provider.clone(), cli.model.clone())?;
    config.validate()?;
    Ok(config)
}

/// MCP handshake and catalog comparison. Failures are logged, not fatal:
/// the client repeats the handshake on its first call, and operations the
/// backend cannot serve fail individually at call time.
async fn prepare_backend(backend: &BackendClient, check: bool) {
    if let Err(e) = backend.initialize().await {
        warn!(error = %e, "backend handshake failed");
        return;
    }
    if check {
        if let Err(e) = backend.discover_operations().await {
            warn!(error = %e, "backend operation discovery failed");
        }
    }
}

async fn build_orchestrator(config: Config) -> Result<Orchestrator<LlmClient>> {
    let retry = RetryPolicy::from_config(&config.retry);
    let llm = LlmClient::from_config(&config.llm)?;
    info!(provider = ?llm.provider(), model = llm.model(), "LLM client ready");

    let backend = BackendClient::from_config(&config.backend, retry.clone())?;
    prepare_backend(&backend, config.backend.check_on_startup).await;

    Ok(Orchestrator::new(
        llm,
        backend,
        config.conversation,
        config.assistant,
        retry,
    )?)
}

fn tool_listing(format: ToolFormat) -> Value {
    let tools = catalog::list_operations();
    match format {
        ToolFormat::Json => tools
            .iter()
            .map(|spec| {
                json!({
                    "name": spec.name(),
                    "description": spec.description,
                    "parameters": spec.parameter_schema(SchemaDialect::JsonSchema),
                })
            })
            .collect(),
        ToolFormat::Gemini => llm::tool_declarations(Provider::Gemini, tools),
        ToolFormat::Openai => llm::tool_declarations(Provider::OpenAi, tools),
        ToolFormat::Anthropic => llm::tool_declarations(Provider::Anthropic, tools),
    }
}

fn print_status(session: &SessionState) {
    match session.customer() {
        Some(customer) => {
            let who = customer
                .name
                .as_deref()
                .or(customer.email.as_deref())
                .unwrap_or("customer");
            println!(
                "Verified as {who} since {}",
                customer.verified_at.format("%Y-%m-%d %H:%M UTC")
            );
        }
        None => println!("Not verified"),
    }
    println!("{} history entries", session.history().len());
}

async fn chat(orchestrator: &Orchestrator<LlmClient>, company: &str) -> Result<()> {
    let mut session = SessionState::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("{company} support. Commands: /status /logout /clear /quit");
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let input = line.trim();

        match input {
            "" => continue,
            "/quit" | "/exit" => break,
            "/logout" => {
                session.logout();
                println!("Logged out.");
                continue;
            }
            "/clear" => {
                session.clear();
                println!("Chat cleared.");
                continue;
            }
            "/status" => {
                print_status(&session);
                continue;
            }
            _ => {}
        }

        // Dropping the turn future on Ctrl-C leaves the session untouched.
        tokio::select! {
            reply = orchestrator.handle_user_turn(&mut session, input) => println!("\n{reply}\n"),
            _ = tokio::signal::ctrl_c() => println!("\n(cancelled)\n"),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("orderdesk=info")),
        )
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    match &cli.command {
        Command::Chat => {
            let config = load_config(&cli)?;
            let company = config.assistant.company_name.clone();
            let orchestrator = build_orchestrator(config).await?;
            chat(&orchestrator, &company).await
        }
        Command::Ask { text } => {
            let config = load_config(&cli)?;
            let orchestrator = build_orchestrator(config).await?;
            let mut session = SessionState::new();
            let outcome = orchestrator.run_turn(&mut session, &text.join(" ")).await;
            println!("{}", outcome.message);
            if let TurnState::Aborted(reason) = outcome.state {
                bail!("turn aborted: {reason:?}");
            }
            Ok(())
        }
        Command::Tools { format } => {
            println!("{}", serde_json::to_string_pretty(&tool_listing(*format))?);
            Ok(())
        }
        Command::Check => {
            let config = load_config(&cli)?;
            let retry = RetryPolicy::from_config(&config.retry);
            let backend = BackendClient::from_config(&config.backend, retry)?;
            backend.initialize().await?;
            let check = backend.discover_operations().await?;
            println!(
                "{} catalog operations, backend at {}",
                catalog::list_operations().len(),
                config.backend.url
            );
            for name in &check.missing {
                println!("  missing: {name}");
            }
            for name in &check.extra {
                println!("  extra:   {name}");
            }
            if !check.is_superset() {
                bail!("backend does not serve {} catalog operation(s)", check.missing.len());
            }
            println!("ok");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_override_switches_default_model() {
        let mut config = LlmConfig::default();
        apply_llm_override(&mut config, Some("anthropic".into()), None).unwrap();
        assert_eq!(config.provider, Provider::Anthropic);
        assert_eq!(config.model, Provider::Anthropic.default_model());

        apply_llm_override(&mut config, None, Some("claude-haiku-4-5".into())).unwrap();
        assert_eq!(config.model, "claude-haiku-4-5");

        assert!(apply_llm_override(&mut config, Some("bard".into()), None).is_err());
    }

    #[test]
    fn tool_listing_formats() {
        let plain = tool_listing(ToolFormat::Json);
        assert_eq!(plain.as_array().unwrap().len(), 8);
        assert_eq!(plain[0]["name"], "list_products");
        let gemini = tool_listing(ToolFormat::Gemini);
        assert_eq!(gemini[0]["functionDeclarations"][1]["parameters"]["type"], "OBJECT");
    }
}
