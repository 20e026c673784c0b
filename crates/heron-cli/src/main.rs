use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use console::style;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use heron::errors::ToolError;
use heron::providers::configs::{OllamaProviderConfig, OpenAiProviderConfig, ProviderConfig};
use heron::providers::factory::get_provider;
use heron::{Agent, AgentConfig, Tool, ToolRegistry};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Provider to talk to
    #[arg(short, long, default_value = "openai")]
    #[arg(value_enum)]
    provider: ProviderVariant,

    /// API key (can also be set via OPENAI_API_KEY)
    #[arg(long)]
    api_key: Option<String>,

    /// Base URL of the provider endpoint
    #[arg(long)]
    host: Option<String>,

    /// Model to use
    #[arg(short, long, default_value = "gpt-4o")]
    model: String,

    /// Disable incremental streaming output
    #[arg(long)]
    no_stream: bool,

    /// Show the tool status block after each tool round
    #[arg(long)]
    tool_status: bool,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum ProviderVariant {
    OpenAi,
    Ollama,
}

/// A couple of local demo tools so the agentic loop has something to call
struct BuiltinRegistry;

#[async_trait]
impl ToolRegistry for BuiltinRegistry {
    fn list_tools(&self) -> Vec<Tool> {
        vec![
            Tool::new(
                "count_words",
                "Count the number of words in text",
                json!({
                    "type": "object",
                    "properties": {
                        "text": {"type": "string", "description": "The text to count words in"}
                    },
                    "required": ["text"]
                }),
            ),
            Tool::new(
                "current_time",
                "Get the current date and time in UTC",
                json!({"type": "object", "properties": {}}),
            ),
        ]
    }

    async fn execute(&self, name: &str, arguments: &Value) -> Result<String, ToolError> {
        match name {
            "count_words" => {
                let text = arguments
                    .get("text")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        ToolError::InvalidParameters("count_words requires a text argument".into())
                    })?;
                Ok(text.split_whitespace().count().to_string())
            }
            "current_time" => Ok(chrono::Utc::now().to_rfc3339()),
            _ => Err(ToolError::NotFound(name.to_string())),
        }
    }
}

fn build_config(cli: &Cli) -> Result<ProviderConfig> {
    match cli.provider {
        ProviderVariant::OpenAi => {
            let api_key = cli
                .api_key
                .clone()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                .context("API key must be provided via --api-key or OPENAI_API_KEY")?;
            let host = cli
                .host
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string());
            Ok(ProviderConfig::OpenAi(OpenAiProviderConfig::new(
                host,
                api_key,
                cli.model.clone(),
            )))
        }
        ProviderVariant::Ollama => {
            let host = cli
                .host
                .clone()
                .or_else(|| std::env::var("OLLAMA_HOST").ok())
                .unwrap_or_else(|| "http://localhost:11434".to_string());
            Ok(ProviderConfig::Ollama(OllamaProviderConfig::new(
                host,
                cli.model.clone(),
            )))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let provider = get_provider(build_config(&cli)?)?;
    let agent = Agent::new(provider, Arc::new(BuiltinRegistry)).with_config(AgentConfig {
        emit_tool_status: cli.tool_status,
        ..Default::default()
    });

    println!(
        "heron chat {}",
        style("- type \"exit\" to end the session").dim()
    );
    println!();

    let mut editor = DefaultEditor::new()?;
    let mut history: Vec<heron::Message> = Vec::new();

    loop {
        let line = match editor.readline(&format!("{} ", style("you:").cyan().bold())) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };

        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        if message.eq_ignore_ascii_case("exit") {
            break;
        }
        editor.add_history_entry(message)?;

        print!("{} ", style("assistant:").green().bold());
        std::io::stdout().flush()?;

        let cancel = CancellationToken::new();
        let on_chunk = |text: &str| {
            print!("{}", text);
            let _ = std::io::stdout().flush();
        };
        let handler: Option<&(dyn Fn(&str) + Send + Sync)> = if cli.no_stream {
            None
        } else {
            Some(&on_chunk)
        };

        match agent
            .reply(
                message,
                "You are a helpful assistant.",
                &history,
                handler,
                cancel,
                None,
            )
            .await
        {
            Ok(response) => {
                if cli.no_stream {
                    println!("{}", response.content);
                } else {
                    println!();
                }
                history.push(heron::Message::user().with_text(message));
                history.push(heron::Message::assistant().with_text(response.content));
            }
            Err(e) => {
                // Partial streamed output stays on screen; the error is
                // reported after it
                println!();
                eprintln!("{} {}", style("error:").red().bold(), e);
            }
        }
        println!();
    }

    Ok(())
}
