use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use colloquy_agent::clients::{OpenAIClient, SharedClient};
use colloquy_agent::config::AgentConfig;
use colloquy_agent::core::{AgentError, CallbackError, ConversationSession, END_OF_REASONING};
use colloquy_agent::mcp::{MCPManager, load_mcp_config};
use colloquy_agent::rag::{StoreError, VectorStore, chunk_document};
use colloquy_agent::tools::ExecutionMode;

#[derive(Parser, Debug)]
#[command(name = "colloquy")]
#[command(version)]
#[command(about = "Conversational agent for OpenAI-compatible engines", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, help = "JSON configuration file")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    api_key: Option<String>,

    #[arg(short, long, global = true, help = "Chat model")]
    model: Option<String>,

    #[arg(short, long, global = true, help = "Base URL of the completion engine")]
    base_url: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Interactive streaming chat")]
    Chat {
        #[arg(long, help = "Do not retrieve context from the vector store")]
        no_rag: bool,

        #[arg(long, help = "Show the model's reasoning tokens")]
        reasoning: bool,
    },

    #[command(about = "Ask a single question")]
    Ask {
        question: String,

        #[arg(long, help = "Expose the tools of the configured MCP servers")]
        tools: bool,

        #[arg(long, help = "Run the tool calls of one turn concurrently")]
        parallel: bool,
    },

    #[command(about = "Chunk, embed and store markdown documents")]
    Ingest {
        #[arg(short, long)]
        documents: Option<PathBuf>,

        #[arg(long)]
        chunk_size: Option<usize>,
    },

    #[command(about = "Query the vector store")]
    Search {
        query: String,

        #[arg(short = 'n', long)]
        top_n: Option<usize>,

        #[arg(long)]
        min_similarity: Option<f32>,
    },

    #[command(about = "Check MCP configuration")]
    CheckMcp {
        #[arg(long)]
        mcp_config: Option<PathBuf>,
    },
}

async fn load_config(args: &Args) -> Result<AgentConfig> {
    let mut config = match &args.config {
        Some(path) => AgentConfig::from_file(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?,
        None => AgentConfig::from_env()?,
    };
    if let Some(key) = &args.api_key {
        config.api_key = Some(key.clone());
    }
    if let Some(model) = &args.model {
        config.chat_model = model.clone();
    }
    if let Some(url) = &args.base_url {
        config.engine_url = url.clone();
    }
    config.validate()?;
    Ok(config)
}

fn make_client(config: &AgentConfig) -> SharedClient {
    Arc::new(OpenAIClient::new(
        config.api_key.clone(),
        Some(config.engine_url.clone()),
    ))
}

fn print_chunk(text: &str, _finish_reason: &str) -> Result<(), CallbackError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.flush()?;
    Ok(())
}

async fn open_store(path: &Path) -> Result<Option<VectorStore>> {
    match VectorStore::load(path).await {
        Ok(store) => Ok(Some(store)),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn report_turn_error(error: &AgentError) {
    if error.is_cancelled() {
        println!("\n{}", "(stopped)".yellow());
    } else {
        eprintln!("\n{} {}", "error:".red().bold(), error);
    }
}

async fn chat(config: AgentConfig, no_rag: bool, reasoning: bool) -> Result<()> {
    let client = make_client(&config);
    let store_path = config.store_path.clone();
    let mut session = ConversationSession::new(config, client);

    if !no_rag {
        match open_store(&store_path).await? {
            Some(store) => {
                println!(
                    "{} {} chunks from {}",
                    "RAG:".cyan(),
                    store.len(),
                    store_path.display()
                );
                session = session.with_vector_store(store);
            }
            None => println!("{} no vector store at {}", "RAG:".cyan(), store_path.display()),
        }
    }

    let stop = session.stop_handle();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            stop.stop();
        }
    });

    println!(
        "Chat with {}. Type 'exit' to quit, '/reset' to clear the conversation, '/tokens' for usage.",
        session.config().chat_model.bold()
    );
    println!("Ctrl+C stops the current answer.\n");

    let mut lines = LinesStream::new(tokio::io::BufReader::new(tokio::io::stdin()).lines());
    loop {
        print!("{} ", "you>".green().bold());
        std::io::stdout().flush()?;

        let Some(line) = lines.next().await else {
            break;
        };
        let line = line?;
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        match input {
            "exit" | "quit" => break,
            "/reset" => {
                session.reset();
                println!("{}", "conversation cleared".dimmed());
                continue;
            }
            "/size" => {
                println!("{} characters", session.size());
                continue;
            }
            "/tokens" => {
                println!("{} tokens used", session.total_tokens_used());
                continue;
            }
            _ => {}
        }

        print!("{} ", "bot>".blue().bold());
        let result = if reasoning {
            session
                .generate_with_reasoning(
                    input,
                    |text, reason| {
                        if reason == END_OF_REASONING {
                            print_chunk("\n", "")
                        } else {
                            print_chunk(&text.dimmed().to_string(), reason)
                        }
                    },
                    print_chunk,
                )
                .await
        } else if session.vector_store().is_some() {
            session.generate_with_context(input, print_chunk).await
        } else {
            session.generate(input, print_chunk).await
        };
        println!();

        match result {
            Ok(_) => {}
            Err(e) if e.is_context_exceeded() => {
                report_turn_error(&e);
                match session.compress().await {
                    Ok(_) => println!("{}", "context compressed, please ask again".dimmed()),
                    Err(e) => report_turn_error(&e),
                }
                continue;
            }
            Err(e) => report_turn_error(&e),
        }

        match session.compress_if_over_threshold().await {
            Ok(Some(_)) => println!("{} ({} characters)", "context compressed".dimmed(), session.size()),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "compression failed"),
        }
    }

    println!("Goodbye!");
    Ok(())
}

async fn ask(mut config: AgentConfig, question: &str, tools: bool, parallel: bool) -> Result<()> {
    if parallel {
        config.tool_execution = ExecutionMode::Parallel;
        config.parallel_tool_calls = true;
    }
    let client = make_client(&config);
    let mcp_path = config.mcp_config_path.clone();
    let mut session = ConversationSession::new(config, client);

    if !tools {
        session.generate(question, print_chunk).await?;
        println!();
        return Ok(());
    }

    let mut manager = MCPManager::new(load_mcp_config(&mcp_path).await?);
    for (server, error) in manager.connect_all().await {
        eprintln!("{} {}: {}", "skipping MCP server".yellow(), server, error);
    }
    let outcome = session
        .run_tools_streaming(question, Arc::new(manager), print_chunk)
        .await?;
    println!();
    for result in &outcome.results {
        let marker = if result.is_success() { "✓".green() } else { "✗".red() };
        println!("{} {} {}", marker, result.function_name.bold(), result.content().dimmed());
    }
    println!(
        "{} {} after {} round(s), {} tokens",
        "finished:".cyan(),
        outcome.finish_reason(),
        outcome.rounds,
        session.total_tokens_used()
    );
    Ok(())
}

async fn collect_documents(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_text = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| matches!(e, "md" | "markdown" | "txt"));
        if is_text {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

async fn ingest(config: AgentConfig, documents: Option<PathBuf>, chunk_size: Option<usize>) -> Result<()> {
    let client = make_client(&config);
    let dir = documents.unwrap_or_else(|| config.documents_path.clone());
    let chunk_size = chunk_size.unwrap_or(config.chunk_size);

    let mut chunks = Vec::new();
    for file in collect_documents(&dir).await? {
        let content = tokio::fs::read_to_string(&file).await?;
        let file_chunks = chunk_document(&content, chunk_size);
        println!("{} {} ({} chunks)", "read".dimmed(), file.display(), file_chunks.len());
        chunks.extend(file_chunks);
    }
    if chunks.is_empty() {
        println!("No documents found in {}", dir.display());
        return Ok(());
    }

    let mut store = VectorStore::new(config.embedding_model.clone());
    store.ingest(client.as_ref(), &chunks).await?;
    store.persist(&config.store_path).await?;

    let metrics = store.metrics();
    println!(
        "{} {} chunks, {} dimensions, avg {:.0} chars, {:?} per embedding",
        "stored".green().bold(),
        store.len(),
        store.dimension().unwrap_or(0),
        metrics.avg_chars_per_document(),
        metrics.avg_embedding_time()
    );
    println!("Saved to {}", config.store_path.display());
    Ok(())
}

async fn search(config: AgentConfig, query: &str, top_n: Option<usize>, min_similarity: Option<f32>) -> Result<()> {
    let client = make_client(&config);
    let store = VectorStore::load(&config.store_path).await?;
    let results = store
        .search_top_n(
            client.as_ref(),
            query,
            min_similarity.unwrap_or(config.min_similarity),
            top_n.unwrap_or(config.top_n),
        )
        .await?;

    if results.is_empty() {
        println!("No matches above the similarity threshold.");
    }
    for (rank, result) in results.iter().enumerate() {
        println!("{} {} {}", format!("#{}", rank + 1).bold(), format!("{:.4}", result.score).cyan(), result.id.dimmed());
        println!("{}\n", result.text);
    }
    Ok(())
}

async fn check_mcp(config_path: &Path) -> Result<()> {
    println!("Checking MCP configuration at: {}", config_path.display());
    let config = load_mcp_config(config_path).await?;
    println!("Number of configured servers: {}", config.servers.len());
    for (name, server) in &config.servers {
        println!("  - {}: {} {:?}", name, server.command, server.args);
    }

    let mut manager = MCPManager::new(config);
    for (server, error) in manager.connect_all().await {
        println!("{} {}: {}", "unavailable".red(), server, error);
    }
    for server in manager.servers() {
        println!("{} {}", "connected".green(), server);
    }
    for tool in manager.list_tools() {
        println!("  tool: {}", tool);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args).await?;

    match args.command {
        Commands::Chat { no_rag, reasoning } => chat(config, no_rag, reasoning).await?,
        Commands::Ask {
            question,
            tools,
            parallel,
        } => ask(config, &question, tools, parallel).await?,
        Commands::Ingest {
            documents,
            chunk_size,
        } => ingest(config, documents, chunk_size).await?,
        Commands::Search {
            query,
            top_n,
            min_similarity,
        } => search(config, &query, top_n, min_similarity).await?,
        Commands::CheckMcp { mcp_config } => {
            let path = mcp_config.unwrap_or_else(|| config.mcp_config_path.clone());
            check_mcp(&path).await?
        }
    }

    Ok(())
}
