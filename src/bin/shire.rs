use clap::{Parser, Subcommand};
use shire::{
    compiler::{CompiledResult, Compiler, Environment},
    config::CompilerConfig,
    plan::{MarkdownPlanParser, RegexPlanParser},
    source::FileSystemContext,
    streaming::{StreamingPipeline, StreamingSession},
    tokenizer::tokenize,
    ShireError,
};
use std::{collections::HashMap, path::PathBuf, sync::Arc};
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a script and print its output
    Compile(CompileArgs),

    /// Print the token stream of a script
    Tokens {
        file: PathBuf,
    },

    /// Parse a markdown plan
    Plan {
        file: PathBuf,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[derive(Parser)]
struct CompileArgs {
    /// Path to the script
    file: PathBuf,

    /// Project root, defaults to the script's directory
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Path to a compiler config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Variable override, `name=value`; JSON values are parsed
    #[arg(long = "var", value_parser = parse_override)]
    vars: Vec<(String, serde_json::Value)>,

    /// Agent known besides those in the front-matter
    #[arg(long = "agent")]
    agents: Vec<String>,

    /// Print the full compiled result as JSON
    #[arg(long)]
    json: bool,
}

fn parse_override(s: &str) -> Result<(String, serde_json::Value), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got `{}`", s))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((name.trim().to_string(), value))
}

async fn compile(args: &CompileArgs) -> Result<(), ShireError> {
    let config = match &args.config {
        Some(path) => CompilerConfig::from_file(path)?,
        None => CompilerConfig::default(),
    };
    info!("config loaded.");
    debug!("config: {:?}", config);

    let mut env = Environment::default().with_config(config);
    for agent in &args.agents {
        env = env.with_agent(agent);
    }
    let env = Arc::new(env);

    let source = tokio::fs::read_to_string(&args.file).await?;
    let root = match &args.root {
        Some(root) => root.clone(),
        None => args
            .file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    let fs = FileSystemContext::new(root).with_current_file(&args.file);
    let overrides: HashMap<_, _> = args.vars.iter().cloned().collect();

    let compiler = Compiler::new(env.clone());
    let compiled = compiler.compile(&source, &fs, overrides).await;

    if args.json {
        let json = serde_json::to_string_pretty(&compiled)
            .map_err(|e| ShireError::internal(format!("Failed to serialize result: {}", e)))?;
        println!("{}", json);
    } else if compiled.has_error {
        return Err(ShireError::internal(
            compiled.error_message.unwrap_or_else(|| "compilation failed".to_string()),
        ));
    } else if let Some(agent) = &compiled.agent_invocation {
        println!("{}", agent.context);
        println!("--- dispatch to @{} ---", agent.name);
        println!("{}", agent.prompt);
    } else {
        let pipeline = StreamingPipeline::with_builtins(env.languages.clone());
        let session = StreamingSession::from_compiled(&compiled, fs.clone());
        let outcome = pipeline.run_local(&session, &compiled).await?;
        println!("{}", outcome.output);
        for warning in &outcome.warnings {
            eprintln!("warning: {}", warning);
        }

        let after = compiler
            .after_streaming(&compiled, &outcome.output, &fs, session.cancel.clone())
            .await;
        for notification in &after.notifications {
            eprintln!("notify: {}", notification);
        }
        for warning in &after.warnings {
            eprintln!("warning: {}", warning);
        }
        if !after.executed.is_empty() {
            for document in &after.executed {
                eprintln!("executed: {}", document.path);
            }
            println!("{}", after.output);
            print_warnings(&compiled);
            return Ok(());
        }
    }

    print_warnings(&compiled);
    if let Some(next) = &compiled.next_job {
        eprintln!("next job: {}", next.path);
    }
    Ok(())
}

fn print_warnings(compiled: &CompiledResult) {
    for warning in &compiled.warnings {
        eprintln!("warning: {}", warning);
    }
}

async fn run(cli: &Cli) -> Result<(), ShireError> {
    match &cli.command {
        Commands::Compile(args) => compile(args).await,
        Commands::Tokens { file } => {
            let source = tokio::fs::read_to_string(file).await?;
            for token in tokenize(&source) {
                println!("{}", token);
            }
            Ok(())
        }
        Commands::Plan { file, json } => {
            let markdown = tokio::fs::read_to_string(file).await?;
            let items = RegexPlanParser.parse(&markdown);
            if *json {
                let json = serde_json::to_string_pretty(&items)
                    .map_err(|e| ShireError::internal(format!("Failed to serialize plan: {}", e)))?;
                println!("{}", json);
            } else {
                for (index, item) in items.iter().enumerate() {
                    println!("{}. {}", index + 1, item);
                }
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
