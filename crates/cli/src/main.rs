mod config;

use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use libmaip::protocol::status;
use libmaip::{Client, ClientError, ConnectOptions, Context, OperationResult, Role};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use config::Config;

/// maip - talk to a MAIP inference host from the command line
#[derive(Parser)]
#[command(name = "maip", version, about)]
struct Cli {
    /// Host address (overrides config)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Host port (overrides config)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Username (overrides config)
    #[arg(short, long, global = true)]
    user: Option<String>,

    /// Access token (overrides config)
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List models on the host
    Models {
        /// Only models this user may use
        #[arg(long)]
        accessible: bool,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Load a model
    Load {
        model: String,

        /// Context size
        #[arg(long)]
        ctx: Option<u32>,
    },

    /// Unload a model
    Unload { model: String },

    /// List contexts owned by this session
    Contexts,

    /// Chat with a model. Interactive when no prompt is given.
    Chat {
        /// Model name (default: config default_model)
        #[arg(short, long)]
        model: Option<String>,

        /// Context size
        #[arg(long)]
        ctx: Option<u32>,

        /// System prompt (overrides config)
        #[arg(short, long)]
        system: Option<String>,

        /// One-shot prompt
        prompt: Vec<String>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("maip=info,libmaip=warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load();
    debug!(host = %config.host, port = config.port, "Config loaded");

    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(user) = cli.user {
        config.username = user;
    }
    if let Some(token) = cli.token {
        config.access_token = token;
    }

    let result = connect(&config).and_then(|client| match cli.command {
        Command::Models { accessible, json } => cmd_models(&client, accessible, json),
        Command::Load { model, ctx } => {
            let ctx = ctx.unwrap_or(config.context_size);
            expect_success("load model", client.load_model(&model, ctx))?;
            println!("Loaded {model}");
            Ok(())
        }
        Command::Unload { model } => {
            expect_success("unload model", client.unload_model(&model))?;
            println!("Unloaded {model}");
            Ok(())
        }
        Command::Contexts => {
            let ids = expect_success("list contexts", client.context_ids())?;
            for id in ids.into_data().unwrap_or_default() {
                println!("{id}");
            }
            Ok(())
        }
        Command::Chat {
            model,
            ctx,
            system,
            prompt,
        } => {
            let Some(model) = model.or_else(|| config.default_model.clone()) else {
                return Err("No model given and no default_model configured".to_string());
            };
            let system = system.or_else(|| config.system_prompt.clone());
            let ctx = ctx.unwrap_or(config.context_size);
            cmd_chat(&client, &model, ctx, system.as_deref(), &prompt.join(" "))
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(1)
        }
    }
}

/// Connect and authenticate
fn connect(config: &Config) -> Result<Client, String> {
    let options = ConnectOptions {
        read_timeout: config.read_timeout(),
        ..ConnectOptions::default()
    };
    let client = Client::with_options(
        config.host.as_str(),
        config.port,
        config.username.as_str(),
        config.access_token.as_str(),
        options,
    );
    if !client.is_connection_active() {
        return Err(format!(
            "cannot connect to {}:{}: is the host running?",
            config.host, config.port
        ));
    }

    let auth = check("authenticate", client.create_client())?;
    if !auth.is(status::SUCCESS) {
        return Err(format!(
            "access denied for {} (status {})",
            config.username, auth.status_code
        ));
    }
    Ok(client)
}

/// Turn transport errors and local failures into a message
fn check<T>(
    what: &str,
    result: Result<OperationResult<T>, ClientError>,
) -> Result<OperationResult<T>, String> {
    match result {
        Ok(r) if r.is_local_failure() => Err(format!("Failed to {what}: connection lost")),
        Ok(r) => Ok(r),
        Err(e) => Err(format!("Failed to {what}: {e}")),
    }
}

/// Like [`check`], but also requires the generic success status
fn expect_success<T>(
    what: &str,
    result: Result<OperationResult<T>, ClientError>,
) -> Result<OperationResult<T>, String> {
    let r = check(what, result)?;
    if !r.is(status::SUCCESS) {
        return Err(format!("Failed to {what}: host returned status {}", r.status_code));
    }
    Ok(r)
}

fn cmd_models(client: &Client, accessible: bool, json: bool) -> Result<(), String> {
    let result = if accessible {
        expect_success("list accessible models", client.accessible_models())?
    } else {
        expect_success("list models", client.list_models())?
    };
    let models = result.into_data().unwrap_or_default();

    if json {
        let out = serde_json::to_string_pretty(&models).map_err(|e| e.to_string())?;
        println!("{out}");
    } else if models.is_empty() {
        println!("No models");
    } else {
        for model in models {
            println!("{model}");
        }
    }
    Ok(())
}

fn cmd_chat(
    client: &Client,
    model: &str,
    ctx_size: u32,
    system: Option<&str>,
    prompt: &str,
) -> Result<(), String> {
    let created = check("create context", client.create_context(model, ctx_size))?;
    let Some(mut ctx) = created.data else {
        return Err(format!(
            "Failed to create context for {model}: host returned status {}",
            created.status_code
        ));
    };
    debug!(ctx = ctx.id(), "Context ready");

    let mut pending = Vec::new();
    if let Some(system) = system {
        pending.push(queue_input(&mut ctx, Role::System, system)?);
    }

    let outcome = if prompt.is_empty() {
        chat_loop(&mut ctx, pending)
    } else {
        pending.push(queue_input(&mut ctx, Role::User, prompt)?);
        run_round(&mut ctx, &pending)
    };

    if let Err(e) = ctx.destroy() {
        debug!("Context teardown failed: {e}");
    }
    outcome
}

/// Interactive REPL: one generation round per stdin line
fn chat_loop(ctx: &mut Context, mut pending: Vec<String>) -> Result<(), String> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!("> ");
        io::stdout().flush().map_err(|e| e.to_string())?;

        let Some(line) = lines.next() else {
            println!();
            return Ok(());
        };
        let line = line.map_err(|e| e.to_string())?;
        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => return Ok(()),
            "/clear" => {
                expect_success("clear history", ctx.clear_history())?;
                println!("History cleared");
                continue;
            }
            text => {
                pending.push(queue_input(ctx, Role::User, text)?);
                run_round(ctx, &pending)?;
                pending.clear();
            }
        }
    }
}

fn queue_input(ctx: &mut Context, role: Role, text: &str) -> Result<String, String> {
    let result = expect_success("queue input", ctx.set_input(role, text))?;
    result
        .into_data()
        .ok_or_else(|| "Failed to queue input: no message id".to_string())
}

/// Execute queued inputs and print tokens as they arrive
fn run_round(ctx: &mut Context, message_ids: &[String]) -> Result<(), String> {
    let started = check("execute input", ctx.execute_input(message_ids))?;
    if !started.is(status::SUCCESS) && !started.is(status::EXEC_SUCCESS) {
        return Err(format!(
            "Failed to execute input: host returned status {}",
            started.status_code
        ));
    }

    let mut stdout = io::stdout().lock();
    let mut generation = ctx.stream();
    for token in generation.by_ref() {
        let token = token.map_err(|e| format!("Generation failed: {e}"))?;
        if token.special {
            continue;
        }
        write!(stdout, "{}", token.token).map_err(|e| e.to_string())?;
        stdout.flush().map_err(|e| e.to_string())?;
    }
    writeln!(stdout).map_err(|e| e.to_string())?;

    match generation.finish_status() {
        Some(code) if code == libmaip::NO_RESULT_STATUS => {
            Err("Generation failed: connection lost".to_string())
        }
        Some(code) => {
            debug!(status = code, "Generation finished");
            Ok(())
        }
        None => Ok(()),
    }
}
