use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::StreamExt;

use chatlist_core_sdk::prelude::*;

/**
 * \brief CLI entry: send one prompt to every active model and compare the answers.
 */
#[derive(Parser, Debug)]
#[command(name = "chatlist", version, about = "Compare LLM answers side by side")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief Create the database and seed the default model list.
     */
    Init {
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        telemetry: bool,
    },

    /**
     * \brief Manage configured models.
     */
    #[command(subcommand)]
    Models(ModelCommand),

    /**
     * \brief Show or change dispatch and generation settings.
     */
    #[command(subcommand)]
    Settings(SettingsCommand),

    /**
     * \brief Send a prompt to all active models and print answers as they arrive.
     */
    Send(SendArgs),

    /**
     * \brief List saved results, optionally for one prompt.
     */
    History {
        #[arg(long)]
        prompt_id: Option<i64>,
    },

    /**
     * \brief Average response time and error counts per model.
     */
    Metrics,

    /**
     * \brief Start the local HTTP service.
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },
}

#[derive(Subcommand, Debug)]
enum ModelCommand {
    List,
    Add {
        /** \brief Model id sent to the API, also the unique name. */
        #[arg(long)]
        name: String,
        #[arg(long)]
        url: String,
        /** \brief Environment variable holding the API key. */
        #[arg(long)]
        key: String,
        #[arg(long, default_value_t = false)]
        inactive: bool,
    },
    Remove {
        #[arg(long)]
        name: String,
    },
    Enable {
        #[arg(long)]
        name: String,
    },
    Disable {
        #[arg(long)]
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsCommand {
    Show,
    Set {
        /** \brief Stagger step between providers, seconds. */
        #[arg(long)]
        delay: Option<f64>,
        /** \brief Per-request timeout, seconds. */
        #[arg(long)]
        timeout: Option<f64>,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long)]
        max_tokens: Option<u32>,
        #[arg(long)]
        top_p: Option<f32>,
        #[arg(long)]
        thinking: Option<bool>,
        #[arg(long)]
        telemetry: Option<bool>,
    },
}

#[derive(Args, Debug)]
struct SendArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    temperature: Option<f32>,
    #[arg(long)]
    max_tokens: Option<u32>,
    #[arg(long)]
    top_p: Option<f32>,
    /** \brief Ask reasoning-capable providers to think first. */
    #[arg(long, default_value_t = false)]
    thinking: bool,
    /** \brief Only these models (repeatable). */
    #[arg(long = "only")]
    only: Vec<String>,
    /** \brief Re-run the failed models once after the batch. */
    #[arg(long, default_value_t = false)]
    retry_failed: bool,
    /** \brief Save the successful answers to history. */
    #[arg(long, default_value_t = false)]
    save: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let conn = db::open_default_db().context("open database failed")?;
    db::migrate(&conn).context("apply migrations failed")?;
    telemetry::set_enabled(db::get_telemetry_enabled(&conn).unwrap_or(true));

    match cli.command {
        Commands::Init { telemetry: enabled } => {
            let seeded = db::seed_default_providers(&conn).context("seed models failed")?;
            db::set_telemetry_enabled(&conn, enabled).context("save telemetry failed")?;
            telemetry::set_enabled(enabled);
            println!("Database ready, {} default models added", seeded);
        }
        Commands::Models(cmd) => run_models(&conn, cmd)?,
        Commands::Settings(cmd) => run_settings(&conn, cmd)?,
        Commands::Send(args) => run_send(&conn, args).await?,
        Commands::History { prompt_id } => {
            let rows = db::list_results(&conn, prompt_id).context("load results failed")?;
            for row in rows {
                println!(
                    "#{} prompt={} {} [{}] {:.2}s {}",
                    row.id, row.prompt_id, row.model_name, row.status, row.resp_time, row.date
                );
                println!("    {}", preview(&row.response, 160));
            }
        }
        Commands::Metrics => {
            let metrics = db::all_metrics(&conn).context("load metrics failed")?;
            let mut names: Vec<_> = metrics.keys().cloned().collect();
            names.sort();
            for name in names {
                let m = metrics[&name];
                println!("{:<50} avg {:>6.2}s  errors {}", name, m.avg_time, m.errors);
            }
            let popular = db::popularity(&conn, 5).context("load popularity failed")?;
            if !popular.is_empty() {
                println!("\nMost used:");
                for (name, count) in popular {
                    println!("  {} ({})", name, count);
                }
            }
        }
        Commands::Serve { addr } => {
            server::run(&addr).await?;
        }
    }

    Ok(())
}

fn run_models(conn: &db::Connection, cmd: ModelCommand) -> Result<()> {
    match cmd {
        ModelCommand::List => {
            for p in db::list_providers(conn, false)? {
                println!(
                    "{} {:<50} {:<24} {}",
                    if p.active { "*" } else { " " },
                    p.name,
                    p.credential_id,
                    p.api_url
                );
            }
        }
        ModelCommand::Add {
            name,
            url,
            key,
            inactive,
        } => {
            let mut provider = ProviderConfig::new(&name, &url, &key);
            provider.active = !inactive;
            db::upsert_provider(conn, &provider).context("save model failed")?;
            println!("Saved model {}", name);
        }
        ModelCommand::Remove { name } => {
            db::delete_provider(conn, &name)?;
            println!("Removed model {}", name);
        }
        ModelCommand::Enable { name } => db::set_provider_active(conn, &name, true)?,
        ModelCommand::Disable { name } => db::set_provider_active(conn, &name, false)?,
    }
    Ok(())
}

fn run_settings(conn: &db::Connection, cmd: SettingsCommand) -> Result<()> {
    match cmd {
        SettingsCommand::Show => {}
        SettingsCommand::Set {
            delay,
            timeout,
            temperature,
            max_tokens,
            top_p,
            thinking,
            telemetry: telemetry_flag,
        } => {
            let mut dispatch = db::load_dispatch_settings(conn)?;
            if let Some(d) = delay {
                dispatch.delay_step_seconds = d;
            }
            if let Some(t) = timeout {
                dispatch.timeout_seconds = t;
            }

            let mut generation = db::load_generation_defaults(conn)?;
            if let Some(t) = temperature {
                generation.temperature = t;
            }
            if let Some(m) = max_tokens {
                generation.max_tokens = m;
            }
            if let Some(p) = top_p {
                generation.top_p = p;
            }
            if let Some(t) = thinking {
                generation.thinking_enabled = t;
            }
            dispatch.validate()?;
            generation.validate()?;
            db::save_dispatch_settings(conn, &dispatch)?;
            db::save_generation_defaults(conn, &generation)?;

            if let Some(enabled) = telemetry_flag {
                db::set_telemetry_enabled(conn, enabled)?;
                telemetry::set_enabled(enabled);
            }
        }
    }

    let dispatch = db::load_dispatch_settings(conn)?;
    let generation = db::load_generation_defaults(conn)?;
    println!("request_delay    {}s", dispatch.delay_step_seconds);
    println!("request_timeout  {}s", dispatch.timeout_seconds);
    println!("temperature      {}", generation.temperature);
    println!("max_tokens       {}", generation.max_tokens);
    println!("top_p            {}", generation.top_p);
    println!("thinking         {}", generation.thinking_enabled);
    println!("telemetry        {}", db::get_telemetry_enabled(conn)?);
    Ok(())
}

async fn run_send(conn: &db::Connection, args: SendArgs) -> Result<()> {
    let prompt = args.prompt.trim().to_string();
    if prompt.is_empty() {
        bail!("prompt must not be empty");
    }

    let defaults = db::load_generation_defaults(conn)?;
    let params = GenerationParameters {
        temperature: args.temperature.unwrap_or(defaults.temperature),
        max_tokens: args.max_tokens.unwrap_or(defaults.max_tokens),
        top_p: args.top_p.unwrap_or(defaults.top_p),
        thinking_enabled: args.thinking || defaults.thinking_enabled,
    };
    params.validate()?;

    let mut providers = db::list_providers(conn, true)?;
    if !args.only.is_empty() {
        providers.retain(|p| args.only.contains(&p.name));
    }
    if providers.is_empty() {
        bail!("no active models, run: chatlist models add --name ... --url ... --key ...");
    }

    let dispatcher = Dispatcher::new(Executor::from_env().context("create http client failed")?);
    let settings = db::load_dispatch_settings(conn)?;
    println!(
        "Sending to {} models (delay {}s, timeout {}s)...",
        providers.len(),
        settings.delay_step_seconds,
        settings.timeout_seconds
    );
    let batch = dispatcher.dispatch(&prompt, &providers, &params, &settings);
    let mut results = print_as_completed(batch).await;

    if args.retry_failed && results.iter().any(|o| o.is_error()) {
        let settings = db::load_dispatch_settings(conn)?;
        let batch = dispatcher.retry_failed(&prompt, &results, &providers, &params, &settings);
        println!("\nRetrying {} failed models...", batch.len());
        let retried = print_as_completed(batch).await;
        merge_outcomes(&mut results, retried);
    }

    println!("\nSummary:");
    for o in &results {
        println!("  {:<50} {:<16} {:>7.2}s", o.provider_name, o.status, o.elapsed_seconds);
    }

    if args.save {
        let successes: Vec<RequestOutcome> =
            results.iter().filter(|o| !o.is_error()).cloned().collect();
        if successes.is_empty() {
            println!("Nothing to save: no successful answers.");
        } else {
            let prompt_id = db::save_selected(conn, &prompt, &successes)?;
            println!("Saved {} answers under prompt #{}", successes.len(), prompt_id);
        }
    }
    Ok(())
}

async fn print_as_completed(batch: Batch) -> Vec<RequestOutcome> {
    let mut stream = Box::pin(Aggregator::new(batch).into_stream());
    let mut outcomes = Vec::new();
    while let Some(step) = stream.next().await {
        println!(
            "\n[{}/{}] {} - {} ({:.2}s)",
            step.completed,
            step.total,
            step.outcome.provider_name,
            step.outcome.status,
            step.outcome.elapsed_seconds
        );
        println!("{}", step.outcome.response_text);
        outcomes = step.snapshot;
    }
    outcomes
}

fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}
