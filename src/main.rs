mod cli;

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use quillcast::buffer::{BufferReader, Reveal, Typewriter};
use quillcast::config::{Config, load_config, validate_config};
use quillcast::daemon;
use quillcast::engine::Engine;
use quillcast::generation::GenerationRequest;
use quillcast::models::StreamEvent;
use quillcast::subscriber::{EventSubscriber, ReconnectPolicy};

use crate::cli::{Cli, Commands};

const TYPEWRITER_CHARS: usize = 3;
const TYPEWRITER_TICK: Duration = Duration::from_millis(20);

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| format!("loading config from {}", cli.config.display()))?;

    let sentry_guard = init_sentry(&config);
    init_tracing(&config, sentry_guard.is_some());

    info!(config_path = %cli.config.display(), "config loaded");

    validate_config(&config).context("config validation failed")?;
    info!("config validated successfully");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(run(cli.command, config))?;

    drop(sentry_guard);
    Ok(())
}

fn init_sentry(config: &Config) -> Option<sentry::ClientInitGuard> {
    let dsn = config.quillcast.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

fn init_tracing(config: &Config, sentry_enabled: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.quillcast.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_enabled.then(sentry::integrations::tracing::layer))
        .init();
}

async fn run(command: Option<Commands>, config: Config) -> Result<()> {
    match command {
        Some(Commands::Validate) => {
            println!("Configuration is valid.");
        }
        Some(Commands::Serve) | None => {
            daemon::run(config).await?;
        }
        Some(Commands::Providers) => {
            let engine = Engine::from_config(&config).await?;
            let listing = engine.list_providers();
            println!("Rotation strategy: {}", listing.current_strategy);
            for p in &listing.providers {
                println!(
                    "  {:<16} {:<24} model={:<24} configured={} available={} enabled={}",
                    p.name, p.display_name, p.default_model, p.configured, p.available, p.enabled
                );
            }
            if listing.enabled_providers.is_empty() {
                println!("No provider is currently eligible for rotation.");
            }
        }
        Some(Commands::TestProvider { name, apply }) => {
            let engine = Engine::from_config(&config).await?;
            let result = engine.test_provider(&name, apply).await?;
            if result.available {
                let usage = result.token_usage.map(|t| format!(", {t} tokens")).unwrap_or_default();
                println!("{name}: available (model {}{usage})", result.model);
            } else {
                println!(
                    "{name}: unavailable (model {}): {}",
                    result.model,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Some(Commands::Generate {
            topic,
            title,
            style,
            provider,
            model,
            length,
            no_typewriter,
        }) => {
            let engine = Engine::from_config(&config).await?;
            let request = GenerationRequest {
                topic,
                title,
                style,
                provider,
                model,
                length,
            };
            generate(&engine, request, !no_typewriter).await?;
        }
        Some(Commands::Publish { article_id, targets }) => {
            let engine = Engine::from_config(&config).await?;
            let job = engine.publish(&article_id, &targets).await?;
            let results = job.results();
            for result in &results {
                match &result.error {
                    None => println!("  {:<16} ok", result.platform),
                    Some(error) => println!("  {:<16} failed: {error}", result.platform),
                }
            }
            let failed = results.iter().filter(|r| !r.success).count();
            if failed > 0 {
                bail!("publishing failed on {failed} of {} platform(s)", results.len());
            }
        }
        Some(Commands::RefreshFeed { source, limit }) => {
            let engine = Engine::from_config(&config).await?;
            let refresh = engine.refresh_feed(&source, limit).await?;
            println!("{}", refresh.message);
            for item in &refresh.items {
                println!("  {:>3}. {}", item.rank, item.title);
            }
        }
        Some(Commands::Watch { url, token }) => {
            let url = url.unwrap_or_else(|| format!("http://{}", config.server.listen.replace("0.0.0.0", "127.0.0.1")));
            let token = token.or_else(|| config.server.api_token.clone());
            watch(&url, token).await?;
        }
    }

    Ok(())
}

async fn generate(engine: &std::sync::Arc<Engine>, request: GenerationRequest, typewriter: bool) -> Result<()> {
    let mut stream = engine.stream_generate(request)?;
    info!(session = %stream.session_id, "generation started");

    let cancel = stream.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let printer = typewriter.then(|| tokio::spawn(typewrite(stream.buffer.reader())));

    let mut outcome = None;
    while let Some(event) = stream.events.recv().await {
        match event {
            StreamEvent::Progress(p) => debug!(state = ?p.state, progress = p.progress, "progress"),
            StreamEvent::Chunk(_) => {}
            StreamEvent::Complete(article) => outcome = Some(Ok(article)),
            StreamEvent::Error(error) => outcome = Some(Err(error)),
        }
    }
    if let Some(printer) = printer {
        printer.await.context("typewriter task failed")??;
    }

    match outcome {
        Some(Ok(article)) => {
            if !typewriter {
                println!("{}\n\n{}", article.title, article.content);
            }
            println!("\nSaved article {} ({} words).", article.article_id, article.word_count);
            Ok(())
        }
        Some(Err(error)) => {
            let hint = error.hint.map(|h| format!("\nhint: {h}")).unwrap_or_default();
            bail!("{} [trace id {}]{hint}", error.message, error.trace_id)
        }
        None => {
            println!("\nGeneration cancelled.");
            Ok(())
        }
    }
}

async fn typewrite(reader: BufferReader) -> Result<()> {
    let mut typewriter = Typewriter::new(reader, TYPEWRITER_CHARS, TYPEWRITER_TICK);
    let mut out = std::io::stdout();
    while let Some(reveal) = typewriter.next().await {
        match reveal {
            Reveal::Text(text) => write!(out, "{text}")?,
            Reveal::Rewind { .. } => writeln!(out, "\n[retrying with the same provider]")?,
        }
        out.flush()?;
    }
    writeln!(out)?;
    Ok(())
}

async fn watch(url: &str, token: Option<String>) -> Result<()> {
    let mut subscriber = EventSubscriber::new(url, token, ReconnectPolicy::default());
    let mut notifications = subscriber.connect();
    println!("Watching {url} (Ctrl-C to stop)");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            next = notifications.recv() => match next {
                Some(notification) => println!("{}", serde_json::to_string(&notification)?),
                None => {
                    subscriber.close().await;
                    bail!("lost connection to {url}");
                }
            },
        }
    }
    subscriber.close().await;
    Ok(())
}
