//! # questline
//!
//! `serve` runs the negotiate endpoint and the content responder. `watch`
//! connects as a client, selects one content file, and prints every update
//! it receives. `logs` prints persisted warnings.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use questline_client::{ClientConfig, HttpCredentialSource, SyncContext, WebPubSubTransport};
use questline_core::{ContentUpdate, UserId};
use questline_server::{
    DirectoryContentStore, Negotiator, NegotiatorCredentialSource, ResponderConfig, ServerConfig,
};
use questline_settings::QuestlineSettings;
use questline_telemetry::{LogQuery, TelemetryConfig, init_telemetry};

/// Questline real-time content sync.
#[derive(Parser, Debug)]
#[command(name = "questline", about = "Questline real-time content sync")]
struct Cli {
    /// Settings file (defaults to `~/.questline/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve `/api/negotiate` and answer content requests.
    Serve {
        /// Host to bind.
        #[arg(long)]
        host: Option<String>,
        /// Port to bind (0 for auto-assign).
        #[arg(long)]
        port: Option<u16>,
        /// Directory holding the content files.
        #[arg(long)]
        content_dir: Option<PathBuf>,
        /// Only serve the negotiate endpoint.
        #[arg(long)]
        no_responder: bool,
    },
    /// Select a content file and print the updates that arrive.
    Watch {
        /// Content identifier, e.g. `quests/dragon.md`.
        file: String,
        /// Credential endpoint (overrides settings).
        #[arg(long)]
        endpoint: Option<String>,
        /// Extra channels to join (`navigation`, `events`, ...).
        #[arg(long = "channel")]
        channels: Vec<String>,
    },
    /// Print persisted warnings, errors, and system events, newest first.
    Logs {
        /// Only this level (`WARN` or `ERROR`).
        #[arg(long)]
        level: Option<String>,
        /// Only events concerning this channel.
        #[arg(long)]
        group: Option<String>,
        /// Only system events of this kind (`connect`, `disconnect`).
        #[arg(long)]
        event: Option<String>,
        /// Maximum rows.
        #[arg(long, default_value = "50")]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => questline_settings::load_settings_from_path(path),
        None => questline_settings::load_settings(),
    }
    .context("Failed to load settings")?;

    let mut telemetry = TelemetryConfig {
        json: settings.logging.json,
        persist_warnings: settings.logging.persist_warnings,
        ..TelemetryConfig::default()
    }
    .with_level_name(&settings.logging.level);
    if let Some(path) = &settings.logging.db_path {
        telemetry.log_db_path = PathBuf::from(path);
    }
    let guard = init_telemetry(&telemetry);

    match cli.command {
        Command::Serve {
            host,
            port,
            content_dir,
            no_responder,
        } => {
            let mut config = ServerConfig::from_settings(&settings);
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(dir) = content_dir {
                config.content_dir = dir;
            }
            serve(&settings, config, no_responder).await
        }
        Command::Watch {
            file,
            endpoint,
            channels,
        } => watch(&settings, &file, endpoint, &channels).await,
        Command::Logs {
            level,
            group,
            event,
            limit,
        } => {
            let sink = guard
                .logs()
                .context("Log persistence is disabled (logging.persistWarnings)")?;
            let query = LogQuery {
                level,
                group,
                system_event: event,
                limit: Some(limit),
                ..LogQuery::default()
            };
            for record in sink.query(&query).context("Failed to query logs")? {
                println!(
                    "{} {:5} {} {}",
                    record.timestamp, record.level, record.target, record.message
                );
            }
            Ok(())
        }
    }
}

async fn serve(settings: &QuestlineSettings, config: ServerConfig, no_responder: bool) -> Result<()> {
    let negotiator = Arc::new(
        Negotiator::from_settings(&settings.pubsub).context("Failed to configure Web PubSub negotiator")?,
    );
    let handle = questline_server::start(&config, Arc::clone(&negotiator))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?;
    tracing::info!(port = handle.port, hub = negotiator.hub(), "Questline server ready");

    let responder = if no_responder {
        None
    } else {
        let transport = Arc::new(WebPubSubTransport::new(std::time::Duration::from_millis(
            settings.connection.ack_timeout_ms,
        )));
        let credentials = Arc::new(NegotiatorCredentialSource::new(
            Arc::clone(&negotiator),
            UserId::from_raw("questline-responder"),
        ));
        let store = Arc::new(DirectoryContentStore::new(&config.content_dir));
        match questline_server::start_responder(
            transport,
            credentials,
            &ClientConfig::from_settings(settings),
            store,
            config.responder.clone(),
        )
        .await
        {
            Ok(responder) => {
                tracing::info!(content_dir = %config.content_dir.display(), "content responder ready");
                Some(responder)
            }
            Err(e) => {
                tracing::error!(error = %e, "content responder could not connect, serving negotiate only");
                None
            }
        }
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    if let Some(responder) = responder {
        responder.shutdown().await;
    }
    handle.abort();
    Ok(())
}

async fn watch(
    settings: &QuestlineSettings,
    file: &str,
    endpoint: Option<String>,
    channels: &[String],
) -> Result<()> {
    let endpoint = endpoint.unwrap_or_else(|| settings.client.credential_endpoint.clone());
    let transport = Arc::new(WebPubSubTransport::new(std::time::Duration::from_millis(
        settings.connection.ack_timeout_ms,
    )));
    let credentials = Arc::new(HttpCredentialSource::new(endpoint));
    let (ctx, mut updates) = SyncContext::new(transport, credentials, ClientConfig::from_settings(settings));

    ctx.start().await.context("Failed to connect")?;
    for channel in channels {
        if let Err(e) = ctx.content().join_channel(channel).await {
            tracing::warn!(group = %channel, error = %e, "could not join channel");
        }
    }
    let channel = ctx
        .content()
        .select_file(file)
        .await
        .with_context(|| format!("Failed to select {file}"))?;
    tracing::info!(group = %channel, file, "watching");

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Some(update) => print_update(&update),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    ctx.shutdown().await;
    Ok(())
}

fn print_update(update: &ContentUpdate) {
    match update {
        ContentUpdate::Content {
            group,
            filename,
            content,
        } => println!("── {filename} ({group}) ──\n{content}"),
        ContentUpdate::Events(events) => {
            for event in events {
                println!("[{}] {}", event.timestamp.to_rfc3339(), event.message);
            }
        }
        ContentUpdate::Trainer(summary) | ContentUpdate::Skills(summary) | ContentUpdate::Spells(summary) => {
            println!("── {} ──\n{}", summary.title, summary.markdown);
        }
        ContentUpdate::Profiles(profiles) => {
            for profile in profiles {
                println!("profile {} ({})", profile.name, profile.id);
            }
        }
        ContentUpdate::CurrentProfile(profile) => println!("current profile: {} ({})", profile.name, profile.id),
        ContentUpdate::Navigation(content) => println!("── navigation ──\n{content}"),
    }
}
