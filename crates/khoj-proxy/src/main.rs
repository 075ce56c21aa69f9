//! `khoj-proxy` binary entrypoint.

use anyhow::{bail, Context, Result};
use clap::Parser;
use khoj_proxy::cli::{AgentCommands, Cli, Commands, ConversationCommands};
use khoj_proxy::{Control, ProxyConfig};
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Respect `RUST_LOG` if set; otherwise default to info.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ProxyConfig::load(cli.config.as_deref(), &cli.overrides())?;
    let control = Control::from_config(&config)?;
    control
        .initialize(cli.conversation_id.as_deref(), cli.new_conversation)
        .await?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&control).await,
        Commands::Status => {
            let conversations = control.conversations();
            println!("Conversation: {}", control.display_handle().await);
            println!("Agent: {}", conversations.active_agent().await);
            println!("{}", control.api_key_status());
            Ok(())
        }
        Commands::Conversation { command } => match command {
            ConversationCommands::New => {
                let handle = control.create_new_conversation().await?;
                println!("New conversation: {}", handle);
                Ok(())
            }
            ConversationCommands::Set { id } => {
                control.set_conversation_handle(&id).await?;
                println!("Conversation: {}", control.display_handle().await);
                Ok(())
            }
        },
        Commands::Agent {
            command: AgentCommands::Set { slug },
        } => {
            control.set_agent_slug(&slug).await?;
            println!("Agent: {}", control.conversations().active_agent().await);
            Ok(())
        }
        Commands::Ask { prompt, timeout } => {
            control
                .conversations()
                .ensure_active()
                .await
                .context("failed to create new conversation")?;

            match control.ask(&prompt.join(" "), Duration::from_secs(timeout)).await {
                Ok(answer) => {
                    println!("{}", answer);
                    Ok(())
                }
                Err(e) if e.is_timeout() => bail!("AI request timed out after {} seconds", timeout),
                Err(e) => Err(e.into()),
            }
        }
    }
}

async fn serve(control: &Control) -> Result<()> {
    let server = control.start_server().await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    server.stop().await
}
