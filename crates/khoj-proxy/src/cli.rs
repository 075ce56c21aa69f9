//! CLI commands

use crate::config::Overrides;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// OpenAI-compatible proxy for the Khoj chat API
#[derive(Parser, Debug)]
#[command(name = "khoj-proxy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Khoj API base URL
    #[arg(long, global = true)]
    pub api_base: Option<String>,

    /// Port to listen on
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Conversation state file
    #[arg(long, global = true)]
    pub state_file: Option<PathBuf>,

    /// Refuse to start without KHOJ_API_KEY
    #[arg(long, global = true)]
    pub require_api_key: bool,

    /// Start a new conversation instead of resuming the saved one
    #[arg(short = 'n', long = "new", global = true)]
    pub new_conversation: bool,

    /// Use this conversation ID instead of the saved one
    #[arg(long, global = true)]
    pub conversation_id: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP server (default)
    Serve,

    /// Show the active conversation, agent and API key status
    Status,

    /// Conversation management
    Conversation {
        #[command(subcommand)]
        command: ConversationCommands,
    },

    /// Agent management
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },

    /// Send one prompt in the active conversation and print the answer
    Ask {
        /// The prompt text
        #[arg(required = true, trailing_var_arg = true)]
        prompt: Vec<String>,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConversationCommands {
    /// Create a new remote conversation and make it active
    New,

    /// Make an existing conversation active
    Set {
        /// Conversation ID
        id: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum AgentCommands {
    /// Set the agent used for new conversations (empty resets to default)
    Set {
        /// Agent slug
        #[arg(default_value = "")]
        slug: String,
    },
}

impl Cli {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            api_base: self.api_base.clone(),
            port: self.port,
            state_file: self.state_file.clone(),
            require_api_key: self.require_api_key,
        }
    }
}
