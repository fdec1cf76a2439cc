use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::settings::SettingsOverrides;

#[derive(Debug, Parser)]
#[command(name = "murmur", version, about = "Terminal chat client for streaming generations")]
pub struct Cli {
    /// Settings file; defaults to the platform config directory.
    #[arg(long, global = true, env = "MURMUR_CONFIG")]
    pub config: Option<PathBuf>,
    /// Base URL of the generation API.
    #[arg(long = "api", global = true)]
    pub api_base_url: Option<String>,
    #[arg(long, global = true)]
    pub model: Option<String>,
    /// SQLite database file.
    #[arg(long = "db", global = true)]
    pub database_path: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    pub fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            api_base_url: self.api_base_url.clone(),
            model: self.model.clone(),
            database_path: self.database_path.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Chat interactively, or send a single prompt.
    Chat {
        /// Continue an existing conversation instead of starting a new one.
        #[arg(long, short)]
        conversation: Option<String>,
        prompt: Vec<String>,
    },
    /// Re-attach to a generation interrupted by the last exit.
    Resume,
    /// List stored conversations, most recent first.
    List,
    /// Print a conversation's messages.
    Show { conversation: String },
    Rename { conversation: String, title: String },
    Delete { conversation: String },
    /// Print the effective settings; `--save` writes them to the settings file.
    Config {
        #[arg(long)]
        save: bool,
    },
}

impl Default for Command {
    fn default() -> Self {
        Self::Chat {
            conversation: None,
            prompt: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_become_overrides() {
        let cli = Cli::try_parse_from([
            "murmur",
            "show",
            "c1",
            "--api",
            "http://example.test/api",
            "--db",
            "/tmp/chat.db",
        ])
        .expect("parse");

        assert_eq!(
            cli.command,
            Some(Command::Show {
                conversation: "c1".to_string()
            })
        );
        let overrides = cli.overrides();
        assert_eq!(
            overrides.api_base_url.as_deref(),
            Some("http://example.test/api")
        );
        assert_eq!(overrides.model, None);
        assert_eq!(overrides.database_path, Some(PathBuf::from("/tmp/chat.db")));
    }

    #[test]
    fn chat_collects_the_prompt_words() {
        let cli = Cli::try_parse_from(["murmur", "chat", "-c", "c9", "hello", "there"])
            .expect("parse");

        assert_eq!(
            cli.command,
            Some(Command::Chat {
                conversation: Some("c9".to_string()),
                prompt: vec!["hello".to_string(), "there".to_string()],
            })
        );
    }
}
