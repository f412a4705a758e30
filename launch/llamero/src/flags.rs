// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "llamero", version, about = "LLM gateway in front of Ollama backends")]
pub struct Flags {
    /// TOML configuration file. Environment variables prefixed `LLAMERO_` override it.
    #[arg(long, short, env = "LLAMERO_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Defaults to `all`
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// HTTP gateway. Reconciles configured backends and runs an initial sync.
    Serve,

    /// Consume sync tasks from the queue
    Worker,

    /// Enqueue a full sync on a fixed interval
    Scheduler,

    /// Gateway, worker pool and scheduler in one process
    All,
}

impl Command {
    pub fn serves(&self) -> bool {
        matches!(self, Command::Serve | Command::All)
    }

    pub fn works(&self) -> bool {
        matches!(self, Command::Worker | Command::All)
    }

    pub fn schedules(&self) -> bool {
        matches!(self, Command::Scheduler | Command::All)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Command::Serve => "serve",
            Command::Worker => "worker",
            Command::Scheduler => "scheduler",
            Command::All => "all",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subcommands() {
        let flags = Flags::try_parse_from(["llamero", "worker", "--config", "/etc/llamero.toml"])
            .expect("parse");
        assert_eq!(flags.command, Some(Command::Worker));
        assert_eq!(flags.config, Some(PathBuf::from("/etc/llamero.toml")));

        let flags = Flags::try_parse_from(["llamero"]).expect("parse");
        assert_eq!(flags.command, None);

        assert!(Flags::try_parse_from(["llamero", "explode"]).is_err());
    }

    #[test]
    fn test_roles() {
        assert!(Command::All.serves() && Command::All.works() && Command::All.schedules());
        assert!(Command::Serve.serves() && !Command::Serve.works());
        assert!(Command::Scheduler.schedules() && !Command::Scheduler.serves());
    }
}
