use async_trait::async_trait;
use eyre::Result;
use std::io::Write;
use std::path::PathBuf;

use super::Command;
use crate::cli::ConfigCommands;
use crate::error::Error;
use execd_core::CoordinatorConfig;

pub struct ConfigCommand {
    pub config: CoordinatorConfig,
    /// Explicit `--config` path, if one was given.
    pub path: Option<PathBuf>,
    pub action: ConfigCommands,
}

#[async_trait]
impl Command for ConfigCommand {
    async fn execute(&self) -> Result<()> {
        let mut stdout = std::io::stdout();
        match self.action {
            ConfigCommands::Show => self.show(&mut stdout)?,
            ConfigCommands::Path => self.print_path(&mut stdout)?,
        }
        Ok(())
    }
}

impl ConfigCommand {
    fn resolved_path(&self) -> std::result::Result<PathBuf, Error> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => Ok(CoordinatorConfig::default_path()?),
        }
    }

    fn show(&self, out: &mut impl Write) -> std::result::Result<(), Error> {
        let path = self.resolved_path()?;
        let source = if path.exists() { "" } else { " (not found, using defaults)" };
        writeln!(out, "# Config file: {}{source}", path.display())?;
        writeln!(out, "{}", self.config.to_toml()?)?;
        Ok(())
    }

    fn print_path(&self, out: &mut impl Write) -> std::result::Result<(), Error> {
        writeln!(out, "{}", self.resolved_path()?.display())?;
        Ok(())
    }
}
