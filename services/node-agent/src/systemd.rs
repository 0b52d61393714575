//! Process manager backed by `systemctl`.

use async_trait::async_trait;
use tracing::debug;

use crate::command::{self, CommandError};
use crate::error::Result;
use crate::runtime::{UnitManager, UnitState};

/// Drives VM units through systemd.
#[derive(Debug, Clone, Default)]
pub struct SystemdUnits;

impl SystemdUnits {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl UnitManager for SystemdUnits {
    async fn start(&self, unit: &str) -> Result<()> {
        command::run("systemctl", &["start", unit]).await?;
        Ok(())
    }

    async fn stop(&self, unit: &str) -> Result<()> {
        match command::run("systemctl", &["stop", unit]).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_missing() => {
                debug!(unit, "Unit not loaded, nothing to stop");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn reload(&self) -> Result<()> {
        command::run("systemctl", &["daemon-reload"]).await?;
        Ok(())
    }

    async fn state(&self, unit: &str) -> Result<UnitState> {
        // is-active exits non-zero for anything but "active" and still prints the state
        let out = command::output("systemctl", &["is-active", unit]).await?;
        if !out.success && out.stdout.trim().is_empty() {
            return Err(CommandError::Failed {
                command: format!("systemctl is-active {unit}"),
                stderr: out.stderr,
            }
            .into());
        }
        Ok(UnitState::parse(&out.stdout))
    }
}
