//! `HostControl` over NetworkManager, systemd and `systemd-detect-virt`.

use crate::command::SystemRunner;
use ironseal_core::error::{IronsealError, IronsealResult};
use ironseal_core::HostControl;
use ironseal_provider::{CommandOutput, CommandRunner};
use log::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct SystemHost<R = SystemRunner> {
    runner: R,
}

impl<R> SystemHost<R>
where
    R: CommandRunner<Error = IronsealError>,
{
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    fn run(&self, program: &str, args: &[&str]) -> IronsealResult<CommandOutput> {
        let args: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
        self.runner.run(program, &args, None)
    }
}

impl<R> HostControl for SystemHost<R>
where
    R: CommandRunner<Error = IronsealError> + Send + Sync,
{
    fn set_networking(&self, enabled: bool) -> IronsealResult<()> {
        let state = if enabled { "on" } else { "off" };
        let out = self.run("nmcli", &["networking", state])?;
        if !out.success() {
            return Err(IronsealError::provider(format!(
                "nmcli networking {state} failed: {}",
                out.diagnostic()
            )));
        }
        info!("networking switched {state}");
        Ok(())
    }

    fn power_off(&self) -> IronsealResult<()> {
        warn!("requesting system power-off");
        let out = self.run("systemctl", &["poweroff"])?;
        if !out.success() {
            return Err(IronsealError::provider(format!(
                "systemctl poweroff failed: {}",
                out.diagnostic()
            )));
        }
        Ok(())
    }

    fn virtualization(&self) -> IronsealResult<Option<String>> {
        let out = self.run("systemd-detect-virt", &[])?;
        let name = out.stdout.trim();
        // Exit 1 with "none" is the bare-metal answer.
        if name == "none" || (out.status == 1 && name.is_empty()) {
            return Ok(None);
        }
        if !out.success() && out.status != 1 {
            return Err(IronsealError::provider(format!(
                "systemd-detect-virt failed: {}",
                out.diagnostic()
            )));
        }
        Ok(Some(name.to_string()))
    }
}
