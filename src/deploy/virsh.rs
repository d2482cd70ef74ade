//! libvirt domains: starting them and opening their consoles

use std::time::Duration;

use tracing::{debug, error, info};

use super::{stages, Timing};
use crate::pattern::Pattern;
use crate::result::Result;
use crate::runner::CommandRunner;
use crate::session::{ConnectOptions, Session, SessionBuilder};
use crate::terminal::CommandLine;

/// Front-end to the local `virsh`.
#[derive(Debug, Clone, Default)]
pub struct Virsh {
    builder: SessionBuilder,
}

impl Virsh {
    /// Use sessions made by `builder`; its log directory receives the console transcripts.
    pub fn new(builder: SessionBuilder) -> Self {
        Self { builder }
    }

    /// `virsh start <node>`; succeeds once virsh reports the domain started.
    pub async fn start_vm(&self, node: &str, timeout: Duration) -> Result<()> {
        let mut start = self
            .builder
            .clone()
            .name(format!("start-{node}"))
            .process(CommandLine::new("virsh").args(["start", node]));
        start.connect(ConnectOptions::default()).await?;

        let started = start.expect(Pattern::exact("started"), timeout).await;
        start.close();
        match started {
            Ok(_) => {
                debug!("{node} started");
                Ok(())
            }
            Err(e) => {
                error!("failed to start {node}");
                Err(e)
            }
        }
    }

    /// An unconnected console session to `node`, named after it.
    ///
    /// Escape sequences are stripped; boot menus and `watch` redraw the screen.
    pub fn console(&self, node: &str) -> Session {
        self.builder.clone().strip_ansi(true).name(node).console(node)
    }
}

/// Follow a secondary node from installation to unlock.
///
/// Opens the console and waits for two login prompts: the one after the
/// install and the one after the unlock reboot.
pub async fn monitor_node_booting(mut console: Session, node: String, timing: Timing) -> Result<()> {
    let result: Result<()> = async {
        console.connect(ConnectOptions::default()).await?;
        stages::wait_for_boot(&mut console, &node, timing.secondary_install)
            .await
            .inspect_err(|_| error!("Timeout when getting login page for installing node {node}"))?;
        stages::wait_for_boot(&mut console, &node, timing.secondary_unlock)
            .await
            .inspect_err(|_| error!("Timeout when getting login page for unlocking node {node}"))?;
        Ok(())
    }
    .await;
    console.close();

    if result.is_ok() {
        info!("{node} installed and unlocked");
    }
    result
}
