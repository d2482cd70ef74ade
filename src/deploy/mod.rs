//! Boot-and-install automaton for a virsh-hosted StarlingX lab
//!
//! The install is a fixed sequence of [`Stage`]s. [`drive`] walks them in
//! order on any [`StageRunner`] and stops at the first failure; the
//! [`Installer`] is the runner that talks to the real consoles.

mod config;
mod installer;
pub mod log;
pub mod poll;
pub mod stages;
mod staging;
mod virsh;

pub use config::{SystemMode, VarDict};
pub use installer::{Installer, Timing};
pub use poll::{HostListProbe, PollPolicy, SshHostList};
pub use staging::{FileStager, ScpStager};
pub use virsh::{monitor_node_booting, Virsh};

use std::fmt;
use std::future::Future;

use tracing::{debug, error, info};

use crate::result::{Error, Result};

/// One step of the install, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Select the boot options of the primary node and wait for its first login prompt.
    BootPrimary,
    /// Log in with the default credentials and change the password.
    FirstLogin,
    /// Static address, link up and default route on the primary node.
    NetworkBootstrap,
    /// Copy configuration files to the primary node.
    FileStaging,
    /// Run the bootstrap playbook.
    AnsibleBootstrap,
    /// Wait for the primary node to come back after unlocking itself.
    UnlockWait,
    /// Log in again and pick up a changed address.
    PostUnlockLogin,
    /// Wait until controller-0 is unlocked, enabled and available.
    WaitPrimaryAvailable,
    /// Start the other nodes and monitor their consoles.
    SecondaryNodes,
    /// Wait until every node is available.
    WaitAllAvailable,
    /// Wait until kubernetes reports every node ready.
    WaitClusterReady,
    /// Run `lab_setup.sh`.
    WorkloadBootstrap,
}

impl Stage {
    /// Every stage in order.
    pub const ALL: [Stage; 12] = [
        Stage::BootPrimary,
        Stage::FirstLogin,
        Stage::NetworkBootstrap,
        Stage::FileStaging,
        Stage::AnsibleBootstrap,
        Stage::UnlockWait,
        Stage::PostUnlockLogin,
        Stage::WaitPrimaryAvailable,
        Stage::SecondaryNodes,
        Stage::WaitAllAvailable,
        Stage::WaitClusterReady,
        Stage::WorkloadBootstrap,
    ];

    /// 1-based position in the sequence.
    pub fn number(self) -> usize {
        self as usize + 1
    }

    /// Human readable name.
    pub fn name(self) -> &'static str {
        match self {
            Stage::BootPrimary => "boot primary",
            Stage::FirstLogin => "first login",
            Stage::NetworkBootstrap => "network bootstrap",
            Stage::FileStaging => "file staging",
            Stage::AnsibleBootstrap => "ansible bootstrap",
            Stage::UnlockWait => "unlock wait",
            Stage::PostUnlockLogin => "post-unlock login",
            Stage::WaitPrimaryAvailable => "wait primary available",
            Stage::SecondaryNodes => "secondary nodes",
            Stage::WaitAllAvailable => "wait all available",
            Stage::WaitClusterReady => "wait cluster ready",
            Stage::WorkloadBootstrap => "workload bootstrap",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Step {} ({})", self.number(), self.name())
    }
}

/// Something that can execute the stages of an install.
pub trait StageRunner: Send {
    /// Whether `stage` runs at all for this install. Skipped stages are not logged as steps.
    fn applies(&self, stage: Stage) -> bool {
        let _ = stage;
        true
    }

    /// Execute one stage; `Ok` means its exit condition holds.
    fn run_stage(&mut self, stage: Stage) -> impl Future<Output = Result<()>> + Send;

    /// Called once after the last stage ran, whether the run succeeded or not.
    fn finish(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Which stages ran and which were skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployReport {
    /// Stages that ran to completion, in order
    pub completed: Vec<Stage>,
    /// Stages that did not apply
    pub skipped: Vec<Stage>,
}

/// Run every applicable stage in order.
///
/// The first failing stage ends the run; later stages are never started.
///
/// # Errors
///
/// [`Error::Deploy`] naming the failed stage and wrapping its error.
pub async fn drive<R: StageRunner>(runner: &mut R) -> Result<DeployReport> {
    let mut report = DeployReport::default();

    for stage in Stage::ALL {
        if !runner.applies(stage) {
            debug!("{stage} does not apply, skipping");
            report.skipped.push(stage);
            continue;
        }

        log::step(stage, false);
        if let Err(e) = runner.run_stage(stage).await {
            error!("sth went wrong at {stage}: {e}");
            runner.finish().await;
            return Err(Error::Deploy {
                stage,
                source: Box::new(e),
            });
        }
        log::step(stage, true);
        report.completed.push(stage);
    }

    runner.finish().await;
    info!("All {} stages finished", report.completed.len());
    Ok(report)
}
