//! The install of a whole lab, stage by stage

use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::log::Spinner;
use super::poll::{self, HostListProbe, PollPolicy};
use super::stages::{self, ANSIBLE_COMMAND, WATCH_HOST_LIST};
use super::{drive, DeployReport, FileStager, Stage, StageRunner, SystemMode, VarDict, Virsh};
use crate::result::{Error, Result};
use crate::runner::CommandRunner;
use crate::session::{ConnectOptions, Session, SessionBuilder};

/// Every wait of the install.
///
/// The defaults are what a real lab needs; tests shrink them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Pause after opening the primary console
    pub console_settle: Duration,
    /// Pause after each key press in the boot menu
    pub key_delay: Duration,
    /// Wait for the installer to answer the boot menu
    pub boot_menu: Duration,
    /// Wait for the first login prompt of the primary node
    pub boot: Duration,
    /// Wait for shell prompts and login dialog steps
    pub prompt: Duration,
    /// Wait for the sudo password request
    pub sudo_password: Duration,
    /// Wait for the playbook summary
    pub ansible: Duration,
    /// Wait for the login prompt after the primary node unlocked
    pub unlock: Duration,
    /// Wait for `virsh start` to report the domain started
    pub start_vm: Duration,
    /// First login prompt of a secondary node
    pub secondary_install: Duration,
    /// Login prompt of a secondary node after its unlock
    pub secondary_unlock: Duration,
    /// Wait for `lab_setup.sh` to finish
    pub lab_setup: Duration,
    /// controller-0 available
    pub primary_available: PollPolicy,
    /// Other nodes configured
    pub nodes_configured: PollPolicy,
    /// Every node available, with its settle delay
    pub all_available: PollPolicy,
    /// kubernetes ready
    pub cluster_ready: PollPolicy,
}

impl Default for Timing {
    fn default() -> Self {
        let secs = Duration::from_secs;
        Self {
            console_settle: secs(10),
            key_delay: secs(1),
            boot_menu: secs(30),
            boot: secs(1800),
            prompt: secs(30),
            sudo_password: secs(30),
            ansible: secs(1800),
            unlock: secs(3600),
            start_vm: secs(30),
            secondary_install: secs(1800),
            secondary_unlock: secs(3600),
            lab_setup: secs(7200),
            primary_available: PollPolicy::new(secs(20), secs(600)),
            nodes_configured: PollPolicy::new(secs(20), secs(600)),
            all_available: PollPolicy::new(secs(30), secs(4800)).with_settle(secs(10)),
            cluster_ready: PollPolicy::new(secs(30), secs(600)),
        }
    }
}

/// Installs a lab through the consoles of its virtual machines.
///
/// The primary node (the one named `*controller-0`) is driven in the
/// foreground; every other node gets a monitor task once it is started.
///
/// ```no_run
/// use stxauto::deploy::{Installer, ScpStager, SshHostList, VarDict};
/// use stxauto::Session;
///
/// # async fn example() -> stxauto::Result<()> {
/// let mut vars = VarDict::load("variable.toml")?;
/// vars.normalize()?;
/// let nodes = vars.node_names()?;
///
/// let builder = Session::builder().log_dir("/tmp/stx-run");
/// let mut installer = Installer::new(
///     vars,
///     nodes,
///     builder.clone(),
///     SshHostList::new(builder.clone()),
///     ScpStager::new(builder),
/// )?;
/// installer.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Installer<P, F> {
    vars: VarDict,
    primary: String,
    secondaries: Vec<String>,
    virsh: Virsh,
    probe: P,
    stager: F,
    timing: Timing,
    console: Option<Session>,
    monitors: JoinSet<(String, Result<()>)>,
}

impl<P: HostListProbe, F: FileStager> Installer<P, F> {
    /// Prepare an install of `nodes`.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if no node is named `*controller-0`.
    pub fn new(
        vars: VarDict,
        nodes: Vec<String>,
        builder: SessionBuilder,
        probe: P,
        stager: F,
    ) -> Result<Self> {
        let index = nodes
            .iter()
            .position(|node| node.contains("controller-0"))
            .ok_or_else(|| Error::Config(format!("no controller-0 among nodes {nodes:?}")))?;
        let mut secondaries = nodes;
        let primary = secondaries.remove(index);

        Ok(Self {
            vars,
            primary,
            secondaries,
            virsh: Virsh::new(builder),
            probe,
            stager,
            timing: Timing::default(),
            console: None,
            monitors: JoinSet::new(),
        })
    }

    /// Replace the default waits.
    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Variables of the run, including an address picked up after unlock.
    pub fn vars(&self) -> &VarDict {
        &self.vars
    }

    /// Name of the primary node.
    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// Names of the other nodes.
    pub fn secondaries(&self) -> &[String] {
        &self.secondaries
    }

    /// Run the install to the end.
    pub async fn run(&mut self) -> Result<DeployReport> {
        let report = drive(self).await?;
        info!(
            "All done! {} installed successfully",
            self.vars.get_or("system_mode", "system")
        );
        Ok(report)
    }

    fn is_multi_node(&self) -> bool {
        let simplex = matches!(self.vars.system_mode(), Ok(SystemMode::Simplex));
        !simplex && !self.secondaries.is_empty()
    }

    fn total_nodes(&self) -> usize {
        self.secondaries.len() + 1
    }

    async fn boot_primary(&mut self) -> Result<()> {
        let mut console = self.virsh.console(&self.primary);
        console.connect(ConnectOptions::default()).await?;
        tokio::time::sleep(self.timing.console_settle).await;
        let console = self.console.insert(console);

        stages::select_kernel_option(console, &self.vars, &self.timing).await?;
        let _spinner = Spinner::start("Loading...");
        stages::wait_for_boot(console, &self.primary, self.timing.boot).await
    }

    async fn start_secondaries(&mut self) -> Result<()> {
        poll::wait_till_other_nodes_configured(
            &self.probe,
            &self.vars,
            self.secondaries.len(),
            &self.timing.nodes_configured,
        )
        .await?;

        for node in &self.secondaries {
            self.virsh.start_vm(node, self.timing.start_vm).await?;

            let console = self.virsh.console(node);
            let node = node.clone();
            let timing = self.timing;
            self.monitors.spawn(async move {
                let result = super::monitor_node_booting(console, node.clone(), timing).await;
                (node, result)
            });
        }
        Ok(())
    }

    /// Log the monitors that are done; returns how many are still running.
    fn reap_monitors(&mut self) -> usize {
        while let Some(joined) = self.monitors.try_join_next() {
            match joined {
                Ok((node, Ok(()))) => debug!("monitor of {node} finished"),
                Ok((node, Err(e))) => error!("error when monitoring {node} booting output: {e}"),
                Err(e) => error!("monitor task failed: {e}"),
            }
        }
        self.monitors.len()
    }
}

fn primary_console<'a>(console: &'a mut Option<Session>, primary: &str) -> Result<&'a mut Session> {
    console.as_mut().ok_or_else(|| Error::NotConnected {
        host: primary.to_string(),
    })
}

impl<P: HostListProbe, F: FileStager> StageRunner for Installer<P, F> {
    fn applies(&self, stage: Stage) -> bool {
        match stage {
            Stage::SecondaryNodes | Stage::WaitAllAvailable | Stage::WaitClusterReady => {
                self.is_multi_node()
            }
            _ => true,
        }
    }

    async fn run_stage(&mut self, stage: Stage) -> Result<()> {
        let timing = self.timing;
        match stage {
            Stage::BootPrimary => self.boot_primary().await,
            Stage::FirstLogin => {
                let console = primary_console(&mut self.console, &self.primary)?;
                stages::login(console, &self.vars, true, timing.prompt).await
            }
            Stage::NetworkBootstrap => {
                let console = primary_console(&mut self.console, &self.primary)?;
                stages::get_external_connectivity(console, &self.vars, &timing).await
            }
            Stage::FileStaging => self.stager.stage_files(&self.vars).await,
            Stage::AnsibleBootstrap => {
                let _spinner = Spinner::start("Running bootstrap playbook...");
                let console = primary_console(&mut self.console, &self.primary)?;
                stages::run_ansible_playbook(console, ANSIBLE_COMMAND, timing.ansible).await
            }
            Stage::UnlockWait => {
                let _spinner = Spinner::start("Waiting for unlock...");
                let console = primary_console(&mut self.console, &self.primary)?;
                console.send(WATCH_HOST_LIST).await?;
                stages::wait_for_boot(console, &self.primary, timing.unlock).await
            }
            Stage::PostUnlockLogin => {
                let console = primary_console(&mut self.console, &self.primary)?;
                stages::login(console, &self.vars, false, timing.prompt).await?;
                stages::update_ip(console, &mut self.vars, timing.prompt).await
            }
            Stage::WaitPrimaryAvailable => {
                let _spinner = Spinner::start("Waiting for controller-0...");
                poll::wait_till_controller_0_available(
                    &self.probe,
                    &self.vars,
                    &timing.primary_available,
                )
                .await
            }
            Stage::SecondaryNodes => self.start_secondaries().await,
            Stage::WaitAllAvailable => {
                let _spinner = Spinner::start("Waiting for all nodes...");
                poll::wait_till_all_nodes_available(
                    &self.probe,
                    &self.vars,
                    self.total_nodes(),
                    &timing.all_available,
                )
                .await
            }
            Stage::WaitClusterReady => {
                let total = self.total_nodes();
                let console = primary_console(&mut self.console, &self.primary)?;
                // the console may have logged out during the long waits
                if let Err(e) = stages::login(console, &self.vars, false, timing.prompt).await {
                    debug!("re-login skipped: {e}");
                    console.flush(timing.prompt).await?;
                }
                stages::check_kubectl(
                    console,
                    &self.vars,
                    total,
                    &timing.cluster_ready,
                    timing.prompt,
                )
                .await
            }
            Stage::WorkloadBootstrap => {
                let running = self.reap_monitors();
                if running > 0 {
                    warn!(
                        "All nodes are ready in the main flow, but {running} monitor(s) of node booting are still running"
                    );
                }
                let _spinner = Spinner::start("Running lab_setup.sh...");
                let console = primary_console(&mut self.console, &self.primary)?;
                stages::run_lab_setup(console, &timing).await
            }
        }
    }

    async fn finish(&mut self) {
        let running = self.reap_monitors();
        if running > 0 {
            info!("Stopping {running} monitor(s) of node booting");
            self.monitors.abort_all();
            while self.monitors.join_next().await.is_some() {}
        }
        if let Some(mut console) = self.console.take() {
            console.close();
        }
    }
}
