//! Polling of the lab's host list

use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use super::VarDict;
use crate::result::{Error, Result};
use crate::runner::{CommandRunner, ExecOptions};
use crate::session::{ConnectOptions, SessionBuilder};

static PRIMARY_AVAILABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"controller-0.*unlocked.*enabled.*available").expect("valid host-list regex")
});

static CONFIGURED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"locked.*disabled.*offline").expect("valid host-list regex"));

static AVAILABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"unlocked.*enabled.*available").expect("valid host-list regex")
});

/// Command listing the hosts of the lab.
pub const HOST_LIST_CMD: &str = "source /etc/platform/openrc && system host-list";

/// Fixed-interval polling with a total budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Pause before every check
    pub interval: Duration,
    /// Total budget
    pub timeout: Duration,
    /// Delay before confirming a positive reading, zero for none
    pub settle: Duration,
}

impl PollPolicy {
    /// Poll every `interval` for at most `timeout`.
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            settle: Duration::ZERO,
        }
    }

    /// Confirm a positive reading after `settle`.
    pub const fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Number of checks the budget allows.
    pub fn attempts(&self) -> u32 {
        if self.interval.is_zero() {
            return 1;
        }
        let n = self.timeout.as_secs_f64() / self.interval.as_secs_f64();
        n.ceil().max(1.0) as u32
    }
}

/// Sleep, check, repeat until `check` holds or the budget runs out.
///
/// # Errors
///
/// [`Error::PollTimeout`] when every check came back negative, or the first
/// error `check` returns.
pub async fn poll_until<F, Fut>(policy: &PollPolicy, what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    for attempt in 1..=policy.attempts() {
        debug!("wait {:?} to check {what}", policy.interval);
        tokio::time::sleep(policy.interval).await;
        if check().await? {
            return Ok(());
        }
        debug!("{what}: not yet ({attempt}/{})", policy.attempts());
    }
    Err(Error::PollTimeout {
        what: what.to_string(),
        timeout: policy.timeout,
    })
}

/// Number of (non-overlapping) matches of `pattern` in `output`.
pub fn count_rows(output: &str, pattern: &Regex) -> usize {
    pattern.find_iter(output).count()
}

/// Source of `system host-list` output.
pub trait HostListProbe: Send + Sync {
    /// Current host list. Transport problems yield an empty listing, which
    /// reads as "not ready yet".
    fn host_list(&self, vars: &VarDict) -> impl Future<Output = Result<String>> + Send;
}

/// Reads the host list over a fresh ssh connection to the lab.
#[derive(Debug, Clone, Default)]
pub struct SshHostList {
    builder: SessionBuilder,
}

impl SshHostList {
    /// Probe with sessions from `builder`.
    pub fn new(builder: SessionBuilder) -> Self {
        Self { builder }
    }
}

impl HostListProbe for SshHostList {
    async fn host_list(&self, vars: &VarDict) -> Result<String> {
        let host = vars.get("vm_ip_addr")?;
        let user = vars.get("vm_os_name")?;
        let password = vars.get("vm_os_password")?;

        let mut session = self.builder.clone().name("host-list").ssh(host, user, password);
        let result = async {
            session.connect(ConnectOptions::default()).await?;
            let (_, output) = session
                .exec_cmd(
                    HOST_LIST_CMD,
                    ExecOptions::default()
                        .timeout(Duration::from_secs(60))
                        .without_exit_code(),
                )
                .await?;
            Ok::<_, Error>(output)
        }
        .await;
        session.close();

        match result {
            Ok(output) => Ok(output),
            Err(e) => {
                warn!("could not read host list from {host}: {e}");
                Ok(String::new())
            }
        }
    }
}

/// Wait until exactly one row shows controller-0 unlocked, enabled and available.
pub async fn wait_till_controller_0_available<P: HostListProbe>(
    probe: &P,
    vars: &VarDict,
    policy: &PollPolicy,
) -> Result<()> {
    poll_until(policy, "controller-0 to be available", move || async move {
        Ok(count_rows(&probe.host_list(vars).await?, &PRIMARY_AVAILABLE) == 1)
    })
    .await
}

/// Wait until every other node is listed as locked, disabled and offline.
pub async fn wait_till_other_nodes_configured<P: HostListProbe>(
    probe: &P,
    vars: &VarDict,
    others: usize,
    policy: &PollPolicy,
) -> Result<()> {
    poll_until(policy, "other nodes to be configured", move || async move {
        Ok(count_rows(&probe.host_list(vars).await?, &CONFIGURED) == others)
    })
    .await
}

/// Wait until `total` nodes are available on two readings `policy.settle` apart.
pub async fn wait_till_all_nodes_available<P: HostListProbe>(
    probe: &P,
    vars: &VarDict,
    total: usize,
    policy: &PollPolicy,
) -> Result<()> {
    let settle = policy.settle;
    poll_until(policy, "all nodes to be available", move || async move {
        if count_rows(&probe.host_list(vars).await?, &AVAILABLE) != total {
            return Ok(false);
        }
        // a node may still flap right after becoming available
        tokio::time::sleep(settle).await;
        let stable = count_rows(&probe.host_list(vars).await?, &AVAILABLE) == total;
        if !stable {
            debug!("node states not stable yet");
        }
        Ok(stable)
    })
    .await
}
