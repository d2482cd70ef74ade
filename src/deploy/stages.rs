//! Console interactions of the individual install steps
//!
//! Each function drives one console through one piece of the install and
//! returns `Ok(())` once the step's exit condition holds.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info};

use super::{PollPolicy, Stage, Timing, VarDict};
use crate::pattern::Pattern;
use crate::result::{Error, Result};
use crate::runner::{CommandRunner, ExecOptions};
use crate::session::{prompt, Shell};

/// Down arrow on a VT100 console.
const DOWN_ARROW: &[u8] = b"\x1b[B";

/// Bootstrap playbook run on the primary node.
pub const ANSIBLE_COMMAND: &str =
    "ansible-playbook lab-install-playbook.yaml -e \"@local-install-overrides.yaml\"";

/// Keeps the console busy while the primary node unlocks and reboots.
pub const WATCH_HOST_LIST: &str = "source /etc/platform/openrc && watch -n 10 system host-list";

static IPV4: LazyLock<Pattern> = LazyLock::new(|| {
    Pattern::regex(r"[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}").expect("valid IPv4 regex")
});

static ANSIBLE_SUMMARY: LazyLock<Pattern> =
    LazyLock::new(|| Pattern::regex(r"failed=.").expect("valid summary regex"));

static LAB_SETUP_EXIT: LazyLock<Pattern> =
    LazyLock::new(|| Pattern::regex(r"lab_setup\.sh exit=(\d+)").expect("valid marker regex"));

static HOST_READY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"unlocked.*enabled.*available.*true").expect("valid kubectl regex")
});

async fn key<S: Shell>(console: &mut S, data: &[u8], delay: Duration) -> Result<()> {
    console.send_raw(data)?;
    tokio::time::sleep(delay).await;
    Ok(())
}

async fn enter<S: Shell>(console: &mut S, delay: Duration) -> Result<()> {
    console.send("").await?;
    tokio::time::sleep(delay).await;
    Ok(())
}

/// Pick the boot menu entries matching the system mode and security flags.
///
/// All-in-one modes move one entry down (two for low latency), then the
/// console and security menus follow. The installer must answer `ready`.
pub async fn select_kernel_option<S: Shell>(
    console: &mut S,
    vars: &VarDict,
    timing: &Timing,
) -> Result<()> {
    let delay = timing.key_delay;
    if vars.get("system_mode")?.contains("plex") {
        key(console, DOWN_ARROW, delay).await?;
        if vars.flag("low_latency")? {
            key(console, DOWN_ARROW, delay).await?;
        }
    }
    enter(console, delay).await?;
    enter(console, delay).await?;

    if vars.flag("extended_security")? {
        key(console, DOWN_ARROW, delay).await?;
    }
    enter(console, delay).await?;

    console
        .expect(Pattern::exact("ready"), timing.boot_menu)
        .await?;
    Ok(())
}

/// Wait for the login prompt of a booting node.
pub async fn wait_for_boot<S: Shell>(console: &mut S, node: &str, timeout: Duration) -> Result<()> {
    debug!("wait for node: {node} to boot");
    console.expect(prompt::LOGIN.clone(), timeout).await?;
    Ok(())
}

/// Log in on the console and wait for the shell.
///
/// The first login uses the user name as password and walks through the
/// forced password change.
pub async fn login<S: Shell>(
    console: &mut S,
    vars: &VarDict,
    first_login: bool,
    timeout: Duration,
) -> Result<()> {
    let user = vars.get("vm_os_name")?;
    let password = vars.get("vm_os_password")?;
    debug!("login to {}, first time = {first_login}", console.name());

    console.send(user).await?;
    console.expect(Pattern::exact("Password:"), timeout).await?;
    if first_login {
        let dialog = [
            (user, "UNIX password:"),
            (user, "New password:"),
            (password, "new password:"),
        ];
        for (answer, next) in dialog {
            console.send(answer).await?;
            console.expect(Pattern::exact(next), timeout).await?;
        }
    }
    console.send(password).await?;

    console.expect(prompt::CONSOLE_SHELL.clone(), timeout).await?;
    Ok(())
}

/// Static address, link and default route so the lab is reachable from outside.
pub async fn get_external_connectivity<S: Shell>(
    console: &mut S,
    vars: &VarDict,
    timing: &Timing,
) -> Result<()> {
    let interface = vars.get("vm_interface_name")?;
    let password = vars.get("vm_os_password")?;
    debug!("setting up external connectivity for node {}", console.name());

    console
        .send(&format!(
            "sudo ip address add {}/24 dev {interface}",
            vars.get("vm_ip_addr")?
        ))
        .await?;
    console
        .expect(prompt::PASSWORD.clone(), timing.sudo_password)
        .await?;
    console.send(password).await?;
    console.expect_prompt(timing.prompt).await?;

    for command in [
        format!("sudo ip link set up dev {interface}"),
        format!(
            "sudo ip route add default via {} dev {interface}",
            vars.get("vm_ip_route")?
        ),
    ] {
        console.send(&command).await?;
        console.expect_prompt(timing.prompt).await?;
    }
    Ok(())
}

/// Run the bootstrap playbook; only a `failed=0` summary counts as success.
pub async fn run_ansible_playbook<S: Shell>(
    console: &mut S,
    command: &str,
    timeout: Duration,
) -> Result<()> {
    debug!("run ansible playbook with \n{command}\non node {}", console.name());
    console.send(command).await?;
    console.expect(ANSIBLE_SUMMARY.clone(), timeout).await?;

    match console.last_match() {
        "failed=0" => Ok(()),
        other => Err(Error::StageFailed {
            stage: Stage::AnsibleBootstrap,
            reason: format!("playbook reported {other}"),
        }),
    }
}

/// Read the address of the external interface and store it if it moved.
pub async fn update_ip<S: Shell>(
    console: &mut S,
    vars: &mut VarDict,
    timeout: Duration,
) -> Result<()> {
    debug!("updating ip on node {}", console.name());
    console
        .send(&format!(
            "ifconfig {} | grep mask | awk '{{print $2}}' | cut -f2 -d:",
            vars.get("vm_interface_name")?
        ))
        .await?;
    console.expect(IPV4.clone(), timeout).await?;

    let current = console.last_match().to_string();
    let stored = vars.get("vm_ip_addr")?;
    if current != stored {
        info!("vm ip address changed from {stored} to {current}");
        vars.set("vm_ip_addr", current);
    }
    console.flush(timeout).await
}

/// Wait until kubernetes lists every host available and every node `Ready`.
///
/// Errors while reading the cluster state count as "not yet".
pub async fn check_kubectl<S: Shell>(
    console: &mut S,
    vars: &VarDict,
    total: usize,
    policy: &PollPolicy,
    timeout: Duration,
) -> Result<()> {
    let hosts_cmd = format!("kubectl get hosts -n {}", vars.get("namespace")?);
    let opts = ExecOptions::default().timeout(timeout).without_exit_code();
    debug!("checking kubectl hosts status {}", console.name());

    for _ in 0..policy.attempts() {
        tokio::time::sleep(policy.interval).await;

        let hosts = match console.exec_cmd(&hosts_cmd, opts).await {
            Ok((_, output)) => output,
            Err(e) => {
                debug!("{hosts_cmd} failed: {e}");
                continue;
            }
        };
        if HOST_READY.find_iter(&hosts).count() != total {
            continue;
        }

        match console.exec_cmd("kubectl get nodes", opts).await {
            Ok((_, nodes)) if nodes.matches("Ready").count() == total => return Ok(()),
            Ok(_) => {}
            Err(e) => debug!("kubectl get nodes failed: {e}"),
        }
    }

    Err(Error::PollTimeout {
        what: "kubernetes to report every node ready".to_string(),
        timeout: policy.timeout,
    })
}

/// Run `lab_setup.sh` in the home directory of the primary node.
///
/// Fails when the script's output mentions `fail`.
pub async fn run_lab_setup<S: Shell>(console: &mut S, timing: &Timing) -> Result<()> {
    debug!("apply stx-openstack on node {}", console.name());
    let opts = ExecOptions::default().timeout(timing.prompt);

    console.exec_cmd("mkdir ~/images", opts).await?;
    console.exec_cmd("chmod +x ./lab_setup.sh", opts.strict()).await?;

    console
        .send("cp ~/tis-centos-guest.img ~/images && ./lab_setup.sh ; echo lab_setup.sh exit=$?")
        .await?;
    console
        .expect(LAB_SETUP_EXIT.clone(), timing.lab_setup)
        .await?;

    let output = console.last_output().to_string();
    info!("{}", console.last_match());
    console.flush(timing.prompt).await?;
    if output.contains("fail") {
        return Err(Error::StageFailed {
            stage: Stage::WorkloadBootstrap,
            reason: format!("lab_setup.sh reported a failure: {}", output.trim()),
        });
    }
    Ok(())
}
