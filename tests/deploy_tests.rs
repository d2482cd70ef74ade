//! Install automaton runs against simulated consoles

mod common;

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{Device, Reply, ScriptedSpawner, PASSWORD, USER};
use stxauto::deploy::poll::{self, PollPolicy};
use stxauto::deploy::stages::{self, ANSIBLE_COMMAND, WATCH_HOST_LIST};
use stxauto::deploy::{
    drive, FileStager, HostListProbe, Installer, Stage, StageRunner, Timing, VarDict,
};
use stxauto::{ConnectOptions, Error, Result, Session};
use tokio::time::Instant;

const PRIMARY_UP: &str = "\
| 1  | controller-0 | controller  | unlocked       | enabled     | available    |
| 2  | controller-1 | controller  | locked         | disabled    | offline      |
";

const ALL_UP: &str = "\
| 1  | controller-0 | controller  | unlocked       | enabled     | available    |
| 2  | controller-1 | controller  | unlocked       | enabled     | available    |
";

const ONE_DEGRADED: &str = "\
| 1  | controller-0 | controller  | unlocked       | enabled     | available    |
| 2  | controller-1 | controller  | unlocked       | enabled     | degraded     |
";

fn lab_vars(mode: &str) -> VarDict {
    [
        ("vm_os_name", USER),
        ("vm_os_password", PASSWORD),
        ("vm_ip_addr", "10.10.10.3"),
        ("vm_ip_route", "10.10.10.1"),
        ("vm_interface_name", "eth1000"),
        ("system_mode", mode),
        ("low_latency", "False"),
        ("extended_security", "False"),
        ("namespace", "deployment"),
    ]
    .into_iter()
    .collect()
}

/// Host lists handed out in order; the last one repeats.
#[derive(Clone)]
struct ScriptedProbe {
    listings: Arc<Mutex<VecDeque<&'static str>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedProbe {
    fn new(listings: &[&'static str]) -> Self {
        Self {
            listings: Arc::new(Mutex::new(listings.iter().copied().collect())),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HostListProbe for ScriptedProbe {
    async fn host_list(&self, _vars: &VarDict) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut listings = self.listings.lock().unwrap();
        let listing = if listings.len() > 1 {
            listings.pop_front()
        } else {
            listings.front().copied()
        };
        Ok(listing.unwrap_or_default().to_string())
    }
}

#[derive(Clone, Default)]
struct CountingStager(Arc<AtomicUsize>);

impl CountingStager {
    fn calls(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl FileStager for CountingStager {
    async fn stage_files(&self, _vars: &VarDict) -> Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

enum Console {
    BootMenu { enters: usize },
    Login { first: bool, step: usize },
    Shell { sudo: bool },
}

/// Console of the primary node, from boot menu to `lab_setup.sh`.
struct PrimaryConsole {
    state: Console,
    ansible_failed: u32,
    received: Arc<Mutex<Vec<String>>>,
}

const SHELL_PROMPT: &str = "controller-0:~$ ";

impl PrimaryConsole {
    fn boxed(ansible_failed: u32, received: Arc<Mutex<Vec<String>>>) -> Box<dyn Device> {
        Box::new(Self {
            state: Console::BootMenu { enters: 0 },
            ansible_failed,
            received,
        })
    }

    fn shell(&mut self, line: &str) -> Reply {
        let prompt = |text: &str| Reply::say(format!("{text}{SHELL_PROMPT}"));
        match line {
            "" | "mkdir ~/images" | "chmod +x ./lab_setup.sh" => prompt(""),
            "echo $?" => prompt("0\r\n"),
            "kubectl get hosts -n deployment" => prompt(
                "NAME           ADMINISTRATIVE   OPERATIONAL   AVAILABILITY   RECONCILED\r\n\
                 controller-0   unlocked         enabled       available      true\r\n\
                 controller-1   unlocked         enabled       available      true\r\n",
            ),
            "kubectl get nodes" => prompt(
                "NAME           STATUS   ROLES    AGE   VERSION\r\n\
                 controller-0   Ready    master   1h    v1.18.1\r\n\
                 controller-1   Ready    master   1h    v1.18.1\r\n",
            ),
            _ if line == ANSIBLE_COMMAND => prompt(&format!(
                "PLAY RECAP ****\r\nlocalhost : ok=120 changed=80 unreachable=0 failed={} skipped=10\r\n",
                self.ansible_failed
            )),
            _ if line == WATCH_HOST_LIST => {
                self.state = Console::Login {
                    first: false,
                    step: 0,
                };
                Reply::say("Every 10.0s: system host-list\r\n")
                    .after(Duration::from_secs(600), "\r\ncontroller-0 login: ")
            }
            _ if line.starts_with("sudo ip address add") => {
                self.state = Console::Shell { sudo: true };
                Reply::say(format!("[sudo] password for {USER}: "))
            }
            _ if line.starts_with("sudo ip ") => prompt(""),
            _ if line.starts_with("ifconfig eth1000") => prompt("10.10.10.3\r\n"),
            _ if line.starts_with("cp ~/tis-centos-guest.img") => {
                prompt("Configuring lab\r\nlab_setup.sh exit=0\r\n")
            }
            _ => prompt(&format!("-sh: {line}: command not found\r\n")),
        }
    }
}

impl Device for PrimaryConsole {
    fn line(&mut self, line: &str) -> Reply {
        self.received.lock().unwrap().push(line.to_string());
        match &mut self.state {
            Console::BootMenu { enters } => {
                *enters += 1;
                if *enters < 3 {
                    return Reply::none();
                }
                self.state = Console::Login {
                    first: true,
                    step: 0,
                };
                Reply::say("Installer ready\r\n")
                    .after(Duration::from_secs(30), "\r\ncontroller-0 login: ")
            }
            Console::Login { first, step } => {
                let dialog: &[&str] = if *first {
                    &[
                        "Password: ",
                        "Current UNIX password: ",
                        "New password: ",
                        "Retype new password: ",
                    ]
                } else {
                    &["Password: "]
                };
                let reply = dialog.get(*step).copied();
                *step += 1;
                match reply {
                    Some(text) => Reply::say(text),
                    None => {
                        self.state = Console::Shell { sudo: false };
                        Reply::say(format!("Last login: today\r\n{SHELL_PROMPT}"))
                    }
                }
            }
            Console::Shell { sudo: true } => {
                self.state = Console::Shell { sudo: false };
                Reply::say(SHELL_PROMPT)
            }
            Console::Shell { sudo: false } => self.shell(line),
        }
    }
}

/// `virsh start`: reports the domain started and exits.
struct Starter(String);

impl Device for Starter {
    fn greet(&mut self) -> Reply {
        Reply::say(format!("Domain {} started\r\n\r\n", self.0)).hang_up()
    }

    fn line(&mut self, _line: &str) -> Reply {
        Reply::none()
    }
}

/// Console of a secondary node: installed, then unlocked.
struct SecondaryConsole {
    node: String,
    unlock_after: Duration,
}

impl Device for SecondaryConsole {
    fn greet(&mut self) -> Reply {
        Reply::none()
            .after(Duration::from_secs(100), format!("{} login: ", self.node))
            .after(self.unlock_after, format!("\r\n{} login: ", self.node))
    }

    fn line(&mut self, _line: &str) -> Reply {
        Reply::none()
    }
}

struct Lab {
    spawner: Arc<ScriptedSpawner>,
    received: Arc<Mutex<Vec<String>>>,
    probe: ScriptedProbe,
    stager: CountingStager,
}

impl Lab {
    fn new(ansible_failed: u32, listings: &[&'static str]) -> Self {
        Self::with_secondary_unlock(ansible_failed, listings, Duration::from_secs(200))
    }

    fn with_secondary_unlock(
        ansible_failed: u32,
        listings: &[&'static str],
        unlock_after: Duration,
    ) -> Self {
        let received = Arc::new(Mutex::new(Vec::new()));
        let console_log = received.clone();
        let spawner = ScriptedSpawner::new(move |command| {
            match command.args.iter().map(String::as_str).collect::<Vec<_>>()[..] {
                ["console", "controller-0"] => {
                    PrimaryConsole::boxed(ansible_failed, console_log.clone())
                }
                ["console", node] => Box::new(SecondaryConsole {
                    node: node.to_string(),
                    unlock_after,
                }),
                ["start", node] => Box::new(Starter(node.to_string())),
                _ => panic!("unexpected spawn: {command}"),
            }
        });
        Self {
            spawner,
            received,
            probe: ScriptedProbe::new(listings),
            stager: CountingStager::default(),
        }
    }

    fn installer(
        &self,
        vars: VarDict,
        nodes: &[&str],
    ) -> Installer<ScriptedProbe, CountingStager> {
        Installer::new(
            vars,
            nodes.iter().map(|n| n.to_string()).collect(),
            Session::builder().spawner(self.spawner.clone()),
            self.probe.clone(),
            self.stager.clone(),
        )
        .unwrap()
        .with_timing(Timing::default())
    }

    fn console_lines(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

#[derive(Clone, Default)]
struct CapturedLog(Arc<Mutex<Vec<u8>>>);

impl io::Write for CapturedLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CapturedLog {
    fn install() -> (Self, tracing::subscriber::DefaultGuard) {
        let log = Self::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        (log, tracing::subscriber::set_default(subscriber))
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

#[tokio::test(start_paused = true)]
async fn test_simplex_install() {
    let (log, _guard) = CapturedLog::install();

    let lab = Lab::new(0, &[PRIMARY_UP]);
    let mut installer = lab.installer(lab_vars("simplex"), &["controller-0"]);
    assert_eq!(installer.primary(), "controller-0");
    assert!(installer.secondaries().is_empty());

    let report = installer.run().await.unwrap();

    let mut expected: Vec<Stage> = Stage::ALL[..8].to_vec();
    expected.push(Stage::WorkloadBootstrap);
    assert_eq!(report.completed, expected);
    assert_eq!(
        report.skipped,
        vec![
            Stage::SecondaryNodes,
            Stage::WaitAllAvailable,
            Stage::WaitClusterReady
        ]
    );

    let text = log.text();
    for stage in &expected {
        let started = format!("Step {} started: {}", stage.number(), stage.name());
        let finished = format!("Step {} finished: {}", stage.number(), stage.name());
        let start_at = text.find(&started).unwrap_or_else(|| panic!("{started} missing"));
        let finish_at = text.find(&finished).unwrap_or_else(|| panic!("{finished} missing"));
        assert!(start_at < finish_at);
    }
    for n in 9..=11 {
        assert!(!text.contains(&format!("Step {n} started")));
    }

    assert_eq!(lab.stager.calls(), 1);
    assert_eq!(lab.probe.calls(), 1);
    assert_eq!(lab.spawner.spawn_count(), 1);

    let lines = lab.console_lines();
    assert!(lines.iter().any(|l| l == ANSIBLE_COMMAND));
    assert!(lines.iter().any(|l| l.starts_with("cp ~/tis-centos-guest.img")));
    assert_eq!(installer.vars().get("vm_ip_addr").unwrap(), "10.10.10.3");
}

#[tokio::test(start_paused = true)]
async fn test_ansible_failure_stops_install() {
    let lab = Lab::new(1, &[PRIMARY_UP]);
    let mut installer = lab.installer(lab_vars("simplex"), &["controller-0"]);

    let err = installer.run().await.unwrap_err();
    assert_eq!(err.stage(), Some(Stage::AnsibleBootstrap));
    assert!(err.to_string().contains("Step 5"), "{err}");
    match err {
        Error::Deploy { source, .. } => {
            assert!(matches!(*source, Error::StageFailed { .. }), "{source}")
        }
        other => panic!("unexpected error: {other}"),
    }

    // nothing after the playbook ran
    assert_eq!(lab.probe.calls(), 0);
    let lines = lab.console_lines();
    assert_eq!(lines.last().map(String::as_str), Some(ANSIBLE_COMMAND));
    assert!(!lines.iter().any(|l| l == WATCH_HOST_LIST));
}

#[tokio::test(start_paused = true)]
async fn test_duplex_install_runs_every_stage() {
    let lab = Lab::new(0, &[PRIMARY_UP, PRIMARY_UP, ALL_UP]);
    let mut installer = lab.installer(lab_vars("duplex"), &["controller-0", "controller-1"]);
    assert_eq!(installer.secondaries(), ["controller-1".to_string()]);

    let report = installer.run().await.unwrap();
    assert_eq!(report.completed, Stage::ALL.to_vec());
    assert!(report.skipped.is_empty());

    let spawned: Vec<String> = lab.spawner.spawned().iter().map(ToString::to_string).collect();
    assert!(spawned.contains(&"virsh start controller-1".to_string()));
    assert!(spawned.contains(&"virsh console controller-1".to_string()));
    assert!(lab
        .console_lines()
        .iter()
        .any(|l| l == "kubectl get nodes"));
}

#[tokio::test]
async fn test_missing_primary_is_rejected() {
    let lab = Lab::new(0, &[PRIMARY_UP]);
    let result = Installer::new(
        lab_vars("duplex"),
        vec!["controller-1".to_string()],
        Session::builder().spawner(lab.spawner.clone()),
        lab.probe.clone(),
        lab.stager.clone(),
    );
    assert!(matches!(result, Err(Error::Config(_))));
}

struct Recorder {
    ran: Vec<Stage>,
    fail_at: Stage,
}

impl StageRunner for Recorder {
    async fn run_stage(&mut self, stage: Stage) -> Result<()> {
        self.ran.push(stage);
        if stage == self.fail_at {
            return Err(Error::StageFailed {
                stage,
                reason: "failed=1".to_string(),
            });
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_later_stages_never_run_after_failure() {
    let mut runner = Recorder {
        ran: Vec::new(),
        fail_at: Stage::AnsibleBootstrap,
    };
    let err = drive(&mut runner).await.unwrap_err();

    assert_eq!(err.stage(), Some(Stage::AnsibleBootstrap));
    assert_eq!(runner.ran, Stage::ALL[..5].to_vec());
}

#[tokio::test(start_paused = true)]
async fn test_all_available_needs_two_readings() {
    let vars = lab_vars("duplex");
    let policy =
        PollPolicy::new(Duration::from_secs(30), Duration::from_secs(300)).with_settle(Duration::from_secs(10));

    // the first positive reading is followed by a node dropping out
    let probe = ScriptedProbe::new(&[ALL_UP, ONE_DEGRADED, ALL_UP, ALL_UP]);
    poll::wait_till_all_nodes_available(&probe, &vars, 2, &policy)
        .await
        .unwrap();
    assert_eq!(probe.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_flapping_nodes_never_count_as_available() {
    let vars = lab_vars("duplex");
    let policy =
        PollPolicy::new(Duration::from_secs(30), Duration::from_secs(120)).with_settle(Duration::from_secs(10));

    let flapping: Vec<&'static str> = [ALL_UP, ONE_DEGRADED].repeat(10);
    let probe = ScriptedProbe::new(&flapping);
    let err = poll::wait_till_all_nodes_available(&probe, &vars, 2, &policy)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PollTimeout { .. }), "{err}");
    assert_eq!(probe.calls(), 8);
}

#[tokio::test(start_paused = true)]
async fn test_running_monitors_reported_before_workload_setup() {
    let (log, _guard) = CapturedLog::install();
    let lab = Lab::with_secondary_unlock(
        0,
        &[PRIMARY_UP, PRIMARY_UP, ALL_UP],
        Duration::from_secs(3000),
    );
    let mut installer = lab.installer(lab_vars("duplex"), &["controller-0", "controller-1"]);

    let start = Instant::now();
    installer.run().await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(3000));

    let text = log.text();
    let warned = text
        .find("1 monitor(s) of node booting are still running")
        .expect("running monitor reported");
    assert!(text.find("Step 11 finished").unwrap() < warned);
    assert!(warned < text.find("Step 12 finished").unwrap());
    assert!(text.contains("Stopping 1 monitor(s) of node booting"));
}

/// A boot menu that never answers.
struct SilentMenu;

impl Device for SilentMenu {
    fn line(&mut self, _line: &str) -> Reply {
        Reply::none()
    }
}

#[tokio::test(start_paused = true)]
async fn test_missing_boot_flags_are_fatal() {
    let spawner = ScriptedSpawner::new(|_| Box::new(SilentMenu));
    let mut console = Session::builder()
        .spawner(spawner.clone())
        .console("duplex-controller-0");
    console.connect(ConnectOptions::default()).await.unwrap();
    let timing = Timing::default();

    let vars: VarDict = [("system_mode", "duplex")].into_iter().collect();
    let err = stages::select_kernel_option(&mut console, &vars, &timing)
        .await
        .unwrap_err();
    assert!(matches!(&err, Error::MissingVar(key) if key == "low_latency"), "{err}");

    let vars: VarDict = [("system_mode", "controllerstorage")].into_iter().collect();
    let err = stages::select_kernel_option(&mut console, &vars, &timing)
        .await
        .unwrap_err();
    assert!(matches!(&err, Error::MissingVar(key) if key == "extended_security"), "{err}");
}
