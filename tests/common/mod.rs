//! Scripted transports standing in for ssh logins and virsh consoles

#![allow(dead_code)]

use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stxauto::terminal::{Channel, CommandLine, Spawner};
use stxauto::Result;
use tokio::sync::mpsc;

pub const USER: &str = "sysadmin";
pub const PASSWORD: &str = "Li69nux*";
pub const HOST: &str = "10.10.10.3";

/// What a device writes back, optionally after a (virtual) delay.
#[derive(Debug, Default)]
pub struct Reply {
    chunks: Vec<(Duration, String)>,
    hang_up: bool,
}

impl Reply {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn say(text: impl Into<String>) -> Self {
        Self::none().then(text)
    }

    pub fn then(mut self, text: impl Into<String>) -> Self {
        self.chunks.push((Duration::ZERO, text.into()));
        self
    }

    pub fn after(mut self, delay: Duration, text: impl Into<String>) -> Self {
        self.chunks.push((delay, text.into()));
        self
    }

    pub fn hang_up(mut self) -> Self {
        self.hang_up = true;
        self
    }
}

/// The far end of a scripted transport. Every line written to it is echoed
/// before `line` is asked for an answer.
pub trait Device: Send + 'static {
    fn greet(&mut self) -> Reply {
        Reply::none()
    }

    fn line(&mut self, line: &str) -> Reply;

    fn interrupt(&mut self) -> Reply {
        Reply::none()
    }
}

struct DeviceInput {
    device: Box<dyn Device>,
    line: Vec<u8>,
    output: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl DeviceInput {
    fn emit(&mut self, reply: Reply) {
        let Some(tx) = self.output.as_ref() else {
            return;
        };
        if reply.chunks.iter().all(|(delay, _)| delay.is_zero()) {
            for (_, text) in reply.chunks {
                let _ = tx.send(text.into_bytes());
            }
        } else {
            let tx = tx.clone();
            tokio::spawn(async move {
                for (delay, text) in reply.chunks {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(text.into_bytes());
                }
            });
        }
        if reply.hang_up {
            self.output = None;
        }
    }
}

impl Write for DeviceInput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.output.is_none() {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        for &byte in buf {
            match byte {
                b'\n' => {
                    let line = String::from_utf8_lossy(&self.line)
                        .trim_end_matches('\r')
                        .to_string();
                    self.line.clear();
                    self.emit(Reply::say(format!("{line}\r\n")));
                    let reply = self.device.line(&line);
                    self.emit(reply);
                }
                0x03 => {
                    self.line.clear();
                    self.emit(Reply::say("^C\r\n"));
                    let reply = self.device.interrupt();
                    self.emit(reply);
                }
                _ => self.line.push(byte),
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

type MakeDevice = dyn Fn(&CommandLine) -> Box<dyn Device> + Send + Sync;

/// Hands out a fresh device per spawn and remembers what was spawned.
pub struct ScriptedSpawner {
    make: Box<MakeDevice>,
    spawned: Mutex<Vec<CommandLine>>,
}

impl ScriptedSpawner {
    pub fn new<F>(make: F) -> Arc<Self>
    where
        F: Fn(&CommandLine) -> Box<dyn Device> + Send + Sync + 'static,
    {
        Arc::new(Self {
            make: Box::new(make),
            spawned: Mutex::new(Vec::new()),
        })
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    pub fn spawned(&self) -> Vec<CommandLine> {
        self.spawned.lock().unwrap().clone()
    }
}

impl Spawner for ScriptedSpawner {
    fn spawn(&self, command: &CommandLine) -> Result<Channel> {
        self.spawned.lock().unwrap().push(command.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let mut input = DeviceInput {
            device: (self.make)(command),
            line: Vec::new(),
            output: Some(tx),
        };
        let greeting = input.device.greet();
        input.emit(greeting);
        Ok(Channel::new(rx, Box::new(input)))
    }
}

/// An ssh target that never gets past the greeting.
pub struct Refusing(pub &'static str);

impl Device for Refusing {
    fn greet(&mut self) -> Reply {
        Reply::say(format!("{}\r\n", self.0)).hang_up()
    }

    fn line(&mut self, _line: &str) -> Reply {
        Reply::none()
    }
}

pub const NATBOX: &str = "128.224.186.181";
pub const NATBOX_USER: &str = "svc-cgcsauto";
pub const NATBOX_PASSWORD: &str = "natbox-pw";
pub const GUEST_IP: &str = "10.10.20.5";
pub const PEER: &str = "10.10.10.4";

const DATE: &str = "Tue Oct 18 10:00:00 UTC 2026";

/// What a non-interactive command prints.
struct Run {
    stdout: String,
    stderr: String,
    code: i32,
}

impl Run {
    fn out(text: impl Into<String>) -> Self {
        Self {
            stdout: text.into(),
            stderr: String::new(),
            code: 0,
        }
    }

    fn err(text: impl Into<String>, code: i32) -> Self {
        Self {
            stdout: String::new(),
            stderr: text.into(),
            code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hop {
    Controller,
    Compute,
    Root,
}

/// A question the controller is waiting to have answered.
enum Awaiting {
    ComputePassword,
    SudoPassword(String),
    RootPassword,
    HostKey,
    TransferPassword(&'static str),
}

/// A controller reached over ssh, with a compute node one hop further.
pub struct Controller {
    logged_in: bool,
    hop: Hop,
    awaiting: Option<Awaiting>,
    last_code: i32,
    host_list_calls: usize,
    authorized_keys: Vec<String>,
}

impl Controller {
    pub fn boxed() -> Box<dyn Device> {
        Box::new(Self {
            logged_in: false,
            hop: Hop::Controller,
            awaiting: None,
            last_code: 0,
            host_list_calls: 0,
            authorized_keys: Vec::new(),
        })
    }

    fn prompt(&self) -> &'static str {
        match self.hop {
            Hop::Controller => "controller-0:~$ ",
            Hop::Compute => "compute-0:~$ ",
            Hop::Root => "root@controller-0:~# ",
        }
    }

    fn done(&mut self, text: &str, code: i32) -> Reply {
        self.last_code = code;
        Reply::say(format!("{text}{}", self.prompt()))
    }

    fn ask(&mut self, awaiting: Awaiting, question: impl Into<String>) -> Reply {
        self.awaiting = Some(awaiting);
        Reply::say(question)
    }

    fn answer(&mut self, awaiting: Awaiting, line: &str) -> Reply {
        let accepted = line == PASSWORD;
        match awaiting {
            Awaiting::ComputePassword if accepted => {
                self.hop = Hop::Compute;
                Reply::say(self.prompt())
            }
            Awaiting::ComputePassword => Reply::say("Permission denied, please try again.\r\n"),
            Awaiting::SudoPassword(command) if accepted => self.shell(&command),
            Awaiting::RootPassword if accepted => {
                self.hop = Hop::Root;
                Reply::say(self.prompt())
            }
            Awaiting::SudoPassword(_) | Awaiting::RootPassword => {
                self.done("Sorry, try again.\r\nsudo: 1 incorrect password attempt\r\n", 1)
            }
            Awaiting::HostKey if line == "yes" => self.ask(
                Awaiting::TransferPassword("lab_setup.sh    100%  1024     1.0MB/s   00:00\r\n"),
                format!(
                    "Warning: Permanently added '{PEER}' (ECDSA) to the list of known hosts.\r\n\
                     {USER}@{PEER}'s password: "
                ),
            ),
            Awaiting::HostKey => self.done("Host key verification failed.\r\n", 1),
            Awaiting::TransferPassword(output) if accepted => self.done(output, 0),
            Awaiting::TransferPassword(output) => self.ask(
                Awaiting::TransferPassword(output),
                format!("Permission denied, please try again.\r\n{USER}@{PEER}'s password: "),
            ),
        }
    }

    /// Commands that talk back or change the shell.
    fn interactive(&mut self, line: &str) -> Option<Reply> {
        let reply = match line {
            "" => Reply::say(self.prompt()),
            "sleep 3600" => Reply::none(),
            "exit" => match self.hop {
                Hop::Compute => {
                    self.hop = Hop::Controller;
                    self.done("logout\r\nConnection to compute-0 closed.\r\n", 0)
                }
                Hop::Root => {
                    self.hop = Hop::Controller;
                    self.done("logout\r\n", 0)
                }
                Hop::Controller => Reply::say("logout\r\n").hang_up(),
            },
            "sudo su -" => self.ask(Awaiting::RootPassword, format!("[sudo] password for {USER}: ")),
            _ if line.starts_with("/usr/bin/ssh ") && line.ends_with("@compute-0") => self.ask(
                Awaiting::ComputePassword,
                format!("{USER}@compute-0's password: "),
            ),
            _ if line.starts_with("rsync -avre ") => self.ask(
                Awaiting::TransferPassword(
                    "sending incremental file list\r\nlab_setup.sh\r\n\r\n\
                     sent 1,100 bytes  received 35 bytes  2,270.00 bytes/sec\r\n",
                ),
                format!("{USER}@{PEER}'s password: "),
            ),
            _ if line.starts_with("scp ") => self.ask(
                Awaiting::HostKey,
                format!(
                    "The authenticity of host '{PEER} ({PEER})' can't be established.\r\n\
                     Are you sure you want to continue connecting (yes/no)? "
                ),
            ),
            _ => match line.strip_prefix("sudo ") {
                Some(command) => self.ask(
                    Awaiting::SudoPassword(command.to_string()),
                    format!("[sudo] password for {USER}: "),
                ),
                None => return None,
            },
        };
        Some(reply)
    }

    /// Run `line` as a plain command, honouring a `1> /dev/null` suffix.
    fn shell(&mut self, line: &str) -> Reply {
        let (command, show_stdout) = match line.strip_suffix(" 1> /dev/null") {
            Some(command) => (command, false),
            None => (line, true),
        };
        let mut text = String::new();
        let mut code = 0;
        for step in command.split("; ") {
            let run = self.run(step);
            if show_stdout {
                text.push_str(&run.stdout);
            }
            text.push_str(&run.stderr);
            code = run.code;
        }
        self.done(&text, code)
    }

    fn run(&mut self, command: &str) -> Run {
        match command {
            "true" | "TMOUT=0" | "mkdir -p ~/.ssh/" => Run::out(""),
            "false" => Run::err("", 1),
            "echo $?" => Run::out(format!("{}\r\n", self.last_code)),
            "hostname" => Run::out(match self.hop {
                Hop::Compute => "compute-0\r\n",
                _ => "controller-0\r\n",
            }),
            "whoami" => Run::out(match self.hop {
                Hop::Root => "root\r\n".to_string(),
                _ => format!("{USER}\r\n"),
            }),
            "date" => Run::out(format!("{DATE}\r\n")),
            "ls /root" => Run::out("anaconda-ks.cfg\r\n"),
            "ls /missing" => Run::err(
                "ls: cannot access '/missing': No such file or directory\r\n",
                2,
            ),
            "system host-list" => {
                self.host_list_calls += 1;
                let availability = if self.host_list_calls < 3 {
                    "degraded"
                } else {
                    "available"
                };
                Run::out(format!(
                    "| 1  | controller-0 | controller  | unlocked       | enabled     | {availability} |\r\n"
                ))
            }
            "cat ~/.ssh/authorized_keys" => Run::out(
                self.authorized_keys
                    .iter()
                    .map(|key| format!("{key}\r\n"))
                    .collect::<String>(),
            ),
            _ if command.starts_with("chmod ") => Run::out(""),
            _ if command.starts_with("grep -q \"") => {
                let key = command
                    .trim_start_matches("grep -q \"")
                    .trim_end_matches("\" ~/.ssh/authorized_keys");
                let code = if self.authorized_keys.iter().any(|k| k == key) { 0 } else { 1 };
                Run::err("", code)
            }
            _ if command.starts_with("echo -e \"") => {
                let key = command
                    .trim_start_matches("echo -e \"")
                    .trim_end_matches("\\n\" >> ~/.ssh/authorized_keys");
                self.authorized_keys.push(key.to_string());
                Run::out("")
            }
            _ => match command.strip_prefix("echo ") {
                Some(text) => Run::out(format!("{text}\r\n")),
                None => Run::err(format!("bash: {command}: command not found\r\n"), 127),
            },
        }
    }
}

impl Device for Controller {
    fn greet(&mut self) -> Reply {
        Reply::say(format!("{USER}@{HOST}'s password: "))
    }

    fn line(&mut self, line: &str) -> Reply {
        if !self.logged_in {
            return if line == PASSWORD {
                self.logged_in = true;
                Reply::say(format!("Last login: today\r\n{}", self.prompt()))
            } else {
                Reply::say(format!(
                    "Permission denied, please try again.\r\n{USER}@{HOST}'s password: "
                ))
            };
        }
        if let Some(awaiting) = self.awaiting.take() {
            return self.answer(awaiting, line);
        }
        match self.interactive(line) {
            Some(reply) => reply,
            None => self.shell(line),
        }
    }

    fn interrupt(&mut self) -> Reply {
        self.awaiting = None;
        self.last_code = 130;
        Reply::say(self.prompt())
    }
}

/// A NAT box with a guest VM behind it that only takes key logins.
pub struct NatBox {
    logged_in: bool,
    on_guest: bool,
    last_code: i32,
}

impl NatBox {
    pub fn boxed() -> Box<dyn Device> {
        Box::new(Self {
            logged_in: false,
            on_guest: false,
            last_code: 0,
        })
    }

    fn prompt(&self) -> String {
        if self.on_guest {
            "ubuntu@vm-1:~$ ".to_string()
        } else {
            format!("{NATBOX_USER}@natbox:~$ ")
        }
    }

    fn done(&mut self, text: &str, code: i32) -> Reply {
        self.last_code = code;
        Reply::say(format!("{text}{}", self.prompt()))
    }
}

impl Device for NatBox {
    fn greet(&mut self) -> Reply {
        Reply::say(format!("{NATBOX_USER}@{NATBOX}'s password: "))
    }

    fn line(&mut self, line: &str) -> Reply {
        if !self.logged_in {
            self.logged_in = line == NATBOX_PASSWORD;
            return if self.logged_in {
                Reply::say(self.prompt())
            } else {
                Reply::say(format!("Permission denied.\r\n{NATBOX_USER}@{NATBOX}'s password: "))
            };
        }
        match line {
            "" => Reply::say(self.prompt()),
            "TMOUT=0" => self.done("", 0),
            "echo $?" => {
                let code = self.last_code;
                self.done(&format!("{code}\r\n"), 0)
            }
            "hostname" => {
                let name = if self.on_guest { "vm-1" } else { "natbox" };
                self.done(&format!("{name}\r\n"), 0)
            }
            "exit" if self.on_guest => {
                self.on_guest = false;
                self.done(&format!("logout\r\nConnection to {GUEST_IP} closed.\r\n"), 0)
            }
            _ if line.starts_with("/usr/bin/ssh ") && line.ends_with(&format!("ubuntu@{GUEST_IP}")) => {
                if line.contains("PubkeyAuthentication=no") {
                    self.done(&format!("ubuntu@{GUEST_IP}: Permission denied (publickey).\r\n"), 255)
                } else {
                    self.on_guest = true;
                    self.done("Welcome to Ubuntu 18.04.3 LTS\r\n", 0)
                }
            }
            _ => self.done(&format!("bash: {line}: command not found\r\n"), 127),
        }
    }
}
