//! stxauto: interactive session automation for StarlingX labs
//!
//! stxauto drives shells it can only reach through a terminal: ssh logins to
//! controllers, ssh hops from one host to the next, and `virsh console`
//! sessions of nodes that are still booting. On top of that it installs a
//! complete virtual lab from its consoles.
//!
//! # Features
//!
//! - **Prompt tracking**: every shell knows which prompt means "ready", also
//!   inside nested ssh hops
//! - **Robust connects**: liveness probes, post-login verification and
//!   retrying with a time budget
//! - **Command execution**: `exec_cmd` returns exit code and output with the
//!   echo removed
//! - **Pattern matching**: exact strings, regular expressions, EOF and timeout
//! - **Lab install**: a twelve step boot-and-install automaton over virsh
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use stxauto::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> stxauto::Result<()> {
//!     let mut controller = Session::ssh("10.10.10.3", "sysadmin", "Li69nux*");
//!     controller
//!         .connect(ConnectOptions::default().retry(true))
//!         .await?;
//!
//!     let (code, output) = controller
//!         .exec_cmd("source /etc/platform/openrc && system host-list", ExecOptions::default())
//!         .await?;
//!     println!("exit code {code}:\n{output}");
//!
//!     controller.close();
//!     Ok(())
//! }
//! ```
//!
//! # Nested Sessions
//!
//! A [`NestedSession`] runs `ssh` inside another shell and borrows it until
//! it is closed:
//!
//! ```rust,no_run
//! use stxauto::prelude::*;
//! use stxauto::session::prompt;
//!
//! # async fn example(controller: &mut Session) -> stxauto::Result<()> {
//! let mut compute = NestedSession::new(
//!     controller,
//!     "compute-0",
//!     "sysadmin",
//!     Some("Li69nux*".into()),
//!     prompt::COMPUTE.clone(),
//! );
//! compute.connect(ConnectOptions::default()).await?;
//! let uptime = compute.exec_cmd("uptime", ExecOptions::default()).await?;
//! compute.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Sending Control Characters
//!
//! ```rust,no_run
//! use stxauto::prelude::*;
//!
//! # async fn example(session: &mut Session) -> stxauto::Result<()> {
//! // Ctrl-C
//! session.send_control('c')?;
//!
//! // Down arrow in a boot menu
//! session.send_raw(b"\x1b[B")?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod buffer;
mod pattern;
mod result;

pub mod deploy;
pub mod registry;
pub mod runner;
pub mod session;
pub mod terminal;

// Public API exports
pub use buffer::strip_ansi;
pub use pattern::{Pattern, PatternSet};
pub use registry::LabContext;
pub use result::{Error, MatchResult, PatternError, Result};
pub use runner::{CommandRunner, ExecOptions, RsyncOptions, WaitOptions};
pub use session::{ConnectOptions, NestedSession, SendOptions, Session, SessionBuilder, Shell};

/// Everything needed to open sessions and run commands.
pub mod prelude {
    pub use crate::registry::LabContext;
    pub use crate::result::{Error, Result};
    pub use crate::runner::{CommandRunner, ExecOptions, RsyncOptions, WaitOptions};
    pub use crate::session::{
        ConnectOptions, NestedSession, SendOptions, Session, SessionBuilder, Shell,
    };
    pub use crate::{Pattern, PatternSet};
}
