//! Lookup of the sessions a test run works with
//!
//! A [`LabContext`] is handed to whatever needs "the active controller" or
//! "the NAT box" instead of keeping them in process-wide state. Lookups
//! without a key only succeed when they are unambiguous.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::{debug, info};

use crate::result::{Error, Result};
use crate::runner::{CommandRunner, ExecOptions};
use crate::session::{prompt, ConnectOptions, Session, SessionBuilder, Shell};

/// Key used for controllers whose host matches no known lab.
pub const NO_NAME: &str = "no_name";

/// A lab the suite knows about.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LabInfo {
    /// Short name, the registry key of the lab
    pub short_name: String,
    /// Floating address of the active controller
    pub floating_ip: String,
}

/// A NAT box the suite may hop through.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NatBoxInfo {
    /// Address of the NAT box
    pub ip: String,
    /// Login user
    pub user: String,
    /// Login password
    pub password: String,
}

/// Sessions of one test run, keyed by role.
///
/// # Examples
///
/// ```no_run
/// use stxauto::prelude::*;
/// use stxauto::registry::LabInfo;
///
/// # async fn example() -> stxauto::Result<()> {
/// let mut lab = LabContext::new(vec![LabInfo {
///     short_name: "WCP_3_6".into(),
///     floating_ip: "128.224.150.10".into(),
/// }]);
///
/// let mut ssh = Session::ssh("128.224.150.10", "sysadmin", "Li69nux*");
/// ssh.connect(ConnectOptions::default()).await?;
/// lab.set_active_controller(ssh);
///
/// let controller = lab.active_controller(Some("wcp_3_6"))?;
/// controller.exec_cmd("system host-list", ExecOptions::default()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct LabContext {
    labs: Vec<LabInfo>,
    natboxes: Vec<NatBoxInfo>,
    current_lab: Option<String>,
    controllers: HashMap<String, Session>,
    natbox_clients: HashMap<String, Session>,
    builder: SessionBuilder,
}

impl LabContext {
    /// A context that knows `labs` and no NAT boxes.
    pub fn new(labs: Vec<LabInfo>) -> Self {
        Self {
            labs,
            ..Self::default()
        }
    }

    /// Register the NAT boxes [`set_natbox_client`](Self::set_natbox_client) may connect to.
    pub fn with_natboxes(mut self, natboxes: Vec<NatBoxInfo>) -> Self {
        self.natboxes = natboxes;
        self
    }

    /// Builder used for NAT box sessions (log directory, spawner, timeouts).
    pub fn with_builder(mut self, builder: SessionBuilder) -> Self {
        self.builder = builder;
        self
    }

    /// Lab the run targets; keyless controller lookups prefer it.
    pub fn with_current_lab(mut self, short_name: impl Into<String>) -> Self {
        self.current_lab = Some(short_name.into().to_lowercase());
        self
    }

    /// Known labs.
    pub fn labs(&self) -> &[LabInfo] {
        &self.labs
    }

    /// Registry key for a controller session on `host`.
    pub fn lab_key(&self, host: &str) -> String {
        self.labs
            .iter()
            .find(|lab| lab.floating_ip == host.trim())
            .map_or_else(|| NO_NAME.to_string(), |lab| lab.short_name.to_lowercase())
    }

    /// Make `session` the active controller of its lab.
    ///
    /// The lab is found by the session's host. A session replaced by this
    /// call is handed back; it is not closed.
    pub fn set_active_controller(&mut self, session: Session) -> Option<Session> {
        let key = self.lab_key(session.host());
        info!(
            "Active controller client for {} is set. Host ip/name: {}",
            key.to_uppercase(),
            session.host()
        );
        self.controllers.insert(key, session)
    }

    /// Set the active controllers of several labs at once.
    ///
    /// Returns the sessions that were replaced.
    pub fn set_active_controllers(
        &mut self,
        sessions: impl IntoIterator<Item = Session>,
    ) -> Vec<Session> {
        sessions
            .into_iter()
            .filter_map(|session| self.set_active_controller(session))
            .collect()
    }

    /// The active controller of `lab`, matched case-insensitively.
    ///
    /// Without a lab the current lab is used if it has a controller; failing
    /// that, the single registered controller.
    ///
    /// # Errors
    ///
    /// - [`Error::ActiveControllerUnset`] when nothing is registered for the key
    /// - [`Error::AmbiguousSession`] for a keyless lookup among several labs
    pub fn active_controller(&mut self, lab: Option<&str>) -> Result<&mut Session> {
        let key = match lab {
            Some(lab) => lab.to_lowercase(),
            None => self.keyless_controller_key()?,
        };
        debug!("Getting active controller client for {key}");
        self.controllers
            .get_mut(&key)
            .ok_or(Error::ActiveControllerUnset { lab: key })
    }

    fn keyless_controller_key(&self) -> Result<String> {
        if let Some(current) = &self.current_lab {
            if self.controllers.contains_key(current) {
                return Ok(current.clone());
            }
        }

        let mut keys = self.controllers.keys();
        match (keys.next(), self.controllers.len()) {
            (Some(key), 1) => Ok(key.clone()),
            (None, _) => Err(Error::ActiveControllerUnset {
                lab: self.current_lab.clone().unwrap_or_else(|| NO_NAME.to_string()),
            }),
            (Some(_), count) => Err(Error::AmbiguousSession {
                kind: "active controller",
                count,
            }),
        }
    }

    /// Every registered controller, e.g. to run a command on all labs.
    ///
    /// # Errors
    ///
    /// [`Error::ActiveControllerUnset`] when none is registered.
    pub fn active_controllers(&mut self) -> Result<Vec<&mut Session>> {
        if self.controllers.is_empty() {
            return Err(Error::ActiveControllerUnset {
                lab: "any lab".to_string(),
            });
        }
        Ok(self.controllers.values_mut().collect())
    }

    /// Take the active controller of `lab` out of the context.
    pub fn remove_active_controller(&mut self, lab: &str) -> Option<Session> {
        self.controllers.remove(&lab.to_lowercase())
    }

    /// Connect to a known NAT box and cache the session under its address.
    ///
    /// Always opens a fresh connection and disables the idle logout.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownNatBox`] if `ip` is not a known NAT box, or the
    /// connect error.
    pub async fn set_natbox_client(&mut self, ip: &str) -> Result<&mut Session> {
        let ip = ip.trim();
        let natbox = self
            .natboxes
            .iter()
            .find(|natbox| natbox.ip == ip)
            .cloned()
            .ok_or_else(|| Error::UnknownNatBox(ip.to_string()))?;

        let mut session = self
            .builder
            .clone()
            .prompt(prompt::natbox(&natbox.user))
            .ssh(&natbox.ip, &natbox.user, &natbox.password);
        session
            .connect(ConnectOptions::default().reuse_if_alive(false))
            .await?;
        session.exec_cmd("TMOUT=0", ExecOptions::default()).await?;

        info!("NatBox {ip} ssh client is set");
        self.natbox_clients.insert(natbox.ip.clone(), session);
        self.natbox_clients
            .get_mut(&natbox.ip)
            .ok_or(Error::NatBoxUnset)
    }

    /// Cache an already connected NAT box session under its host.
    pub fn insert_natbox_client(&mut self, session: Session) -> Option<Session> {
        self.natbox_clients.insert(session.host().to_owned(), session)
    }

    /// The NAT box session for `ip`, or the only one cached when no address is given.
    ///
    /// # Errors
    ///
    /// - [`Error::NatBoxUnset`] when nothing matches
    /// - [`Error::AmbiguousSession`] for a keyless lookup among several NAT boxes
    pub fn natbox_client(&mut self, ip: Option<&str>) -> Result<&mut Session> {
        let count = self.natbox_clients.len();
        match ip {
            Some(ip) => self.natbox_clients.get_mut(ip.trim()).ok_or(Error::NatBoxUnset),
            None if count > 1 => Err(Error::AmbiguousSession {
                kind: "NAT box",
                count,
            }),
            None => self.natbox_clients.values_mut().next().ok_or(Error::NatBoxUnset),
        }
    }
}
