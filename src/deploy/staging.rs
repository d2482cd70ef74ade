//! Copying the install files to the primary node

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info};

use super::{Stage, VarDict};
use crate::pattern::{Pattern, PatternSet};
use crate::result::{Error, Result};
use crate::runner::CommandRunner;
use crate::session::{prompt, ConnectOptions, SessionBuilder, SSH_OPTIONS};
use crate::terminal::CommandLine;

/// Puts the files an install needs onto the primary node.
pub trait FileStager: Send + Sync {
    /// Copy every file named in `vars` to the primary node.
    fn stage_files(&self, vars: &VarDict) -> impl Future<Output = Result<()>> + Send;
}

/// Copies files with `scp`, answering the password prompt.
#[derive(Debug, Clone)]
pub struct ScpStager {
    builder: SessionBuilder,
    timeout: Duration,
}

impl Default for ScpStager {
    fn default() -> Self {
        Self::new(SessionBuilder::new())
    }
}

impl ScpStager {
    /// Run `scp` through sessions made by `builder`.
    pub fn new(builder: SessionBuilder) -> Self {
        Self {
            builder,
            timeout: Duration::from_secs(1800),
        }
    }

    /// Budget for a single copy.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn copy(&self, local: &str, remote: &str, password: &str) -> Result<()> {
        let command = CommandLine::new("scp").args(SSH_OPTIONS).args([local, remote]);
        let mut scp = self.builder.clone().name("scp").process(command);
        scp.connect(ConnectOptions::default()).await?;

        let set: PatternSet = [prompt::PASSWORD.clone(), Pattern::Eof].into();
        if scp.expect(set, self.timeout).await? == 0 {
            scp.send(password).await?;
            scp.expect(Pattern::Eof, self.timeout).await?;
        }

        let code = scp.exit_code();
        scp.close();
        match code {
            Some(0) | None => Ok(()),
            Some(code) => Err(Error::StageFailed {
                stage: Stage::FileStaging,
                reason: format!("scp {local} exited with {code}"),
            }),
        }
    }
}

impl FileStager for ScpStager {
    async fn stage_files(&self, vars: &VarDict) -> Result<()> {
        let user = vars.get("vm_os_name")?;
        let password = vars.get("vm_os_password")?;
        let host = vars.get("vm_ip_addr")?;

        for (name, local) in vars.files() {
            if local.is_empty() {
                debug!("no local copy of {name}, skipping");
                continue;
            }
            info!("sending {local} to controller-0");
            self.copy(local, &format!("{user}@{host}:~/{name}"), password)
                .await?;
        }
        Ok(())
    }
}
