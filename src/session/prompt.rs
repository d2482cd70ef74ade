//! Prompt and login patterns used across StarlingX hosts

use std::sync::LazyLock;

use crate::pattern::Pattern;

fn re(pattern: &str) -> Pattern {
    Pattern::regex(pattern).expect("built-in prompt pattern is a valid regex")
}

/// Shell prompt of either controller.
pub static CONTROLLER: LazyLock<Pattern> = LazyLock::new(|| re(r".*controller\-[01]\:~\$ "));

/// Shell prompt of controller-0 only.
pub static CONTROLLER_0: LazyLock<Pattern> = LazyLock::new(|| re(r".*controller\-0\:~\$ "));

/// Shell prompt of controller-1 only.
pub static CONTROLLER_1: LazyLock<Pattern> = LazyLock::new(|| re(r".*controller\-1\:~\$ "));

/// Shell prompt of any compute host.
pub static COMPUTE: LazyLock<Pattern> = LazyLock::new(|| re(r".*compute\-([0-9]){1,}\:~\$"));

/// Shell prompt of any storage host.
pub static STORAGE: LazyLock<Pattern> = LazyLock::new(|| re(r".*storage\-([0-9]){1,}\:~\$"));

/// Any password request (ssh, sudo, su).
pub static PASSWORD: LazyLock<Pattern> = LazyLock::new(|| re(r".*assword\:.*"));

/// Unknown host key confirmation.
pub static ADD_HOST: LazyLock<Pattern> = LazyLock::new(|| re(r".*\(yes/no\).*"));

/// Root shell prompt.
pub static ROOT: LazyLock<Pattern> = LazyLock::new(|| re(r".*root@.*"));

/// Rejected credentials.
pub static PERMISSION_DENIED: LazyLock<Pattern> =
    LazyLock::new(|| re(r"(?i)permission denied"));

/// Nothing listening on the port.
pub static CONNECTION_REFUSED: LazyLock<Pattern> =
    LazyLock::new(|| re(r"(?i)connection refused"));

/// Transport-level ssh failures other than refusal.
pub static SSH_FAILURE: LazyLock<Pattern> = LazyLock::new(|| {
    re(concat!(
        r"Could not resolve hostname.*|No route to host|Connection timed out",
        r"|Connection closed by.*|Connection reset by.*|Host key verification failed"
    ))
});

/// Generic `$ ` or `# ` shell prompt.
pub static SHELL: LazyLock<Pattern> = LazyLock::new(|| re(r".*[$#] "));

/// Login prompt of a booted console.
pub static LOGIN: LazyLock<Pattern> = LazyLock::new(|| Pattern::exact("login:"));

/// Shell prompt on a virsh console after login.
pub static CONSOLE_SHELL: LazyLock<Pattern> = LazyLock::new(|| Pattern::exact(":~$"));

/// Prompt of a NAT box user's shell.
pub fn natbox(user: &str) -> Pattern {
    re(&format!(r"{}\@.*\:\~[$#]", regex::escape(user)))
}

/// Prompt of a guest VM shell for `user`.
pub fn vm(user: &str) -> Pattern {
    re(&format!(r".*{}\@.*\~.*[$#]", regex::escape(user)))
}

/// Prompt matching a specific host name.
pub fn host(hostname: &str) -> Pattern {
    re(&format!(r".*{}\:~\$ ", regex::escape(hostname)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &Pattern, text: &str) -> bool {
        pattern.to_matcher().unwrap().find(text.as_bytes()).is_some()
    }

    #[test]
    fn test_controller_prompts() {
        assert!(matches(&CONTROLLER, "controller-0:~$ "));
        assert!(matches(&CONTROLLER, "controller-1:~$ "));
        assert!(matches(&CONTROLLER_0, "controller-0:~$ "));
        assert!(!matches(&CONTROLLER_0, "controller-1:~$ "));
        assert!(!matches(&CONTROLLER, "compute-0:~$ "));
    }

    #[test]
    fn test_node_prompts() {
        assert!(matches(&COMPUTE, "compute-12:~$"));
        assert!(matches(&STORAGE, "storage-0:~$"));
        assert!(!matches(&COMPUTE, "controller-0:~$"));
    }

    #[test]
    fn test_login_prompts() {
        assert!(matches(&PASSWORD, "sysadmin@10.10.10.3's password: "));
        assert!(matches(&PASSWORD, "Password:"));
        assert!(matches(
            &ADD_HOST,
            "Are you sure you want to continue connecting (yes/no)? "
        ));
        assert!(matches(&PERMISSION_DENIED, "Permission denied, please try again."));
        assert!(matches(&SSH_FAILURE, "ssh: connect to host x port 22: No route to host"));
    }

    #[test]
    fn test_user_prompts() {
        assert!(matches(&natbox("svc-cgcsauto"), "svc-cgcsauto@yow-natbox:~$"));
        assert!(matches(&vm("ubuntu"), "ubuntu@tenant1-vm-1:~$ "));
        assert!(matches(&host("compute-3"), "compute-3:~$ "));
    }
}
