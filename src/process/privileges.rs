//! Dropping root privileges once every privileged resource is held.
//!
//! # Ordering
//! ```text
//! resolve user → supplementary groups → gid → uid → verify euid != 0
//! ```
//! Groups and gid can only be changed while still root, so uid goes last.

use std::ffi::CString;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("invalid user {0:?}: not found")]
    UnknownUser(String),

    #[error("{call} failed while switching to {user:?}: {source}")]
    SyscallFailed {
        call: &'static str,
        user: String,
        #[source]
        source: std::io::Error,
    },

    #[error("effective uid is still 0 after switching to {0:?}")]
    StillPrivileged(String),
}

/// Resolved account to switch to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
}

/// The credential calls used by `drop_privileges`, as a seam for tests.
pub trait Credentials {
    fn effective_uid(&self) -> u32;
    fn lookup(&self, name: &str) -> std::io::Result<Option<Account>>;
    fn init_groups(&mut self, account: &Account) -> std::io::Result<()>;
    fn set_gid(&mut self, gid: u32) -> std::io::Result<()>;
    fn set_uid(&mut self, uid: u32) -> std::io::Result<()>;
}

/// What `drop_privileges` ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrivilegeOutcome {
    /// Not running as root, nothing to drop.
    Unprivileged,
    /// Running as root but no target user configured.
    NoTarget,
    /// Target is the superuser account; kept root.
    RemainedRoot,
    /// Now running as the given account.
    Dropped(Account),
}

/// Switch to `target_user` using the real process credentials.
pub fn drop_privileges(target_user: Option<&str>) -> Result<PrivilegeOutcome, PrivilegeError> {
    drop_privileges_with(&mut SystemCredentials, target_user)
}

/// Switch to `target_user` through the given credential calls.
pub fn drop_privileges_with<C: Credentials>(
    creds: &mut C,
    target_user: Option<&str>,
) -> Result<PrivilegeOutcome, PrivilegeError> {
    if creds.effective_uid() != 0 {
        return Ok(PrivilegeOutcome::Unprivileged);
    }
    let Some(name) = target_user.filter(|n| !n.is_empty()) else {
        tracing::warn!("Running as root without a configured user; this is strongly discouraged");
        return Ok(PrivilegeOutcome::NoTarget);
    };
    if name == "root" {
        tracing::warn!("Configured user is root; the broker keeps full privileges, which is strongly discouraged");
        return Ok(PrivilegeOutcome::RemainedRoot);
    }

    let failed = |call: &'static str| {
        let user = name.to_string();
        move |source: std::io::Error| PrivilegeError::SyscallFailed { call, user, source }
    };

    let account = creds
        .lookup(name)
        .map_err(failed("getpwnam"))?
        .ok_or_else(|| PrivilegeError::UnknownUser(name.to_string()))?;

    creds.init_groups(&account).map_err(failed("initgroups"))?;
    creds.set_gid(account.gid).map_err(failed("setgid"))?;
    creds.set_uid(account.uid).map_err(failed("setuid"))?;

    if account.uid != 0 && creds.effective_uid() == 0 {
        return Err(PrivilegeError::StillPrivileged(name.to_string()));
    }

    tracing::info!(user = %account.name, uid = account.uid, gid = account.gid, "Dropped privileges");
    Ok(PrivilegeOutcome::Dropped(account))
}

/// Real credential calls via nix.
#[derive(Debug, Default)]
pub struct SystemCredentials;

#[cfg(unix)]
impl Credentials for SystemCredentials {
    fn effective_uid(&self) -> u32 {
        nix::unistd::geteuid().as_raw()
    }

    fn lookup(&self, name: &str) -> std::io::Result<Option<Account>> {
        let user = nix::unistd::User::from_name(name)?;
        Ok(user.map(|u| Account {
            name: u.name,
            uid: u.uid.as_raw(),
            gid: u.gid.as_raw(),
        }))
    }

    fn init_groups(&mut self, account: &Account) -> std::io::Result<()> {
        let name = CString::new(account.name.as_str())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        init_groups(&name, account.gid)
    }

    fn set_gid(&mut self, gid: u32) -> std::io::Result<()> {
        nix::unistd::setgid(nix::unistd::Gid::from_raw(gid))?;
        Ok(())
    }

    fn set_uid(&mut self, uid: u32) -> std::io::Result<()> {
        nix::unistd::setuid(nix::unistd::Uid::from_raw(uid))?;
        Ok(())
    }
}

#[cfg(all(unix, not(any(target_os = "macos", target_os = "ios"))))]
fn init_groups(name: &CString, gid: u32) -> std::io::Result<()> {
    nix::unistd::initgroups(name, nix::unistd::Gid::from_raw(gid))?;
    Ok(())
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn init_groups(name: &CString, gid: u32) -> std::io::Result<()> {
    // SAFETY: `name` is a valid NUL terminated string for the duration of the call.
    let rc = unsafe { libc::initgroups(name.as_ptr(), gid as libc::c_int) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
impl Credentials for SystemCredentials {
    fn effective_uid(&self) -> u32 {
        1
    }

    fn lookup(&self, _name: &str) -> std::io::Result<Option<Account>> {
        Ok(None)
    }

    fn init_groups(&mut self, _account: &Account) -> std::io::Result<()> {
        Err(std::io::ErrorKind::Unsupported.into())
    }

    fn set_gid(&mut self, _gid: u32) -> std::io::Result<()> {
        Err(std::io::ErrorKind::Unsupported.into())
    }

    fn set_uid(&mut self, _uid: u32) -> std::io::Result<()> {
        Err(std::io::ErrorKind::Unsupported.into())
    }
}
