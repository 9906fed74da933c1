//! Execution identity provisioning.
//!
//! Accounts live in the image rootfs `etc/passwd` and `etc/group`. The
//! configured account must not collide with an existing one by name or id;
//! re-provisioning the same account is a no-op.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::lchown;
use std::path::Path;
use walkdir::WalkDir;

use super::{BuildContext, Stage, StageRecord};
use crate::error::BuildError;
use crate::image::{self, Identity};

const ROOT_SHELL: &str = "/bin/sh";

/// One parsed `etc/passwd` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    pub shell: String,
}

/// One parsed `etc/group` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub name: String,
    pub gid: u32,
}

fn read_db(path: &Path) -> Result<String> {
    // A missing file means no accounts yet.
    if !path.exists() {
        return Ok(String::new());
    }
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn parse_id(field: &str, what: &str, line: &str, path: &Path) -> Result<u32> {
    field.parse().with_context(|| {
        format!(
            "Corrupted {}: invalid {} '{}' in line '{}'",
            path.display(),
            what,
            field,
            line
        )
    })
}

/// All users in the rootfs passwd file.
pub fn read_users(rootfs: &Path) -> Result<Vec<PasswdEntry>> {
    let path = rootfs.join("etc/passwd");
    let content = read_db(&path)?;
    let mut users = Vec::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() < 7 {
            anyhow::bail!("Corrupted {}: malformed line '{}'", path.display(), line);
        }
        users.push(PasswdEntry {
            name: parts[0].to_string(),
            uid: parse_id(parts[2], "UID", line, &path)?,
            gid: parse_id(parts[3], "GID", line, &path)?,
            home: parts[5].to_string(),
            shell: parts[6].to_string(),
        });
    }
    Ok(users)
}

/// All groups in the rootfs group file.
pub fn read_groups(rootfs: &Path) -> Result<Vec<GroupEntry>> {
    let path = rootfs.join("etc/group");
    let content = read_db(&path)?;
    let mut groups = Vec::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() < 3 {
            anyhow::bail!("Corrupted {}: malformed line '{}'", path.display(), line);
        }
        groups.push(GroupEntry {
            name: parts[0].to_string(),
            gid: parse_id(parts[2], "GID", line, &path)?,
        });
    }
    Ok(groups)
}

/// Look up a user by name in the rootfs.
pub fn lookup_user(rootfs: &Path, name: &str) -> Result<Option<PasswdEntry>> {
    Ok(read_users(rootfs)?.into_iter().find(|u| u.name == name))
}

/// Create passwd and group files holding only root, if absent.
pub fn create_root_user(rootfs: &Path) -> Result<()> {
    let etc = rootfs.join("etc");
    fs::create_dir_all(&etc)?;
    let passwd = etc.join("passwd");
    if !passwd.exists() {
        fs::write(&passwd, format!("root:x:0:0:root:/root:{}\n", ROOT_SHELL))?;
    }
    let group = etc.join("group");
    if !group.exists() {
        fs::write(&group, "root:x:0:\n")?;
    }
    Ok(())
}

/// Ensure a group with exactly this name and gid exists.
pub fn ensure_group(rootfs: &Path, name: &str, gid: u32) -> Result<()> {
    for group in read_groups(rootfs)? {
        if group.name == name && group.gid == gid {
            return Ok(());
        }
        if group.name == name {
            return Err(BuildError::privilege(format!(
                "group '{}' already exists with gid {}",
                name, group.gid
            ))
            .into());
        }
        if group.gid == gid {
            return Err(BuildError::privilege(format!(
                "gid {} is already taken by group '{}'",
                gid, group.name
            ))
            .into());
        }
    }

    let path = rootfs.join("etc/group");
    let mut content = read_db(&path)?;
    content.push_str(&format!("{}:x:{}:\n", name, gid));
    fs::write(&path, content).with_context(|| format!("Failed to write group {}", name))?;
    Ok(())
}

/// Ensure a user matching `identity` exists.
pub fn ensure_user(rootfs: &Path, identity: &Identity) -> Result<()> {
    for user in read_users(rootfs)? {
        if user.name == identity.name && user.uid == identity.uid && user.gid == identity.gid {
            return Ok(());
        }
        if user.name == identity.name {
            return Err(BuildError::privilege(format!(
                "user '{}' already exists with uid {}",
                identity.name, user.uid
            ))
            .into());
        }
        if user.uid == identity.uid {
            return Err(BuildError::privilege(format!(
                "uid {} is already taken by user '{}'",
                identity.uid, user.name
            ))
            .into());
        }
    }

    let path = rootfs.join("etc/passwd");
    let mut content = read_db(&path)?;
    content.push_str(&format!(
        "{}:x:{}:{}:{}:{}:{}\n",
        identity.name, identity.uid, identity.gid, identity.name, identity.home, identity.shell
    ));
    fs::write(&path, content)
        .with_context(|| format!("Failed to write passwd for user {}", identity.name))?;
    Ok(())
}

/// Change ownership of `root` and everything below it. Symlinks are not followed.
pub fn chown_recursive(root: &Path, uid: u32, gid: u32) -> Result<usize> {
    let mut changed = 0;
    for entry in WalkDir::new(root) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        lchown(entry.path(), Some(uid), Some(gid)).map_err(|e| {
            BuildError::privilege(format!(
                "cannot give {} to {}:{}: {}",
                entry.path().display(),
                uid,
                gid,
                e
            ))
        })?;
        changed += 1;
    }
    Ok(changed)
}

/// Stage 6: create the account and hand it the workdir.
pub fn provision_identity(ctx: &mut BuildContext) -> Result<StageRecord> {
    let workdir = BuildContext::require(&ctx.workdir, Stage::Workdir)?.clone();
    BuildContext::require(&ctx.source, Stage::Source)?;

    let user = &ctx.config.user;
    let identity = Identity {
        name: user.name.clone(),
        uid: user.uid,
        gid: user.gid(),
        home: ctx.config.user_home(),
        shell: user.shell.clone(),
    };
    if identity.uid == 0 || identity.gid == 0 {
        return Err(BuildError::privilege("execution identity must not be root").into());
    }

    create_root_user(&ctx.rootfs)?;
    ensure_group(&ctx.rootfs, &identity.name, identity.gid)?;
    ensure_user(&ctx.rootfs, &identity)?;

    for dir in &ctx.config.launch.runtime_dirs {
        let path = workdir.join(dir);
        fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create runtime dir {}", path.display()))?;
    }

    let mut changed = chown_recursive(&workdir, identity.uid, identity.gid)?;
    let home = image::in_rootfs(&ctx.rootfs, &identity.home);
    if !home.starts_with(&workdir) {
        fs::create_dir_all(&home)
            .with_context(|| format!("Failed to create home {}", home.display()))?;
        changed += chown_recursive(&home, identity.uid, identity.gid)?;
    }
    tracing::info!(
        user = %identity.name,
        uid = identity.uid,
        gid = identity.gid,
        entries = changed,
        "provisioned execution identity"
    );

    let detail = format!("{} ({}:{})", identity.name, identity.uid, identity.gid);
    ctx.identity = Some(identity);
    Ok(StageRecord::done(Stage::Identity, detail))
}
