//! Privilege drop.
//!
//! From here on every process the image runs executes as the provisioned
//! account. The identity is re-read from the image account database, so what
//! gets recorded is what the image actually contains.

use anyhow::Result;

use super::identity::lookup_user;
use super::{BuildContext, Stage, StageRecord};
use crate::error::BuildError;
use crate::image::Identity;

/// Stage 7: fix the identity later processes run as.
pub fn drop_privilege(ctx: &mut BuildContext) -> Result<StageRecord> {
    let provisioned = BuildContext::require(&ctx.identity, Stage::Identity)?.clone();

    let entry = lookup_user(&ctx.rootfs, &provisioned.name)?.ok_or_else(|| {
        BuildError::privilege(format!(
            "user '{}' is missing from the image account database",
            provisioned.name
        ))
    })?;
    if entry.uid == 0 || entry.gid == 0 {
        return Err(BuildError::privilege(format!(
            "refusing to run as '{}' ({}:{})",
            entry.name, entry.uid, entry.gid
        ))
        .into());
    }
    if entry.uid != provisioned.uid || entry.gid != provisioned.gid {
        return Err(BuildError::privilege(format!(
            "user '{}' resolves to {}:{}, expected {}:{}",
            entry.name, entry.uid, entry.gid, provisioned.uid, provisioned.gid
        ))
        .into());
    }

    let run_as = Identity {
        name: entry.name,
        uid: entry.uid,
        gid: entry.gid,
        home: entry.home,
        shell: entry.shell,
    };
    tracing::info!(user = %run_as.name, uid = run_as.uid, "dropping privilege");
    let detail = format!("{} ({}:{})", run_as.name, run_as.uid, run_as.gid);
    ctx.run_as = Some(run_as);
    Ok(StageRecord::done(Stage::Privilege, detail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use crate::stage::identity::{create_root_user, ensure_user};
    use std::fs;
    use tempfile::TempDir;

    fn ctx_with_identity(rootfs: &std::path::Path, identity: Identity) -> BuildContext {
        let mut ctx = BuildContext::new(rootfs, BuildConfig::default(), rootfs);
        ctx.identity = Some(identity);
        ctx
    }

    fn appuser() -> Identity {
        Identity {
            name: "appuser".into(),
            uid: 1000,
            gid: 1000,
            home: "/app".into(),
            shell: "/usr/sbin/nologin".into(),
        }
    }

    #[test]
    fn resolves_provisioned_identity() {
        let dir = TempDir::new().unwrap();
        create_root_user(dir.path()).unwrap();
        ensure_user(dir.path(), &appuser()).unwrap();

        let mut ctx = ctx_with_identity(dir.path(), appuser());
        drop_privilege(&mut ctx).unwrap();
        assert_eq!(ctx.run_as, Some(appuser()));
    }

    #[test]
    fn missing_account_fails() {
        let dir = TempDir::new().unwrap();
        create_root_user(dir.path()).unwrap();
        let mut ctx = ctx_with_identity(dir.path(), appuser());
        let err = drop_privilege(&mut ctx).unwrap_err();
        assert_eq!(
            BuildError::find(&err).unwrap().kind(),
            "PrivilegeProvisioningError"
        );
        assert!(ctx.run_as.is_none());
    }

    #[test]
    fn root_mapped_account_is_refused() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        fs::write(
            dir.path().join("etc/passwd"),
            "appuser:x:0:0:appuser:/app:/bin/sh\n",
        )
        .unwrap();
        let mut ctx = ctx_with_identity(dir.path(), appuser());
        let err = drop_privilege(&mut ctx).unwrap_err();
        assert!(err.to_string().contains("refusing"));
    }
}
