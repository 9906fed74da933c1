//! Entrypoint launch.
//!
//! Starts the recorded entrypoint as the image's non-root identity, from the
//! image workdir, with exactly the image environment. The child is the
//! foreground process: termination signals sent to `pyship run` are forwarded
//! to it and its exit status becomes ours.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};

use crate::error::BuildError;
use crate::image::{self, ImageManifest, ROOTFS_DIR};

/// Directories searched after the dependency environment.
const SYSTEM_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Exit code when the entrypoint program cannot be found.
pub const EXIT_NOT_FOUND: i32 = 127;
/// Exit code when the entrypoint program exists but cannot be started.
pub const EXIT_CANNOT_EXECUTE: i32 = 126;

/// Whether to switch identity when spawning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    /// The caller already is the image identity.
    AlreadyIdentity,
    /// The caller is root and drops to the identity.
    DropTo { uid: u32, gid: u32 },
}

/// Everything needed to start the entrypoint.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    pub switch: Switch,
}

fn launch_failure(reason: impl Into<String>, code: i32) -> BuildError {
    BuildError::EntrypointLaunchFailure {
        reason: reason.into(),
        code,
    }
}

/// Decide how to become the image identity from effective uid `euid`.
pub fn identity_switch(manifest: &ImageManifest, euid: u32) -> Result<Switch> {
    let user = &manifest.user;
    if user.uid == 0 || user.gid == 0 {
        return Err(BuildError::privilege(format!(
            "image '{}' records a root identity",
            manifest.name
        ))
        .into());
    }
    if euid == 0 {
        Ok(Switch::DropTo {
            uid: user.uid,
            gid: user.gid,
        })
    } else if euid == user.uid {
        Ok(Switch::AlreadyIdentity)
    } else {
        Err(BuildError::privilege(format!(
            "cannot run as {} (uid {}) from uid {}; run as that user or as root",
            user.name, user.uid, euid
        ))
        .into())
    }
}

/// Environment of the entrypoint process.
///
/// Nothing leaks from the caller except the variables the image names in
/// `required_env` and `pass_env`.
pub fn launch_env(
    image_dir: &Path,
    manifest: &ImageManifest,
    host_env: &HashMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    let venv = manifest.host_venv(image_dir);
    let home = if manifest.user.home == manifest.workdir {
        manifest.host_workdir(image_dir)
    } else {
        image::in_rootfs(&image_dir.join(ROOTFS_DIR), &manifest.user.home)
    };

    let mut env = BTreeMap::new();
    env.insert(
        "PATH".to_string(),
        format!("{}:{}", venv.join("bin").display(), SYSTEM_PATH),
    );
    env.insert("HOME".to_string(), home.display().to_string());
    env.insert("USER".to_string(), manifest.user.name.clone());
    env.insert("VIRTUAL_ENV".to_string(), venv.display().to_string());
    for (key, value) in &manifest.env {
        env.insert(key.clone(), value.clone());
    }
    for key in &manifest.pass_env {
        if let Some(value) = host_env.get(key) {
            env.insert(key.clone(), value.clone());
        }
    }

    let missing: Vec<String> = manifest
        .required_env
        .iter()
        .filter(|r| !r.is_satisfied(host_env))
        .map(ToString::to_string)
        .collect();
    if !missing.is_empty() {
        return Err(launch_failure(
            format!("required environment variable(s) not set: {}", missing.join(", ")),
            1,
        )
        .into());
    }
    for key in manifest.required_env.iter().flat_map(|r| r.names()) {
        if let Some(value) = host_env.get(key).filter(|v| !v.is_empty()) {
            env.insert(key.clone(), value.clone());
        }
    }
    Ok(env)
}

/// Resolve the entrypoint program against the image PATH.
pub fn resolve_program(program: &str, path: &str, cwd: &Path, rootfs: &Path) -> Result<PathBuf> {
    let not_found = || launch_failure(format!("entrypoint '{}' not found", program), EXIT_NOT_FOUND);

    if program.starts_with('/') {
        let in_image = image::in_rootfs(rootfs, program);
        return if in_image.exists() {
            Ok(in_image)
        } else if Path::new(program).exists() {
            Ok(PathBuf::from(program))
        } else {
            Err(not_found().into())
        };
    }
    if program.contains('/') {
        let path = cwd.join(program);
        return if path.exists() {
            Ok(path)
        } else {
            Err(not_found().into())
        };
    }
    which::which_in(program, Some(path), cwd).map_err(|_| not_found().into())
}

/// Build the launch plan for a published image.
pub fn prepare(
    image_dir: &Path,
    manifest: &ImageManifest,
    host_env: &HashMap<String, String>,
    euid: u32,
) -> Result<LaunchPlan> {
    let switch = identity_switch(manifest, euid)?;
    let env = launch_env(image_dir, manifest, host_env)?;
    manifest
        .verify_dependencies(image_dir)
        .map_err(|e| launch_failure(format!("{:#}", e), EXIT_CANNOT_EXECUTE))?;

    let cwd = manifest.host_workdir(image_dir);
    if !cwd.is_dir() {
        return Err(launch_failure(
            format!("image workdir {} is missing", cwd.display()),
            EXIT_CANNOT_EXECUTE,
        )
        .into());
    }

    let (program, args) = manifest
        .entrypoint
        .split_first()
        .ok_or_else(|| launch_failure("image has no entrypoint", EXIT_CANNOT_EXECUTE))?;
    let path = env.get("PATH").map(String::as_str).unwrap_or(SYSTEM_PATH);
    let program = resolve_program(program, path, &cwd, &image_dir.join(ROOTFS_DIR))?;

    Ok(LaunchPlan {
        program,
        args: args.to_vec(),
        env,
        cwd,
        switch,
    })
}

/// Exit code for a finished child: its own code, or 128 + signal.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => 1,
    }
}

fn forward(pid: Option<u32>, sig: libc::c_int) {
    if let Some(pid) = pid {
        tracing::debug!(pid, signal = sig, "forwarding signal");
        // SAFETY: kill(2) with a pid we spawned and a valid signal number.
        unsafe {
            libc::kill(pid as libc::pid_t, sig);
        }
    }
}

/// Spawn the entrypoint and wait for it, forwarding termination signals.
///
/// Handlers are in place before the child exists, so a signal can never hit
/// us with the default disposition while the child runs.
pub async fn execute(plan: &LaunchPlan) -> Result<i32> {
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    let mut cmd = Command::new(&plan.program);
    cmd.args(&plan.args)
        .env_clear()
        .envs(&plan.env)
        .current_dir(&plan.cwd);
    if let Switch::DropTo { uid, gid } = plan.switch {
        cmd.uid(uid).gid(gid);
    }

    let mut child = cmd.spawn().map_err(|e| {
        let code = match e.kind() {
            std::io::ErrorKind::NotFound => EXIT_NOT_FOUND,
            _ => EXIT_CANNOT_EXECUTE,
        };
        launch_failure(format!("cannot start {}: {}", plan.program.display(), e), code)
    })?;
    let pid = child.id();
    tracing::info!(pid = pid.unwrap_or_default(), program = %plan.program.display(), "entrypoint started");

    loop {
        tokio::select! {
            status = child.wait() => {
                let status = status.context("Failed to wait for entrypoint")?;
                let code = exit_code(status);
                tracing::info!(code, "entrypoint exited");
                return Ok(code);
            }
            _ = sigint.recv() => forward(pid, libc::SIGINT),
            _ = sigterm.recv() => forward(pid, libc::SIGTERM),
            _ = sighup.recv() => forward(pid, libc::SIGHUP),
        }
    }
}

/// Launch the published image `name` of `project_dir`. Returns the exit code.
pub async fn launch(project_dir: &Path, name: &str, host_env: &HashMap<String, String>) -> Result<i32> {
    let (image_dir, manifest) = ImageManifest::load_published(project_dir, name)?;
    // SAFETY: geteuid(2) has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    let plan = prepare(&image_dir, &manifest, host_env, euid)?;
    tracing::info!(
        image = %manifest.image_id,
        user = %manifest.user.name,
        workdir = %manifest.workdir,
        "launching entrypoint"
    );
    execute(&plan).await
}
