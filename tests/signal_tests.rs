//! Signal forwarding during launch.
//!
//! Lives in its own test binary: a signal sent to the test process reaches
//! every launch running in it.

use pyship::launch::{execute, LaunchPlan, Switch};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[tokio::test]
async fn signal_right_after_spawn_is_forwarded() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut env = BTreeMap::new();
    env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
    let plan = LaunchPlan {
        program: PathBuf::from("/bin/sh"),
        // The child signals us before it does anything else.
        args: vec!["-c".into(), "kill -TERM $PPID; sleep 5".into()],
        env,
        cwd: dir.path().to_path_buf(),
        switch: Switch::AlreadyIdentity,
    };

    let code = execute(&plan).await.unwrap();
    assert_eq!(code, 128 + libc::SIGTERM);
}
