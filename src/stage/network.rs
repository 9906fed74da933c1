//! Network contract declaration.
//!
//! The exposed port is metadata only. Nothing binds or publishes it; the
//! application listens on it when started.

use anyhow::Result;

use super::{BuildContext, Stage, StageRecord};
use crate::image::{ExposedPort, Protocol};

/// Stage 8: record the port the application listens on.
pub fn declare_port(ctx: &mut BuildContext) -> Result<StageRecord> {
    BuildContext::require(&ctx.run_as, Stage::Privilege)?;

    let port = ExposedPort {
        port: ctx.config.network.port,
        protocol: Protocol::Tcp,
    };
    tracing::info!(port = %port, "declared exposed port");
    let detail = port.to_string();
    ctx.port = Some(port);
    Ok(StageRecord::done(Stage::Network, detail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use crate::image::Identity;
    use tempfile::TempDir;

    #[test]
    fn declares_configured_port() {
        let dir = TempDir::new().unwrap();
        let mut ctx = BuildContext::new(dir.path(), BuildConfig::default(), dir.path());
        ctx.run_as = Some(Identity {
            name: "appuser".into(),
            uid: 1000,
            gid: 1000,
            home: "/app".into(),
            shell: "/usr/sbin/nologin".into(),
        });

        let record = declare_port(&mut ctx).unwrap();
        assert_eq!(record.detail, "8000/tcp");
        assert_eq!(ctx.port.map(|p| p.port), Some(8000));
    }

    #[test]
    fn requires_privilege_drop() {
        let dir = TempDir::new().unwrap();
        let mut ctx = BuildContext::new(dir.path(), BuildConfig::default(), dir.path());
        assert!(declare_port(&mut ctx).is_err());
    }
}
