//! The ordered list of subsystem exporters run for a snapshot.

use super::step::Step;
use std::path::Path;

/// Inputs that shape the step list.
#[derive(Debug, Clone, Copy)]
pub struct PlanContext<'a> {
    /// Effective host after negotiation.
    pub host: &'a str,
    pub strategy: &'a str,
    pub skip_pages: bool,
    pub run_fsck: bool,
    pub snapshot_dir: &'a Path,
}

pub fn standard(ctx: &PlanContext<'_>) -> Vec<Step> {
    let mut steps = vec![
        Step::new("secrets", "ghe-backup-secrets"),
        Step::new("settings", "ghe-backup-settings"),
        Step::new("authorized-keys", "ghe-ssh")
            .args([ctx.host, "--", "ghe-export-authorized-keys"])
            .stdout_to("authorized-keys.json"),
        Step::new("ssh-host-keys", "ghe-ssh")
            .args([ctx.host, "--", "ghe-export-ssh-host-keys"])
            .stdout_to("ssh-host-keys.tar"),
        Step::new("mysql", "ghe-backup-mysql"),
        Step::new("redis", "ghe-backup-redis").stdout_to("redis.rdb"),
        Step::new("audit-log", "ghe-backup-audit-log"),
        Step::new("repositories", "ghe-backup-repositories"),
    ];
    if !ctx.skip_pages {
        steps.push(Step::new("pages", "ghe-backup-pages"));
    }
    steps.push(Step::new("storage", "ghe-backup-storage"));
    steps.push(Step::new("git-hooks", "ghe-backup-git-hooks"));
    if ctx.strategy == "rsync" {
        steps.push(Step::new("elasticsearch", "ghe-backup-es-rsync"));
    }
    if ctx.run_fsck {
        steps.push(Step::new("fsck", "ghe-backup-fsck").arg(ctx.snapshot_dir));
    }
    steps
}
