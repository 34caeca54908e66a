//! `ghe-fix-paths`: reduce repository listing lines to their parent
//! directories, as appropriate for the negotiated remote version.

use anyhow::{Context, Result};
use backup_snapshot::remote::NegotiatedRemote;
use std::collections::HashMap;
use std::io::{self, BufWriter};

fn main() -> Result<()> {
    let env: HashMap<String, String> = std::env::vars().collect();
    let remote = NegotiatedRemote::from_env(&env)
        .context("GHE_REMOTE_VERSION and GHE_HOSTNAME must be set; run this through ghe-backup")?
        .context("GHE_REMOTE_VERSION is not a valid version")?;

    let stdin = io::stdin().lock();
    let stdout = BufWriter::new(io::stdout().lock());
    remote
        .path_fixup
        .filter(stdin, stdout)
        .context("failed to filter paths")?;
    Ok(())
}
