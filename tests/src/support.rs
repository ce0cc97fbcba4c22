use anyhow::Result;
use sandbox::{SandboxConfig, SandboxGateway};
use tempfile::{tempdir, TempDir};

pub fn temp_workspace() -> Result<TempDir> {
    Ok(tempdir()?)
}

/// Gateway over `<workspace>/files`, created on demand.
pub fn gateway_in(workspace: &TempDir, max_file_size: u64) -> Result<SandboxGateway> {
    let config = SandboxConfig::new(workspace.path().join("files"), max_file_size)?;
    Ok(SandboxGateway::new(config)?)
}
