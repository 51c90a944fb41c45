//! A script used to generate the CRDs used by this project.
//!
//! Any time a CRD spec changes, this script can be run to ensure that the CRDs are up-to-date and
//! ready to be synced with the cluster. The output directory defaults to `config/crd` and may be
//! overridden with the first argument.

use anyhow::{Context, Result};
use kube::CustomResourceExt;
use saas_core::crd::{Sentinel, ShardedRedisBackup};

fn main() -> Result<()> {
    let crds_path = std::env::args().nth(1).unwrap_or_else(|| "config/crd".into());
    let crds_path = std::path::PathBuf::from(crds_path);
    std::fs::create_dir_all(&crds_path).with_context(|| format!("error creating {:?}", &crds_path))?;

    let sentinel = Sentinel::crd();
    let sentinel_yaml = serde_yaml::to_string(&sentinel).context("error serializing Sentinel CRD to yaml")?;
    std::fs::write(crds_path.join("sentinel.yaml"), &sentinel_yaml).with_context(|| format!("error writing Sentinel CRD to {:?}", &crds_path))?;
    println!("Sentinel CRD written to {:?}", &crds_path);

    let backup = ShardedRedisBackup::crd();
    let backup_yaml = serde_yaml::to_string(&backup).context("error serializing ShardedRedisBackup CRD to yaml")?;
    std::fs::write(crds_path.join("shardedredisbackup.yaml"), &backup_yaml)
        .with_context(|| format!("error writing ShardedRedisBackup CRD to {:?}", &crds_path))?;
    println!("ShardedRedisBackup CRD written to {:?}", &crds_path);

    Ok(())
}
