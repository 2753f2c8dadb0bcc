//! Resolution of the executable search root and the cluster data root.
//!
//! Kept as an explicit object rather than ambient environment access so
//! tests can inject their own roots through [`crate::ClusterOptions`].

use std::env;
use std::path::{Path, PathBuf};

use crate::error::ClusterError;
use crate::topology::ClusterOptions;

/// Environment variable overriding the deduced binary search root.
pub const BIN_ROOT_ENV: &str = "CORRAL_BIN_ROOT";

/// Resolved filesystem roots for one cluster.
#[derive(Debug, Clone)]
pub struct HarnessPaths {
    bin_root: PathBuf,
    data_root: PathBuf,
}

impl HarnessPaths {
    /// Resolves both roots from the options, falling back to the
    /// environment.
    ///
    /// The binary root falls back to [`BIN_ROOT_ENV`] and then to the
    /// directory of the running executable; the data root falls back to a
    /// fixed subdirectory of the system temp directory.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` when no binary root can be deduced.
    pub fn resolve(opts: &ClusterOptions) -> Result<Self, ClusterError> {
        let bin_root = match &opts.bin_root {
            Some(root) => root.clone(),
            None => deduce_bin_root()?,
        };
        let data_root = opts
            .data_root
            .clone()
            .unwrap_or_else(|| env::temp_dir().join("corral-minicluster"));
        Ok(Self {
            bin_root,
            data_root,
        })
    }

    /// Directory searched for server binaries.
    #[must_use]
    pub fn bin_root(&self) -> &Path {
        self.bin_root.as_path()
    }

    /// Directory receiving per-node data subdirectories.
    #[must_use]
    pub fn data_root(&self) -> &Path {
        self.data_root.as_path()
    }

    /// Full path of a server binary under the binary root.
    #[must_use]
    pub fn binary_path(&self, name: &str) -> PathBuf {
        self.bin_root.join(name)
    }

    /// Data directory for the node with the given deterministic id, e.g.
    /// `coordinator-0` or `worker-3`.
    #[must_use]
    pub fn data_path(&self, node_id: &str) -> PathBuf {
        self.data_root.join(node_id)
    }
}

fn deduce_bin_root() -> Result<PathBuf, ClusterError> {
    if let Some(root) = env::var_os(BIN_ROOT_ENV) {
        return Ok(PathBuf::from(root));
    }
    let exe = env::current_exe().map_err(|source| ClusterError::Configuration {
        message: format!("cannot locate the running executable: {source}"),
    })?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| ClusterError::Configuration {
            message: format!("executable path '{}' has no parent", exe.display()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_roots_win_over_deduction() {
        let opts = ClusterOptions {
            bin_root: Some(PathBuf::from("/opt/corral/bin")),
            data_root: Some(PathBuf::from("/var/tmp/cluster")),
            ..ClusterOptions::default()
        };
        let paths = HarnessPaths::resolve(&opts).expect("resolve");
        assert_eq!(paths.bin_root(), Path::new("/opt/corral/bin"));
        assert_eq!(paths.data_root(), Path::new("/var/tmp/cluster"));
    }

    #[test]
    fn unset_roots_are_deduced() {
        let paths = HarnessPaths::resolve(&ClusterOptions::default()).expect("resolve");
        // The test binary itself lives somewhere; its directory is the root.
        assert!(paths.bin_root().is_dir());
        assert!(paths.data_root().ends_with("corral-minicluster"));
    }

    #[test]
    fn node_paths_are_deterministic() {
        let opts = ClusterOptions {
            bin_root: Some(PathBuf::from("/bin")),
            data_root: Some(PathBuf::from("/data")),
            ..ClusterOptions::default()
        };
        let paths = HarnessPaths::resolve(&opts).expect("resolve");
        assert_eq!(
            paths.binary_path("corral-coordinatord"),
            Path::new("/bin/corral-coordinatord")
        );
        assert_eq!(paths.data_path("worker-3"), Path::new("/data/worker-3"));
    }
}
