//! Shared harness for the integration tests: a full stack over a scratch
//! database and scratch pool filesystems.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use diskcat::builtin::dpm::LocalDpm;
use diskcat::builtin::store::FsStatus;
use diskcat::{PluginManager, SecurityCredentials, StackInstance};

pub struct Harness {
    pub dir: TempDir,
    pub manager: Arc<PluginManager>,
    db_name: String,
}

/// The bundled plug-ins in their usual order.
pub const STANDARD_PLUGINS: &[&str] = &[
    "builtin_ns",
    "mdcache",
    "builtin_catalog",
    "builtin_pools",
    "builtin_io",
];

impl Harness {
    /// A harness loading `plugins` in order (order defines decoration).
    /// `extra` lines are appended to the configuration verbatim.
    pub fn with_plugins(plugins: &[&str], extra: &[&str]) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().expect("scratch dir");
        let db_name = dir
            .path()
            .join("ns.db")
            .to_string_lossy()
            .into_owned();

        let mut config = String::new();
        for plugin in plugins {
            writeln!(config, "LoadPlugin {plugin} lib/plugin.so").unwrap();
        }
        writeln!(config, "NsDatabase {db_name}").unwrap();
        writeln!(config, "DpmDatabase {db_name}").unwrap();
        writeln!(config, "TokenPassword test-secret").unwrap();
        writeln!(config, "TokenId ip").unwrap();
        writeln!(config, "TokenLife 600").unwrap();
        writeln!(config, "SymLinkLimit 3").unwrap();
        for line in extra {
            writeln!(config, "{line}").unwrap();
        }

        let config_path = dir.path().join("diskcat.conf");
        std::fs::write(&config_path, config).expect("write configuration");

        let mut manager = PluginManager::new();
        manager
            .load_configuration(&config_path)
            .expect("load configuration");
        Harness {
            dir,
            manager: Arc::new(manager),
            db_name,
        }
    }

    /// A harness with the standard plug-in stack and extra configuration.
    pub fn with_config(extra: &[&str]) -> Harness {
        Harness::with_plugins(STANDARD_PLUGINS, extra)
    }

    pub fn new() -> Harness {
        Harness::with_config(&[])
    }

    /// A stack authenticated as `client` from localhost.
    pub fn stack_as(&self, client: &str, fqans: &[&str]) -> StackInstance {
        let mut stack = StackInstance::new(Arc::clone(&self.manager));
        let mut credentials = SecurityCredentials::for_client(client);
        credentials.remote_address = "127.0.0.1".to_string();
        credentials.fqans = fqans.iter().map(|f| f.to_string()).collect();
        stack
            .set_security_credentials(&credentials)
            .expect("credentials resolve");
        stack
    }

    /// A root stack.
    pub fn root_stack(&self) -> StackInstance {
        self.stack_as("root", &[])
    }

    /// The in-process disk-pool daemon behind the stack.
    pub fn dpm(&self) -> Arc<LocalDpm> {
        LocalDpm::connect(&self.db_name).expect("daemon")
    }

    /// Create a pool with one enabled filesystem; returns the fs root.
    pub fn add_pool(&self, pool: &str, server: &str) -> PathBuf {
        let root = self.dir.path().join(format!("{pool}-fs1"));
        let dpm = self.dpm();
        dpm.add_pool(pool, "fs").expect("pool");
        dpm.add_filesystem(pool, server, &root, FsStatus::Enabled, 1)
            .expect("filesystem");
        root
    }
}
