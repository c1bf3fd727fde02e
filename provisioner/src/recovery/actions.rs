//! Recovery actions and the remote routines behind them

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Every recovery the engine knows how to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    KillConflictingProcesses,
    ReleasePackageLocks,
    RepairBrokenPackages,
    FreeDiskSpace,
    RestartDatabase,
    ResetNginxConfig,
    ReinstallDependencies,
    RestartDocker,
    FixPermissions,
    RestoreNetwork,
    AddSwap,
    RestartBackend,
}

impl RecoveryAction {
    pub const ALL: [RecoveryAction; 12] = [
        RecoveryAction::KillConflictingProcesses,
        RecoveryAction::ReleasePackageLocks,
        RecoveryAction::RepairBrokenPackages,
        RecoveryAction::FreeDiskSpace,
        RecoveryAction::RestartDatabase,
        RecoveryAction::ResetNginxConfig,
        RecoveryAction::ReinstallDependencies,
        RecoveryAction::RestartDocker,
        RecoveryAction::FixPermissions,
        RecoveryAction::RestoreNetwork,
        RecoveryAction::AddSwap,
        RecoveryAction::RestartBackend,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::KillConflictingProcesses => "kill_conflicting_processes",
            RecoveryAction::ReleasePackageLocks => "release_package_locks",
            RecoveryAction::RepairBrokenPackages => "repair_broken_packages",
            RecoveryAction::FreeDiskSpace => "free_disk_space",
            RecoveryAction::RestartDatabase => "restart_database",
            RecoveryAction::ResetNginxConfig => "reset_nginx_config",
            RecoveryAction::ReinstallDependencies => "reinstall_dependencies",
            RecoveryAction::RestartDocker => "restart_docker",
            RecoveryAction::FixPermissions => "fix_permissions",
            RecoveryAction::RestoreNetwork => "restore_network",
            RecoveryAction::AddSwap => "add_swap",
            RecoveryAction::RestartBackend => "restart_backend",
        }
    }
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fixed command sequence plus the check that decides its outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryRoutine {
    pub commands: Vec<String>,

    /// Exit status 0 means the routine succeeded
    pub verify: String,
}

impl RecoveryRoutine {
    fn new(commands: &[&str], verify: &str) -> Self {
        Self {
            commands: commands.iter().map(|c| c.to_string()).collect(),
            verify: verify.to_string(),
        }
    }
}

/// Routine for one action
pub fn routine_for(action: RecoveryAction) -> RecoveryRoutine {
    match action {
        RecoveryAction::KillConflictingProcesses => RecoveryRoutine::new(
            &[
                "systemctl stop apache2 2>/dev/null || true",
                "systemctl disable apache2 2>/dev/null || true",
                "fuser -k 80/tcp 2>/dev/null || true",
                "fuser -k 443/tcp 2>/dev/null || true",
                "sleep 2",
            ],
            "! ss -ltnH '( sport = :80 or sport = :443 )' | grep -q .",
        ),
        RecoveryAction::ReleasePackageLocks => RecoveryRoutine::new(
            &[
                "systemctl stop unattended-upgrades 2>/dev/null || true",
                "pkill -9 -f 'apt|dpkg' 2>/dev/null || true",
                "rm -f /var/lib/dpkg/lock /var/lib/dpkg/lock-frontend /var/cache/apt/archives/lock /var/lib/apt/lists/lock",
                "dpkg --configure -a",
            ],
            "! fuser /var/lib/dpkg/lock-frontend 2>/dev/null",
        ),
        RecoveryAction::RepairBrokenPackages => RecoveryRoutine::new(
            &[
                "dpkg --configure -a",
                "DEBIAN_FRONTEND=noninteractive apt-get -f install -y",
                "apt-get clean",
            ],
            "apt-get check",
        ),
        RecoveryAction::FreeDiskSpace => RecoveryRoutine::new(
            &[
                "apt-get clean",
                "journalctl --vacuum-size=100M",
                "docker system prune -af 2>/dev/null || true",
                "rm -rf /tmp/* /var/tmp/* 2>/dev/null || true",
            ],
            "test $(df --output=avail / | tail -1) -gt 1048576",
        ),
        RecoveryAction::RestartDatabase => RecoveryRoutine::new(
            &[
                "systemctl restart postgresql",
                "sleep 3",
            ],
            "pg_isready -q",
        ),
        RecoveryAction::ResetNginxConfig => RecoveryRoutine::new(
            &[
                "rm -f /etc/nginx/sites-enabled/default",
                "find /etc/nginx/sites-enabled -xtype l -delete",
                "nginx -t && systemctl reload-or-restart nginx",
            ],
            "nginx -t && systemctl is-active --quiet nginx",
        ),
        RecoveryAction::ReinstallDependencies => RecoveryRoutine::new(
            &[
                "cd /opt/app && rm -rf node_modules package-lock.json.bak",
                "cd /opt/app && npm cache clean --force",
                "cd /opt/app && npm ci --no-audit --no-fund",
            ],
            "test -d /opt/app/node_modules",
        ),
        RecoveryAction::RestartDocker => RecoveryRoutine::new(
            &[
                "systemctl restart containerd 2>/dev/null || true",
                "systemctl restart docker",
                "sleep 3",
            ],
            "docker info >/dev/null",
        ),
        RecoveryAction::FixPermissions => RecoveryRoutine::new(
            &[
                "chown -R app:app /opt/app 2>/dev/null || true",
                "chmod -R u+rwX /opt/app",
            ],
            "test -w /opt/app",
        ),
        RecoveryAction::RestoreNetwork => RecoveryRoutine::new(
            &[
                "systemctl restart systemd-resolved 2>/dev/null || true",
                "sleep 2",
            ],
            "getent hosts deb.debian.org >/dev/null || getent hosts archive.ubuntu.com >/dev/null",
        ),
        RecoveryAction::AddSwap => RecoveryRoutine::new(
            &[
                "test -f /swapfile || fallocate -l 2G /swapfile",
                "chmod 600 /swapfile",
                "mkswap /swapfile 2>/dev/null || true",
                "swapon /swapfile 2>/dev/null || true",
                "grep -q '^/swapfile' /etc/fstab || echo '/swapfile none swap sw 0 0' >> /etc/fstab",
            ],
            "swapon --show | grep -q .",
        ),
        RecoveryAction::RestartBackend => RecoveryRoutine::new(
            &[
                "systemctl daemon-reload",
                "systemctl restart app-backend",
                "sleep 3",
            ],
            "systemctl is-active --quiet app-backend",
        ),
    }
}

/// The lookup table used by the dispatcher, built once at startup
pub fn default_routines() -> HashMap<RecoveryAction, RecoveryRoutine> {
    RecoveryAction::ALL
        .iter()
        .map(|action| (*action, routine_for(*action)))
        .collect()
}

/// Ordered recovery actions to try when a given step fails
#[derive(Debug, Clone, Default)]
pub struct StepRecoveryMap {
    entries: HashMap<String, Vec<RecoveryAction>>,
}

impl StepRecoveryMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, step: &str, actions: &[RecoveryAction]) -> Self {
        self.entries.insert(step.to_string(), actions.to_vec());
        self
    }

    pub fn actions_for(&self, step: &str) -> &[RecoveryAction] {
        self.entries.get(step).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Recovery chains for the standard provisioning steps
pub fn default_step_recovery() -> StepRecoveryMap {
    use RecoveryAction::*;

    StepRecoveryMap::new()
        .with("update_system", &[ReleasePackageLocks, RepairBrokenPackages, RestoreNetwork])
        .with("install_packages", &[ReleasePackageLocks, RepairBrokenPackages, FreeDiskSpace])
        .with("install_docker", &[ReleasePackageLocks, RestartDocker])
        .with("setup_database", &[RestartDatabase])
        .with("configure_backend", &[RestartDatabase, ReinstallDependencies, RestartBackend])
        .with("build_frontend", &[AddSwap, ReinstallDependencies])
        .with("setup_nginx", &[ResetNginxConfig, KillConflictingProcesses])
        .with("setup_ssl", &[KillConflictingProcesses, ResetNginxConfig])
        .with("start_services", &[KillConflictingProcesses, RestartBackend])
}
