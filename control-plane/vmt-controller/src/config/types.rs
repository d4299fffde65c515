use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct ControllerConfig {
    #[envconfig(from = "VMT_PROFILE", default = "dev")]
    pub profile: String,

    #[envconfig(from = "HTTP_PORT", default = "8088")]
    pub http_port: u16,

    /// Namespace holding management resources (leases, built-in templates).
    #[envconfig(from = "VMT_NAMESPACE", default = "default")]
    pub namespace: String,

    /// Number of reconcile workers draining the work queue.
    #[envconfig(from = "VMT_THREADINESS", default = "10")]
    pub threadiness: usize,

    /// Full relist interval; every known object is re-enqueued.
    #[envconfig(from = "VMT_RESYNC_SECS", default = "60")]
    pub resync_secs: u64,

    #[envconfig(nested)]
    pub features: FeaturesConfig,

    #[envconfig(nested)]
    pub leader: LeaderConfig,

    #[envconfig(nested)]
    pub backoff: BackoffConfig,
}

#[derive(Envconfig, Clone, Debug, Default)]
pub struct FeaturesConfig {
    /// If Some, env explicitly set; otherwise, profile defaults apply
    #[envconfig(from = "VMT_FEATURES_LEADER_ELECTION")]
    pub leader_election: Option<bool>,
    #[envconfig(from = "VMT_FEATURES_SEED_DEFAULTS")]
    pub seed_defaults: Option<bool>,
}

#[derive(Envconfig, Clone, Debug)]
pub struct LeaderConfig {
    #[envconfig(from = "VMT_LEASE_NAME", default = "vmt-controllers")]
    pub lease_name: String,
    /// Holder identity; the pod name when running in-cluster.
    #[envconfig(from = "POD_NAME")]
    pub identity: Option<String>,
}

#[derive(Envconfig, Clone, Debug)]
pub struct BackoffConfig {
    /// First requeue delay after a failed reconcile.
    /// Env: VMT_BACKOFF_BASE_MS
    #[envconfig(from = "VMT_BACKOFF_BASE_MS", default = "100")]
    pub base_ms: u64,
    #[envconfig(from = "VMT_BACKOFF_MAX_SECS", default = "30")]
    pub max_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 100,
            max_secs: 30,
        }
    }
}

impl BackoffConfig {
    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms.max(1))
    }

    pub fn max(&self) -> Duration {
        Duration::from_secs(self.max_secs).max(self.base())
    }
}

impl ControllerConfig {
    /// Apply profile → defaults mapping, while respecting explicit env overrides.
    ///
    /// - dev: leader_election=false, seed_defaults=false
    /// - edge: leader_election=true, seed_defaults=true
    /// - full: leader_election=true, seed_defaults=true
    pub fn apply_profile_defaults(mut self) -> Self {
        let (def_le, def_seed) = match self.profile.as_str() {
            "edge" => (true, true),
            "full" | "prod" | "production" => (true, true),
            _ /* dev */ => (false, false),
        };
        if self.features.leader_election.is_none() {
            self.features.leader_election = Some(def_le);
        }
        if self.features.seed_defaults.is_none() {
            self.features.seed_defaults = Some(def_seed);
        }
        if self.threadiness == 0 {
            self.threadiness = 1;
        }
        self
    }

    pub fn leader_election(&self) -> bool {
        self.features.leader_election.unwrap_or(false)
    }

    pub fn seed_defaults(&self) -> bool {
        self.features.seed_defaults.unwrap_or(false)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_secs.max(1))
    }

    /// Config for in-process use (tests, embedding) without reading env.
    pub fn for_profile(profile: &str) -> Self {
        Self {
            profile: profile.to_string(),
            http_port: 8088,
            namespace: "default".into(),
            threadiness: 10,
            resync_secs: 60,
            features: FeaturesConfig::default(),
            leader: LeaderConfig {
                lease_name: "vmt-controllers".into(),
                identity: None,
            },
            backoff: BackoffConfig::default(),
        }
        .apply_profile_defaults()
    }
}
