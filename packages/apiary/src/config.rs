//! Scheduler configuration and deployment context.
//!
//! Configuration enters the core as one explicit value at construction
//! time; there are no lazy globals. Loading (files, env, flags) belongs to
//! the embedding service.

use std::time::Duration;

use typed_builder::TypedBuilder;

/// Maximum number of shards a single request may fan out to.
pub const MAXIMUM_SHARDS: u8 = 255;

/// Where the scheduler is deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    /// Deliberately starved deployment: few shards, short backoff, so
    /// contention bugs surface before production does.
    Canary,
    LocalDev,
}

impl Environment {
    pub fn is_canary(self) -> bool {
        self == Environment::Canary
    }

    pub fn is_local_dev(self) -> bool {
        self == Environment::LocalDev
    }

    /// Nibble width of the root-entity shard space. 16^2 roots on canary
    /// force transaction conflicts; 16^5 spreads production write load.
    pub fn default_sharding_level(self) -> u8 {
        if self.is_canary() {
            2
        } else {
            5
        }
    }
}

/// Tunables honored by the scheduler core.
#[derive(Debug, Clone, TypedBuilder)]
pub struct SchedulerConfig {
    #[builder(default = Environment::Production)]
    pub environment: Environment,

    /// Version string recorded on every run-result mutation.
    #[builder(default = String::from("dev"), setter(into))]
    pub server_version: String,

    /// How far back a prior successful run may be reused for an idempotent
    /// task. One week by default.
    #[builder(default = 7 * 24 * 60 * 60)]
    pub reusable_task_age_secs: i64,

    /// A Running attempt whose last update is older than this is treated as
    /// a dead bot.
    #[builder(default = 600)]
    pub bot_ping_tolerance_secs: i64,

    /// Nibble width of the shard space; defaults to the environment's value
    /// through [`SchedulerConfig::for_environment`].
    #[builder(default = Environment::Production.default_sharding_level())]
    pub sharding_level: u8,

    /// How long a claimed key stays in the negative lookup cache.
    #[builder(default = Duration::from_secs(15))]
    pub lookup_cache_ttl: Duration,

    /// Page size for dispatch and expiration scans.
    #[builder(default = 50)]
    pub dispatch_page_size: usize,
}

impl SchedulerConfig {
    /// Configuration with every tunable at the environment's default.
    pub fn for_environment(environment: Environment) -> Self {
        SchedulerConfig::builder()
            .environment(environment)
            .sharding_level(environment.default_sharding_level())
            .build()
    }

    /// Upper bound for the bot poll backoff, in seconds. Canary polls more
    /// often on purpose.
    pub fn max_backoff_wait(&self) -> f64 {
        if self.environment.is_canary() {
            3.0
        } else {
            60.0
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig::for_environment(Environment::Production)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sharding_level_follows_environment() {
        assert_eq!(
            SchedulerConfig::for_environment(Environment::Canary).sharding_level,
            2
        );
        assert_eq!(
            SchedulerConfig::for_environment(Environment::Production).sharding_level,
            5
        );
    }

    #[test]
    fn canary_caps_backoff_low() {
        assert_eq!(
            SchedulerConfig::for_environment(Environment::Canary).max_backoff_wait(),
            3.0
        );
        assert_eq!(SchedulerConfig::default().max_backoff_wait(), 60.0);
    }
}
