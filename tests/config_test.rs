use std::env;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

const ENV_VARS: &[&str] = &[
    "POOLGUARD_LISTEN",
    "POOLGUARD_POOL_MIN",
    "POOLGUARD_POOL_MAX",
    "POOLGUARD_ACQUIRE_TIMEOUT_MS",
    "POOLGUARD_MAX_IDLE_MS",
    "POOLGUARD_MAX_LIFETIME_MS",
    "POOLGUARD_BREAKER_UTILIZATION",
    "POOLGUARD_BREAKER_WAITING",
    "POOLGUARD_BREAKER_COOLDOWN_MS",
    "POOLGUARD_CACHE_TTL_MS",
    "POOLGUARD_RATE_CAPACITY",
    "POOLGUARD_RATE_REFILL",
];

/// Test loading configuration from YAML file
#[test]
fn test_load_yaml_config() {
    let yaml = r#"
server:
  listen: "127.0.0.1:9000"

pool:
  role: settlement
  min_size: 1
  max_size: 8
  acquire_timeout_ms: 750
  max_idle_ms: 60000
  max_lifetime_ms: 900000
  health_check_after_ms: 10000
  reclaim_after_ms: 120000

breaker:
  open_utilization_threshold: 0.75
  open_waiting_threshold: 3
  cooldown_ms: 2000
  critical_write_timeout_ms: 250

cache:
  ttl_ms: 5000
  stale_while_revalidate_ms: 60000
  defaults:
    profile:
      currency: EUR

rate_limits:
  default:
    capacity: 50
    refill_per_sec: 25
  classes:
    odds:
      capacity: 500
      refill_per_sec: 250
"#;

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("poolguard.yaml");
    fs::write(&config_path, yaml).unwrap();

    let config = poolguard::config::load_config(Some(config_path.to_str().unwrap())).unwrap();

    assert_eq!(config.server.listen, "127.0.0.1:9000");

    let pool = config.pool.to_pool_config();
    assert_eq!(pool.role, "settlement");
    assert_eq!(pool.min_size, 1);
    assert_eq!(pool.max_size, 8);
    assert_eq!(pool.acquire_timeout, Duration::from_millis(750));
    assert_eq!(pool.max_idle_duration, Duration::from_secs(60));
    assert_eq!(pool.max_lifetime, Duration::from_secs(900));
    assert_eq!(pool.health_check_after, Duration::from_secs(10));
    assert_eq!(pool.reclaim_after, Some(Duration::from_secs(120)));

    let breaker = config.breaker.to_breaker_config();
    assert_eq!(breaker.open_utilization_threshold, 0.75);
    assert_eq!(breaker.open_waiting_threshold, 3);
    assert_eq!(breaker.cooldown_duration, Duration::from_secs(2));
    assert_eq!(breaker.critical_write_timeout, Duration::from_millis(250));

    let cache = config.cache.to_cache_config();
    assert_eq!(cache.ttl, Duration::from_secs(5));
    assert_eq!(cache.defaults["profile"]["currency"], "EUR");

    let limits = config.rate_limits.to_limiter_config();
    assert_eq!(limits.for_class("odds").capacity, 500.0);
    assert_eq!(limits.for_class("bets").capacity, 50.0);
}

/// Invalid bounds are fatal at load time
#[test]
fn test_invalid_yaml_config_is_rejected() {
    let temp_dir = TempDir::new().unwrap();

    let bad_bounds = temp_dir.path().join("bounds.yaml");
    fs::write(&bad_bounds, "pool:\n  min_size: 10\n  max_size: 5\n").unwrap();
    assert!(poolguard::config::load_config(Some(bad_bounds.to_str().unwrap())).is_err());

    let bad_type = temp_dir.path().join("type.yaml");
    fs::write(&bad_type, "pool:\n  max_size: lots\n").unwrap();
    assert!(poolguard::config::load_config(Some(bad_type.to_str().unwrap())).is_err());

    let missing = temp_dir.path().join("missing.yaml");
    assert!(poolguard::config::load_config(Some(missing.to_str().unwrap())).is_err());
}

/// Environment variables override defaults; unparsable values are errors.
///
/// One test so the process environment is not mutated concurrently.
#[test]
fn test_load_env_config() {
    let originals: Vec<(&str, Option<String>)> =
        ENV_VARS.iter().map(|name| (*name, env::var(name).ok())).collect();
    for name in ENV_VARS {
        env::remove_var(name);
    }

    env::set_var("POOLGUARD_LISTEN", "127.0.0.1:7000");
    env::set_var("POOLGUARD_POOL_MIN", "3");
    env::set_var("POOLGUARD_POOL_MAX", "30");
    env::set_var("POOLGUARD_ACQUIRE_TIMEOUT_MS", "1500");
    env::set_var("POOLGUARD_MAX_LIFETIME_MS", "60000");
    env::set_var("POOLGUARD_BREAKER_UTILIZATION", "0.9");
    env::set_var("POOLGUARD_BREAKER_COOLDOWN_MS", "3000");
    env::set_var("POOLGUARD_CACHE_TTL_MS", "10000");
    env::set_var("POOLGUARD_RATE_CAPACITY", "100");
    env::set_var("POOLGUARD_RATE_REFILL", "2");

    let config = poolguard::config::load_config(None).unwrap();
    assert_eq!(config.server.listen, "127.0.0.1:7000");
    assert_eq!(config.pool.min_size, 3);
    assert_eq!(config.pool.max_size, 30);
    assert_eq!(config.pool.acquire_timeout_ms, 1500);
    assert_eq!(config.pool.max_lifetime_ms, 60000);
    // Unset variables keep their defaults
    assert_eq!(config.pool.max_idle_ms, 300_000);
    assert_eq!(config.breaker.open_utilization_threshold, 0.9);
    assert_eq!(config.breaker.open_waiting_threshold, 5);
    assert_eq!(config.breaker.cooldown_ms, 3000);
    assert_eq!(config.cache.ttl_ms, 10000);
    assert_eq!(config.rate_limits.default.capacity, 100.0);
    assert_eq!(config.rate_limits.default.refill_per_sec, 2.0);

    env::set_var("POOLGUARD_POOL_MAX", "twenty");
    assert!(poolguard::config::load_from_env().is_err());

    env::set_var("POOLGUARD_POOL_MAX", "2");
    assert!(poolguard::config::load_config(None).is_err());

    for (name, value) in originals {
        cleanup_env(name, value);
    }
}

/// Test default values
#[test]
fn test_default_values() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("empty.yaml");
    fs::write(&config_path, "{}\n").unwrap();

    let config = poolguard::config::load_from_yaml(&config_path).unwrap();

    assert_eq!(config.server.listen, "0.0.0.0:8080");
    assert_eq!(config.pool.role, "primary");
    assert_eq!(config.pool.min_size, 2);
    assert_eq!(config.pool.max_size, 20);
    assert_eq!(config.breaker.open_utilization_threshold, 0.85);
    assert_eq!(config.breaker.cooldown_ms, 10_000);
    assert_eq!(config.cache.ttl_ms, 30_000);
    assert!(config.validate().is_ok());
}

fn cleanup_env(key: &str, original: Option<String>) {
    match original {
        Some(val) => env::set_var(key, val),
        None => env::remove_var(key),
    }
}
