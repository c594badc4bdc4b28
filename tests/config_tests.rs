//! Profile loading and validation tests.

use armada::config::{ConfigError, ScalewayConfig};
use armada::test_support::EnvGuard;
use chrono::TimeDelta;
use rstest::*;

#[fixture]
fn valid_config() -> ScalewayConfig {
    ScalewayConfig {
        access_key: Some(String::from("SCWACCESSKEYEXAMPLE")),
        secret_key: String::from("SCWSECRETKEYEXAMPLE"),
        default_organization_id: None,
        default_project_id: String::from("11111111-2222-3333-4444-555555555555"),
        default_zone: String::from("fr-par-1"),
        default_instance_type: String::from("DEV1-S"),
        default_architecture: String::from("x86_64"),
        cache_ttl_hours: 24,
    }
}

#[rstest]
fn valid_profile_passes_validation(valid_config: ScalewayConfig) {
    assert_eq!(valid_config.validate(), Ok(()));
}

#[rstest]
#[case::secret(|cfg: &mut ScalewayConfig| cfg.secret_key.clear(), "SCW_SECRET_KEY", "secret_key")]
#[case::project(
    |cfg: &mut ScalewayConfig| cfg.default_project_id = String::from("  "),
    "SCW_DEFAULT_PROJECT_ID",
    "default_project_id"
)]
#[case::zone(|cfg: &mut ScalewayConfig| cfg.default_zone.clear(), "SCW_DEFAULT_ZONE", "default_zone")]
#[case::instance_type(
    |cfg: &mut ScalewayConfig| cfg.default_instance_type.clear(),
    "SCW_DEFAULT_INSTANCE_TYPE",
    "default_instance_type"
)]
#[case::architecture(
    |cfg: &mut ScalewayConfig| cfg.default_architecture.clear(),
    "SCW_DEFAULT_ARCHITECTURE",
    "default_architecture"
)]
fn validation_errors_are_actionable(
    valid_config: ScalewayConfig,
    #[case] mutate: fn(&mut ScalewayConfig),
    #[case] env_var: &str,
    #[case] toml_key: &str,
) {
    let mut cfg = valid_config;
    mutate(&mut cfg);

    let error = cfg.validate().expect_err("validation should fail");
    let ConfigError::MissingField(ref message) = error else {
        panic!("expected MissingField error, got {error:?}");
    };
    assert!(message.contains(env_var), "should mention {env_var}: {message}");
    assert!(message.contains(toml_key), "should mention {toml_key}: {message}");
    assert!(
        message.contains("armada.toml"),
        "should mention the config file: {message}"
    );
}

#[rstest]
fn cache_ttl_is_expressed_in_hours(valid_config: ScalewayConfig) {
    assert_eq!(valid_config.cache_ttl(), Ok(TimeDelta::hours(24)));
}

#[tokio::test]
async fn environment_supplies_the_profile_and_defaults_fill_the_rest() {
    let _guard = EnvGuard::set_vars(&[
        ("SCW_SECRET_KEY", Some("secret-from-env")),
        ("SCW_DEFAULT_PROJECT_ID", Some("project-from-env")),
        ("SCW_DEFAULT_ZONE", None),
        ("SCW_DEFAULT_INSTANCE_TYPE", None),
        ("SCW_CACHE_TTL_HOURS", None),
    ])
    .await;

    let cfg = ScalewayConfig::load_without_cli_args().expect("profile should load");

    assert_eq!(cfg.secret_key, "secret-from-env");
    assert_eq!(cfg.default_project_id, "project-from-env");
    assert_eq!(cfg.default_zone, "fr-par-1");
    assert_eq!(cfg.default_instance_type, "DEV1-S");
    assert_eq!(cfg.cache_ttl_hours, 24);
}

#[tokio::test]
async fn environment_overrides_defaults() {
    let _guard = EnvGuard::set_vars(&[
        ("SCW_SECRET_KEY", Some("secret")),
        ("SCW_DEFAULT_PROJECT_ID", Some("project")),
        ("SCW_DEFAULT_ZONE", Some("nl-ams-2")),
        ("SCW_CACHE_TTL_HOURS", Some("6")),
    ])
    .await;

    let cfg = ScalewayConfig::load_validated().expect("profile should load");

    assert_eq!(cfg.default_zone, "nl-ams-2");
    assert_eq!(cfg.cache_ttl_hours, 6);
}
