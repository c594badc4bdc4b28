//! Unit tests for the launch orchestrator.

use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rstest::{fixture, rstest};

use super::*;
use crate::test_support::{ProviderCall, ScriptedProvider, instance_record};

#[fixture]
fn provider() -> ScriptedProvider {
    let provider = ScriptedProvider::new();
    provider.push_instance(
        instance_record("fr-par-2/web-1", "web", InstanceState::Running, 100)
            .with_type("t1.micro")
            .with_zone("fr-par-2")
            .with_image("img-1")
            .with_key_name("deploy")
            .with_security_group("web-sg")
            .with_public_address("51.15.0.1"),
    );
    provider
}

fn orchestrator(provider: &ScriptedProvider) -> LaunchOrchestrator<ScriptedProvider> {
    LaunchOrchestrator::new(InstanceDirectory::new(Arc::new(provider.clone())))
}

fn only_spec(provider: &ScriptedProvider) -> CreateSpec {
    let specs = provider.create_specs();
    assert_eq!(specs.len(), 1, "expected exactly one creation call");
    specs.into_iter().next().unwrap_or_default()
}

fn with_image(image: &str) -> LaunchOptions {
    LaunchOptions {
        image: Some(image.to_owned()),
        defaults: Defaults::Disabled,
        ..LaunchOptions::default()
    }
}

#[rstest]
#[tokio::test]
async fn inherits_template_attributes_but_not_its_zone(provider: ScriptedProvider) {
    orchestrator(&provider)
        .launch("web", &LaunchOptions::default())
        .await
        .expect("launch should succeed");

    let spec = only_spec(&provider);
    assert_eq!(spec.instance_type.as_deref(), Some("t1.micro"));
    assert_eq!(spec.image_id, "img-1");
    assert_eq!(spec.key_name.as_deref(), Some("deploy"));
    assert_eq!(spec.security_groups, ["web-sg"]);
    assert_eq!(spec.zone, None);
    assert_eq!(spec.count, 1);
}

#[rstest]
#[case("api.v2")]
#[case("i-ngress")]
#[tokio::test]
async fn templates_are_found_by_name_whatever_its_shape(#[case] name: &str) {
    let provider = ScriptedProvider::new();
    provider.push_instance(
        instance_record("fr-par-1/tpl", name, InstanceState::Running, 100).with_image("img-api"),
    );

    orchestrator(&provider)
        .launch(name, &LaunchOptions::default())
        .await
        .expect("launch should succeed");

    assert_eq!(only_spec(&provider).image_id, "img-api");
}

#[rstest]
#[tokio::test]
async fn caller_options_take_precedence_over_the_template(provider: ScriptedProvider) {
    let options = LaunchOptions {
        instance_type: Some(String::from("DEV1-M")),
        zone: Some(String::from("fr-par-1")),
        ..LaunchOptions::default()
    };

    orchestrator(&provider)
        .launch("web", &options)
        .await
        .expect("launch should succeed");

    let spec = only_spec(&provider);
    assert_eq!(spec.instance_type.as_deref(), Some("DEV1-M"));
    assert_eq!(spec.zone.as_deref(), Some("fr-par-1"));
    assert_eq!(spec.image_id, "img-1");
}

#[rstest]
#[tokio::test]
async fn copies_the_template_boot_payload(provider: ScriptedProvider) {
    provider.set_boot_payload("fr-par-2/web-1", &payload::encode(b"#!/bin/bash\necho hi\n"));

    orchestrator(&provider)
        .launch("web", &LaunchOptions::default())
        .await
        .expect("launch should succeed");

    let spec = only_spec(&provider);
    assert_eq!(
        spec.boot_payload_base64,
        Some(payload::encode(b"#!/bin/bash\necho hi\n"))
    );
}

#[rstest]
#[tokio::test]
async fn supplied_boot_payload_skips_the_template_lookup(provider: ScriptedProvider) {
    let options = LaunchOptions {
        boot_payload: Some(b"echo mine".to_vec()),
        ..LaunchOptions::default()
    };

    orchestrator(&provider)
        .launch("web", &options)
        .await
        .expect("launch should succeed");

    assert_eq!(provider.count(ProviderCall::DescribeBootPayload), 0);
    assert_eq!(
        only_spec(&provider).boot_payload_base64,
        Some(payload::encode(b"echo mine"))
    );
}

#[rstest]
#[tokio::test]
async fn missing_image_fails_before_any_provider_call(provider: ScriptedProvider) {
    let options = LaunchOptions {
        defaults: Defaults::Disabled,
        load_balancer: Some(String::from("front")),
        ..LaunchOptions::default()
    };

    let err = orchestrator(&provider)
        .launch("web", &options)
        .await
        .expect_err("launch without image should fail");

    assert!(matches!(err, LaunchError::MissingImage), "got {err}");
    assert!(provider.calls().is_empty(), "calls: {:?}", provider.calls());
}

#[rstest]
#[tokio::test]
async fn template_without_image_still_requires_one(provider: ScriptedProvider) {
    let err = orchestrator(&provider)
        .launch("db", &LaunchOptions::default())
        .await
        .expect_err("no template matches `db`");

    assert!(matches!(err, LaunchError::MissingImage), "got {err}");
    assert_eq!(provider.count(ProviderCall::CreateInstances), 0);
}

#[rstest]
#[case("")]
#[case("   ")]
#[tokio::test]
async fn empty_name_is_rejected(provider: ScriptedProvider, #[case] name: &str) {
    let err = orchestrator(&provider)
        .launch(name, &with_image("img-1"))
        .await
        .expect_err("empty name should fail");

    assert!(matches!(err, LaunchError::MissingName), "got {err}");
    assert!(provider.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn zero_count_is_rejected(provider: ScriptedProvider) {
    let options = LaunchOptions {
        count: Some(0),
        ..with_image("img-1")
    };

    let err = orchestrator(&provider)
        .launch("web", &options)
        .await
        .expect_err("zero count should fail");

    assert!(matches!(err, LaunchError::InvalidCount), "got {err}");
}

#[rstest]
#[tokio::test]
async fn zone_comes_from_the_load_balancer(provider: ScriptedProvider) {
    provider.set_load_balancer_zones("front", &["fr-par-3"]);
    let options = LaunchOptions {
        load_balancer: Some(String::from("front")),
        ..with_image("img-1")
    };

    let launched = orchestrator(&provider)
        .launch("api", &options)
        .await
        .expect("launch should succeed");

    assert_eq!(only_spec(&provider).zone.as_deref(), Some("fr-par-3"));
    assert_eq!(
        provider.registrations(),
        [(String::from("front"), vec![launched.id.clone()])]
    );
}

#[rstest]
#[tokio::test]
async fn tags_every_created_instance_with_the_name(provider: ScriptedProvider) {
    let options = LaunchOptions {
        count: Some(2),
        ..with_image("img-1")
    };

    let launched = orchestrator(&provider)
        .launch("worker+blue", &options)
        .await
        .expect("launch should succeed");

    assert_eq!(
        provider.tags(),
        [(
            vec![String::from("new-1"), String::from("new-2")],
            vec![Tag::name("worker+blue")]
        )]
    );
    assert_eq!(launched.id, "new-1");
    assert_eq!(
        launched.name.map(|name| name.to_string()).as_deref(),
        Some("worker+blue")
    );
}

#[rstest]
#[tokio::test]
async fn resolves_image_labels_before_creating(provider: ScriptedProvider) {
    provider.set_image("ubuntu_noble", "img-42");

    orchestrator(&provider)
        .launch("api", &with_image("ubuntu_noble"))
        .await
        .expect("launch should succeed");

    assert_eq!(only_spec(&provider).image_id, "img-42");
}

#[rstest]
#[tokio::test]
async fn tag_failure_leaves_created_instances_in_place(provider: ScriptedProvider) {
    provider.fail(
        ProviderCall::TagResources,
        ProviderError::Api {
            message: String::from("tag quota"),
        },
    );

    let err = orchestrator(&provider)
        .launch("api", &with_image("img-1"))
        .await
        .expect_err("tagging failure should propagate");

    assert!(
        matches!(err, LaunchError::Tag { ref ids, .. } if ids == &[String::from("new-1")]),
        "got {err}"
    );
    assert!(provider.instances().iter().any(|inst| inst.id == "new-1"));
    assert!(provider.terminated().is_empty());
}

#[rstest]
#[tokio::test]
async fn create_failure_reports_instances_created_before_it(provider: ScriptedProvider) {
    provider.fail(
        ProviderCall::CreateInstances,
        ProviderError::partial_create(
            vec![String::from("fr-par-1/first")],
            ProviderError::Api {
                message: String::from("quota exceeded"),
            },
        ),
    );
    let options = LaunchOptions {
        count: Some(2),
        ..with_image("img-1")
    };

    let err = orchestrator(&provider)
        .launch("api", &options)
        .await
        .expect_err("creation failure should propagate");

    assert_eq!(
        err.to_string(),
        "failed to create instances: provider request failed: quota exceeded (left in place: fr-par-1/first)"
    );
    assert!(
        matches!(err, LaunchError::Create { ref created, .. } if created == &[String::from("fr-par-1/first")]),
        "got {err}"
    );
}

#[rstest]
#[tokio::test]
async fn registration_failure_is_fatal(provider: ScriptedProvider) {
    provider.set_load_balancer_zones("front", &["fr-par-1"]);
    provider.fail(
        ProviderCall::RegisterWithLoadBalancer,
        ProviderError::not_found("backend", "front"),
    );
    let options = LaunchOptions {
        load_balancer: Some(String::from("front")),
        ..with_image("img-1")
    };

    let err = orchestrator(&provider)
        .launch("api", &options)
        .await
        .expect_err("registration failure should propagate");

    assert!(matches!(err, LaunchError::Register { .. }), "got {err}");
    assert!(provider.terminated().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn wait_polls_every_two_seconds_until_running(provider: ScriptedProvider) {
    provider.script_launch_states(&[
        InstanceState::Pending,
        InstanceState::Pending,
        InstanceState::Running,
    ]);
    let options = LaunchOptions {
        wait: true,
        ..with_image("img-1")
    };
    let started = Instant::now();

    let launched = orchestrator(&provider)
        .launch("api", &options)
        .await
        .expect("launch should succeed");

    assert_eq!(launched.state, InstanceState::Running);
    assert_eq!(provider.launch_polls(), 3);
    assert!(started.elapsed() >= 2 * WAIT_POLL_INTERVAL);
    assert!(started.elapsed() < 3 * WAIT_POLL_INTERVAL);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn bounded_wait_times_out(provider: ScriptedProvider) {
    provider.script_launch_states(&[InstanceState::Pending]);
    let options = LaunchOptions {
        wait: true,
        ..with_image("img-1")
    };

    let err = orchestrator(&provider)
        .with_wait_timeout(Duration::from_secs(5))
        .launch("api", &options)
        .await
        .expect_err("instance never runs");

    assert!(matches!(err, LaunchError::WaitTimeout { .. }), "got {err}");
    assert_eq!(provider.launch_polls(), 3);
}

#[rstest]
#[tokio::test]
async fn without_wait_the_instance_is_read_back_once(provider: ScriptedProvider) {
    let launched = orchestrator(&provider)
        .launch("api", &with_image("img-1"))
        .await
        .expect("launch should succeed");

    assert_eq!(launched.state, InstanceState::Pending);
    assert_eq!(provider.launch_polls(), 1);
}

#[test]
fn chooses_a_zone_from_the_offered_set() {
    let zones = vec![String::from("nl-ams-1"), String::from("nl-ams-2")];
    let mut rng = StdRng::seed_from_u64(7);
    let mut request = LaunchRequest {
        count: 1,
        ..LaunchRequest::default()
    };

    request.choose_zone(&zones, &mut rng);

    assert!(request.zone.as_ref().is_some_and(|zone| zones.contains(zone)));
}

#[test]
fn chosen_zone_never_replaces_an_explicit_one() {
    let mut request = LaunchRequest {
        zone: Some(String::from("pl-waw-1")),
        count: 1,
        ..LaunchRequest::default()
    };

    request.choose_zone(&[String::from("nl-ams-1")], &mut StdRng::seed_from_u64(1));

    assert_eq!(request.zone.as_deref(), Some("pl-waw-1"));
}
