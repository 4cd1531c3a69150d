//! Unit tests for the deploy fan-out.

use super::*;
use rstest::{fixture, rstest};

use crate::backend::{BackendFuture, ResourceSpec};
use crate::masters::ensure_masters;
use crate::namespace::resolve;
use crate::simulated::{SimulatedClient, SimulatedError};
use crate::spec::{SpecModel, parse};
use crate::test_support::{FlakyClient, GaugedClient, Operation, replicated_spec, sample_spec};

struct Lab {
    model: SpecModel,
    tree: FolderTree,
    client: Arc<FlakyClient>,
    masters: MasterSet,
}

fn settings() -> RunSettings {
    RunSettings::new(3, RetryPolicy::immediate(3))
}

async fn lab_from(raw: &str) -> Lab {
    let model = parse(raw).expect("valid spec");
    let tree = resolve(&model).expect("resolves");
    let client = Arc::new(FlakyClient::new());
    let build = ensure_masters(&tree, &model, client.as_ref(), &settings()).await;
    assert!(build.is_complete(), "{build}");
    client.reset_calls();
    Lab {
        model,
        tree,
        client,
        masters: build.masters,
    }
}

#[fixture]
fn spec() -> &'static str {
    sample_spec()
}

async fn run(lab: &Lab) -> DeploymentReport<SimulatedError> {
    deploy(
        lab.model.groups(),
        &lab.masters,
        &lab.tree,
        Arc::clone(&lab.client),
        &settings(),
        &CancellationToken::new(),
    )
    .await
}

#[rstest]
#[tokio::test]
async fn deploys_every_group_and_service(spec: &str) {
    let lab = lab_from(spec).await;

    let report = run(&lab).await;

    assert!(report.is_success(), "{report}");
    assert_eq!(report.groups.len(), 4);
    assert_eq!(report.clones_in_place(), lab.model.planned_clone_count());
    let inner = lab.client.inner();
    let clones: Vec<Resource> = inner
        .snapshot()
        .into_iter()
        .filter(|r| r.kind == ResourceKind::Instance)
        .collect();
    assert_eq!(clones.len(), 7);
    assert!(clones.iter().all(|clone| clone.power == PowerState::On));
    assert_eq!(inner.count(ResourceKind::Network), 5);
}

#[rstest]
#[tokio::test]
async fn clones_attach_to_every_group_segment(spec: &str) {
    let lab = lab_from(spec).await;
    run(&lab).await;

    for plan in lab.tree.group_plans() {
        for clone in &plan.clones {
            let resource = lab
                .client
                .inner()
                .find(&clone.path)
                .await
                .expect("find")
                .expect("clone exists");
            for segment in &plan.segments {
                assert!(
                    resource.is_attached_to(&segment.path),
                    "{} not on {}",
                    clone.path,
                    segment.path
                );
            }
        }
    }
}

#[rstest]
#[tokio::test]
async fn groups_never_share_private_segments(spec: &str) {
    let lab = lab_from(spec).await;
    run(&lab).await;
    let resources = lab.client.inner().snapshot();

    for owner in lab.tree.group_plans() {
        for other in lab.tree.group_plans().filter(|p| p.group != owner.group) {
            for segment in other.private_segments() {
                for clone in &owner.clones {
                    let attached = resources
                        .iter()
                        .find(|r| r.path == clone.path)
                        .is_some_and(|r| r.is_attached_to(&segment.path));
                    assert!(!attached, "{} reaches {}", clone.path, segment.path);
                }
            }
        }
    }
}

#[rstest]
#[tokio::test]
async fn isolation_precedes_power_on(spec: &str) {
    let lab = lab_from(spec).await;
    run(&lab).await;
    let calls = lab.client.calls();

    for plan in lab.tree.group_plans() {
        for clone in &plan.clones {
            let path = clone.path.to_string();
            let last_attach = calls
                .iter()
                .rposition(|c| c.operation == Operation::Attach && c.path == path);
            let power_on = calls
                .iter()
                .position(|c| c.operation == Operation::PowerOn && c.path == path);
            assert!(last_attach.is_some());
            assert!(last_attach < power_on, "{path} powered on before wiring");
        }
    }
}

#[rstest]
#[tokio::test]
async fn redeploy_changes_nothing(spec: &str) {
    let lab = lab_from(spec).await;
    run(&lab).await;
    lab.client.reset_calls();

    let report = run(&lab).await;

    assert!(report.is_success());
    assert_eq!(lab.client.mutation_count(), 0);
    assert!(
        report
            .groups
            .values()
            .flat_map(|g| g.services.values())
            .all(|o| matches!(o, ItemOutcome::Unchanged))
    );
}

#[rstest]
#[tokio::test]
async fn transient_clone_failures_recover_within_the_ceiling(spec: &str) {
    let lab = lab_from(spec).await;
    lab.client
        .fail_transient(Operation::Clone, "team-02-target", 2);

    let report = run(&lab).await;

    assert_eq!(report.status_of("team-02"), Some(GroupStatus::Complete));
    assert!(report.is_success());
}

#[rstest]
#[tokio::test]
async fn exhausted_retries_fail_only_the_affected_group(spec: &str) {
    let lab = lab_from(spec).await;
    lab.client
        .fail_transient(Operation::Clone, "team-02-", 10);

    let report = run(&lab).await;

    assert_eq!(report.status_of("team-02"), Some(GroupStatus::Failed));
    let failures: Vec<_> = report
        .groups
        .get("team-02")
        .map(|g| g.failures().map(|(_, err)| err).collect())
        .unwrap_or_default();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|err| matches!(
        err,
        OperationError::RetriesExhausted { attempts: 3, .. }
    )));
    for sibling in ["team-01", "team-03", "observer"] {
        assert_eq!(report.status_of(sibling), Some(GroupStatus::Complete));
    }
}

#[rstest]
#[tokio::test]
async fn one_failed_service_makes_a_group_partial(spec: &str) {
    let lab = lab_from(spec).await;
    lab.client
        .fail_permanent(Operation::PowerOn, "team-01-target");

    let report = run(&lab).await;

    assert_eq!(report.status_of("team-01"), Some(GroupStatus::Partial));
    assert_eq!(report.failed_items(), 1);
}

#[rstest]
#[tokio::test]
async fn mismatched_clones_are_flagged_not_replaced(spec: &str) {
    let lab = lab_from(spec).await;
    let namespace = lab.tree.group_namespace("observer").expect("planned").clone();
    ensure_folder(lab.client.inner(), &namespace, &RetryPolicy::no_retry())
        .await
        .expect("namespace");
    let wrong = lab.masters.get("kali").expect("kali master");
    lab.client
        .inner()
        .clone_instance(wrong, "observer-target", &namespace)
        .await
        .expect("squatter");

    let report = run(&lab).await;

    let outcome = report
        .groups
        .get("observer")
        .and_then(|g| g.services.get("target"));
    assert!(matches!(
        outcome,
        Some(ItemOutcome::Failed(OperationError::Mismatch { .. }))
    ));
    assert_eq!(report.status_of("team-01"), Some(GroupStatus::Complete));
}

#[rstest]
#[tokio::test]
async fn missing_masters_are_unmet_dependencies(spec: &str) {
    let lab = lab_from(spec).await;
    let partial = MasterSet::default();

    let report = deploy(
        lab.model.groups(),
        &partial,
        &lab.tree,
        Arc::clone(&lab.client),
        &settings(),
        &CancellationToken::new(),
    )
    .await;

    assert!(
        report
            .groups
            .values()
            .flat_map(|g| g.services.values())
            .all(|o| matches!(o, ItemOutcome::Failed(OperationError::DependencyUnmet { .. })))
    );
    assert_eq!(report.groups.len(), 4);
    assert_eq!(lab.client.call_count(), 0);
}

#[rstest]
#[tokio::test]
async fn groups_with_an_unready_master_are_left_untouched(spec: &str) {
    let model = parse(spec).expect("valid spec");
    let tree = resolve(&model).expect("resolves");
    let client = Arc::new(FlakyClient::new());
    client.fail_permanent(Operation::Create, "kali-web-master");
    let build = ensure_masters(&tree, &model, client.as_ref(), &settings()).await;
    assert!(build.masters.get("kali-web").is_none());
    client.clear_faults();
    client.reset_calls();

    let report = deploy(
        model.groups(),
        &build.masters,
        &tree,
        Arc::clone(&client),
        &settings(),
        &CancellationToken::new(),
    )
    .await;

    for team in ["team-01", "team-02", "team-03"] {
        let group = report.groups.get(team).expect("reported");
        assert_eq!(group.status(), GroupStatus::Failed);
        assert!(group.networks.is_empty());
        assert!(group.services.values().all(|o| matches!(
            o,
            ItemOutcome::Failed(OperationError::DependencyUnmet { requirement, .. })
                if requirement.contains("kali-web")
        )));
    }
    assert_eq!(report.status_of("observer"), Some(GroupStatus::Complete));
    assert!(
        client
            .calls()
            .iter()
            .all(|call| !call.path.contains("attackers")),
        "team namespaces were touched"
    );
    for segment in tree.shared_segments() {
        let found = client.inner().find(&segment.path).await.expect("find");
        assert!(found.is_none(), "{} created for untouched groups", segment.path);
    }
}

#[rstest]
#[tokio::test]
async fn interrupted_wiring_is_resumed(spec: &str) {
    let lab = lab_from(spec).await;
    lab.client.fail_permanent(Operation::Attach, "observer-target");
    let first = run(&lab).await;
    assert_eq!(first.status_of("observer"), Some(GroupStatus::Failed));
    lab.client.clear_faults();

    let second = run(&lab).await;

    assert!(matches!(
        second
            .groups
            .get("observer")
            .and_then(|g| g.services.get("target")),
        Some(ItemOutcome::Resumed)
    ));
    assert!(second.is_success());
}

#[rstest]
#[tokio::test]
async fn network_failures_stop_the_group_before_cloning(spec: &str) {
    let lab = lab_from(spec).await;
    lab.client.fail_permanent(Operation::Create, "team-03-lan");

    let report = run(&lab).await;
    let group = report.groups.get("team-03").expect("reported");

    assert_eq!(group.status(), GroupStatus::Failed);
    assert!(group.network_error.is_some());
    assert!(
        lab.client
            .calls()
            .iter()
            .all(|c| !(c.operation == Operation::Clone && c.path.contains("team-03")))
    );
    assert_eq!(report.status_of("team-01"), Some(GroupStatus::Complete));
}

#[rstest]
#[tokio::test]
async fn cancellation_stops_new_work(spec: &str) {
    let lab = lab_from(spec).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = deploy(
        lab.model.groups(),
        &lab.masters,
        &lab.tree,
        Arc::clone(&lab.client),
        &settings(),
        &cancel,
    )
    .await;

    assert_eq!(lab.client.mutation_count(), 0);
    assert!(
        report
            .groups
            .values()
            .flat_map(|g| g.services.values())
            .all(|o| matches!(o, ItemOutcome::Failed(err) if err.is_cancelled()))
    );
}

#[tokio::test]
async fn disabled_groups_are_skipped() {
    let lab = lab_from(
        r"
metadata: {name: lab}
services:
  - {name: web, image: nginx}
folders:
  - {name: f}
groups:
  - {name: blue, folder: f, services: [web]}
  - {name: red, folder: f, services: [web], enabled: false}
",
    )
    .await;

    let report = run(&lab).await;

    assert_eq!(report.skipped, ["red"]);
    assert_eq!(report.groups.len(), 1);
    assert!(report.to_string().contains("red: skipped"));
}

/// Simulated backend whose power supply fails hard for one clone.
struct PanicsOnPowerOn {
    inner: SimulatedClient,
    fragment: &'static str,
}

impl VirtualizationClient for PanicsOnPowerOn {
    type Error = SimulatedError;

    fn find<'a>(
        &'a self,
        path: &'a ResourcePath,
    ) -> BackendFuture<'a, Option<Resource>, Self::Error> {
        self.inner.find(path)
    }

    fn list<'a>(
        &'a self,
        prefix: &'a ResourcePath,
    ) -> BackendFuture<'a, Vec<Resource>, Self::Error> {
        self.inner.list(prefix)
    }

    fn create<'a>(&'a self, spec: &'a ResourceSpec) -> BackendFuture<'a, Resource, Self::Error> {
        self.inner.create(spec)
    }

    fn clone_instance<'a>(
        &'a self,
        source: &'a Resource,
        dest_name: &'a str,
        dest_path: &'a ResourcePath,
    ) -> BackendFuture<'a, Resource, Self::Error> {
        self.inner.clone_instance(source, dest_name, dest_path)
    }

    fn delete<'a>(&'a self, resource: &'a Resource) -> BackendFuture<'a, (), Self::Error> {
        self.inner.delete(resource)
    }

    fn power_on<'a>(&'a self, resource: &'a Resource) -> BackendFuture<'a, (), Self::Error> {
        assert!(
            !resource.path.as_str().contains(self.fragment),
            "power supply fault on {}",
            resource.path
        );
        self.inner.power_on(resource)
    }

    fn power_off<'a>(&'a self, resource: &'a Resource) -> BackendFuture<'a, (), Self::Error> {
        self.inner.power_off(resource)
    }

    fn attach_network<'a>(
        &'a self,
        resource: &'a Resource,
        network: &'a Resource,
    ) -> BackendFuture<'a, (), Self::Error> {
        self.inner.attach_network(resource, network)
    }

    fn convert_to_template<'a>(
        &'a self,
        resource: &'a Resource,
    ) -> BackendFuture<'a, Resource, Self::Error> {
        self.inner.convert_to_template(resource)
    }
}

#[rstest]
#[tokio::test]
async fn panicking_work_items_are_reported_as_failures(spec: &str) {
    let model = parse(spec).expect("valid spec");
    let tree = resolve(&model).expect("resolves");
    let client = Arc::new(PanicsOnPowerOn {
        inner: SimulatedClient::new(),
        fragment: "team-01-target",
    });
    let build = ensure_masters(&tree, &model, client.as_ref(), &settings()).await;

    let report = deploy(
        model.groups(),
        &build.masters,
        &tree,
        Arc::clone(&client),
        &settings(),
        &CancellationToken::new(),
    )
    .await;

    let team = report.groups.get("team-01").expect("reported");
    assert_eq!(team.services.len(), 2);
    assert!(matches!(
        team.services.get("target"),
        Some(ItemOutcome::Failed(OperationError::Aborted { .. }))
    ));
    assert_eq!(team.status(), GroupStatus::Partial);
    assert!(!report.is_success());
    assert_eq!(report.status_of("team-02"), Some(GroupStatus::Complete));
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(3)]
#[tokio::test]
async fn backend_calls_stay_within_the_concurrency_limit(spec: &str, #[case] limit: usize) {
    let model = parse(spec).expect("valid spec");
    let tree = resolve(&model).expect("resolves");
    let client = Arc::new(GaugedClient::new());
    let build = ensure_masters(&tree, &model, client.as_ref(), &settings()).await;
    assert!(build.is_complete(), "{build}");
    client.reset_peak();

    let report = deploy(
        model.groups(),
        &build.masters,
        &tree,
        Arc::clone(&client),
        &RunSettings::new(limit, RetryPolicy::immediate(3)),
        &CancellationToken::new(),
    )
    .await;

    assert!(report.is_success(), "{report}");
    assert!(client.peak() <= limit, "peak {} above {limit}", client.peak());
    assert_eq!(client.peak(), limit);
}

#[tokio::test]
async fn numbered_services_and_folder_copies_deploy_separately() {
    let lab = lab_from(replicated_spec()).await;

    let report = run(&lab).await;

    assert!(report.is_success(), "{report}");
    let groups: Vec<&str> = report.groups.keys().map(String::as_str).collect();
    assert_eq!(groups, ["pods-01-team", "pods-02-team"]);
    for group in report.groups.values() {
        let keys: Vec<&str> = group.services.keys().map(String::as_str).collect();
        assert_eq!(keys, ["db", "web-01", "web-02"]);
    }
    assert_eq!(report.clones_in_place(), 6);
    let second =
        ResourcePath::from_segments(["pods-lab", "pods", "pods-02", "team", "team-web-02"]);
    let clone = lab
        .client
        .inner()
        .find(&second)
        .await
        .expect("find")
        .expect("deployed");
    assert_eq!(clone.power, PowerState::On);
}
