//! Unit tests for namespace resolution.

use super::*;
use rstest::{fixture, rstest};

use crate::simulated::SimulatedClient;
use crate::spec::parse;

#[fixture]
fn model() -> SpecModel {
    parse(
        r"
metadata:
  name: Intro Lab
services:
  - {name: kali, image: kali}
  - {name: web, image: nginx}
networks:
  - {name: lan}
  - {name: dmz}
  - {name: scoreboard, shared: true}
  - {name: uplink, shared: true, vlan: 2001}
folders:
  - {name: blue, parent: red}
  - {name: red, services: [kali], networks: [scoreboard]}
groups:
  - {name: team, folder: blue, services: [web], networks: [lan, scoreboard, uplink], instances: 2}
  - {name: lone, folder: red, services: [kali, web]}
  - {name: idle, folder: red, services: [web], enabled: false}
",
    )
    .expect("valid spec")
}

fn path(raw: &str) -> ResourcePath {
    ResourcePath::from_segments(raw.split('/'))
}

#[rstest]
#[case("Kali Linux", "kali-linux")]
#[case("  web__01 ", "web__01")]
#[case("A & B!", "a-b")]
#[case("--x--", "x")]
#[case("Été", "t")]
fn canonical_segment_normalises(#[case] raw: &str, #[case] expected: &str) {
    assert_eq!(canonical_segment(raw), expected);
}

#[rstest]
fn folders_resolve_parents_first(model: SpecModel) {
    let tree = resolve(&model).expect("resolves");
    let names: Vec<&str> = tree.folders().iter().map(|node| node.name.as_str()).collect();

    assert_eq!(tree.root(), &path("intro-lab"));
    assert_eq!(names, ["red", "blue"]);
    assert_eq!(tree.folder_path("blue"), Some(&path("intro-lab/red/blue")));
    assert_eq!(
        tree.folders().first().map(|node| node.children.clone()),
        Some(vec![String::from("blue")])
    );
}

#[rstest]
fn masters_mirror_service_placement(model: SpecModel) {
    let tree = resolve(&model).expect("resolves");

    assert_eq!(
        tree.master_location("kali"),
        Some(&path("intro-lab/masters/red/kali-master"))
    );
    assert_eq!(
        tree.master_location("web"),
        Some(&path("intro-lab/masters/web-master"))
    );
}

#[rstest]
fn group_paths_are_deterministic(model: SpecModel) {
    let tree = resolve(&model).expect("resolves");

    assert_eq!(
        tree.group_namespace("team-01"),
        Some(&path("intro-lab/red/blue/team-01"))
    );
    assert_eq!(
        tree.clone_location("team-01", "web"),
        Some(&path("intro-lab/red/blue/team-01/team-01-web"))
    );
    assert_eq!(
        tree.clone_location("lone", "kali"),
        Some(&path("intro-lab/red/lone/lone-kali"))
    );
}

#[rstest]
fn disabled_groups_have_no_plan(model: SpecModel) {
    let tree = resolve(&model).expect("resolves");

    assert!(tree.group_plan("idle").is_none());
    assert!(tree.segments_for_group("idle").is_empty());
    assert_eq!(tree.group_plans().count(), 3);
}

#[rstest]
fn private_segments_are_per_group(model: SpecModel) {
    let tree = resolve(&model).expect("resolves");
    let first = tree.segment_for("team-01", "lan").expect("lan segment");
    let second = tree.segment_for("team-02", "lan").expect("lan segment");

    assert!(!first.shared);
    assert_eq!(first.path, path("intro-lab/red/blue/team-01/team-01-lan"));
    assert_ne!(first.path, second.path);
    assert_ne!(first.vlan, second.vlan);
}

#[rstest]
fn groups_without_private_networks_get_a_default_segment(model: SpecModel) {
    let tree = resolve(&model).expect("resolves");
    let segments = tree.segments_for_group("lone");

    assert_eq!(segments.len(), 1);
    let segment = segments.first().expect("default segment");
    assert_eq!(segment.network, DEFAULT_PRIVATE_NETWORK);
    assert_eq!(segment.path, path("intro-lab/red/lone/lone-private"));
}

#[rstest]
fn shared_segments_are_common_to_groups(model: SpecModel) {
    let tree = resolve(&model).expect("resolves");
    let first = tree.segment_for("team-01", "scoreboard").expect("shared");
    let second = tree.segment_for("team-02", "scoreboard").expect("shared");

    assert!(first.shared);
    assert_eq!(first, second);
    assert_eq!(first.path, path("intro-lab/red/scoreboard"));
    assert_eq!(tree.shared_segments().count(), 2);
}

#[rstest]
fn vlans_are_unique_and_respect_pins(model: SpecModel) {
    let tree = resolve(&model).expect("resolves");
    let mut tags: Vec<u16> = tree
        .shared_segments()
        .chain(tree.group_plans().flat_map(GroupPlan::private_segments))
        .map(|segment| segment.vlan)
        .collect();

    assert_eq!(
        tree.segment_for("team-02", "uplink").map(|s| s.vlan),
        Some(2001)
    );
    assert!(tags.iter().all(|tag| *tag >= VLAN_POOL_START));
    let total = tags.len();
    tags.sort_unstable();
    tags.dedup();
    assert_eq!(tags.len(), total);
}

#[rstest]
fn resolution_is_stable(model: SpecModel) {
    assert_eq!(resolve(&model), resolve(&model));
}

#[rstest]
#[case::canonical_clash(
    "metadata: {name: l}\nfolders:\n  - {name: Red Team}\n  - {name: red-team}\n"
)]
#[case::masters_folder(
    "metadata: {name: l}\nfolders:\n  - {name: Masters}\n"
)]
#[case::group_vs_folder(
    "metadata: {name: l}\nfolders:\n  - {name: a}\n  - {name: g, parent: a}\ngroups:\n  - {name: g, folder: a}\n"
)]
fn collisions_fail_resolution(#[case] raw: &str) {
    let model = parse(raw).expect("valid spec");

    assert!(matches!(resolve(&model), Err(ResolveError::Collision(_))));
}

#[rstest]
fn collision_names_both_entities() {
    let model = parse("metadata: {name: l}\nfolders:\n  - {name: Red Team}\n  - {name: red-team}\n")
        .expect("valid spec");
    let Err(ResolveError::Collision(collision)) = resolve(&model) else {
        panic!("expected collision");
    };

    assert_eq!(collision.path, path("l/red-team"));
    assert_eq!(collision.first, "folder 'Red Team'");
    assert_eq!(collision.second, "folder 'red-team'");
}

#[rstest]
fn unusable_names_are_rejected() {
    let model = parse("metadata: {name: l}\nfolders:\n  - {name: '!!!'}\n").expect("valid spec");

    assert!(matches!(
        resolve(&model),
        Err(ResolveError::UnusableName { .. })
    ));
}

#[rstest]
fn folder_name_overrides_root() {
    let model =
        parse("metadata: {name: lab, folder-name: Courses/Intro}\n").expect("valid spec");
    let tree = resolve(&model).expect("resolves");

    assert_eq!(tree.root(), &path("courses/intro"));
    assert_eq!(tree.masters_root(), path("courses/intro/masters"));
}

#[tokio::test]
async fn ensure_folder_creates_missing_ancestors() {
    let client = SimulatedClient::new();
    let target = path("lab/red/blue");

    let folder = ensure_folder(&client, &target, &RetryPolicy::no_retry())
        .await
        .expect("folder created");
    let again = ensure_folder(&client, &target, &RetryPolicy::no_retry())
        .await
        .expect("folder reused");

    assert_eq!(folder.kind, ResourceKind::Folder);
    assert_eq!(folder.id, again.id);
    assert_eq!(client.snapshot().len(), 3);
}

#[tokio::test]
async fn ensure_folder_flags_non_folders_in_the_way() {
    let client = SimulatedClient::new();
    ensure_folder(&client, &path("lab"), &RetryPolicy::no_retry())
        .await
        .expect("root");
    client
        .create(&ResourceSpec::Network(crate::backend::NetworkSpec {
            path: path("lab/net"),
            vlan: 2000,
        }))
        .await
        .expect("network");

    let err = ensure_folder(&client, &path("lab/net/inner"), &RetryPolicy::no_retry())
        .await
        .expect_err("network in the way");
    assert!(matches!(err, OperationError::Mismatch { .. }));
}

#[rstest]
fn numbered_services_get_one_clone_each() {
    let model = parse(
        "metadata: {name: l}\nservices:\n  - {name: web, image: x, instances: 2}\n  - {name: db, image: y}\nfolders:\n  - {name: f}\ngroups:\n  - {name: g, folder: f, services: [web, db]}\n",
    )
    .expect("valid spec");
    let tree = resolve(&model).expect("resolves");
    let plan = tree.group_plan("g").expect("planned");

    let clones: Vec<(&str, &str, String)> = plan
        .clones
        .iter()
        .map(|c| (c.service.as_str(), c.name.as_str(), c.path.to_string()))
        .collect();
    assert_eq!(
        clones,
        [
            ("web", "web-01", String::from("l/f/g/g-web-01")),
            ("web", "web-02", String::from("l/f/g/g-web-02")),
            ("db", "db", String::from("l/f/g/g-db")),
        ]
    );
    assert_eq!(tree.clone_location("g", "web"), Some(&path("l/f/g/g-web-01")));
}

#[rstest]
fn folder_copies_hold_their_own_group_namespaces() {
    let model = parse(
        "metadata: {name: l}\nservices:\n  - {name: web, image: x}\nfolders:\n  - {name: pods, instances: 2}\ngroups:\n  - {name: team, folder: pods, services: [web]}\n",
    )
    .expect("valid spec");
    let tree = resolve(&model).expect("resolves");

    assert_eq!(tree.folder_path("pods-02"), Some(&path("l/pods/pods-02")));
    assert_eq!(
        tree.group_namespace("pods-01-team"),
        Some(&path("l/pods/pods-01/team"))
    );
    assert_eq!(
        tree.clone_location("pods-02-team", "web"),
        Some(&path("l/pods/pods-02/team/team-web"))
    );
}
