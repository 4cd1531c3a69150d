//! Unit tests for the simulated backend's resource rules.

use super::*;
use camino::Utf8PathBuf;
use rstest::rstest;
use tempfile::TempDir;

use crate::backend::{InstanceSpec, NetworkSpec};

fn path(raw: &str) -> ResourcePath {
    ResourcePath::from_segments(raw.split('/'))
}

async fn folder(client: &SimulatedClient, raw: &str) -> Resource {
    client
        .create(&ResourceSpec::Folder { path: path(raw) })
        .await
        .expect("folder")
}

async fn template(client: &SimulatedClient, raw: &str) -> Resource {
    let instance = client
        .create(&ResourceSpec::Instance(InstanceSpec {
            path: path(raw),
            image: ImageSource::Image(String::from("debian-12")),
            cpus: 1,
            memory_mb: 512,
            packages: Vec::new(),
            note: Some(String::from("base image")),
        }))
        .await
        .expect("instance");
    client
        .convert_to_template(&instance)
        .await
        .expect("template")
}

#[tokio::test]
async fn create_requires_an_existing_parent_folder() {
    let client = SimulatedClient::new();
    let err = client
        .create(&ResourceSpec::Folder {
            path: path("lab/inner"),
        })
        .await
        .expect_err("missing parent");

    assert_eq!(err.class(), ErrorClass::NotFound);
}

#[tokio::test]
async fn duplicate_creation_is_already_exists() {
    let client = SimulatedClient::new();
    folder(&client, "lab").await;
    let err = client
        .create(&ResourceSpec::Folder { path: path("lab") })
        .await
        .expect_err("duplicate");

    assert_eq!(err.class(), ErrorClass::AlreadyExists);
}

#[tokio::test]
async fn clones_carry_source_and_note() {
    let client = SimulatedClient::new();
    folder(&client, "lab").await;
    let master = template(&client, "lab/kali-master").await;

    let clone = client
        .clone_instance(&master, "team-kali", &path("lab"))
        .await
        .expect("clone");

    assert_eq!(clone.path, path("lab/team-kali"));
    assert_eq!(clone.kind, ResourceKind::Instance);
    assert_eq!(clone.source, Some(master.path.clone()));
    assert_eq!(clone.note.as_deref(), Some("base image"));
    assert_eq!(clone.power, PowerState::Off);
}

#[tokio::test]
async fn only_templates_can_be_cloned() {
    let client = SimulatedClient::new();
    let lab = folder(&client, "lab").await;

    let err = client
        .clone_instance(&lab, "copy", &path("lab"))
        .await
        .expect_err("folders are not templates");
    assert_eq!(err.class(), ErrorClass::Permanent);
}

#[tokio::test]
async fn convert_requires_power_off() {
    let client = SimulatedClient::new();
    folder(&client, "lab").await;
    let instance = client
        .create(&ResourceSpec::Instance(InstanceSpec {
            path: path("lab/vm"),
            image: ImageSource::Image(String::from("debian-12")),
            cpus: 1,
            memory_mb: 512,
            packages: Vec::new(),
            note: None,
        }))
        .await
        .expect("instance");
    client.power_on(&instance).await.expect("power on");

    assert!(client.convert_to_template(&instance).await.is_err());
    client.power_off(&instance).await.expect("power off");
    let converted = client.convert_to_template(&instance).await.expect("convert");
    assert_eq!(converted.kind, ResourceKind::Template);
}

#[tokio::test]
async fn deletion_rules_protect_dependents() {
    let client = SimulatedClient::new();
    let lab = folder(&client, "lab").await;
    let master = template(&client, "lab/master").await;
    let net = client
        .create(&ResourceSpec::Network(NetworkSpec {
            path: path("lab/net"),
            vlan: 2000,
        }))
        .await
        .expect("network");
    let clone = client
        .clone_instance(&master, "clone", &path("lab"))
        .await
        .expect("clone");
    client.attach_network(&clone, &net).await.expect("attach");
    client.attach_network(&clone, &net).await.expect("attach twice");
    client.power_on(&clone).await.expect("power on");

    assert!(client.delete(&lab).await.is_err(), "non-empty folder");
    assert!(client.delete(&net).await.is_err(), "attached network");
    assert!(client.delete(&master).await.is_err(), "template with clones");
    assert!(client.delete(&clone).await.is_err(), "powered on");

    client.power_off(&clone).await.expect("power off");
    client.delete(&clone).await.expect("delete clone");
    client.delete(&net).await.expect("delete network");
    client.delete(&master).await.expect("delete master");
    client.delete(&lab).await.expect("delete folder");
    assert!(client.snapshot().is_empty());
}

#[tokio::test]
async fn attachments_are_recorded_once() {
    let client = SimulatedClient::new();
    folder(&client, "lab").await;
    let master = template(&client, "lab/master").await;
    let net = client
        .create(&ResourceSpec::Network(NetworkSpec {
            path: path("lab/net"),
            vlan: 2001,
        }))
        .await
        .expect("network");
    let clone = client
        .clone_instance(&master, "clone", &path("lab"))
        .await
        .expect("clone");
    client.attach_network(&clone, &net).await.expect("attach");
    client.attach_network(&clone, &net).await.expect("attach twice");

    let found = client
        .find(&clone.path)
        .await
        .expect("find")
        .expect("present");
    assert_eq!(found.networks, [net.path.clone()]);
    assert_eq!(net.vlan, Some(2001));
}

#[tokio::test]
async fn list_is_recursive_and_strict() {
    let client = SimulatedClient::new();
    folder(&client, "lab").await;
    folder(&client, "lab/a").await;
    folder(&client, "lab/a/b").await;
    folder(&client, "labs").await;

    let listed = client.list(&path("lab")).await.expect("list");
    let paths: Vec<&str> = listed.iter().map(|r| r.path.as_str()).collect();

    assert_eq!(paths, ["lab/a", "lab/a/b"]);
}

#[rstest]
#[case(SimulatedError::NotFound { path: String::new() }, ErrorClass::NotFound)]
#[case(SimulatedError::AlreadyExists { path: String::new() }, ErrorClass::AlreadyExists)]
#[case(SimulatedError::Unavailable { operation: String::new() }, ErrorClass::Transient)]
#[case(SimulatedError::InvalidState { path: String::new(), detail: String::new() }, ErrorClass::Permanent)]
fn errors_classify(#[case] err: SimulatedError, #[case] expected: ErrorClass) {
    assert_eq!(err.class(), expected);
}

#[tokio::test]
async fn persisted_state_survives_reopen() {
    let tmp = TempDir::new().expect("temp dir");
    let state = Utf8PathBuf::from_path_buf(tmp.path().join("state.json"))
        .unwrap_or_else(|err| panic!("temp path should be utf8: {}", err.display()));

    let first = SimulatedClient::open(&state).expect("open");
    folder(&first, "lab").await;
    let master = template(&first, "lab/master").await;
    drop(first);

    let second = SimulatedClient::open(&state).expect("reopen");
    let found = second
        .find(&master.path)
        .await
        .expect("find")
        .expect("persisted");
    assert_eq!(found.kind, ResourceKind::Template);
    let next = folder(&second, "lab/next").await;
    assert_ne!(next.id, master.id);
}

#[tokio::test]
async fn failed_persistence_leaves_the_inventory_untouched() {
    let tmp = TempDir::new().expect("temp dir");
    let state = Utf8PathBuf::from_path_buf(tmp.path().join("state.json"))
        .unwrap_or_else(|err| panic!("temp path should be utf8: {}", err.display()));
    let client = SimulatedClient::open(&state).expect("open");
    folder(&client, "lab").await;
    std::fs::remove_file(&state).expect("remove state");
    std::fs::create_dir(&state).expect("block state path");

    let err = client
        .create(&ResourceSpec::Folder {
            path: path("lab/inner"),
        })
        .await
        .expect_err("write must fail");

    assert!(matches!(err, SimulatedError::Store { .. }));
    assert!(client.find(&path("lab/inner")).await.expect("find").is_none());
    assert_eq!(client.snapshot().len(), 1);
}
