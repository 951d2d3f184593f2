//! Driver tests against a fake IaC tool
#![cfg(unix)]

use chrono::{Duration, Utc};
use infraflow_cloud::VarArg;
use infraflow_config::{BundleConfig, BundleEntry};
use infraflow_core::{CloudType, Entity, EntityKind, NetworkSpec, ResourceSpec, Spec};
use infraflow_driver::{
    BundleCatalog, Driver, DriverError, DriverSettings, StackArgs, StackState,
};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::TempDir;

const FAKE_TOOL: &str = r#"#!/bin/sh
echo "$*" >> calls.log
env | grep '^TF_' | sort >> env.log
case "$1" in
  init)
    echo "Terraform has been successfully initialized!"
    ;;
  plan)
    if [ -f applied ]; then exit 0; else echo "Plan: 3 to add"; exit 2; fi
    ;;
  apply)
    if [ -f fail_apply ]; then
      i=0
      while [ $i -lt 60 ]; do i=$((i+1)); echo "log line $i"; done
      echo "Error: quota exceeded"
      exit 1
    fi
    if [ -f slow ]; then exec sleep 30; fi
    touch applied
    echo "Apply complete! Resources: 3 added, 0 changed, 0 destroyed."
    ;;
  destroy)
    rm -f applied
    echo "Destroy complete!"
    ;;
  output)
    cat outputs.json
    ;;
  *)
    echo "unknown command $1" >&2
    exit 1
    ;;
esac
"#;

const OUTPUTS: &str = r#"{"vpc_id":{"sensitive":false,"type":"string","value":"vpc-123"},"subnet_ids":{"sensitive":false,"type":["list","string"],"value":["subnet-a","subnet-b"]}}"#;

struct Fixture {
    root: TempDir,
    catalog: BundleCatalog,
}

impl Fixture {
    fn new(extra_files: &[(&str, &str)]) -> Self {
        let root = tempfile::tempdir().unwrap();
        let bundle = root.path().join("bundles/aws/v2.3.0/network");
        fs::create_dir_all(&bundle).unwrap();
        fs::write(bundle.join("main.tf"), "# network").unwrap();
        fs::write(bundle.join("outputs.json"), OUTPUTS).unwrap();
        for (name, content) in extra_files {
            fs::write(bundle.join(name), content).unwrap();
        }

        let tools = root.path().join("tools");
        fs::create_dir_all(&tools).unwrap();
        let tool = tools.join("terraform-1.7.5");
        fs::write(&tool, FAKE_TOOL).unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();

        let catalog = BundleCatalog::from_config(&BundleConfig {
            root: root.path().join("bundles"),
            tool: "terraform".to_string(),
            tools_dir: Some(tools),
            entries: vec![BundleEntry {
                cloud: CloudType::Aws,
                version: "v2.3.0".to_string(),
                tool_version: "1.7.5".to_string(),
            }],
        });
        Self { root, catalog }
    }

    fn settings(&self) -> DriverSettings {
        DriverSettings {
            work_dir: self.root.path().join("work"),
            tail_lines: 10,
        }
    }

    async fn driver(&self, deadline: Duration) -> Driver {
        let entity = network();
        let bundle = self
            .catalog
            .resolve(CloudType::Aws, "v2.3.0", EntityKind::Network)
            .unwrap();
        Driver::prepare(&self.settings(), bundle, &entity, args(), Utc::now() + deadline)
            .await
            .unwrap()
    }
}

fn network() -> Entity {
    Entity::new(
        "net-1",
        Some("acct-1".to_string()),
        Spec {
            cloud: CloudType::Aws,
            infra_version: "v2.3.0".to_string(),
            resource: ResourceSpec::Network(NetworkSpec {
                region: "us-west-2".to_string(),
                cidr: "10.0.0.0/16".to_string(),
                availability_zones: vec![],
                public_subnets: vec![],
                private_subnets: vec![],
            }),
        },
    )
}

fn args() -> StackArgs {
    StackArgs {
        vars: vec![
            VarArg::plain("region", "us-west-2"),
            VarArg::plain("vpc_cidr", "10.0.0.0/16"),
        ],
        backend: vec![
            VarArg::plain("bucket", "tf-state"),
            VarArg::plain("key", "infraflow/network/net-1/terraform.tfstate"),
        ],
        credentials: vec![
            VarArg::secret("aws_access_key_id", "AKIAFAKE"),
            VarArg::secret("aws_secret_access_key", "super-secret-value"),
        ],
    }
}

fn read(dir: &Path, name: &str) -> String {
    fs::read_to_string(dir.join(name)).unwrap_or_default()
}

#[tokio::test]
async fn test_apply_then_output() {
    let fixture = Fixture::new(&[]);
    let mut driver = fixture.driver(Duration::minutes(5)).await;
    assert_eq!(driver.state(), StackState::Uninitialized);

    driver.apply().await.unwrap();
    assert_eq!(driver.state(), StackState::Applied);

    let outputs = driver.output().await.unwrap();
    assert_eq!(outputs.string("vpc_id"), Some("vpc-123"));

    let calls = read(driver.work_dir(), "calls.log");
    let lines: Vec<&str> = calls.lines().collect();
    assert!(lines[0].starts_with("init -input=false"));
    assert!(lines[0].contains("-backend-config=bucket=tf-state"));
    assert!(lines[1].starts_with("apply -auto-approve -input=false"));
    assert!(lines[1].contains("-var=vpc_cidr=10.0.0.0/16"));
    assert_eq!(lines[2], "output -json -no-color");
}

#[tokio::test]
async fn test_credentials_never_reach_argv() {
    let fixture = Fixture::new(&[]);
    let mut driver = fixture.driver(Duration::minutes(5)).await;
    driver.apply().await.unwrap();

    let calls = read(driver.work_dir(), "calls.log");
    assert!(!calls.contains("super-secret-value"));
    assert!(!calls.contains("AKIAFAKE"));

    let env = read(driver.work_dir(), "env.log");
    assert!(env.contains("TF_VAR_aws_secret_access_key=super-secret-value"));
    assert!(env.contains("TF_IN_AUTOMATION=1"));
    assert!(env.contains("TF_INPUT=0"));
}

#[tokio::test]
async fn test_apply_twice_is_idempotent() {
    let fixture = Fixture::new(&[]);
    let mut driver = fixture.driver(Duration::minutes(5)).await;

    driver.apply().await.unwrap();
    let first = driver.output().await.unwrap();
    driver.apply().await.unwrap();
    let second = driver.output().await.unwrap();

    assert_eq!(driver.state(), StackState::Applied);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_plan_reports_changes() {
    let fixture = Fixture::new(&[]);
    let mut driver = fixture.driver(Duration::minutes(5)).await;

    driver.init().await.unwrap();
    let plan = driver.plan("p1").await.unwrap();
    assert!(plan.has_changes);
    assert!(plan.plan_file.ends_with("p1.tfplan"));
    assert_eq!(driver.state(), StackState::Initialized);

    driver.apply().await.unwrap();
    let plan = driver.plan("p2").await.unwrap();
    assert!(!plan.has_changes);
}

#[tokio::test]
async fn test_failure_embeds_tail() {
    let fixture = Fixture::new(&[("fail_apply", "")]);
    let mut driver = fixture.driver(Duration::minutes(5)).await;

    let err = driver.apply().await.unwrap_err();
    assert_eq!(driver.state(), StackState::Failed);
    match err {
        DriverError::Execution { code, tail, .. } => {
            assert_eq!(code, 1);
            assert_eq!(tail.lines().count(), 10);
            assert!(tail.contains("Error: quota exceeded"));
            assert!(!tail.contains("log line 1\n"));
        }
        other => panic!("unexpected error: {other}"),
    }

    // A failed stack accepts no further commands
    assert!(matches!(
        driver.apply().await,
        Err(DriverError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_deadline_marks_timeout() {
    let fixture = Fixture::new(&[("slow", "")]);
    let mut driver = fixture.driver(Duration::milliseconds(800)).await;

    let err = driver.apply().await.unwrap_err();
    assert!(matches!(err, DriverError::Timeout { .. }));
    assert_eq!(err.kind(), infraflow_core::ErrorKind::Timeout);
    assert_eq!(driver.state(), StackState::Failed);
}

#[tokio::test]
async fn test_state_machine_guards() {
    let fixture = Fixture::new(&[]);
    let mut driver = fixture.driver(Duration::minutes(5)).await;

    assert!(matches!(
        driver.output().await,
        Err(DriverError::InvalidState { .. })
    ));
    assert!(matches!(
        driver.plan("p").await,
        Err(DriverError::InvalidState { .. })
    ));

    driver.destroy().await.unwrap();
    assert_eq!(driver.state(), StackState::Destroyed);
    assert!(matches!(
        driver.apply().await,
        Err(DriverError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_malformed_output() {
    let fixture = Fixture::new(&[("outputs.json", "{\"vpc_id\": ")]);
    let mut driver = fixture.driver(Duration::minutes(5)).await;
    driver.apply().await.unwrap();

    let err = driver.output().await.unwrap_err();
    assert_eq!(err.kind(), infraflow_core::ErrorKind::OutputParseError);
}

#[tokio::test]
async fn test_working_directories_are_exclusive() {
    let fixture = Fixture::new(&[]);
    let a = fixture.driver(Duration::minutes(5)).await;
    let b = fixture.driver(Duration::minutes(5)).await;
    assert_ne!(a.work_dir(), b.work_dir());
    assert!(a.work_dir().starts_with(fixture.root.path().join("work/net-1")));

    let a_dir = a.work_dir().to_path_buf();
    assert_eq!(a.close(false).await.unwrap(), None);
    assert!(!a_dir.exists());

    let kept = b.close(true).await.unwrap().unwrap();
    assert!(kept.join("main.tf").exists());
}
