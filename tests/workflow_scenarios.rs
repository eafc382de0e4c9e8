//! Workflow scenarios: command steps over scripted providers, onError
//! recovery, and a full project run against the local exec provider.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::json;

use trellis::action::ActionState;
use trellis::config::ProjectConfig;
use trellis::provider::exec::ExecHandler;
use trellis::provider::testing::ScriptedHandler;
use trellis::provider::ProviderRouter;
use trellis::tree::StaticTreeVersions;
use trellis::Session;

fn scripted_session(
    project_yaml: &str,
    root: &Utf8Path,
    handler: ScriptedHandler,
) -> (Session, Arc<ScriptedHandler>) {
    let project = ProjectConfig::parse(project_yaml, root).unwrap();
    let handler = Arc::new(handler);
    let router = Arc::new(ProviderRouter::new().register(Arc::clone(&handler) as _));
    let session = Session::build(
        project,
        None,
        router,
        Arc::new(StaticTreeVersions::empty()),
        json!({}),
        false,
    )
    .unwrap();
    (session, handler)
}

fn tmp_root() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, path)
}

#[tokio::test]
async fn on_error_deploy_step_still_runs_and_records_outputs() {
    // Steps [deploy a, deploy b(onError)]; a fails. Both execute, the
    // workflow fails, and step b still records its outputs.
    let (_guard, root) = tmp_root();
    let project = r#"
name: shop
actions:
  - kind: Deploy
    name: a
    type: container
  - kind: Deploy
    name: b
    type: container
workflows:
  - name: rollout
    steps:
      - name: deploy-a
        command: [deploy, a]
      - name: deploy-b
        command: [deploy, b]
        when: onError
"#;
    let (session, handler) = scripted_session(
        project,
        &root,
        ScriptedHandler::new("container")
            .with_status("deploy.a", ActionState::Missing)
            .with_status("deploy.b", ActionState::Missing)
            .with_execute_error("deploy.a", "rollout failed"),
    );

    let result = session
        .run_workflow("rollout", Default::default())
        .await
        .unwrap();

    assert!(result.failed());
    assert!(!result.errors.is_empty());

    let names: Vec<&str> = result.steps.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["deploy-a", "deploy-b"]);

    // Step b executed for real and recorded a successful deploy
    assert!(handler.calls().contains(&"execute:deploy.b".to_string()));
    let (_, step_b) = &result.steps[1];
    assert_eq!(step_b.outputs["deploy.b"]["success"], json!(true));
}

#[tokio::test]
async fn workflow_commands_share_one_graph_per_session() {
    // Two steps deploying actions that share a build; the build runs once.
    let (_guard, root) = tmp_root();
    let project = r#"
name: shop
actions:
  - kind: Build
    name: common
    type: container
  - kind: Deploy
    name: a
    type: container
    build: common
  - kind: Deploy
    name: b
    type: container
    build: common
workflows:
  - name: rollout
    steps:
      - command: [deploy, a]
      - command: [deploy, b]
"#;
    let (session, handler) = scripted_session(
        project,
        &root,
        ScriptedHandler::new("container")
            .with_status("build.common", ActionState::NotReady)
            .with_status("deploy.a", ActionState::Missing)
            .with_status("deploy.b", ActionState::Missing),
    );

    let result = session
        .run_workflow("rollout", Default::default())
        .await
        .unwrap();
    assert!(!result.failed());

    let builds = handler
        .calls()
        .iter()
        .filter(|c| *c == "execute:build.common")
        .count();
    assert_eq!(builds, 1);
}

#[tokio::test]
async fn exec_provider_project_runs_end_to_end() {
    let (_guard, root) = tmp_root();
    let project = r#"
name: scripts
actions:
  - kind: Build
    name: artifact
    type: exec
    spec:
      command: [sh, -c, "echo built"]
  - kind: Run
    name: smoke
    type: exec
    dependencies: [build.artifact]
    spec:
      command: [sh, -c, "echo smoke-ok"]
workflows:
  - name: ship
    steps:
      - name: pipeline
        command: [run, smoke]
      - name: summarize
        script: "echo finished"
"#;
    let project = ProjectConfig::parse(project, &root).unwrap();
    let router = Arc::new(ProviderRouter::new().register(Arc::new(ExecHandler)));
    let session = Session::build(
        project,
        None,
        router,
        Arc::new(StaticTreeVersions::empty()),
        json!({}),
        false,
    )
    .unwrap();

    let result = session.run_workflow("ship", Default::default()).await.unwrap();
    assert!(!result.failed(), "errors: {:?}", result.errors);

    let (_, pipeline) = &result.steps[0];
    assert_eq!(pipeline.outputs["run.smoke"]["success"], json!(true));
    assert_eq!(
        pipeline.outputs["run.smoke"]["output"]["outputs"]["log"],
        json!("smoke-ok")
    );
    let (_, summarize) = &result.steps[1];
    assert_eq!(summarize.log, "finished");
}

#[tokio::test]
async fn exec_status_probe_skips_execution_when_ready() {
    let (_guard, root) = tmp_root();
    let marker = root.join("deployed.marker");
    std::fs::write(&marker, "ok").unwrap();

    let project = format!(
        r#"
name: scripts
actions:
  - kind: Deploy
    name: svc
    type: exec
    spec:
      command: [sh, -c, "echo deploying && touch {marker}.ran"]
      statusCommand: [test, -f, "{marker}"]
"#
    );
    let project = ProjectConfig::parse(&project, &root).unwrap();
    let router = Arc::new(ProviderRouter::new().register(Arc::new(ExecHandler)));
    let session = Session::build(
        project,
        None,
        router,
        Arc::new(StaticTreeVersions::empty()),
        json!({}),
        false,
    )
    .unwrap();

    let result = session
        .run_command(&["deploy".into(), "svc".into()])
        .await
        .unwrap();
    assert!(result.errors.is_empty());
    assert_eq!(result.result["deploy.svc"]["output"]["state"], json!("ready"));

    // The deploy command itself never ran
    assert!(!std::path::Path::new(&format!("{marker}.ran")).exists());
}

#[tokio::test]
async fn session_rejects_persistent_commands() {
    let (_guard, root) = tmp_root();
    let project = r#"
name: shop
actions:
  - kind: Deploy
    name: api
    type: container
"#;
    let (session, _) =
        scripted_session(project, &root, ScriptedHandler::new("container"));

    let err = session
        .run_command(&["deploy".into(), "api".into(), "--sync".into()])
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TRL-006");
}
