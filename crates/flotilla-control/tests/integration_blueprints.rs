//! Integration tests for blueprint publication, inputs and outputs.

mod common;

use common::{fixtures, TestControlPlane};
use flotilla_control::{
    BlueprintId, ControlError, DeploymentId, ListFilter, Parameters, PlanDocument, ResourceStore,
};
use serde_json::json;

#[tokio::test]
async fn published_plan_round_trips_through_the_store() {
    let plane = TestControlPlane::new();
    let id = plane.publish("web-app", &fixtures::web_app()).await;

    let blueprint = plane.orchestrator.deployments().get_blueprint(&id).await.unwrap();
    let plan: PlanDocument = serde_json::from_value(blueprint.plan).unwrap();
    assert_eq!(plan.nodes.len(), 2);
    assert!(plan.inputs["port"].is_mandatory());
    assert!(!plan.inputs["image"].is_mandatory());
}

#[tokio::test]
async fn unreadable_blueprints_are_rejected() {
    let plane = TestControlPlane::new();
    let deployments = plane.orchestrator.deployments();

    let err = deployments
        .publish_blueprint(BlueprintId::new("missing"), "missing.json")
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::PlanCompilation(_)));

    std::fs::write(plane.blueprints.path().join("cycle.json"), r#"{
        "nodes": [
            {"id": "a", "type": "t", "host_id": "b"},
            {"id": "b", "type": "t", "host_id": "a"}
        ]
    }"#)
    .unwrap();
    let err = deployments
        .publish_blueprint(BlueprintId::new("cycle"), "cycle.json")
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::PlanCompilation(_)));

    assert!(deployments
        .list_blueprints(&ListFilter::new())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn deployment_inputs_are_checked() {
    let plane = TestControlPlane::new();
    let id = plane.publish("web-app", &fixtures::web_app()).await;
    let deployments = plane.orchestrator.deployments();

    let err = deployments
        .create_deployment(&id, DeploymentId::new("web-prod"), &Parameters::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::MissingRequiredInput(ref names) if names == "port"));

    let inputs = Parameters::from([
        ("port".to_owned(), json!(80)),
        ("region".to_owned(), json!("eu-west-1")),
    ]);
    let err = deployments
        .create_deployment(&id, DeploymentId::new("web-prod"), &inputs)
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::UnknownInput(ref names) if names == "region"));

    assert!(deployments
        .list_deployments(&ListFilter::new())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn nodes_carry_resolved_properties() {
    let plane = TestControlPlane::new();
    let deployment = plane.deploy_web_app("web-prod").await;
    let deployments = plane.orchestrator.deployments();

    let app = deployments.get_node(&deployment.id, "app").await.unwrap();
    assert_eq!(app.properties["port"], json!(8080));
    assert_eq!(app.host_id.as_deref(), Some("server"));

    let server = deployments.get_node(&deployment.id, "server").await.unwrap();
    assert_eq!(server.properties["image"], json!("ubuntu-22.04"));

    let instances = deployments
        .list_node_instances(&ListFilter::new().with_deployment(deployment.id.clone()))
        .await
        .unwrap();
    let server_instance = instances.iter().find(|i| i.node_id == "server").unwrap();
    let app_instance = instances.iter().find(|i| i.node_id == "app").unwrap();
    assert_eq!(app_instance.host_id.as_deref(), Some(server_instance.id.as_str()));
    assert_eq!(app_instance.relationships[0].target_id, server_instance.id);

    let err = deployments
        .get_node(&deployment.id, "database")
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::NotFound { kind: "node", .. }));
}

#[tokio::test]
async fn outputs_read_runtime_properties() {
    let plane = TestControlPlane::new();
    let deployment = plane.deploy_web_app("web-prod").await;
    let deployments = plane.orchestrator.deployments();

    // Not yet reported by the worker
    let err = deployments.evaluate_outputs(&deployment.id).await.unwrap_err();
    assert!(matches!(err, ControlError::OutputsEvaluation(_)));

    let mut server = deployments
        .list_node_instances(&ListFilter::new().with_deployment(deployment.id.clone()))
        .await
        .unwrap()
        .into_iter()
        .find(|i| i.node_id == "server")
        .unwrap();
    server
        .runtime_properties
        .insert("ip".to_owned(), json!("10.0.0.7"));
    plane.store.put_node_instance(&server).await.unwrap();

    let outputs = deployments.evaluate_outputs(&deployment.id).await.unwrap();
    assert_eq!(outputs["endpoint"], json!({"ip": "10.0.0.7", "port": 8080}));
}

#[tokio::test]
async fn blueprints_outlive_their_deployments() {
    let plane = TestControlPlane::new();
    let deployment = plane.deploy_web_app("web-prod").await;
    let deployments = plane.orchestrator.deployments();
    let blueprint_id = deployment.blueprint_id.clone();

    let err = deployments.delete_blueprint(&blueprint_id).await.unwrap_err();
    match err {
        ControlError::DependentExists { kind, dependents, .. } => {
            assert_eq!(kind, "blueprint");
            assert_eq!(dependents, vec!["web-prod".to_owned()]);
        }
        other => panic!("unexpected error: {other}"),
    }

    deployments
        .delete_deployment(&deployment.id, false)
        .await
        .unwrap();
    deployments.delete_blueprint(&blueprint_id).await.unwrap();

    let err = deployments.get_blueprint(&blueprint_id).await.unwrap_err();
    assert!(matches!(err, ControlError::NotFound { kind: "blueprint", .. }));
}
