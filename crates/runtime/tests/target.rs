//! Parent/child scenarios: recipe expansion, completion aggregation,
//! concurrent parent-state merging and delete cascades.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use wunsch_core::{Metadata, RecipeRef, StateMap, WantConfig, WantSpec, WantStatus};
use wunsch_runtime::builder::BuilderOptions;
use wunsch_runtime::{Builder, ProgressError, Progressable, Want};

/// Reports a cost from its params and achieves on the first cycle.
struct CostReporter;

#[async_trait::async_trait]
impl Progressable for CostReporter {
    fn is_achieved(&self, want: &Arc<Want>) -> bool {
        want.get_state("reported") == Some(json!(true))
    }

    async fn progress(&self, want: &Arc<Want>) -> Result<(), ProgressError> {
        let cost = want
            .spec()
            .params
            .get("cost")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        want.store_state("total_cost", json!(cost));

        let mut updates = StateMap::new();
        updates.insert("costs".into(), json!({ want.name(): cost }));
        want.merge_parent_state(updates);

        want.store_state("reported", json!(true));
        Ok(())
    }
}

const TRAVEL_RECIPE: &str = r#"
recipe:
  parameters:
    prefix: trip
  wants:
    - metadata:
        name: "{{prefix}}-restaurant"
        type: cost-reporter
      spec:
        params: { cost: 120 }
    - metadata:
        name: "{{prefix}}-hotel"
        type: cost-reporter
      spec:
        params: { cost: 300 }
    - metadata:
        name: "{{prefix}}-buffet"
        type: cost-reporter
      spec:
        params: { cost: 45 }
  result:
    - want_name: "{{prefix}}-restaurant"
      state_field: total_cost
"#;

fn test_builder() -> Builder {
    let builder = Builder::new(BuilderOptions::default());
    builder.register_want_type(
        "cost-reporter",
        Arc::new(|_cfg: &WantConfig| Arc::new(CostReporter) as Arc<dyn Progressable>),
    );
    builder
}

fn target_config(name: &str, recipe_path: &str) -> WantConfig {
    let mut metadata = Metadata::new(name, "target");
    metadata.labels.insert("role".into(), "parent".into());
    let mut spec = WantSpec::default();
    spec.recipe = Some(RecipeRef {
        path: recipe_path.to_string(),
        params: StateMap::new(),
    });
    let mut config = WantConfig::new(metadata, spec);
    config.state.insert("budget".into(), json!(5000));
    config.state.insert("costs".into(), json!({}));
    config
}

async fn wait_for_want<F>(builder: &Builder, name: &str, timeout: Duration, pred: F) -> Arc<Want>
where
    F: Fn(&Arc<Want>) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(want) = builder.want(name).await {
            if pred(&want) {
                return want;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "want {name} did not reach the expected condition"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn write_recipe(dir: &tempfile::TempDir) -> String {
    let path = dir.path().join("travel.yaml");
    std::fs::write(&path, TRAVEL_RECIPE).unwrap();
    path.to_string_lossy().into_owned()
}

#[tokio::test]
async fn target_spawns_children_and_aggregates_completion() {
    let dir = tempfile::tempdir().unwrap();
    let builder = test_builder();
    builder.start();

    builder
        .queue_want_add(vec![target_config("journey", &write_recipe(&dir))])
        .await
        .unwrap();

    let target = wait_for_want(&builder, "journey", Duration::from_secs(5), |w| {
        w.status() == WantStatus::Achieved
    })
    .await;

    assert_eq!(target.get_state("achieving_percentage"), Some(json!(100)));
    assert_eq!(target.get_state("completed"), Some(json!(true)));
    assert_eq!(target.get_state("children_count"), Some(json!(3)));

    // result spec: first listed child's field lands as `result` too
    assert_eq!(
        target.get_state("trip-restaurant_total_cost"),
        Some(json!(120.0))
    );
    assert_eq!(target.get_state("result"), Some(json!(120.0)));

    // children carry owner labels and scoped selectors
    let child = builder.want("trip-hotel").await.unwrap();
    let metadata = child.metadata();
    assert_eq!(metadata.labels.get("owner").map(String::as_str), Some("child"));
    let owner = metadata.controller_owner().unwrap().clone();
    assert_eq!(owner.name, "journey");
    assert!(owner.block_owner_deletion);

    builder.shutdown().await;
}

#[tokio::test]
async fn concurrent_child_merges_land_in_parent_state() {
    let dir = tempfile::tempdir().unwrap();
    let builder = test_builder();
    builder.start();

    builder
        .queue_want_add(vec![target_config("journey", &write_recipe(&dir))])
        .await
        .unwrap();

    let target = wait_for_want(&builder, "journey", Duration::from_secs(5), |w| {
        w.status() == WantStatus::Achieved
    })
    .await;

    // three children merged {costs: {name: cost}} concurrently; all three
    // keys must survive
    let costs = target.get_state("costs").unwrap();
    let costs = costs.as_object().unwrap();
    assert_eq!(costs.len(), 3);
    assert_eq!(costs["trip-restaurant"], json!(120.0));
    assert_eq!(costs["trip-hotel"], json!(300.0));
    assert_eq!(costs["trip-buffet"], json!(45.0));
    assert_eq!(target.get_state("budget"), Some(json!(5000)));

    builder.shutdown().await;
}

#[tokio::test]
async fn delete_cascades_to_owned_children() {
    let dir = tempfile::tempdir().unwrap();
    let builder = test_builder();
    builder.start();

    builder
        .queue_want_add(vec![target_config("journey", &write_recipe(&dir))])
        .await
        .unwrap();

    let target = wait_for_want(&builder, "journey", Duration::from_secs(5), |w| {
        w.status() == WantStatus::Achieved
    })
    .await;
    assert_eq!(builder.want_names().await.len(), 4);

    builder.queue_want_delete(vec![target.id()]).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if builder.want_names().await.is_empty() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "cascade delete did not finish"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // nothing left in the snapshot either
    let snapshot = builder.snapshot_now().await;
    assert!(snapshot.wants.is_empty());

    builder.shutdown().await;
}

#[tokio::test]
async fn parameter_updates_propagate_to_matching_children() {
    let dir = tempfile::tempdir().unwrap();
    let builder = test_builder();
    builder.start();

    builder
        .queue_want_add(vec![target_config("journey", &write_recipe(&dir))])
        .await
        .unwrap();
    wait_for_want(&builder, "journey", Duration::from_secs(5), |w| {
        w.status() == WantStatus::Achieved
    })
    .await;

    // children declare `cost`; the parent's `primary_cost` maps onto it
    builder
        .update_target_parameter("journey", "primary_cost", json!(99))
        .await
        .unwrap();

    let target = builder.want("journey").await.unwrap();
    assert_eq!(target.spec().params.get("primary_cost"), Some(&json!(99)));
    for child in ["trip-restaurant", "trip-hotel", "trip-buffet"] {
        let child = builder.want(child).await.unwrap();
        assert_eq!(child.spec().params.get("cost"), Some(&json!(99)));
    }

    builder.shutdown().await;
}

#[tokio::test]
async fn orphan_parent_state_goes_to_global() {
    let builder = test_builder();
    builder.start();

    let mut metadata = Metadata::new("loner", "cost-reporter");
    metadata.labels.insert("role".into(), "solo".into());
    let mut spec = WantSpec::default();
    spec.params.insert("cost".into(), json!(7.5));
    builder
        .queue_want_add(vec![WantConfig::new(metadata, spec)])
        .await
        .unwrap();

    wait_for_want(&builder, "loner", Duration::from_secs(5), |w| {
        w.status() == WantStatus::Achieved
    })
    .await;

    // no controller owner: the merge fell through to global state
    let costs = builder.global().get("costs").unwrap();
    assert_eq!(costs["loner"], json!(7.5));

    builder.shutdown().await;
}
