// Licensed under the Apache License, Version 2.0 (see LICENSE).

use serde_json::json;

use super::*;

async fn journal() -> Journal {
  Journal::open_in_memory().expect("in-memory schema always initializes")
}

#[tokio::test]
async fn register_task_creates_plan_items_in_order() {
  let j = journal().await;
  let task = j
    .register_task("ship the release".to_owned(), vec!["build".to_owned(), "test".to_owned(), "publish".to_owned()], None)
    .await
    .unwrap();
  assert_eq!(task.status, TaskStatus::Active);

  let summary = j.get_summary(&task.id, SummaryDetail::Items).await.unwrap();
  assert_eq!(summary.plan_items.len(), 3);
  assert_eq!(summary.plan_items[0].title, "build");
  assert_eq!(summary.progress.current, Some(0));
}

#[tokio::test]
async fn update_task_accepts_canceled_alias_and_records_message() {
  let j = journal().await;
  let task = j.register_task("demo".to_owned(), vec!["a".to_owned()], None).await.unwrap();
  let updated = j
    .update_task(&task.id, Some("giving up".to_owned()), Some("canceled".to_owned()), None)
    .await
    .unwrap();
  assert_eq!(updated.status, TaskStatus::Cancelled);

  let summary = j.get_summary(&task.id, SummaryDetail::Actions).await.unwrap();
  let actions = summary.actions.unwrap();
  assert_eq!(actions.len(), 1);
  assert_eq!(actions[0].action.summary, "giving up");
}

#[tokio::test]
async fn update_plan_item_computes_duration_once_terminal() {
  let j = journal().await;
  let task = j.register_task("demo".to_owned(), vec!["a".to_owned()], None).await.unwrap();
  j.update_plan_item(&task.id, 0, "active".to_owned(), None).await.unwrap();
  let item = j.update_plan_item(&task.id, 0, "completed".to_owned(), Some("done".to_owned())).await.unwrap();
  assert_eq!(item.status, PlanItemStatus::Completed);
  assert!(item.duration_seconds.is_some());
}

#[tokio::test]
async fn wait_lifecycle_tracks_active_wait_ids() {
  let j = journal().await;
  let task = j.register_task("demo".to_owned(), vec!["a".to_owned()], None).await.unwrap();
  j.insert_wait_job(NewWaitJob {
    id: "wait0001".to_owned(),
    task_id: Some(task.id.clone()),
    target_kind: "window".to_owned(),
    target_id: "Terminal".to_owned(),
    criteria: "build finished".to_owned(),
    display: Some(":17".to_owned()),
  })
  .await
  .unwrap();
  j.on_wait_created(&task.id, "wait0001".to_owned(), "window:Terminal".to_owned(), "build finished".to_owned(), Some(300.0))
    .await
    .unwrap();

  let reloaded = j.get_task(&task.id).await.unwrap();
  assert_eq!(active_wait_ids(&reloaded.metadata), vec!["wait0001".to_owned()]);

  j.finalize_wait_job("wait0001", WaitJobStatus::Resolved, Some("done".to_owned())).await.unwrap();
  j.on_wait_finished(&task.id, "wait0001".to_owned(), "resolved".to_owned(), "build finished".to_owned(), Some(12.5))
    .await
    .unwrap();

  let reloaded = j.get_task(&task.id).await.unwrap();
  assert!(active_wait_ids(&reloaded.metadata).is_empty());

  let job = j.get_wait_job("wait0001").await.unwrap();
  assert_eq!(job.status, WaitJobStatus::Resolved);
}

#[tokio::test]
async fn reconcile_active_wait_ids_drops_resolved_jobs() {
  let j = journal().await;
  let task = j.register_task("demo".to_owned(), vec!["a".to_owned()], None).await.unwrap();
  j.insert_wait_job(NewWaitJob {
    id: "wait0002".to_owned(),
    task_id: Some(task.id.clone()),
    target_kind: "window".to_owned(),
    target_id: "Terminal".to_owned(),
    criteria: "x".to_owned(),
    display: None,
  })
  .await
  .unwrap();
  j.on_wait_created(&task.id, "wait0002".to_owned(), "window:Terminal".to_owned(), "x".to_owned(), None).await.unwrap();
  j.finalize_wait_job("wait0002", WaitJobStatus::Timeout, None).await.unwrap();

  let reconciled = j.reconcile_active_wait_ids(&task.id).await.unwrap();
  assert!(reconciled.is_empty());
}

#[tokio::test]
async fn build_resume_packet_includes_progress_and_reason() {
  let j = journal().await;
  let task = j
    .register_task("demo".to_owned(), vec!["a".to_owned(), "b".to_owned()], Some(json!({"note": "x"})))
    .await
    .unwrap();
  j.update_plan_item(&task.id, 0, "completed".to_owned(), None).await.unwrap();
  let packet = j.build_resume_packet(&task.id, "no activity for 10 minutes".to_owned()).await.unwrap();
  assert_eq!(packet.progress.completed, vec![0]);
  assert_eq!(packet.progress.current, Some(1));
  assert_eq!(packet.reason, "no activity for 10 minutes");
}
