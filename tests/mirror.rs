mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use common::*;
use watermark_mirror::transform::page_count;
use watermark_mirror::{
    Error, MemoryTree, NodeKind, ProgressReply, RemoteError, TaskId, TaskStatus,
};

/// Every source folder has exactly one same-named mirror, every document
/// exactly one prefixed output, and nothing else is copied.
fn assert_mirrored(tree: &MemoryTree, source: &str, dest: &str) {
    let sources = tree.children_of(source);
    let dests = tree.children_of(dest);

    let mut expected = 0;
    for child in &sources {
        match child.kind {
            NodeKind::Folder => {
                expected += 1;
                let matches: Vec<_> = dests
                    .iter()
                    .filter(|d| d.kind == NodeKind::Folder && d.name == child.name)
                    .collect();
                assert_eq!(matches.len(), 1, "folder {} mirrored once", child.name);
                assert_mirrored(tree, &child.id, &matches[0].id);
            }
            NodeKind::Document => {
                expected += 1;
                let name = format!("watermarked_{}", child.name);
                let count = dests.iter().filter(|d| d.name == name).count();
                assert_eq!(count, 1, "{} uploaded once", name);
            }
            NodeKind::Other => {
                assert!(
                    !dests.iter().any(|d| d.name.ends_with(&child.name)),
                    "{} must not be copied",
                    child.name
                );
            }
        }
    }
    assert_eq!(dests.len(), expected);
}

#[tokio::test]
async fn mirrors_nested_tree() {
    let tree = Arc::new(MemoryTree::new());
    let root = tree.add_folder("Decks", "");
    let original = sample_pdf(3);
    let a = tree.add_file("a.pdf", NodeKind::Document, original.clone(), &root);
    tree.add_file("cover.png", NodeKind::Other, b"png".to_vec(), &root);
    let sub = tree.add_folder("Q1", &root);
    add_pdf(&tree, "b.pdf", 1, &sub);
    let deeper = tree.add_folder("drafts", &sub);
    add_pdf(&tree, "c.pdf", 2, &deeper);
    tree.add_folder("empty", &root);

    let orchestrator = orchestrator();
    let id = orchestrator
        .start(handle(&tree), &root, &logo_png())
        .await
        .unwrap();
    let snap = wait(&orchestrator, &id).await;

    assert_eq!(snap.status, TaskStatus::Completed);
    assert_eq!(snap.progress, 100);
    assert_eq!(snap.uploaded, 3);
    assert_eq!(snap.skipped, 0);
    assert_eq!(snap.total, Some(7));
    assert_eq!(snap.processed, 7);

    let dest = dest_root(&tree, "Decks");
    assert_mirrored(&tree, &root, &dest.id);

    let out = tree.find_child(&dest.id, "watermarked_a.pdf").unwrap();
    let bytes = tree.contents(&out.id).unwrap();
    assert_eq!(page_count(&bytes).unwrap(), 3);
    assert_ne!(bytes, original);
    // Sources stay untouched.
    assert_eq!(tree.contents(&a).unwrap(), original);
}

#[tokio::test]
async fn folder_url_is_accepted() {
    let tree = Arc::new(MemoryTree::new());
    let root = tree.add_folder("Shared", "");
    add_pdf(&tree, "a.pdf", 1, &root);

    let orchestrator = orchestrator();
    let url = format!("https://drive.google.com/drive/folders/{}?usp=sharing", root);
    let id = orchestrator.start(handle(&tree), &url, &logo_png()).await.unwrap();
    assert_eq!(wait(&orchestrator, &id).await.status, TaskStatus::Completed);
}

#[tokio::test]
async fn progress_steps_by_quarter_for_four_children() {
    let gate = Arc::new(Semaphore::new(0));
    let tree = Arc::new(MemoryTree::new().with_upload_gate(Arc::clone(&gate)));
    let root = tree.add_folder("Four", "");
    for i in 0..4 {
        add_pdf(&tree, &format!("{}.pdf", i), 1, &root);
    }

    let orchestrator = orchestrator();
    let id = orchestrator.start(handle(&tree), &root, &logo_png()).await.unwrap();

    let mut seen = Vec::new();
    for done in 1..=4 {
        gate.add_permits(1);
        wait_until(|| orchestrator.registry().snapshot(&id).unwrap().processed == done).await;
        seen.push(orchestrator.registry().snapshot(&id).unwrap().progress);
    }
    assert_eq!(seen, vec![25, 50, 75, 100]);
    assert_eq!(wait(&orchestrator, &id).await.status, TaskStatus::Completed);
}

#[tokio::test]
async fn cancel_stops_after_in_flight_item() {
    let gate = Arc::new(Semaphore::new(0));
    let tree = Arc::new(MemoryTree::new().with_upload_gate(Arc::clone(&gate)));
    let root = tree.add_folder("Many", "");
    for i in 0..6 {
        add_pdf(&tree, &format!("{}.pdf", i), 1, &root);
    }

    let orchestrator = orchestrator();
    let id = orchestrator.start(handle(&tree), &root, &logo_png()).await.unwrap();

    gate.add_permits(2);
    wait_until(|| tree.uploads().len() == 2).await;
    orchestrator.cancel(&id).unwrap();
    gate.add_permits(10);

    let snap = wait(&orchestrator, &id).await;
    assert_eq!(snap.status, TaskStatus::Cancelled);
    assert!(tree.uploads().len() <= 3, "uploads: {}", tree.uploads().len());
    assert!(snap.progress < 100);

    // No rollback, and no further calls once cancelled.
    let calls = tree.call_count();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(tree.call_count(), calls);
    assert!(!tree.children_of(&dest_root(&tree, "Many").id).is_empty());
}

#[tokio::test]
async fn pause_holds_the_walk_until_resumed() {
    let tree = Arc::new(MemoryTree::new());
    let root = tree.add_folder("Paused", "");
    for i in 0..3 {
        add_pdf(&tree, &format!("{}.pdf", i), 1, &root);
    }

    let orchestrator = orchestrator();
    let id = orchestrator.start(handle(&tree), &root, &logo_png()).await.unwrap();
    let snap = orchestrator.pause(&id).unwrap();
    assert!(snap.paused);
    let calls = tree.call_count();

    tokio::time::sleep(Duration::from_millis(30)).await;
    let snap = orchestrator.registry().snapshot(&id).unwrap();
    assert_eq!(snap.status, TaskStatus::Running);
    assert_eq!(snap.processed, 0);
    assert_eq!(tree.call_count(), calls);

    orchestrator.resume(&id).unwrap();
    let snap = wait(&orchestrator, &id).await;
    assert_eq!(snap.status, TaskStatus::Completed);
    assert!(!snap.paused);
    assert_eq!(tree.uploads().len(), 3);
}

#[tokio::test]
async fn cancel_while_paused_ends_cancelled() {
    let tree = Arc::new(MemoryTree::new());
    let root = tree.add_folder("Stopped", "");
    add_pdf(&tree, "a.pdf", 1, &root);

    let orchestrator = orchestrator();
    let id = orchestrator.start(handle(&tree), &root, &logo_png()).await.unwrap();
    orchestrator.pause(&id).unwrap();
    orchestrator.cancel(&id).unwrap();

    let snap = wait(&orchestrator, &id).await;
    assert_eq!(snap.status, TaskStatus::Cancelled);
    assert!(tree.uploads().is_empty());
}

#[tokio::test]
async fn malformed_document_is_skipped() {
    let tree = Arc::new(MemoryTree::new());
    let root = tree.add_folder("Mixed", "");
    tree.add_file("broken.pdf", NodeKind::Document, b"not a pdf".to_vec(), &root);
    add_pdf(&tree, "good.pdf", 2, &root);

    let orchestrator = orchestrator();
    let id = orchestrator.start(handle(&tree), &root, &logo_png()).await.unwrap();
    let snap = wait(&orchestrator, &id).await;

    assert_eq!(snap.status, TaskStatus::Completed);
    assert_eq!(snap.skipped, 1);
    assert_eq!(snap.uploaded, 1);
    let dest = dest_root(&tree, "Mixed");
    assert!(tree.find_child(&dest.id, "watermarked_good.pdf").is_some());
    assert!(tree.find_child(&dest.id, "watermarked_broken.pdf").is_none());
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let tree = Arc::new(MemoryTree::new());
    let root = tree.add_folder("Flaky", "");
    let sub = tree.add_folder("sub", &root);
    let doc = add_pdf(&tree, "a.pdf", 1, &sub);
    tree.fail_on(&sub, 2, RemoteError::Transient("503".into()));
    tree.fail_on(&doc, 1, RemoteError::Transient("reset".into()));

    let orchestrator = orchestrator();
    let id = orchestrator.start(handle(&tree), &root, &logo_png()).await.unwrap();
    let snap = wait(&orchestrator, &id).await;
    assert_eq!(snap.status, TaskStatus::Completed);
    assert_eq!(snap.uploaded, 1);
}

#[tokio::test]
async fn creations_that_landed_before_failing_are_not_duplicated() {
    let tree = Arc::new(MemoryTree::new());
    let root = tree.add_folder("Lossy", "");
    add_pdf(&tree, "a.pdf", 1, &root);
    let sub = tree.add_folder("sub", &root);
    add_pdf(&tree, "b.pdf", 1, &sub);
    tree.fail_after_commit("watermarked_a.pdf", 1, RemoteError::Transient("timeout".into()));
    tree.fail_after_commit("sub", 1, RemoteError::Transient("timeout".into()));

    let orchestrator = orchestrator();
    let id = orchestrator.start(handle(&tree), &root, &logo_png()).await.unwrap();
    let snap = wait(&orchestrator, &id).await;

    assert_eq!(snap.status, TaskStatus::Completed);
    assert_eq!(snap.uploaded, 2);
    assert_eq!(tree.uploads().len(), 2);
    assert_mirrored(&tree, &root, &dest_root(&tree, "Lossy").id);
}

#[tokio::test]
async fn permanent_failure_in_subtree_fails_the_job() {
    let tree = Arc::new(MemoryTree::new());
    let root = tree.add_folder("Locked", "");
    let sub = tree.add_folder("private", &root);
    add_pdf(&tree, "a.pdf", 1, &sub);
    tree.fail_on(&sub, u32::MAX, RemoteError::Permanent("permission denied".into()));

    let orchestrator = orchestrator();
    let id = orchestrator.start(handle(&tree), &root, &logo_png()).await.unwrap();
    let snap = wait(&orchestrator, &id).await;

    assert_eq!(snap.status, TaskStatus::Failed);
    let error = snap.error.expect("error summary");
    assert!(error.contains("permission denied"), "{}", error);
    assert!(snap.finished_at.is_some());
}

#[tokio::test]
async fn failure_mid_walk_keeps_earlier_outputs() {
    let tree = Arc::new(MemoryTree::new());
    let root = tree.add_folder("Partial", "");
    add_pdf(&tree, "a.pdf", 1, &root);
    let bad = add_pdf(&tree, "b.pdf", 1, &root);
    add_pdf(&tree, "c.pdf", 1, &root);
    tree.fail_on(&bad, u32::MAX, RemoteError::Permanent("gone".into()));

    let orchestrator = orchestrator();
    let id = orchestrator.start(handle(&tree), &root, &logo_png()).await.unwrap();
    let snap = wait(&orchestrator, &id).await;

    assert_eq!(snap.status, TaskStatus::Failed);
    let names: Vec<_> = tree.uploads().into_iter().map(|n| n.name).collect();
    assert_eq!(names, vec!["watermarked_a.pdf"]);
}

#[tokio::test]
async fn bad_logo_fails_submission_without_side_effects() {
    let tree = Arc::new(MemoryTree::new());
    let root = tree.add_folder("Decks", "");
    add_pdf(&tree, "a.pdf", 1, &root);

    let orchestrator = orchestrator();
    let err = orchestrator
        .start(handle(&tree), &root, b"not an image")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Render(_)));
    assert_eq!(tree.children_of("").len(), 1);
    assert!(orchestrator.registry().is_empty());
}

#[tokio::test]
async fn missing_or_non_folder_source_is_not_found() {
    let tree = Arc::new(MemoryTree::new());
    let root = tree.add_folder("Decks", "");
    let file = add_pdf(&tree, "a.pdf", 1, &root);

    let orchestrator = orchestrator();
    let err = orchestrator
        .start(handle(&tree), "does-not-exist", &logo_png())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let err = orchestrator
        .start(handle(&tree), &file, &logo_png())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    // A URL no pattern recognizes is looked up verbatim.
    let err = orchestrator
        .start(handle(&tree), "https://example.com/nothing/here", &logo_png())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert!(orchestrator.registry().is_empty());
}

#[tokio::test]
async fn rejected_credential_is_an_auth_error() {
    let tree = Arc::new(MemoryTree::new());
    let root = tree.add_folder("Decks", "");
    tree.fail_on(&root, 1, RemoteError::Auth("token expired".into()));

    let orchestrator = orchestrator();
    let err = orchestrator
        .start(handle(&tree), &root, &logo_png())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Auth(_)));
}

#[tokio::test]
async fn unknown_task_query_is_typed() {
    let orchestrator = orchestrator();
    let id = TaskId::from("nope");
    assert!(matches!(
        orchestrator.progress(&id),
        ProgressReply::UnknownTask { .. }
    ));
    assert!(matches!(orchestrator.pause(&id), Err(Error::UnknownTask(_))));
    assert!(matches!(orchestrator.wait(&id).await, Err(Error::UnknownTask(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_jobs_stay_isolated() {
    let tree_a = Arc::new(MemoryTree::new());
    let root_a = tree_a.add_folder("Alpha", "");
    for i in 0..3 {
        add_pdf(&tree_a, &format!("a{}.pdf", i), 1, &root_a);
    }
    let tree_b = Arc::new(MemoryTree::new());
    let root_b = tree_b.add_folder("Beta", "");
    let sub_b = tree_b.add_folder("nested", &root_b);
    add_pdf(&tree_b, "b.pdf", 2, &sub_b);

    let orchestrator = orchestrator();
    let logo = logo_png();
    let (id_a, id_b) = tokio::join!(
        orchestrator.start(handle(&tree_a), &root_a, &logo),
        orchestrator.start(handle(&tree_b), &root_b, &logo),
    );
    let (id_a, id_b) = (id_a.unwrap(), id_b.unwrap());
    assert_ne!(id_a, id_b);

    let snap_a = wait(&orchestrator, &id_a).await;
    let snap_b = wait(&orchestrator, &id_b).await;
    assert_eq!((snap_a.status, snap_a.uploaded), (TaskStatus::Completed, 3));
    assert_eq!((snap_b.status, snap_b.uploaded), (TaskStatus::Completed, 1));

    assert_mirrored(&tree_a, &root_a, &dest_root(&tree_a, "Alpha").id);
    assert_mirrored(&tree_b, &root_b, &dest_root(&tree_b, "Beta").id);
    assert_eq!(orchestrator.registry().len(), 2);
}
