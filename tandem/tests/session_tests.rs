//! Session API behaviour against a scripted engine.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{Step, action, drain_quiet, frames_until, harness, is_action, item, wait_until};
use tandem::server::pool::Connection;
use tandem::server::protocol::{
    DownloadIdParams, DownloadParams, FlushParams, ListParams, ResumeParams,
};

fn download_params(url: &str) -> DownloadParams {
    DownloadParams {
        url: url.to_string(),
        ..DownloadParams::default()
    }
}

fn resume_params(id: &str) -> ResumeParams {
    ResumeParams {
        download_id: id.to_string(),
        ..ResumeParams::default()
    }
}

fn id_params(id: &str) -> DownloadIdParams {
    DownloadIdParams {
        download_id: id.to_string(),
    }
}

#[tokio::test]
async fn terminal_event_is_last() {
    let h = harness(&[]).await;
    let url = "http://media.test/clip.mp4";
    h.engine.script(
        url,
        30,
        vec![Step::Progress(10), Step::Progress(20), Step::Complete],
    );

    let (conn, mut rx) = Connection::channel(64);
    let response = h.container.api.download(conn, download_params(url)).await.unwrap();
    assert_eq!(response.file_name, "clip.mp4");
    assert_eq!(response.content_length, 30);

    let frames = frames_until(&mut rx, is_action("download_complete")).await;
    let actions: Vec<&str> = frames.iter().map(action).collect();
    assert_eq!(
        actions,
        vec!["download_progress", "download_progress", "download_complete"]
    );
    assert_eq!(frames[2]["update"]["message"]["value"], 30);
    assert!(drain_quiet(&mut rx).await.is_empty());
    assert!(!h.container.pool.has_download(&response.download_id));

    let id = response.download_id.clone();
    wait_until(|| !h.container.active.contains(&id)).await;
    let stored = h.container.manager.get(&id).unwrap();
    assert!(stored.completed);
    assert_eq!(stored.downloaded, 30);
}

#[tokio::test]
async fn late_attach_sees_no_history() {
    let h = harness(&[]).await;
    let url = "http://media.test/long.mp4";
    let gate = CancellationToken::new();
    h.engine.script(
        url,
        12,
        vec![
            Step::Progress(5),
            Step::Wait(gate.clone()),
            Step::Progress(7),
            Step::Complete,
        ],
    );

    let (first, mut first_rx) = Connection::channel(64);
    let response = h.container.api.download(first, download_params(url)).await.unwrap();
    let id = response.download_id;
    assert_eq!(action(&common::next_frame(&mut first_rx).await), "download_progress");

    let (late, mut late_rx) = Connection::channel(64);
    h.container.api.attach(late, id_params(&id)).await.unwrap();
    gate.cancel();

    let late_frames = frames_until(&mut late_rx, is_action("download_complete")).await;
    let values: Vec<u64> = late_frames
        .iter()
        .map(|f| f["update"]["message"]["value"].as_u64().unwrap())
        .collect();
    assert_eq!(values, vec![7, 12]);

    let first_frames = frames_until(&mut first_rx, is_action("download_complete")).await;
    assert_eq!(first_frames.len(), 2);

    wait_until(|| !h.container.active.contains(&id)).await;
    let (again, _rx) = Connection::channel(4);
    let err = h.container.api.attach(again, id_params(&id)).await.unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}

#[tokio::test]
async fn pair_resume_synthesizes_child_and_compiles_once() {
    let mut primary = item("p1", 40, 100);
    primary.child_hash = Some("c1".into());
    let mut child = item("c1", 50, 50);
    child.children = true;
    let h = harness(&[primary.clone(), child]).await;

    let gate = CancellationToken::new();
    h.engine.script(
        &primary.url,
        100,
        vec![
            Step::Wait(gate.clone()),
            Step::Progress(30),
            Step::Progress(30),
            Step::Complete,
        ],
    );

    let (conn, mut rx) = Connection::channel(64);
    h.container.api.resume(conn, resume_params("p1")).await.unwrap();

    let first = common::next_frame(&mut rx).await;
    assert_eq!(action(&first), "download_complete");
    assert_eq!(first["update"]["message"]["downloadId"], "p1");
    assert_eq!(first["update"]["message"]["hash"], "c1");
    assert_eq!(first["update"]["message"]["percentage"], 60);
    assert_eq!(h.compiler.calls(), 0);
    assert_eq!(*h.engine.resumed.lock(), vec!["p1".to_string()]);

    gate.cancel();
    let frames = frames_until(&mut rx, is_action("compile_complete")).await;
    let actions: Vec<&str> = frames.iter().map(action).collect();
    assert_eq!(
        actions,
        vec![
            "download_progress",
            "download_progress",
            "download_complete",
            "compile_start",
            "compile_progress",
            "compile_complete",
        ]
    );
    let percentages: Vec<u64> = frames[..3]
        .iter()
        .map(|f| f["update"]["message"]["percentage"].as_u64().unwrap())
        .collect();
    assert_eq!(percentages, vec![80, 100, 100]);
    assert!(drain_quiet(&mut rx).await.is_empty());

    assert_eq!(h.compiler.calls(), 1);
    let job = h.compiler.jobs.lock()[0].clone();
    assert!(job.video.ends_with("p1.mp4"));
    assert!(job.audio.ends_with("c1.mp4"));
    assert_eq!(job.output, job.video);
    assert!(h.container.manager.get("p1").unwrap().compiled);
}

#[tokio::test]
async fn unified_percentage_floors_then_reaches_hundred() {
    let mut primary = item("p2", 50, 100);
    primary.child_hash = Some("c2".into());
    let h = harness(&[primary.clone(), item("c2", 50, 50)]).await;
    h.engine
        .script(&primary.url, 100, vec![Step::Progress(50), Step::Complete]);

    let (conn, mut rx) = Connection::channel(64);
    h.container.api.resume(conn, resume_params("p2")).await.unwrap();

    let frames = frames_until(&mut rx, is_action("compile_complete")).await;
    let child_complete = frames
        .iter()
        .find(|f| f["update"]["message"]["hash"] == "c2")
        .unwrap();
    assert_eq!(child_complete["update"]["message"]["percentage"], 66);
    let primary_complete = frames
        .iter()
        .find(|f| action(f) == "download_complete" && f["update"]["message"]["hash"] == "p2")
        .unwrap();
    assert_eq!(primary_complete["update"]["message"]["percentage"], 100);
}

#[tokio::test]
async fn child_failure_skips_compile_with_one_critical_error() {
    let h = harness(&[]).await;
    let child_url = "http://media.test/audio.m4a";
    let primary_url = "http://media.test/video.mp4";
    h.engine
        .script(child_url, 50, vec![Step::Progress(10), Step::Fail("connection reset")]);
    let gate = CancellationToken::new();
    h.engine.script(
        primary_url,
        100,
        vec![
            Step::Progress(50),
            Step::Wait(gate.clone()),
            Step::Progress(50),
            Step::Assemble,
            Step::Complete,
        ],
    );

    let (registrar, _registrar_rx) = Connection::channel(8);
    let child = h
        .container
        .api
        .download(
            registrar,
            DownloadParams {
                is_children: true,
                ..download_params(child_url)
            },
        )
        .await
        .unwrap();
    // Registered only; the primary starts it.
    assert!(!h.container.active.contains(&child.download_id));

    let (conn, mut rx) = Connection::channel(64);
    let primary = h
        .container
        .api
        .download(
            conn,
            DownloadParams {
                child_hash: child.download_id.clone(),
                ..download_params(primary_url)
            },
        )
        .await
        .unwrap();

    // The sibling keeps running after the child failed.
    frames_until(&mut rx, |f| f["ok"] == false).await;
    assert!(h.container.active.contains(&primary.download_id));
    gate.cancel();

    let mut frames = frames_until(&mut rx, is_action("download_stopped")).await;
    frames.extend(drain_quiet(&mut rx).await);
    assert_eq!(action(frames.last().unwrap()), "download_stopped");
    assert!(frames.iter().all(|f| f["ok"] == true));
    assert!(frames.iter().all(|f| !action(f).starts_with("compile")));
    assert_eq!(h.compiler.calls(), 0);

    let primary_item = h.container.manager.get(&primary.download_id).unwrap();
    assert!(primary_item.completed);
    assert!(!primary_item.compiled);
}

#[tokio::test]
async fn pair_with_missing_child_starts_nothing() {
    let h = harness(&[]).await;
    let (conn, _rx) = Connection::channel(8);
    let err = h
        .container
        .api
        .download(
            conn,
            DownloadParams {
                child_hash: "missing".into(),
                ..download_params("http://media.test/v.mp4")
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
    assert_eq!(h.engine.created.load(Ordering::SeqCst), 0);
    assert!(h.container.active.is_empty());
}

#[tokio::test]
async fn list_filters_by_status() {
    let h = harness(&[item("a", 10, 100), item("b", 0, 100), item("c", 100, 100)]).await;

    let pending = h
        .container
        .api
        .list(ListParams {
            show_completed: false,
            show_pending: true,
            show_hidden: false,
        })
        .unwrap();
    let mut hashes: Vec<&str> = pending.items.iter().map(|i| i.hash.as_str()).collect();
    hashes.sort();
    assert_eq!(hashes, vec!["a", "b"]);
    assert_eq!(pending.items.iter().find(|i| i.hash == "a").unwrap().percentage, 10);
    assert!(pending.message.is_none());

    let none = h.container.api.list(ListParams::default()).unwrap();
    assert!(none.items.is_empty());
    assert!(none.message.is_some());
}

#[tokio::test]
async fn flush_refuses_active_download() {
    let h = harness(&[]).await;
    let url = "http://media.test/slow.mp4";
    let gate = CancellationToken::new();
    h.engine
        .script(url, 100, vec![Step::Progress(25), Step::Wait(gate.clone()), Step::Complete]);

    let (conn, mut rx) = Connection::channel(64);
    let id = h
        .container
        .api
        .download(conn, download_params(url))
        .await
        .unwrap()
        .download_id;
    common::next_frame(&mut rx).await;
    let before = h.container.manager.get(&id).unwrap();

    let err = h
        .container
        .api
        .flush(FlushParams {
            download_id: Some(id.clone()),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "STILL_ACTIVE");
    let after = h.container.manager.get(&id).unwrap();
    assert_eq!((after.downloaded, after.total_size), (before.downloaded, before.total_size));
    assert!(h.engine.discarded.lock().is_empty());

    let stopped = h.container.api.stop(id_params(&id)).await.unwrap();
    assert!(stopped.stopped);
    let frames = frames_until(&mut rx, is_action("download_stopped")).await;
    assert_eq!(frames.len(), 1);
    assert!(drain_quiet(&mut rx).await.is_empty());

    wait_until(|| !h.container.active.contains(&id)).await;
    let flushed = h
        .container
        .api
        .flush(FlushParams {
            download_id: Some(id.clone()),
        })
        .await
        .unwrap();
    assert_eq!(flushed.flushed, vec![id.clone()]);
    assert!(!h.container.manager.contains(&id));
    assert_eq!(*h.engine.discarded.lock(), vec![id]);
}

#[tokio::test]
async fn flush_all_takes_only_completed() {
    let h = harness(&[item("done", 5, 5), item("partial", 1, 5)]).await;
    let flushed = h
        .container
        .api
        .flush(FlushParams::default())
        .await
        .unwrap();
    assert_eq!(flushed.flushed, vec!["done".to_string()]);
    assert!(h.container.manager.contains("partial"));
}

#[tokio::test]
async fn stop_is_idempotent() {
    let h = harness(&[]).await;
    let (watcher, mut rx) = Connection::channel(8);
    h.container.pool.add_download("ghost", &watcher);

    let first = h.container.api.stop(id_params("ghost")).await.unwrap();
    assert!(!first.stopped);
    assert_eq!(action(&common::next_frame(&mut rx).await), "download_stopped");

    let second = h.container.api.stop(id_params("ghost")).await.unwrap();
    assert!(!second.stopped);
    assert!(drain_quiet(&mut rx).await.is_empty());
}

#[tokio::test]
async fn resume_of_complete_item_skips_engine() {
    let h = harness(&[item("whole", 80, 80)]).await;
    let (conn, mut rx) = Connection::channel(8);
    let response = h.container.api.resume(conn, resume_params("whole")).await.unwrap();
    assert_eq!(response.downloaded, 80);

    let frame = common::next_frame(&mut rx).await;
    assert_eq!(action(&frame), "download_complete");
    assert_eq!(frame["update"]["message"]["value"], 80);
    assert!(h.engine.resumed.lock().is_empty());
}

#[tokio::test]
async fn resume_of_active_download_is_rejected() {
    let h = harness(&[item("busy", 0, 10)]).await;
    let gate = CancellationToken::new();
    h.engine.script(
        "http://media.test/busy",
        10,
        vec![Step::Wait(gate.clone()), Step::Complete],
    );

    let (conn, _rx) = Connection::channel(8);
    h.container.api.resume(conn.clone(), resume_params("busy")).await.unwrap();
    let err = h
        .container
        .api
        .resume(conn, resume_params("busy"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ALREADY_ACTIVE");
    gate.cancel();
}

#[tokio::test]
async fn compiled_pair_resume_only_reports_completion() {
    let mut primary = item("p3", 100, 100);
    primary.child_hash = Some("c3".into());
    primary.compiled = true;
    let h = harness(&[primary, item("c3", 20, 20)]).await;

    let (conn, mut rx) = Connection::channel(16);
    h.container.api.resume(conn, resume_params("p3")).await.unwrap();

    let frames = frames_until(&mut rx, is_action("compile_complete")).await;
    assert_eq!(frames.len(), 3);
    assert_eq!(h.compiler.calls(), 0);
    assert!(h.engine.resumed.lock().is_empty());
}

#[tokio::test]
async fn dispatch_rejects_unknown_and_malformed_requests() {
    let h = harness(&[]).await;
    let (conn, _rx) = Connection::channel(8);

    let err = h
        .container
        .registry
        .dispatch("explode", json!({}), conn.clone())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "UNKNOWN_COMMAND");

    let err = h
        .container
        .registry
        .dispatch("download", json!({"url": 42}), conn.clone())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "DECODE_ERROR");
    assert_eq!(h.engine.created.load(Ordering::SeqCst), 0);

    let err = h
        .container
        .registry
        .dispatch("download", json!({"url": "ftp://x/y"}), conn)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
}

#[tokio::test]
async fn pair_compile_events_come_only_from_the_merge() {
    let mut primary = item("p5", 0, 100);
    primary.child_hash = Some("c5".into());
    let mut child = item("c5", 0, 50);
    child.children = true;
    let h = harness(&[primary.clone(), child.clone()]).await;
    h.engine.script(
        &primary.url,
        100,
        vec![Step::Progress(100), Step::Assemble, Step::Complete],
    );
    h.engine.script(
        &child.url,
        50,
        vec![Step::Progress(50), Step::Assemble, Step::Complete],
    );

    let (conn, mut rx) = Connection::channel(64);
    h.container.api.resume(conn, resume_params("p5")).await.unwrap();

    let mut frames = frames_until(&mut rx, is_action("compile_complete")).await;
    frames.extend(drain_quiet(&mut rx).await);

    let compile: Vec<(usize, &serde_json::Value)> = frames
        .iter()
        .enumerate()
        .filter(|(_, f)| action(f).starts_with("compile"))
        .collect();
    let compile_actions: Vec<&str> = compile.iter().map(|(_, f)| action(f)).collect();
    assert_eq!(
        compile_actions,
        vec!["compile_start", "compile_progress", "compile_complete"]
    );
    assert!(compile.iter().all(|(_, f)| f["update"]["message"]["hash"] == "p5"));

    let last_download = frames
        .iter()
        .rposition(|f| action(f) == "download_complete")
        .unwrap();
    assert_eq!(
        frames.iter().filter(|f| action(f) == "download_complete").count(),
        2
    );
    assert!(compile[0].0 > last_download);
    assert_eq!(action(frames.last().unwrap()), "compile_complete");
    assert_eq!(h.compiler.calls(), 1);
}

#[tokio::test]
async fn stopping_paired_primary_leaves_child_running() {
    let mut primary = item("p6", 0, 100);
    primary.child_hash = Some("c6".into());
    let mut child = item("c6", 0, 50);
    child.children = true;
    let h = harness(&[primary.clone(), child.clone()]).await;

    let primary_gate = CancellationToken::new();
    let child_gate = CancellationToken::new();
    h.engine.script(
        &primary.url,
        100,
        vec![Step::Progress(10), Step::Wait(primary_gate.clone()), Step::Complete],
    );
    h.engine.script(
        &child.url,
        50,
        vec![
            Step::Progress(5),
            Step::Wait(child_gate.clone()),
            Step::Progress(45),
            Step::Complete,
        ],
    );

    let (conn, mut rx) = Connection::channel(64);
    h.container.api.resume(conn, resume_params("p6")).await.unwrap();
    assert!(h.container.active.contains("p6"));
    assert!(h.container.active.contains("c6"));

    let stopped = h.container.api.stop(id_params("p6")).await.unwrap();
    assert!(stopped.stopped);
    let mut frames = frames_until(&mut rx, is_action("download_stopped")).await;

    wait_until(|| !h.container.active.contains("p6")).await;
    assert!(h.container.active.contains("c6"));
    child_gate.cancel();
    wait_until(|| h.container.manager.get("c6").is_ok_and(|i| i.completed)).await;
    assert_eq!(h.container.manager.get("c6").unwrap().downloaded, 50);

    frames.extend(drain_quiet(&mut rx).await);
    assert_eq!(
        frames.iter().filter(|f| action(f) == "download_stopped").count(),
        1
    );
    assert!(frames.iter().all(|f| !action(f).starts_with("compile")));
    assert_eq!(h.compiler.calls(), 0);
    assert!(!h.container.manager.get("p6").unwrap().compiled);
}

#[tokio::test]
async fn standalone_failure_reports_one_error_then_stopped() {
    let h = harness(&[]).await;
    let url = "http://media.test/broken.mp4";
    h.engine
        .script(url, 40, vec![Step::Progress(10), Step::Fail("disk full")]);

    let (conn, mut rx) = Connection::channel(64);
    let id = h
        .container
        .api
        .download(conn, download_params(url))
        .await
        .unwrap()
        .download_id;

    let frames = frames_until(&mut rx, is_action("download_stopped")).await;
    assert_eq!(frames.len(), 3);
    assert_eq!(action(&frames[0]), "download_progress");
    assert_eq!(frames[1]["ok"], false);
    assert_eq!(frames[1]["error"]["severity"], "critical");
    assert_eq!(frames[1]["error"]["downloadId"], id.as_str());
    assert!(drain_quiet(&mut rx).await.is_empty());

    wait_until(|| !h.container.active.contains(&id)).await;
    assert!(!h.container.pool.has_download(&id));
}

#[tokio::test]
async fn overlapping_resumes_leave_the_winner_untouched() {
    let h = harness(&[item("race", 40, 100)]).await;
    let gate = CancellationToken::new();
    h.engine.script(
        "http://media.test/race",
        100,
        vec![Step::Progress(10), Step::Wait(gate.clone()), Step::Complete],
    );
    let engine_gate = CancellationToken::new();
    *h.engine.resume_gate.lock() = Some(engine_gate.clone());

    let api = Arc::clone(&h.container.api);
    let (first, mut first_rx) = Connection::channel(16);
    let winner = tokio::spawn(async move { api.resume(first, resume_params("race")).await });
    wait_until(|| h.engine.resumed.lock().len() == 1).await;

    let (second, mut second_rx) = Connection::channel(16);
    let err = h
        .container
        .api
        .resume(second, resume_params("race"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ALREADY_ACTIVE");
    assert_eq!(h.engine.resumed.lock().len(), 1);
    assert_eq!(h.container.pool.subscriber_count("race"), 0);

    engine_gate.cancel();
    winner.await.unwrap().unwrap();
    assert_eq!(action(&common::next_frame(&mut first_rx).await), "download_progress");
    assert_eq!(h.container.manager.get("race").unwrap().downloaded, 50);
    assert_eq!(h.container.pool.subscriber_count("race"), 1);
    assert!(drain_quiet(&mut second_rx).await.is_empty());
    gate.cancel();
}

#[tokio::test]
async fn attach_to_child_joins_the_pair() {
    let mut primary = item("p7", 0, 100);
    primary.child_hash = Some("c7".into());
    let mut child = item("c7", 0, 50);
    child.children = true;
    let h = harness(&[primary.clone(), child.clone()]).await;
    let gate = CancellationToken::new();
    h.engine
        .script(&primary.url, 100, vec![Step::Wait(gate.clone()), Step::Complete]);
    h.engine
        .script(&child.url, 50, vec![Step::Wait(gate.clone()), Step::Complete]);

    let (owner, _owner_rx) = Connection::channel(64);
    h.container.api.resume(owner, resume_params("p7")).await.unwrap();

    let (late, mut late_rx) = Connection::channel(64);
    let response = h.container.api.attach(late, id_params("c7")).await.unwrap();
    assert_eq!(response.download_id, "p7");
    assert_eq!(h.container.pool.subscriber_count("p7"), 2);
    assert!(!h.container.pool.has_download("c7"));

    gate.cancel();
    let frames = frames_until(&mut late_rx, is_action("compile_complete")).await;
    assert!(frames.iter().all(|f| f["update"]["message"]["downloadId"] == "p7"));
}
