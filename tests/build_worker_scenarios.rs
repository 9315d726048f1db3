// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! End-to-end coordination scenarios for the Build worker (spec.md §8's
//! Testable Scenarios), exercised against a `FakeBroker` and a fake chain
//! tool implemented as a tiny shell script, since RabbitMQ/the real chain
//! node are out-of-scope external collaborators (spec.md §1).

use std::{io::Write, os::unix::fs::PermissionsExt, sync::Arc};

use clap::Parser;
use forest_snapshot_pipeline::{
    broker::{fake::FakeBroker, BrokerClient, Stream},
    chain_tool::ChainTool,
    config::PipelineConfig,
    metadata::SnapshotVariant,
    metrics::PipelineMetrics,
    worker::{build::build_variant, WorkerContext},
};

/// Write an executable shell script standing in for `forest-cli`: it
/// inspects its own argv to decide how to respond, mirroring the handful of
/// subcommands Build actually invokes (`chain genesis`, `snapshot export`,
/// `archive metadata`, `archive info`).
fn fake_chain_tool(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("forest-cli");
    let script = r#"#!/bin/sh
case "$1 $2" in
  "chain genesis")
    echo '{"Blocks":[{"Timestamp":1598306400}]}'
    ;;
  "snapshot export"|"snapshot export-diff")
    shift
    out=""
    while [ "$#" -gt 0 ]; do
      case "$1" in
        --output-path) out="$2"; shift 2 ;;
        *) shift ;;
      esac
    done
    echo "fake car bytes" > "$out"
    ;;
  "archive metadata")
    cat <<EOF
Snapshot version: 1
Head Tipset: bafy2bzacaexample
CAR format: v1
Network: calibnet
Epoch: 30000
State-roots: 900
Messages sets: 12
Index size: 4 MiB
EOF
    ;;
  "archive info")
    echo "Info: ok"
    ;;
  *)
    echo "unrecognized args: $@" >&2
    exit 1
    ;;
esac
"#;
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(script.as_bytes()).unwrap();
    let mut perms = f.metadata().unwrap().permissions();
    perms.set_mode(0o755);
    f.set_permissions(perms).unwrap();
    path
}

fn test_ctx(tool_dir: &std::path::Path, snapshot_root: &std::path::Path) -> (WorkerContext, Arc<FakeBroker>) {
    let binary = fake_chain_tool(tool_dir);
    let config = Arc::new(
        PipelineConfig::try_parse_from([
            "forest-snapshotd",
            "--role",
            "build",
            "--rabbitmq-pass",
            "x",
            "--chain",
            "calibnet",
            "--snapshot-path",
            &snapshot_root.join("snaps").to_string_lossy(),
            "--snapshot-archive-path",
            &snapshot_root.join("archive").to_string_lossy(),
        ])
        .unwrap(),
    );
    let broker = Arc::new(FakeBroker::new());
    let ctx = WorkerContext {
        config,
        broker: broker.clone() as Arc<dyn BrokerClient>,
        chain_tool: ChainTool::new(binary.to_string_lossy().into_owned()),
        metrics: Arc::new(PipelineMetrics::new("build")),
        notifier: None,
        object_store: None,
        docker: None,
    };
    (ctx, broker)
}

/// S1-style scenario (spec.md §8): a lite snapshot built from scratch
/// exports the tool, harvests its metadata, and publishes a routed envelope
/// whose filename-embedded epoch matches `build_information.epoch`
/// (Testable Property 3).
#[tokio::test]
async fn build_variant_exports_harvests_and_publishes_lite_snapshot() {
    let tool_dir = tempfile::tempdir().unwrap();
    let snapshot_root = tempfile::tempdir().unwrap();
    let (ctx, broker) = test_ctx(tool_dir.path(), snapshot_root.path());

    broker.declare(Stream::Snapshot).await.unwrap();

    build_variant(&ctx, SnapshotVariant::Lite, 30_000).await.unwrap();

    let (_, body) = broker.consume(Stream::Snapshot).await.unwrap().expect("lite envelope published");
    let envelope = forest_snapshot_pipeline::SnapshotMetadata::from_json(&body).unwrap();
    assert_eq!(envelope.build_information.epoch, 30_000);
    assert_eq!(envelope.snapshot.epoch, 30_000);
    assert_eq!(envelope.snapshot.state_roots, 900);

    let parsed_epoch = forest_snapshot_pipeline::metadata::parse_epoch_from_filename(
        std::path::Path::new(&envelope.build_information.build_path)
            .file_name()
            .unwrap()
            .to_str()
            .unwrap(),
    );
    assert_eq!(parsed_epoch, Some(envelope.build_information.epoch));
}

/// Testable Property 5 ("no-op on existing file"): when the target path
/// already exists, Build must not invoke the chain tool at all. Asserted by
/// pointing the worker at a chain tool binary that always fails, then
/// confirming `build_variant` still succeeds because it never spawns it.
#[tokio::test]
async fn build_variant_skips_export_when_output_already_exists() {
    let tool_dir = tempfile::tempdir().unwrap();
    let snapshot_root = tempfile::tempdir().unwrap();
    let (ctx, broker) = test_ctx(tool_dir.path(), snapshot_root.path());
    broker.declare(Stream::Snapshot).await.unwrap();

    // Replace the fake tool with one that only answers `chain genesis` (as
    // `build_variant` always needs that for epoch-date resolution) and
    // fails on anything else, so a spawned export would be detected as a
    // hard error rather than silently succeeding.
    std::fs::write(
        tool_dir.path().join("forest-cli"),
        "#!/bin/sh\ncase \"$1 $2\" in \"chain genesis\") echo '{\"Blocks\":[{\"Timestamp\":1598306400}]}';; *) exit 7;; esac\n",
    )
    .unwrap();
    let mut perms = std::fs::metadata(tool_dir.path().join("forest-cli")).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(tool_dir.path().join("forest-cli"), perms).unwrap();

    let folder = snapshot_root.path().join("archive").join("lite");
    std::fs::create_dir_all(&folder).unwrap();
    let date = forest_snapshot_pipeline::metadata::epoch_to_date(1_598_306_400, 30, 30_000);
    let filename = forest_snapshot_pipeline::metadata::snapshot_filename(
        SnapshotVariant::Lite,
        "calibnet",
        date,
        30_000,
    );
    std::fs::write(folder.join(&filename), b"already built").unwrap();

    build_variant(&ctx, SnapshotVariant::Lite, 30_000).await.unwrap();

    // No envelope is published on the short-circuit path (matches the
    // original: `_build_snapshot` returns early and the caller only
    // publishes after a successful export+harvest).
    assert_eq!(broker.consume(Stream::Snapshot).await.unwrap(), None);
}

/// Compute/Build cursor routing (spec.md §4.3's routing table): diff
/// snapshots land on `snapshot-diff`, never `snapshot`.
#[tokio::test]
async fn build_variant_routes_diff_snapshots_to_diff_stream() {
    let tool_dir = tempfile::tempdir().unwrap();
    let snapshot_root = tempfile::tempdir().unwrap();
    let (ctx, broker) = test_ctx(tool_dir.path(), snapshot_root.path());
    broker.declare(Stream::Snapshot).await.unwrap();
    broker.declare(Stream::SnapshotDiff).await.unwrap();

    build_variant(&ctx, SnapshotVariant::Diff, 27_000).await.unwrap();

    assert_eq!(broker.consume(Stream::Snapshot).await.unwrap(), None);
    let (_, body) = broker
        .consume(Stream::SnapshotDiff)
        .await
        .unwrap()
        .expect("diff envelope published to snapshot-diff");
    let envelope = forest_snapshot_pipeline::SnapshotMetadata::from_json(&body).unwrap();
    assert_eq!(envelope.build_information.epoch, 27_000);
}
