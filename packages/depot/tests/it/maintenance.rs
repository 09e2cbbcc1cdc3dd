use color_eyre::Result;
use depot::CacheServerConfig;
use pretty_assertions::assert_eq as pretty_assert_eq;
use protocol::{CasKey, CompactCasKeyTable, MessageType, Storage, message::StoreEntryResponse};

use crate::{BUCKET, TestServer, pairs};

#[test_log::test]
fn deleted_output_becomes_a_miss() -> Result<()> {
    let server = TestServer::new();
    let cmd = CasKey::from_buffer(b"cmd");
    let output = server.blob(b"object");
    server
        .connect()?
        .store_committed(&cmd, &[], &[("/a.o", output)], b"")?;

    server.storage.delete(&output)?;
    assert!(server.server.run_maintenance(false, || false));
    assert!(server.connect()?.fetch(&cmd)?.is_empty());
    Ok(())
}

#[test]
fn compaction_keeps_survivors_resolvable() -> Result<()> {
    let server = TestServer::new();
    let kept_cmd = CasKey::from_buffer(b"kept");
    let dropped_cmd = CasKey::from_buffer(b"dropped");
    let dropped_output = server.blob(b"dropped output");

    let mut session = server.connect()?;
    // Stored first so the survivor's records sit at higher offsets.
    session.store_committed(
        &dropped_cmd,
        &[("/src/dropped.c", server.blob(b"dropped.c"))],
        &[("/out/dropped.o", dropped_output)],
        b"",
    )?;
    let inputs = [
        ("/src/kept.c", server.blob(b"kept.c")),
        ("/include/common.h", server.blob(b"common.h")),
    ];
    let outputs = [("/out/kept.o", server.blob(b"kept.o"))];
    session.store_committed(&kept_cmd, &inputs, &outputs, b"note")?;

    let before = session.fetch(&kept_cmd)?;
    let generation = server.server.bucket_generation(BUCKET);
    let size_before = session.fetch_raw(&kept_cmd)?.cas_table_size;

    server.storage.delete(&dropped_output)?;
    assert!(server.server.run_maintenance(false, || false));

    pretty_assert_eq!(server.server.bucket_generation(BUCKET), generation + 1);
    assert!(session.fetch_raw(&kept_cmd)?.cas_table_size < size_before);
    let after = session.fetch(&kept_cmd)?;
    pretty_assert_eq!(after, before);
    pretty_assert_eq!(after[0].inputs, pairs(&inputs));
    pretty_assert_eq!(after[0].outputs, pairs(&outputs));
    assert!(session.fetch(&dropped_cmd)?.is_empty());
    Ok(())
}

#[test]
fn stale_generation_refetches_from_start() -> Result<()> {
    let server = TestServer::new();
    let cmd = CasKey::from_buffer(b"cmd");
    let doomed = server.blob(b"doomed");
    let mut session = server.connect()?;
    session.store_committed(&CasKey::from_buffer(b"doomed cmd"), &[], &[("/doomed.o", doomed)], b"")?;
    session.store_committed(&cmd, &[], &[("/kept.o", server.blob(b"kept"))], b"")?;

    let old_generation = server.server.bucket_generation(BUCKET);
    let full = session.fetch_table(MessageType::FetchCasTable, old_generation, CompactCasKeyTable::INITIAL_SIZE)?;
    let size = CompactCasKeyTable::INITIAL_SIZE + full.bytes.len() as u32;

    // Up to date: nothing new.
    let current = session.fetch_table(MessageType::FetchCasTable, old_generation, size)?;
    pretty_assert_eq!(current.generation, old_generation);
    assert!(current.bytes.is_empty());

    server.storage.delete(&doomed)?;
    server.server.run_maintenance(false, || false);

    // After compaction the same request gets the whole new table.
    let rebuilt = session.fetch_table(MessageType::FetchCasTable, old_generation, size)?;
    assert!(rebuilt.generation > old_generation);
    assert!(!rebuilt.bytes.is_empty());
    assert!(rebuilt.bytes.len() < full.bytes.len());
    Ok(())
}

#[test]
fn staged_entry_spanning_compaction_is_discarded() -> Result<()> {
    let server = TestServer::new();
    let cmd = CasKey::from_buffer(b"cmd");
    let doomed = server.blob(b"doomed");
    let mut session = server.connect()?;
    session.store_committed(&CasKey::from_buffer(b"doomed cmd"), &[], &[("/doomed.o", doomed)], b"")?;

    let late = b"uploaded late";
    let response = session.store(&cmd, &[], &[("/late.o", CasKey::from_buffer(late))], b"")?;
    let StoreEntryResponse::Staged { token, .. } = response else {
        panic!("expected staged response, got {response:?}");
    };

    server.storage.delete(&doomed)?;
    server.server.run_maintenance(false, || false);
    server.blob(late);

    pretty_assert_eq!(session.done(token, true)?, 0);
    assert!(session.fetch(&cmd)?.is_empty());
    Ok(())
}

#[test]
fn quiet_buckets_are_skipped_unless_requested() -> Result<()> {
    let server = TestServer::new();
    let cmd = CasKey::from_buffer(b"cmd");
    let output = server.blob(b"object");
    server
        .connect()?
        .store_committed(&cmd, &[], &[("/a.o", output)], b"")?;
    assert!(!server.server.run_maintenance(false, || false));
    let generation = server.server.bucket_generation(BUCKET);

    // No stores since the last pass, so the deletion goes unnoticed.
    server.storage.delete(&output)?;
    assert!(!server.server.run_maintenance(false, || false));
    pretty_assert_eq!(server.server.entry_count(BUCKET, &cmd), 1);
    pretty_assert_eq!(server.server.bucket_generation(BUCKET), generation);

    server.server.execute_command("maintenance")?;
    assert!(server.server.maintenance_requested());
    assert!(server.server.run_maintenance(false, || false));
    pretty_assert_eq!(server.server.entry_count(BUCKET, &cmd), 0);
    assert!(!server.server.maintenance_requested());
    Ok(())
}

#[test]
fn exit_request_skips_pending_buckets() -> Result<()> {
    let server = TestServer::new();
    let cmd = CasKey::from_buffer(b"cmd");
    let output = server.blob(b"object");
    server
        .connect()?
        .store_committed(&cmd, &[], &[("/a.o", output)], b"")?;
    server.storage.delete(&output)?;

    assert!(!server.server.run_maintenance(true, || true));
    pretty_assert_eq!(server.server.entry_count(BUCKET, &cmd), 1);
    Ok(())
}

#[test]
fn entries_per_command_are_capped() -> Result<()> {
    let server = TestServer::with_config(|root| {
        CacheServerConfig::builder()
            .root_dir(root)
            .max_entries_per_key(2)
            .build()
    });
    let cmd = CasKey::from_buffer(b"cmd");
    let mut session = server.connect()?;
    for n in 0..3 {
        let output = server.blob(format!("v{n}").as_bytes());
        session.store_committed(&cmd, &[], &[("/a.o", output)], b"")?;
    }

    server.server.run_maintenance(false, || false);
    let ids = session
        .fetch(&cmd)?
        .into_iter()
        .map(|entry| entry.id)
        .collect::<Vec<_>>();
    pretty_assert_eq!(ids, vec![3, 2]);
    Ok(())
}

#[test]
fn worker_count_is_bounded() {
    let server = TestServer::new();
    pretty_assert_eq!(server.server.bucket_worker_count(0), 1);
    pretty_assert_eq!(server.server.bucket_worker_count(1), 1);
    assert!(server.server.bucket_worker_count(10_000) <= num_cpus::get());
}
