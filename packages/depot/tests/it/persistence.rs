use color_eyre::Result;
use depot::CacheServerConfig;
use pretty_assertions::assert_eq as pretty_assert_eq;
use protocol::{CasKey, CompactPathTable, MessageType};

use crate::{BUCKET, Session, TestServer, pairs};

#[test_log::test]
fn saved_database_survives_restart() -> Result<()> {
    let server = TestServer::new();
    let cmd = CasKey::from_buffer(b"cmd");
    let inputs = [("/src/a.c", server.blob(b"a")), ("/src/b.h", server.blob(b"b"))];
    let outputs = [("/out/a.o", server.blob(b"a.o"))];
    let id = server
        .connect()?
        .store_committed(&cmd, &inputs, &outputs, b"compiled")?;
    pretty_assert_eq!(server.server.save()?, 1);

    let restarted = server.restart()?;
    let fetched = Session::connect(restarted.clone(), BUCKET)?.fetch(&cmd)?;
    pretty_assert_eq!(fetched.len(), 1);
    pretty_assert_eq!(fetched[0].id, id);
    pretty_assert_eq!(fetched[0].inputs, pairs(&inputs));
    pretty_assert_eq!(fetched[0].outputs, pairs(&outputs));
    pretty_assert_eq!(fetched[0].log_lines, b"compiled".to_vec());

    // Ids keep counting from where they were.
    let mut session = Session::connect(restarted, BUCKET)?;
    let next = session.store_committed(&cmd, &inputs, &[("/out/a.o", server.blob(b"a2.o"))], b"")?;
    pretty_assert_eq!(next, id + 1);
    Ok(())
}

#[test]
fn clean_buckets_are_not_rewritten() -> Result<()> {
    let server = TestServer::new();
    server
        .connect()?
        .store_committed(&CasKey::from_buffer(b"cmd"), &[], &[("/a.o", server.blob(b"o"))], b"")?;
    pretty_assert_eq!(server.server.save()?, 1);
    pretty_assert_eq!(server.server.save()?, 0);
    Ok(())
}

#[test]
fn wipe_on_load_discards_database() -> Result<()> {
    let server = TestServer::new();
    let cmd = CasKey::from_buffer(b"cmd");
    server
        .connect()?
        .store_committed(&cmd, &[], &[("/a.o", server.blob(b"o"))], b"")?;
    server.server.save()?;

    let wiping = TestServer {
        config: CacheServerConfig::builder()
            .root_dir(server.config.root_dir.clone())
            .wipe_on_load(true)
            .build(),
        ..server
    };
    let restarted = wiping.restart()?;
    pretty_assert_eq!(restarted.entry_count(BUCKET, &cmd), 0);

    // The wipe happens once; the next load finds nothing either way.
    pretty_assert_eq!(restarted.load()?, 0);
    Ok(())
}

#[test]
fn obliterate_clears_memory_and_disk() -> Result<()> {
    let server = TestServer::new();
    let cmd = CasKey::from_buffer(b"cmd");
    server
        .connect()?
        .store_committed(&cmd, &[], &[("/a.o", server.blob(b"o"))], b"")?;
    server.server.save()?;

    let output = server.server.execute_command("obliterate")?;
    pretty_assert_eq!(output, "obliterated 1 buckets");
    pretty_assert_eq!(server.server.entry_count(BUCKET, &cmd), 0);
    pretty_assert_eq!(server.restart()?.entry_count(BUCKET, &cmd), 0);
    Ok(())
}

#[test]
fn corrupt_bucket_file_fails_load() -> Result<()> {
    let server = TestServer::new();
    let dir = server.config.root_dir.join("buckets");
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join("1.bucket"), b"definitely not zstd")?;
    assert!(server.server.load().is_err());
    Ok(())
}

#[test_log::test]
fn generation_is_not_reused_after_restart() -> Result<()> {
    let server = TestServer::new();
    let mut session = server.connect()?;
    session.store_committed(&CasKey::from_buffer(b"cmd"), &[], &[("/src/a.o", server.blob(b"o"))], b"")?;
    let generation = server.server.bucket_generation(BUCKET);
    let known = session.fetch_table(MessageType::FetchPathTable, 0, CompactPathTable::INITIAL_SIZE)?;
    let known_size = CompactPathTable::INITIAL_SIZE + known.bytes.len() as u32;
    server.server.save()?;

    let restarted = server.restart()?;
    assert!(restarted.bucket_generation(BUCKET) > generation);

    // A mirror from before the restart gets the whole table again.
    let session = Session::connect(restarted, BUCKET)?;
    let resent = session.fetch_table(MessageType::FetchPathTable, generation, known_size)?;
    assert_ne!(resent.generation, generation);
    pretty_assert_eq!(resent.bytes, known.bytes);
    Ok(())
}

#[test_log::test]
fn obliterate_never_reuses_a_generation() -> Result<()> {
    let server = TestServer::new();
    let mut session = server.connect()?;
    session.store_committed(&CasKey::from_buffer(b"a"), &[], &[("/src/a.o", server.blob(b"a"))], b"")?;
    let before = server.server.bucket_generation(BUCKET);
    let stale = session.fetch_table(MessageType::FetchPathTable, 0, CompactPathTable::INITIAL_SIZE)?;
    let stale_size = CompactPathTable::INITIAL_SIZE + stale.bytes.len() as u32;

    server.server.execute_command("obliterate")?;
    let mut other = server.connect()?;
    for n in 0..6 {
        let path = format!("/very/long/directory/name/number/{n}/with/nested/output.o");
        let output = server.blob(path.as_bytes());
        other.store_committed(&CasKey::from_buffer(format!("cmd {n}")), &[], &[(path.as_str(), output)], b"")?;
    }
    other.store_committed(&CasKey::from_buffer(b"a"), &[], &[("/src/a.o", server.blob(b"a"))], b"")?;

    let after = server.server.bucket_generation(BUCKET);
    assert!(after > before);
    let full = other.fetch_table(MessageType::FetchPathTable, 0, CompactPathTable::INITIAL_SIZE)?;
    let resent = other.fetch_table(MessageType::FetchPathTable, before, stale_size)?;
    pretty_assert_eq!(resent.generation, after);
    pretty_assert_eq!(resent.bytes, full.bytes);
    Ok(())
}
