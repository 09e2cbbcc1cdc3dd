use std::collections::BTreeSet;

use color_eyre::Result;
use depot::InProcessClient;
use pretty_assertions::assert_eq as pretty_assert_eq;
use protocol::{
    CACHE_NETWORK_VERSION, CasKey, CaseSensitivity, CompactPathTable, MessageType, NetworkClient,
    NetworkClientExt,
    message::{ConnectRequest, FetchEntriesRequest, FetchEntriesResponse, StoreEntryResponse},
};

use crate::{BUCKET, FetchedEntry, TestServer, pairs};

#[test_log::test]
fn store_then_fetch() -> Result<()> {
    let server = TestServer::new();
    let input = server.blob(b"int main() {}");
    let output = server.blob(b"\x7fELF");
    let cmd = CasKey::from_buffer(b"cc -c main.c");

    let mut session = server.connect()?;
    let inputs = [("/src/main.c", input)];
    let outputs = [("/out/main.o", output)];
    let id = session.store_committed(&cmd, &inputs, &outputs, b"warning: unused")?;
    pretty_assert_eq!(id, 1);

    let fetched = server.connect()?.fetch(&cmd)?;
    pretty_assert_eq!(
        fetched,
        vec![FetchedEntry {
            id: 1,
            inputs: pairs(&inputs),
            outputs: pairs(&outputs),
            log_lines: b"warning: unused".to_vec(),
        }]
    );
    Ok(())
}

#[test]
fn fetch_unknown_command_is_empty() -> Result<()> {
    let server = TestServer::new();
    let session = server.connect()?;
    let response = session.fetch_raw(&CasKey::from_buffer(b"never stored"))?;
    assert!(response.entries.is_empty());
    Ok(())
}

#[test]
fn identical_store_reuses_entry() -> Result<()> {
    let server = TestServer::new();
    let cmd = CasKey::from_buffer(b"cmd");
    let inputs = [("/a.h", server.blob(b"a"))];
    let outputs = [("/a.o", server.blob(b"o"))];

    let mut session = server.connect()?;
    let first = session.store_committed(&cmd, &inputs, &outputs, b"")?;
    let second = session.store_committed(&cmd, &inputs, &outputs, b"")?;
    pretty_assert_eq!(first, second);
    pretty_assert_eq!(server.server.entry_count(BUCKET, &cmd), 1);
    Ok(())
}

#[test]
fn clients_with_different_tables_agree() -> Result<()> {
    let server = TestServer::new();
    let cmd = CasKey::from_buffer(b"cmd");
    let x = ("/src/x.h", server.blob(b"x"));
    let y = ("/src/y.h", server.blob(b"y"));
    let output = ("/out/o", server.blob(b"o"));

    let mut alice = server.connect()?;
    let first = alice.store_committed(&cmd, &[x, y], &[output], b"")?;

    // Registers the files in another order, so its offsets differ.
    let mut bob = server.connect()?;
    bob.file("/unrelated/file", &CasKey::from_buffer(b"unrelated"));
    let second = bob.store_committed(&cmd, &[y, x], &[output], b"")?;

    pretty_assert_eq!(first, second);
    Ok(())
}

#[test]
fn newest_entry_comes_first() -> Result<()> {
    let server = TestServer::new();
    let cmd = CasKey::from_buffer(b"cmd");
    let input = ("/a.c", server.blob(b"a"));

    let mut session = server.connect()?;
    let first = session.store_committed(&cmd, &[input], &[("/a.o", server.blob(b"v1"))], b"")?;
    let second = session.store_committed(&cmd, &[input], &[("/a.o", server.blob(b"v2"))], b"")?;
    pretty_assert_eq!((first, second), (1, 2));

    let ids = |session: &crate::Session| -> Result<Vec<u32>> {
        Ok(session.fetch(&cmd)?.into_iter().map(|entry| entry.id).collect())
    };
    pretty_assert_eq!(ids(&session)?, vec![2, 1]);

    session.report_used(&cmd, 1)?;
    pretty_assert_eq!(ids(&session)?, vec![1, 2]);
    Ok(())
}

#[test]
fn staged_entry_is_invisible_until_done() -> Result<()> {
    let server = TestServer::new();
    let cmd = CasKey::from_buffer(b"cmd");
    let content = b"not uploaded yet";
    let output = CasKey::from_buffer(content);

    let mut session = server.connect()?;
    let response = session.store(&cmd, &[], &[("/out.bin", output)], b"")?;
    let StoreEntryResponse::Staged { token, missing } = response else {
        panic!("expected staged response, got {response:?}");
    };
    pretty_assert_eq!(missing, vec![output]);
    assert!(server.connect()?.fetch(&cmd)?.is_empty());

    server.blob(content);
    let id = session.done(token, true)?;
    pretty_assert_eq!(id, 1);
    pretty_assert_eq!(server.connect()?.fetch(&cmd)?.len(), 1);
    Ok(())
}

#[test]
fn abandoned_staged_entry_is_dropped() -> Result<()> {
    let server = TestServer::new();
    let cmd = CasKey::from_buffer(b"cmd");
    let mut session = server.connect()?;
    let response = session.store(&cmd, &[], &[("/out.bin", CasKey::from_buffer(b"missing"))], b"")?;
    let StoreEntryResponse::Staged { token, .. } = response else {
        panic!("expected staged response, got {response:?}");
    };

    pretty_assert_eq!(session.done(token, false)?, 0);
    assert!(session.fetch(&cmd)?.is_empty());
    // The token is consumed either way.
    assert!(session.done(token, true).is_err());
    Ok(())
}

#[test]
fn done_with_outputs_still_missing_commits_nothing() -> Result<()> {
    let server = TestServer::new();
    let cmd = CasKey::from_buffer(b"cmd");
    let mut session = server.connect()?;
    let response = session.store(&cmd, &[], &[("/out.bin", CasKey::from_buffer(b"missing"))], b"")?;
    let StoreEntryResponse::Staged { token, .. } = response else {
        panic!("expected staged response, got {response:?}");
    };

    pretty_assert_eq!(session.done(token, true)?, 0);
    assert!(session.fetch(&cmd)?.is_empty());
    Ok(())
}

#[test]
fn staged_entries_belong_to_their_connection() -> Result<()> {
    let server = TestServer::new();
    let cmd = CasKey::from_buffer(b"cmd");
    let mut session = server.connect()?;
    let response = session.store(&cmd, &[], &[("/out.bin", CasKey::from_buffer(b"missing"))], b"")?;
    let StoreEntryResponse::Staged { token, .. } = response else {
        panic!("expected staged response, got {response:?}");
    };

    let other = server.connect()?;
    assert!(other.done(token, true).is_err());
    Ok(())
}

#[test]
fn requests_need_a_handshake() {
    let server = TestServer::new();
    let client = InProcessClient::new(server.server.clone());
    let request = FetchEntriesRequest::builder()
        .bucket(BUCKET)
        .cmd_key(CasKey::from_buffer(b"cmd"))
        .build();
    let err = client
        .request::<_, FetchEntriesResponse>(MessageType::FetchEntries, &request)
        .unwrap_err();
    assert!(format!("{err:#}").contains("before connect"), "{err:#}");
}

#[test]
fn version_mismatch_is_rejected() {
    let server = TestServer::new();
    let client = InProcessClient::new(server.server.clone());
    let request = ConnectRequest::builder()
        .version(CACHE_NETWORK_VERSION + 1)
        .client_name("future client")
        .build();
    let err = client
        .request::<_, u32>(MessageType::Connect, &request)
        .unwrap_err();
    assert!(format!("{err:#}").contains("does not match"), "{err:#}");
}

#[test]
fn malformed_request_is_an_error_not_a_panic() -> Result<()> {
    let server = TestServer::new();
    let session = server.connect()?;
    assert!(session.client.send(MessageType::StoreEntry, &[0xff]).is_err());
    // The connection stays usable.
    assert!(session.fetch(&CasKey::from_buffer(b"cmd"))?.is_empty());
    Ok(())
}

#[test]
fn table_pushes_resume_from_server_size() -> Result<()> {
    let server = TestServer::new();
    let session = server.connect()?;
    let table = CompactPathTable::new(CaseSensitivity::Sensitive);
    table.add("/src/a.c");
    let start = CompactPathTable::INITIAL_SIZE;
    let bytes = table.memory_from(start);

    let size = session.push_table(MessageType::StorePathTable, start, bytes.clone())?;
    pretty_assert_eq!(size, start + bytes.len() as u32);

    // A repeated push overlaps entirely and appends nothing.
    pretty_assert_eq!(session.push_table(MessageType::StorePathTable, start, bytes.clone())?, size);

    // A push past the end is ignored; the reply says where to resume.
    pretty_assert_eq!(session.push_table(MessageType::StorePathTable, size + 10, bytes)?, size);
    Ok(())
}

#[test]
fn concurrent_stores_get_distinct_increasing_ids() -> Result<()> {
    const CLIENTS: u32 = 16;
    let server = TestServer::new();
    let cmd = CasKey::from_buffer(b"cmd");
    let outputs = (0..CLIENTS)
        .map(|n| server.blob(format!("output {n}").as_bytes()))
        .collect::<Vec<_>>();

    let ids = std::thread::scope(|scope| {
        let handles = outputs
            .iter()
            .map(|output| {
                scope.spawn(|| -> Result<u32> {
                    let mut session = server.connect()?;
                    session.store_committed(&cmd, &[], &[("/out.o", *output)], b"")
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("store thread panicked"))
            .collect::<Result<BTreeSet<_>>>()
    })?;

    pretty_assert_eq!(ids, (1..=CLIENTS).collect::<BTreeSet<_>>());
    pretty_assert_eq!(server.server.entry_count(BUCKET, &cmd), CLIENTS as usize);
    Ok(())
}
