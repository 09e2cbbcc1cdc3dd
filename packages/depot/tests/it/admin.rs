use color_eyre::Result;
use pretty_assertions::assert_eq as pretty_assert_eq;
use protocol::{CasKey, MessageType, NetworkClientExt};
use simple_test_case::test_case;

use crate::TestServer;

#[test]
fn status_reports_buckets_as_json() -> Result<()> {
    let server = TestServer::new();
    let mut session = server.connect()?;
    session.store_committed(&CasKey::from_buffer(b"cmd"), &[], &[("/a.o", server.blob(b"o"))], b"")?;

    let status = session
        .client
        .request::<_, String>(MessageType::ExecuteCommand, &String::from("status"))?;
    let status = serde_json::from_str::<serde_json::Value>(&status)?;
    pretty_assert_eq!(status["connections"], 1);
    pretty_assert_eq!(status["buckets"][0]["id"], 1);
    pretty_assert_eq!(status["buckets"][0]["entries"], 1);
    pretty_assert_eq!(status["buckets"][0]["dirty"], true);
    Ok(())
}

#[test_case("save", "saved 0 buckets"; "save")]
#[test_case("maintenance", "maintenance scheduled"; "maintenance")]
#[test_case("  save\n", "saved 0 buckets"; "surrounding_whitespace")]
#[test]
fn commands(command: &str, expected: &str) -> Result<()> {
    let server = TestServer::new();
    pretty_assert_eq!(server.server.execute_command(command)?, expected);
    Ok(())
}

#[test]
fn unknown_command_is_an_error() -> Result<()> {
    let server = TestServer::new();
    let session = server.connect()?;
    let err = session
        .client
        .request::<_, String>(MessageType::ExecuteCommand, &String::from("defragment"))
        .unwrap_err();
    assert!(format!("{err:#}").contains("unknown command"), "{err:#}");
    Ok(())
}

#[test]
fn shutdown_request_sets_flag() -> Result<()> {
    let server = TestServer::new();
    let session = server.connect()?;
    assert!(!server.server.should_shutdown());
    session
        .client
        .request::<_, ()>(MessageType::RequestShutdown, &String::from("deploying"))?;
    assert!(server.server.should_shutdown());
    Ok(())
}
