use color_eyre::Result;
use pretty_assertions::assert_eq as pretty_assert_eq;
use simple_test_case::test_case;

use crate::Fixture;

#[test_case("save", "saved 0 buckets"; "save")]
#[test_case("maintenance", "maintenance scheduled"; "maintenance")]
#[test]
fn execute_command(command: &str, expected: &str) -> Result<()> {
    let fixture = Fixture::new();
    pretty_assert_eq!(fixture.client()?.execute_command(command)?, expected);
    Ok(())
}

#[test]
fn status_lists_stored_buckets() -> Result<()> {
    let fixture = Fixture::new();
    let client = fixture.client()?;
    let checkout = fixture.checkout("work");
    checkout.write("src/main.c", "int main;");
    checkout.write("out/main.o", "object");
    assert!(checkout.store(&client, "src/main.c", "out/main.o", &[]));

    let status = client.execute_command("status")?;
    assert!(status.contains("\"connections\": 1"), "{status}");
    assert!(status.contains("\"entries\": 1"), "{status}");
    Ok(())
}

#[test]
fn unknown_command_is_an_error() -> Result<()> {
    let fixture = Fixture::new();
    assert!(fixture.client()?.execute_command("defragment").is_err());
    Ok(())
}

#[test]
fn shutdown_request_reaches_the_server() -> Result<()> {
    let fixture = Fixture::new();
    assert!(!fixture.server.should_shutdown());
    fixture.client()?.request_server_shutdown("tests done")?;
    assert!(fixture.server.should_shutdown());
    Ok(())
}

#[test]
fn client_name_is_sent_on_connect() -> Result<()> {
    let fixture = Fixture::new();
    let client = fixture.client()?;
    pretty_assert_eq!(client.config().client_name, "stash");
    pretty_assert_eq!(fixture.server.status().connections, 1);
    drop(client);
    pretty_assert_eq!(fixture.server.status().connections, 0);
    Ok(())
}
