//! Entries shared between checkouts at different locations.

use color_eyre::Result;
use pretty_assertions::assert_eq as pretty_assert_eq;
use protocol::{CasKey, ProcessLogLine, Storage};
use stash::{CacheClientConfig, cmd_key};

use crate::{BUCKET, Fixture};

#[test_log::test]
fn moved_checkout_hits() -> Result<()> {
    let fixture = Fixture::new();
    let first = fixture.checkout("first");
    let second = fixture.checkout("second");
    for checkout in [&first, &second] {
        checkout.write("src/main.c", "int main;");
    }
    first.write("out/main.o", "object");
    pretty_assert_eq!(
        cmd_key(&first.roots, &first.compile("src/main.c", "out/main.o")),
        cmd_key(&second.roots, &second.compile("src/main.c", "out/main.o")),
    );

    assert!(first.store(&fixture.client()?, "src/main.c", "out/main.o", &[ProcessLogLine::info("main.c")]));
    let result = second.fetch(&fixture.client()?, "src/main.c", "out/main.o");
    assert!(result.hit);
    pretty_assert_eq!(result.log_lines, vec![ProcessLogLine::info("main.c")]);
    pretty_assert_eq!(second.read("out/main.o")?, "object");
    Ok(())
}

#[test]
fn unregistered_location_misses() -> Result<()> {
    let fixture = Fixture::new();
    let first = fixture.checkout("first");
    let mut second = fixture.checkout("second");
    for checkout in [&first, &second] {
        checkout.write("src/main.c", "int main;");
    }
    first.write("out/main.o", "object");
    assert!(first.store(&fixture.client()?, "src/main.c", "out/main.o", &[]));

    second.roots = Default::default();
    assert!(!second.fetch(&fixture.client()?, "src/main.c", "out/main.o").hit);
    Ok(())
}

#[test_log::test]
fn embedded_paths_follow_the_checkout() -> Result<()> {
    let fixture = Fixture::new();
    let config = || {
        CacheClientConfig::builder()
            .normalize_extensions(vec![String::from("d")])
            .build()
    };
    let first = fixture.checkout("first");
    let second = fixture.checkout("second");
    for checkout in [&first, &second] {
        checkout.write("src/main.c", "int main;");
        // Inputs embedding the root hash the same everywhere.
        let root = checkout.root_str();
        checkout.write("src/main.d", format!("{root}/src/main.c: {root}/include/config.h\n"));
    }
    let root = first.root_str();
    first.write("out/main.o", "object");
    first.write("out/main.o.d", format!("{root}/out/main.o: {root}/src/main.c\n"));

    let process = first.compile("src/main.c", "out/main.o");
    assert!(fixture.client_with(config())?.write_to_cache(
        &first.roots,
        BUCKET,
        &process,
        &[first.path("src/main.c"), first.path("src/main.d")],
        &[first.path("out/main.o"), first.path("out/main.o.d")],
        &[],
        1,
    ));
    // The stored dependency file holds no absolute path.
    let normalized = format!("\u{1}A/out/main.o: \u{1}A/src/main.c\n");
    let key = CasKey::from_buffer(&normalized).as_normalized(true);
    pretty_assert_eq!(fixture.storage.read(&key)?, Some(normalized.into_bytes()));

    let process = second.compile("src/main.c", "out/main.o");
    let result = fixture
        .client_with(config())?
        .fetch_from_cache(&second.roots, BUCKET, &process);
    assert!(result.hit);
    let root = second.root_str();
    pretty_assert_eq!(second.read("out/main.o")?, "object");
    pretty_assert_eq!(
        second.read("out/main.o.d")?,
        format!("{root}/out/main.o: {root}/src/main.c\n")
    );
    Ok(())
}
