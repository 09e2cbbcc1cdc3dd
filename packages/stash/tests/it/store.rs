use std::path::PathBuf;

use color_eyre::Result;
use pretty_assertions::assert_eq as pretty_assert_eq;
use protocol::{CasKey, ProcessLogLine, Storage};
use stash::{CacheClientConfig, MissReason};

use crate::{BUCKET, Fixture};

#[test_log::test]
fn store_uploads_outputs() -> Result<()> {
    let fixture = Fixture::new();
    let checkout = fixture.checkout("work");
    checkout.write("src/main.c", "int main;");
    checkout.write("out/main.o", "object");

    assert!(checkout.store(&fixture.client()?, "src/main.c", "out/main.o", &[]));
    assert!(fixture.storage.exists(&CasKey::from_buffer(b"object"))?);
    // Sources are hashed, never uploaded.
    assert!(!fixture.storage.exists(&CasKey::from_buffer(b"int main;"))?);
    Ok(())
}

#[test]
fn missing_output_stores_nothing() -> Result<()> {
    let fixture = Fixture::new();
    let client = fixture.client()?;
    let checkout = fixture.checkout("work");
    checkout.write("src/main.c", "int main;");

    assert!(!checkout.store(&client, "src/main.c", "out/main.o", &[]));
    let result = checkout.fetch(&client, "src/main.c", "out/main.o");
    pretty_assert_eq!(result.miss_reason, Some(MissReason::NoEntries));
    Ok(())
}

#[test]
fn missing_input_stores_nothing() -> Result<()> {
    let fixture = Fixture::new();
    let client = fixture.client()?;
    let checkout = fixture.checkout("work");
    checkout.write("out/main.o", "object");

    assert!(!checkout.store(&client, "src/main.c", "out/main.o", &[]));
    assert!(!fixture.storage.exists(&CasKey::from_buffer(b"object"))?);
    Ok(())
}

#[test]
fn outputs_with_equal_content() -> Result<()> {
    let fixture = Fixture::new();
    let client = fixture.client()?;
    let checkout = fixture.checkout("work");
    checkout.write("src/gen.py", "print()");
    checkout.write("out/a.h", "#pragma once");
    checkout.write("out/b.h", "#pragma once");
    let process = checkout.compile("src/gen.py", "out");
    let outputs = [checkout.path("out/a.h"), checkout.path("out/b.h")];

    assert!(client.write_to_cache(
        &checkout.roots,
        BUCKET,
        &process,
        &[checkout.path("src/gen.py")],
        &outputs,
        &[],
        1,
    ));

    checkout.remove("out/a.h");
    checkout.remove("out/b.h");
    assert!(client.fetch_from_cache(&checkout.roots, BUCKET, &process).hit);
    pretty_assert_eq!(checkout.read("out/a.h")?, "#pragma once");
    pretty_assert_eq!(checkout.read("out/b.h")?, "#pragma once");
    Ok(())
}

#[test]
fn entry_without_inputs_always_hits() -> Result<()> {
    let fixture = Fixture::new();
    let client = fixture.client()?;
    let checkout = fixture.checkout("work");
    checkout.write("out/version.h", "#define VERSION 3");
    let process = checkout.compile("gen-version", "out/version.h");

    assert!(client.write_to_cache(
        &checkout.roots,
        BUCKET,
        &process,
        &Vec::<PathBuf>::new(),
        &[checkout.path("out/version.h")],
        &[ProcessLogLine::info("generated")],
        1,
    ));
    let result = client.fetch_from_cache(&checkout.roots, BUCKET, &process);
    assert!(result.hit);
    pretty_assert_eq!(result.log_lines, vec![ProcessLogLine::info("generated")]);
    Ok(())
}

#[test]
fn validated_store() -> Result<()> {
    let fixture = Fixture::new();
    let config = CacheClientConfig::builder()
        .validate_cache_writes_input(true)
        .validate_cache_writes_output(true)
        .build();
    let client = fixture.client_with(config)?;
    let checkout = fixture.checkout("work");
    checkout.write("src/main.c", "int main;");
    checkout.write("out/main.o", "object");

    assert!(checkout.store(&client, "src/main.c", "out/main.o", &[]));
    assert!(checkout.fetch(&client, "src/main.c", "out/main.o").hit);
    Ok(())
}

#[test]
fn buckets_do_not_share_entries() -> Result<()> {
    let fixture = Fixture::new();
    let client = fixture.client()?;
    let checkout = fixture.checkout("work");
    checkout.write("src/main.c", "int main;");
    checkout.write("out/main.o", "object");
    assert!(checkout.store(&client, "src/main.c", "out/main.o", &[]));

    let process = checkout.compile("src/main.c", "out/main.o");
    assert!(!client.fetch_from_cache(&checkout.roots, BUCKET + 1, &process).hit);
    assert!(client.fetch_from_cache(&checkout.roots, BUCKET, &process).hit);
    Ok(())
}

#[test_log::test]
fn concurrent_stores_from_one_client() -> Result<()> {
    let fixture = Fixture::new();
    let client = fixture.client()?;
    let checkout = fixture.checkout("work");
    let names = (0..8).map(|n| format!("unit{n}")).collect::<Vec<_>>();
    for name in &names {
        checkout.write(&format!("src/{name}.c"), format!("int {name};"));
        checkout.write(&format!("out/{name}.o"), format!("{name} object"));
    }

    let stored = std::thread::scope(|scope| {
        let handles = names
            .iter()
            .map(|name| {
                let (client, checkout) = (&client, &checkout);
                scope.spawn(move || {
                    checkout.store(client, &format!("src/{name}.c"), &format!("out/{name}.o"), &[])
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    });
    assert!(stored.iter().all(|stored| *stored));

    let other = fixture.client()?;
    for name in &names {
        let source = format!("src/{name}.c");
        let output = format!("out/{name}.o");
        checkout.remove(&output);
        assert!(checkout.fetch(&other, &source, &output).hit, "{name} should hit");
        pretty_assert_eq!(checkout.read(&output)?, format!("{name} object"));
    }
    Ok(())
}

#[test]
fn preparsed_directory_still_hashes_correctly() -> Result<()> {
    let fixture = Fixture::new();
    let client = fixture.client()?;
    let checkout = fixture.checkout("work");
    checkout.write("src/main.c", "int main;");
    checkout.write("src/util.c", "int util;");
    checkout.write("out/main.o", "object");

    pretty_assert_eq!(client.preparse_directory(checkout.path("src"))?, 2);
    pretty_assert_eq!(client.preparse_directory(checkout.path("src"))?, 0);
    assert!(checkout.store(&client, "src/main.c", "out/main.o", &[]));

    checkout.write("src/main.c", "int main(void);");
    assert!(!checkout.fetch(&client, "src/main.c", "out/main.o").hit);
    Ok(())
}
