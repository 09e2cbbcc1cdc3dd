//! Command keys: what identifies "the same build step" across machines.

use protocol::{
    CasKey, ProcessStartInfo, ROOT_PATHS_VERSION, RootPaths, binary::BinaryWriter,
};

/// Key of a process invocation with every registered root replaced by its
/// token, so the same step in checkouts at different locations shares
/// entries.
///
/// The description is not part of the key. The root path scheme version
/// is, so that changing the scheme never produces false hits.
pub fn cmd_key(roots: &RootPaths, process: &ProcessStartInfo) -> CasKey {
    let normalize = |value: &str| match roots.normalize_content(value.as_bytes()) {
        Some(normalized) => normalized,
        None => value.as_bytes().to_vec(),
    };

    let mut writer = BinaryWriter::new();
    writer.write_u32(ROOT_PATHS_VERSION);
    writer.write_blob(&normalize(&process.application));
    writer.write_7bit(process.arguments.len() as u64);
    for argument in &process.arguments {
        writer.write_blob(&normalize(argument));
    }
    writer.write_blob(&normalize(&process.working_dir));
    CasKey::from_buffer(writer.as_slice())
}
