use std::path::Path;

use super::{SstError, SstReader, SstWriter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StripStats {
    pub puts: u64,
    pub tombstones: u64,
    pub bytes_dropped: u64,
}

/// Copies `src` into a new table at `dst` keeping every key and tombstone but
/// replacing each value with an empty payload.
///
/// The key sequence of the output is identical to the input, so the copy still
/// answers "which keys did this file touch" for diff consumers.
pub fn strip_values(src: &Path, dst: &Path, block_size: usize) -> Result<StripStats, SstError> {
    let reader = SstReader::open(src)?;
    let mut writer = SstWriter::create(dst, block_size)?;
    let mut stats = StripStats::default();

    for entry in reader.iter() {
        let (key, value) = entry?;
        if key.kind.is_tombstone() {
            stats.tombstones += 1;
        } else {
            stats.puts += 1;
        }
        stats.bytes_dropped += value.len() as u64;
        writer.add(&key, &[])?;
    }

    let props = writer.finish()?;
    if props.entries != stats.puts + stats.tombstones {
        return Err(SstError::Corrupt("stripped table entry count mismatch"));
    }
    Ok(stats)
}
