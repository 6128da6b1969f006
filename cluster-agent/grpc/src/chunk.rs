use crate::proto;

/// The largest payload carried by a single stream message, leaving room for gRPC framing so that
/// each message fits a 64 KiB frame.
pub const CHUNK_SIZE: usize = 64 * 1024 - 4;

/// Splits an encoded report into consecutive snapshot chunks.
pub fn snapshot_chunks(payload: &[u8]) -> Vec<proto::RawSnapshotChunk> {
    payload
        .chunks(CHUNK_SIZE)
        .map(|chunk| proto::RawSnapshotChunk {
            chunk: chunk.to_vec(),
        })
        .collect()
}

/// Splits an encoded diagnostics document into consecutive diagnostics chunks.
pub fn diagnostics_chunks(payload: &[u8]) -> Vec<proto::RawDiagnosticsChunk> {
    payload
        .chunks(CHUNK_SIZE)
        .map(|chunk| proto::RawDiagnosticsChunk {
            chunk: chunk.to_vec(),
        })
        .collect()
}
