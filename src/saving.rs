use bincode::{deserialize_from, serialize_into};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::Result;
use crate::gateway::SheetSnapshot;

fn write_snapshot<W: Write>(snapshot: &SheetSnapshot, sink: W) -> Result<W> {
    let encoder = GzEncoder::new(sink, Compression::default());
    let mut writer = BufWriter::new(encoder);
    serialize_into(&mut writer, snapshot)?;
    let encoder = writer.into_inner().map_err(|e| e.into_error())?;
    Ok(encoder.finish()?)
}

fn read_snapshot<R: Read>(source: R) -> Result<SheetSnapshot> {
    let decoder = GzDecoder::new(source);
    let mut reader = BufReader::new(decoder);
    Ok(deserialize_from(&mut reader)?)
}

/// Gzip-compressed bincode form of a snapshot.
pub fn encode_snapshot(snapshot: &SheetSnapshot) -> Result<Vec<u8>> {
    write_snapshot(snapshot, Vec::new())
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<SheetSnapshot> {
    read_snapshot(bytes)
}

pub fn save_snapshot(snapshot: &SheetSnapshot, path: impl AsRef<Path>) -> Result<()> {
    let file = File::create(path)?;
    write_snapshot(snapshot, file)?.sync_all()?;
    Ok(())
}

pub fn load_snapshot(path: impl AsRef<Path>) -> Result<SheetSnapshot> {
    read_snapshot(File::open(path)?)
}
