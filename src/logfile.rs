// cancapture/src/logfile.rs
//
// Implements the packet log table and its binary file format.
//
// This file is part of the Rust 'cancapture' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! The packet log.
//!
//! Captured packets are kept as rows of text cells, one row per packet and
//! one cell per [`Column`]. Cells may be absent, and absent cells are never
//! written to disk.
//!
//! The log file is a big-endian stream:
//!
//! ```text
//! u32  magic (0x636C6603)
//! then, until the end of the file, one record per non-empty cell:
//!   i64  row
//!   i64  column
//!   u32  length of the value in bytes (0xFFFFFFFF for a null value)
//!   ...  the value as UTF-16BE code units
//! ```
//!
//! Records are written in ascending (row, column) order.

use crate::{Direction, Error, Packet, Result, Subscribers, Timestamp};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use chrono::{Local, NaiveDateTime, TimeZone};
use log::debug;
use std::{
    fmt,
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
    sync::mpsc,
};

/// The marker at the start of every log file ("clf" plus a version byte).
pub const MAGIC: u32 = 0x636C_6603;

/// The number of columns in a row.
pub const NUM_COLUMNS: usize = 11;

/// The format of the timestamp column.
pub const TIMESTAMP_FORMAT: &str = "%d.%m.%Y %H:%M:%S%.3f";

// Rows past this are taken as a corrupt file rather than allocated.
const MAX_ROWS: i64 = 1 << 24;

// Longest cell value accepted from a file, in bytes.
const MAX_VALUE_LEN: u32 = 1 << 16;

const NULL_STRING: u32 = 0xFFFF_FFFF;

/// The columns of the log table.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Column {
    /// Row number, decimal
    Index = 0,
    /// Local time, "dd.mm.yyyy hh:mm:ss.zzz"
    Timestamp,
    /// Interface number, always 0
    Interface,
    /// "<" received or ">" sent
    Direction,
    /// Remote request flag, "0" or "1"
    Rtr,
    /// Extended ID flag, "0" or "1"
    Extended,
    /// Error frame flag, "0" or "1"
    Error,
    /// The identifier, decimal
    Identifier,
    /// Data length code, decimal
    Dlc,
    /// Data bytes as space-separated, lower-case hex
    Data,
    /// Checksum, always 0
    Crc,
}

impl Column {
    /// All columns, in table order.
    pub const ALL: [Column; NUM_COLUMNS] = [
        Column::Index,
        Column::Timestamp,
        Column::Interface,
        Column::Direction,
        Column::Rtr,
        Column::Extended,
        Column::Error,
        Column::Identifier,
        Column::Dlc,
        Column::Data,
        Column::Crc,
    ];

    /// The zero-based position of the column.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Gets the column at a position.
    pub fn from_index(idx: usize) -> Option<Self> {
        Self::ALL.get(idx).copied()
    }

    /// A short heading for the column.
    pub fn title(self) -> &'static str {
        match self {
            Column::Index => "#",
            Column::Timestamp => "Timestamp",
            Column::Interface => "Interface",
            Column::Direction => "Dir",
            Column::Rtr => "RTR",
            Column::Extended => "EFF",
            Column::Error => "ERR",
            Column::Identifier => "CAN ID",
            Column::Dlc => "DLC",
            Column::Data => "Data",
            Column::Crc => "CRC",
        }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.title())
    }
}

// ===== Row =====

/// One row of the log table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    cells: [Option<String>; NUM_COLUMNS],
}

impl Row {
    /// Renders a packet as a table row.
    pub fn from_packet(index: usize, packet: &Packet) -> Self {
        let flag = |b: bool| if b { "1" } else { "0" }.to_string();

        let mut row = Row::default();
        row.set(Column::Index, index.to_string());
        if let Some(dt) = packet.timestamp.to_local() {
            row.set(Column::Timestamp, dt.format(TIMESTAMP_FORMAT).to_string());
        }
        row.set(Column::Interface, "0");
        row.set(Column::Direction, packet.direction.marker());
        row.set(Column::Rtr, flag(packet.rtr));
        row.set(Column::Extended, flag(packet.extended));
        row.set(Column::Error, flag(packet.error));
        row.set(Column::Identifier, packet.identifier.to_string());
        row.set(Column::Dlc, packet.dlc.to_string());
        row.set(Column::Data, packet.data_hex());
        row.set(Column::Crc, "0");
        row
    }

    /// Gets the text of a cell, if present.
    pub fn get(&self, col: Column) -> Option<&str> {
        self.cells[col.index()].as_deref()
    }

    /// Sets a cell. An empty string removes the cell.
    pub fn set(&mut self, col: Column, value: impl Into<String>) {
        let value = value.into();
        self.cells[col.index()] = if value.is_empty() { None } else { Some(value) };
    }

    /// Determines if the row has no cells at all.
    pub fn is_empty(&self) -> bool {
        self.cells.iter().all(Option::is_none)
    }

    /// Iterates over the cells that are present, in column order.
    pub fn cells(&self) -> impl Iterator<Item = (Column, &str)> + '_ {
        Column::ALL
            .into_iter()
            .filter_map(move |col| self.get(col).map(|s| (col, s)))
    }

    /// Parses the row back into a packet.
    ///
    /// The identifier and DLC must be present. Missing flags are taken as
    /// "0", a missing direction as received, and a missing or unreadable
    /// timestamp as zero.
    pub fn to_packet(&self) -> Result<Packet> {
        let invalid =
            |what: &str, s: &str| Error::InvalidRecord(format!("bad {} '{}'", what, s));

        let direction = match self.get(Column::Direction) {
            Some(s) => Direction::from_marker(s).ok_or_else(|| invalid("direction", s))?,
            None => Direction::Received,
        };

        let flag = |col: Column| match self.get(col) {
            None | Some("0") => Ok(false),
            Some("1") => Ok(true),
            Some(s) => Err(invalid(col.title(), s)),
        };

        let id = self
            .get(Column::Identifier)
            .ok_or_else(|| Error::InvalidRecord("missing CAN ID".into()))?;
        let identifier: u32 = id.trim().parse().map_err(|_| invalid("CAN ID", id))?;

        let dlc = self
            .get(Column::Dlc)
            .ok_or_else(|| Error::InvalidRecord("missing DLC".into()))?;
        let dlc: u8 = dlc.parse().map_err(|_| invalid("DLC", dlc))?;

        let data = match self.get(Column::Data) {
            Some(s) => {
                let digits: String = s.split_whitespace().collect();
                hex::decode(digits).map_err(|_| invalid("data", s))?
            }
            None => Vec::new(),
        };

        let timestamp = self
            .get(Column::Timestamp)
            .and_then(|s| NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).ok())
            .and_then(|dt| Local.from_local_datetime(&dt).earliest())
            .map(Timestamp::from)
            .unwrap_or_default();

        let mut packet = Packet {
            direction,
            identifier,
            rtr: flag(Column::Rtr)?,
            extended: flag(Column::Extended)?,
            error: flag(Column::Error)?,
            dlc,
            timestamp,
            ..Packet::default()
        };

        if data.len() > packet.data.len() {
            return Err(invalid("data", self.get(Column::Data).unwrap_or_default()));
        }
        packet.data[..data.len()].copy_from_slice(&data);

        packet
            .validate()
            .map_err(|err| Error::InvalidRecord(err.to_string()))?;
        Ok(packet)
    }
}

// ===== LogStore =====

/// Events published by a log store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEvent {
    /// A row was added
    Modified,
}

/// An in-memory log of packets with load and save.
#[derive(Debug, Default)]
pub struct LogStore {
    rows: Vec<Row>,
    modified: bool,
    subscribers: Subscribers<LogEvent>,
}

impl LogStore {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes every row.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.modified = false;
    }

    /// The number of rows.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Determines if the log has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Gets a row by number.
    pub fn row(&self, idx: usize) -> Option<&Row> {
        self.rows.get(idx)
    }

    /// All of the rows, in order.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Determines if rows were added since the last load, save or clear.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Registers a listener closure for log events.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&LogEvent) + Send + Sync + 'static,
    {
        self.subscribers.add(listener);
    }

    /// Gets a receiver that gets a copy of every log event.
    pub fn subscribe(&self) -> mpsc::Receiver<LogEvent> {
        self.subscribers.channel()
    }

    /// Adds a packet at the end of the log, returning its row number.
    pub fn append(&mut self, packet: &Packet) -> usize {
        let idx = self.rows.len();
        self.rows.push(Row::from_packet(idx, packet));
        self.modified = true;
        self.subscribers.publish(&LogEvent::Modified);
        idx
    }

    /// Replaces the contents of the log with a file.
    ///
    /// The log is cleared first, and is left empty if the load fails.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.clear();
        let path = path.as_ref();
        let file = File::open(path)?;
        self.read_from(BufReader::new(file))?;
        debug!("Loaded {} rows from {}", self.rows.len(), path.display());
        Ok(())
    }

    /// Replaces the contents of the log with a log stream.
    ///
    /// The log is cleared first, and is left empty if the read fails.
    pub fn read_from<R: BufRead>(&mut self, mut rdr: R) -> Result<()> {
        self.clear();
        let res = self.read_records(&mut rdr);
        if res.is_err() {
            self.rows.clear();
        }
        res
    }

    fn read_records<R: BufRead>(&mut self, rdr: &mut R) -> Result<()> {
        let magic = rdr.read_u32::<BigEndian>()?;
        if magic != MAGIC {
            return Err(Error::BadMagic(magic));
        }

        while !rdr.fill_buf()?.is_empty() {
            let row = rdr.read_i64::<BigEndian>()?;
            let col = rdr.read_i64::<BigEndian>()?;
            let value = read_string(rdr)?;

            if !(0..MAX_ROWS).contains(&row) {
                return Err(Error::InvalidRecord(format!("row {} out of range", row)));
            }
            let col = usize::try_from(col)
                .ok()
                .and_then(Column::from_index)
                .ok_or_else(|| Error::InvalidRecord(format!("column {} out of range", col)))?;

            let row = row as usize;
            if self.rows.len() <= row {
                self.rows.resize_with(row + 1, Row::default);
            }
            if let Some(value) = value {
                self.rows[row].set(col, value);
            }
        }
        Ok(())
    }

    /// Writes the log to a file, replacing it.
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut wtr = BufWriter::new(File::create(path)?);
        self.write_to(&mut wtr)?;
        wtr.flush()?;
        self.modified = false;
        debug!("Saved {} rows to {}", self.rows.len(), path.display());
        Ok(())
    }

    /// Writes the log as a stream.
    pub fn write_to<W: Write>(&self, wtr: &mut W) -> Result<()> {
        wtr.write_u32::<BigEndian>(MAGIC)?;
        for (i, row) in self.rows.iter().enumerate() {
            for (col, value) in row.cells() {
                wtr.write_i64::<BigEndian>(i as i64)?;
                wtr.write_i64::<BigEndian>(col.index() as i64)?;
                write_string(wtr, value)?;
            }
        }
        Ok(())
    }
}

// ===== String codec =====

/// Reads a length-prefixed UTF-16BE string. `None` is a null string.
fn read_string<R: BufRead>(rdr: &mut R) -> Result<Option<String>> {
    let len = rdr.read_u32::<BigEndian>()?;
    if len == NULL_STRING {
        return Ok(None);
    }
    if len % 2 != 0 || len > MAX_VALUE_LEN {
        return Err(Error::InvalidRecord(format!("bad string length {}", len)));
    }

    let mut buf = vec![0u8; len as usize];
    rdr.read_exact(&mut buf)?;

    let mut units = vec![0u16; buf.len() / 2];
    BigEndian::read_u16_into(&buf, &mut units);

    String::from_utf16(&units)
        .map(Some)
        .map_err(|_| Error::InvalidRecord("string is not valid UTF-16".into()))
}

/// Writes a string as length-prefixed UTF-16BE.
fn write_string<W: Write>(wtr: &mut W, s: &str) -> Result<()> {
    let units: Vec<u16> = s.encode_utf16().collect();
    wtr.write_u32::<BigEndian>((units.len() * 2) as u32)?;
    for unit in units {
        wtr.write_u16::<BigEndian>(unit)?;
    }
    Ok(())
}

/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_packet() -> Packet {
        let mut packet = Packet::new(0x12345678, true, &[0xde, 0xad, 0x0f]).unwrap();
        packet.direction = Direction::Sent;
        packet.timestamp = Timestamp::new(1_600_000_000, 123_456);
        packet
    }

    #[test]
    fn test_render_row() {
        let packet = sample_packet();
        let row = Row::from_packet(7, &packet);

        assert_eq!(row.get(Column::Index), Some("7"));
        assert_eq!(row.get(Column::Interface), Some("0"));
        assert_eq!(row.get(Column::Direction), Some(">"));
        assert_eq!(row.get(Column::Rtr), Some("0"));
        assert_eq!(row.get(Column::Extended), Some("1"));
        assert_eq!(row.get(Column::Error), Some("0"));
        assert_eq!(row.get(Column::Identifier), Some("305419896"));
        assert_eq!(row.get(Column::Dlc), Some("3"));
        assert_eq!(row.get(Column::Data), Some("de ad 0f"));
        assert_eq!(row.get(Column::Crc), Some("0"));

        let expected = packet
            .timestamp
            .to_local()
            .unwrap()
            .format(TIMESTAMP_FORMAT)
            .to_string();
        assert_eq!(row.get(Column::Timestamp), Some(expected.as_str()));
        assert!(expected.ends_with(".123"));
    }

    #[test]
    fn test_render_standard_no_data() {
        let packet = Packet::new(0x7, false, &[]).unwrap();
        let row = Row::from_packet(0, &packet);

        assert_eq!(row.get(Column::Identifier), Some("7"));
        assert_eq!(row.get(Column::Direction), Some("<"));
        assert_eq!(row.get(Column::Data), None);
        assert_eq!(row.cells().count(), NUM_COLUMNS - 1);
    }

    #[test]
    fn test_row_to_packet() {
        let packet = sample_packet();
        let back = Row::from_packet(0, &packet).to_packet().unwrap();

        assert_eq!(back.direction, packet.direction);
        assert_eq!(back.identifier, packet.identifier);
        assert!(back.extended);
        assert_eq!(back.data(), packet.data());
        // Only milliseconds are kept in the table
        assert_eq!(back.timestamp, Timestamp::new(1_600_000_000, 123_000));
    }

    #[test]
    fn test_bad_row() {
        let mut row = Row::from_packet(0, &sample_packet());
        row.set(Column::Dlc, "9");
        assert!(matches!(row.to_packet(), Err(Error::InvalidRecord(_))));

        let mut row = Row::from_packet(0, &sample_packet());
        row.set(Column::Identifier, "");
        assert!(matches!(row.to_packet(), Err(Error::InvalidRecord(_))));

        let mut row = Row::from_packet(0, &sample_packet());
        row.set(Column::Data, "zz");
        assert!(matches!(row.to_packet(), Err(Error::InvalidRecord(_))));
    }

    #[test]
    fn test_parse_recorded_row() {
        // Rows recorded by older capture tools end the data with a space
        let mut row = Row::default();
        row.set(Column::Direction, "<");
        row.set(Column::Identifier, "291");
        row.set(Column::Dlc, "3");
        row.set(Column::Data, "11 22 33 ");

        let packet = row.to_packet().unwrap();
        assert_eq!(packet.identifier, 0x123);
        assert!(!packet.extended);
        assert_eq!(packet.data(), &[0x11, 0x22, 0x33]);

        row.set(Column::Identifier, "7FF");
        assert!(matches!(row.to_packet(), Err(Error::InvalidRecord(_))));
    }

    #[test]
    fn test_string_codec() {
        let mut buf = Vec::new();
        write_string(&mut buf, "A<").unwrap();
        assert_eq!(buf, [0, 0, 0, 4, 0, 0x41, 0, 0x3C]);

        let s = read_string(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(s.as_deref(), Some("A<"));

        let null = [0xFFu8; 4];
        assert_eq!(read_string(&mut Cursor::new(&null)).unwrap(), None);

        let odd: [u8; 7] = [0, 0, 0, 3, 0, 0x41, 0];
        assert!(matches!(
            read_string(&mut Cursor::new(&odd)),
            Err(Error::InvalidRecord(_))
        ));
    }

    #[test]
    fn test_stream_layout() {
        let mut log = LogStore::new();
        let mut row = Row::default();
        row.set(Column::Dlc, "1");
        log.rows.push(row);

        let mut buf = Vec::new();
        log.write_to(&mut buf).unwrap();
        assert_eq!(
            buf,
            [
                0x63, 0x6C, 0x66, 0x03, // magic
                0, 0, 0, 0, 0, 0, 0, 0, // row
                0, 0, 0, 0, 0, 0, 0, 8, // column
                0, 0, 0, 2, 0, 0x31, // "1"
            ]
        );
    }

    #[test]
    fn test_append_and_stream() {
        let mut log = LogStore::new();
        let rx = log.subscribe();

        assert_eq!(log.append(&sample_packet()), 0);
        assert_eq!(log.append(&Packet::new(0x1, false, &[]).unwrap()), 1);
        assert!(log.is_modified());
        assert_eq!(rx.try_iter().count(), 2);

        let mut buf = Vec::new();
        log.write_to(&mut buf).unwrap();

        let mut other = LogStore::new();
        other.read_from(Cursor::new(&buf)).unwrap();
        assert_eq!(other.rows(), log.rows());
        assert!(!other.is_modified());
    }

    #[test]
    fn test_bad_magic() {
        let mut log = LogStore::new();
        log.append(&sample_packet());

        let buf: [u8; 8] = [0x12, 0x34, 0x56, 0x78, 0, 0, 0, 0];
        match log.read_from(Cursor::new(&buf)) {
            Err(Error::BadMagic(0x12345678)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(log.is_empty());

        // Too short for a magic number
        assert!(matches!(
            log.read_from(Cursor::new(&[0x63u8, 0x6C])),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_out_of_range_records() {
        for (row, col) in [(-1i64, 0i64), (0, 11), (0, -3), (MAX_ROWS, 0)] {
            let mut buf = Vec::new();
            buf.write_u32::<BigEndian>(MAGIC).unwrap();
            buf.write_i64::<BigEndian>(row).unwrap();
            buf.write_i64::<BigEndian>(col).unwrap();
            write_string(&mut buf, "x").unwrap();

            let mut log = LogStore::new();
            assert!(matches!(
                log.read_from(Cursor::new(&buf)),
                Err(Error::InvalidRecord(_))
            ));
            assert!(log.is_empty());
        }
    }
}
