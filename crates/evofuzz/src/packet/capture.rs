//! Seed ingestion from packet captures.
//!
//! Reads PCAP or PCAPNG files and slices each frame down to its TCP/UDP
//! payload. Protocol modules turn the resulting [`SeedRecord`]s into typed
//! packets; everything link- and network-layer is discarded here.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use etherparse::{SlicedPacket, TransportSlice};
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{Block, LegacyPcapReader, Linktype, PcapBlockOwned, PcapNGReader};

use crate::error::{Error, Result};

const READER_BUFFER_SIZE: usize = 1 << 16;
const PCAPNG_MAGIC: [u8; 4] = [0x0a, 0x0d, 0x0d, 0x0a];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedTransport {
    Tcp,
    Udp,
}

/// One transport payload extracted from the capture.
#[derive(Debug, Clone)]
pub struct SeedRecord {
    pub transport: SeedTransport,
    pub dst_port: u16,
    pub payload: Vec<u8>,
}

/// Read every non-empty TCP/UDP payload from a capture file, in file order.
pub fn read_payloads(path: &Path) -> Result<Vec<SeedRecord>> {
    let mut file = File::open(path)
        .map_err(|e| Error::Capture(format!("{}: {e}", path.display())))?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)
        .map_err(|e| Error::Capture(format!("reading magic: {e}")))?;
    file.seek(SeekFrom::Start(0))
        .map_err(|e| Error::Capture(format!("rewinding: {e}")))?;

    let mut records = Vec::new();
    if magic == PCAPNG_MAGIC {
        read_pcapng(file, &mut records)?;
    } else {
        read_legacy(file, &mut records)?;
    }
    Ok(records)
}

fn read_legacy(file: File, records: &mut Vec<SeedRecord>) -> Result<()> {
    let mut reader = LegacyPcapReader::new(READER_BUFFER_SIZE, file)
        .map_err(|e| Error::Capture(format!("pcap reader init: {e}")))?;
    let mut linktype = Linktype::ETHERNET;
    loop {
        match reader.next() {
            Ok((offset, block)) => {
                match block {
                    PcapBlockOwned::LegacyHeader(header) => linktype = header.network,
                    PcapBlockOwned::Legacy(packet) => {
                        if let Some(record) = slice_frame(linktype, packet.data) {
                            records.push(record);
                        }
                    }
                    PcapBlockOwned::NG(_) => {}
                }
                reader.consume(offset);
            }
            Err(pcap_parser::PcapError::Eof) => return Ok(()),
            Err(pcap_parser::PcapError::Incomplete(_)) => {
                reader
                    .refill()
                    .map_err(|e| Error::Capture(format!("pcap reader refill: {e}")))?;
            }
            Err(e) => return Err(Error::Capture(format!("pcap reader next: {e}"))),
        }
    }
}

fn read_pcapng(file: File, records: &mut Vec<SeedRecord>) -> Result<()> {
    let mut reader = PcapNGReader::new(READER_BUFFER_SIZE, file)
        .map_err(|e| Error::Capture(format!("pcapng reader init: {e}")))?;
    let mut linktypes: Vec<Linktype> = Vec::new();
    loop {
        match reader.next() {
            Ok((offset, block)) => {
                match block {
                    PcapBlockOwned::NG(Block::InterfaceDescription(intf)) => {
                        linktypes.push(intf.linktype);
                    }
                    PcapBlockOwned::NG(Block::EnhancedPacket(packet)) => {
                        let linktype = linktypes
                            .get(packet.if_id as usize)
                            .copied()
                            .unwrap_or(Linktype::ETHERNET);
                        if let Some(record) = slice_frame(linktype, packet.data) {
                            records.push(record);
                        }
                    }
                    _ => {}
                }
                reader.consume(offset);
            }
            Err(pcap_parser::PcapError::Eof) => return Ok(()),
            Err(pcap_parser::PcapError::Incomplete(_)) => {
                reader
                    .refill()
                    .map_err(|e| Error::Capture(format!("pcapng reader refill: {e}")))?;
            }
            Err(e) => return Err(Error::Capture(format!("pcapng reader next: {e}"))),
        }
    }
}

/// Slice one link-layer frame down to its transport payload.
///
/// Frames that are not TCP/UDP, carry no payload, or fail to slice are
/// dropped; a capture mixing relevant and irrelevant traffic is the norm.
fn slice_frame(linktype: Linktype, data: &[u8]) -> Option<SeedRecord> {
    let sliced = match linktype {
        Linktype::ETHERNET => SlicedPacket::from_ethernet(data).ok()?,
        Linktype::RAW | Linktype::IPV4 | Linktype::IPV6 => SlicedPacket::from_ip(data).ok()?,
        _ => return None,
    };
    let (transport, dst_port, payload) = match sliced.transport? {
        TransportSlice::Tcp(tcp) => (
            SeedTransport::Tcp,
            tcp.destination_port(),
            tcp.payload().to_vec(),
        ),
        TransportSlice::Udp(udp) => (
            SeedTransport::Udp,
            udp.destination_port(),
            udp.payload().to_vec(),
        ),
        _ => return None,
    };
    if payload.is_empty() {
        return None;
    }
    Some(SeedRecord {
        transport,
        dst_port,
        payload,
    })
}
